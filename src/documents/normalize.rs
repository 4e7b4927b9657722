//! Writing documents into the graph: a planner-driven walk over response
//! data that stores entities under their derived keys, embedded objects under
//! path keys, and connection pages through the canonical layer.

use crate::canonical::CanonicalStore;
use crate::canonical::EdgeInput;
use crate::canonical::PageInput;
use crate::canonical::CURSOR_FIELD;
use crate::canonical::EDGES_FIELD;
use crate::canonical::NODE_FIELD;
use crate::canonical::PAGE_INFO_FIELD;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::graph::make_ref;
use crate::graph::FieldMap;
use crate::graph::Graph;
use crate::graph::ROOT_TYPENAME;
use crate::graph::TYPENAME_FIELD;
use crate::planner::Plan;
use crate::planner::PlanField;
use crate::planner::PlanSelectionSet;
use serde_json::Value as JsonValue;
use std::rc::Rc;

/// Writes `data` for `plan` into the graph, rooted at `root_id`. Missing
/// selection values are skipped (no negative caching); connection fields go
/// through [`CanonicalStore::record_page`].
pub(crate) fn normalize(
    config: &CacheConfig,
    graph: &mut Graph,
    canonical: &mut CanonicalStore,
    plan: &Plan,
    variables: &FieldMap,
    data: &FieldMap,
    root_id: &str,
) -> Result<(), CacheError> {
    // Synthetic roots (`@`, `@mutation.N`, `@subscription.N`) carry the
    // synthetic typename; entity-rooted writes (fragments) do not.
    let synthetic_root = root_id.starts_with(crate::graph::ROOT_KEY);
    if synthetic_root && graph.get_record(root_id).is_none() {
        let mut fields = FieldMap::new();
        fields.insert(
            TYPENAME_FIELD.to_string(),
            JsonValue::String(ROOT_TYPENAME.to_string()),
        );
        graph.put_record(root_id, fields);
    }
    let mut walker = Normalizer {
        config,
        graph,
        canonical,
        variables,
    };
    walker.walk_object(root_id, plan.root_type(), &plan.root, data, synthetic_root)
}

struct Normalizer<'a> {
    config: &'a CacheConfig,
    graph: &'a mut Graph,
    canonical: &'a mut CanonicalStore,
    variables: &'a FieldMap,
}

impl Normalizer<'_> {
    fn walk_object(
        &mut self,
        record_key: &str,
        collect_typename: &str,
        set: &PlanSelectionSet,
        data: &FieldMap,
        is_root: bool,
    ) -> Result<(), CacheError> {
        let typename = data
            .get(TYPENAME_FIELD)
            .and_then(JsonValue::as_str)
            .unwrap_or(collect_typename);

        let mut selected: Vec<&Rc<PlanField>> = Vec::new();
        set.collect_fields(self.config, typename, self.variables, &mut selected);

        let mut record_fields = FieldMap::new();
        if !is_root {
            if let Some(value) = data.get(TYPENAME_FIELD) {
                record_fields.insert(TYPENAME_FIELD.to_string(), value.clone());
            }
        }

        for field in selected {
            let Some(value) = data.get(&field.response_key) else {
                continue;
            };
            let args = field.args(self.variables)?;
            let storage = field.storage_key(&args);

            if field.connection.is_some() && value.is_object() {
                let page_key = self.write_connection_page(record_key, field, &args, value)?;
                record_fields.insert(storage, make_ref(page_key));
                continue;
            }

            match value {
                JsonValue::Object(object) => {
                    let target = self.write_object(record_key, &storage, field, object)?;
                    record_fields.insert(storage, make_ref(target));
                }
                JsonValue::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (index, item) in items.iter().enumerate() {
                        match item {
                            JsonValue::Object(object) => {
                                let slot = format!("{record_key}.{storage}.{index}");
                                let target =
                                    self.write_list_item(&slot, field, object)?;
                                out.push(make_ref(target));
                            }
                            other => out.push(other.clone()),
                        }
                    }
                    record_fields.insert(storage, JsonValue::Array(out));
                }
                other => {
                    record_fields.insert(storage, other.clone());
                }
            }
        }

        self.graph.put_record(record_key, record_fields);
        Ok(())
    }

    /// Normalizes a nested object: an identifiable entity lands under its own
    /// key, anything else becomes an embedded record under the parent path.
    fn write_object(
        &mut self,
        parent_key: &str,
        storage: &str,
        field: &Rc<PlanField>,
        object: &FieldMap,
    ) -> Result<String, CacheError> {
        let key = match self.config.identify(object) {
            Some(entity_key) => entity_key,
            None => format!("{parent_key}.{storage}"),
        };
        let typename = object
            .get(TYPENAME_FIELD)
            .and_then(JsonValue::as_str)
            .unwrap_or("");
        self.walk_object(&key, typename, &field.selections, object, false)?;
        Ok(key)
    }

    fn write_list_item(
        &mut self,
        slot_key: &str,
        field: &Rc<PlanField>,
        object: &FieldMap,
    ) -> Result<String, CacheError> {
        let key = match self.config.identify(object) {
            Some(entity_key) => entity_key,
            None => slot_key.to_string(),
        };
        let typename = object
            .get(TYPENAME_FIELD)
            .and_then(JsonValue::as_str)
            .unwrap_or("");
        self.walk_object(&key, typename, &field.selections, object, false)?;
        Ok(key)
    }

    /// Extracts a [`PageInput`] from a connection value, normalizing the
    /// nodes behind each edge, and records the page canonically.
    fn write_connection_page(
        &mut self,
        parent_key: &str,
        field: &Rc<PlanField>,
        args: &FieldMap,
        value: &JsonValue,
    ) -> Result<String, CacheError> {
        let spec = field
            .connection
            .clone()
            .ok_or_else(|| crate::internal_error!("connection write without a connection spec"))?;
        let object = value
            .as_object()
            .ok_or_else(|| crate::internal_error!("connection value is not an object"))?;
        let page_key = crate::canonical::page_key(parent_key, &field.field_name, args);

        let edges_plan = field.selections.field(EDGES_FIELD);
        let node_plan = edges_plan.and_then(|edges| edges.selections.field(NODE_FIELD));

        let mut edges = Vec::new();
        if let Some(JsonValue::Array(items)) = object.get(EDGES_FIELD) {
            for (index, item) in items.iter().enumerate() {
                let Some(edge_object) = item.as_object() else {
                    continue;
                };
                let cursor = edge_object
                    .get(CURSOR_FIELD)
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                let node_ref = match edge_object.get(NODE_FIELD) {
                    Some(JsonValue::Object(node_object)) => {
                        let slot = format!("{page_key}.{EDGES_FIELD}.{index}.{NODE_FIELD}");
                        let key = match self.config.identify(node_object) {
                            Some(entity_key) => entity_key,
                            None => slot,
                        };
                        let typename = node_object
                            .get(TYPENAME_FIELD)
                            .and_then(JsonValue::as_str)
                            .unwrap_or("");
                        if let Some(node_plan) = node_plan {
                            self.walk_object(
                                &key,
                                typename,
                                &node_plan.selections,
                                node_object,
                                false,
                            )?;
                        } else {
                            self.graph.put_record(&key, node_object.clone());
                        }
                        Some(key)
                    }
                    _ => None,
                };
                let mut extras = FieldMap::new();
                for (name, extra) in edge_object {
                    if name == CURSOR_FIELD || name == NODE_FIELD {
                        continue;
                    }
                    extras.insert(name.clone(), extra.clone());
                }
                edges.push(EdgeInput {
                    cursor,
                    node_ref,
                    extras,
                });
            }
        }

        let page_info = object
            .get(PAGE_INFO_FIELD)
            .and_then(JsonValue::as_object)
            .cloned();

        let mut extras = FieldMap::new();
        for (name, extra) in object {
            if name == EDGES_FIELD || name == PAGE_INFO_FIELD || name == TYPENAME_FIELD {
                continue;
            }
            extras.insert(name.clone(), extra.clone());
        }

        let page = PageInput {
            typename: object
                .get(TYPENAME_FIELD)
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            edges,
            page_info,
            extras,
        };
        let (page_key, _identity) = self.canonical.record_page(
            self.graph,
            parent_key,
            &field.field_name,
            &spec,
            args,
            page,
        );
        Ok(page_key)
    }
}
