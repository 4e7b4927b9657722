//! Reading documents out of the graph: a planner-driven walk that rebuilds a
//! data tree, tracks every visited record's version, and flags incomplete
//! reads instead of failing them.

use crate::config::CacheConfig;
use crate::graph::ref_key;
use crate::graph::FieldMap;
use crate::graph::Graph;
use crate::graph::TYPENAME_FIELD;
use crate::optimistic::OverlayStack;
use crate::planner::Plan;
use crate::planner::PlanField;
use crate::planner::PlanSelectionSet;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::rc::Rc;

/// Read completeness. `canonical` is false when any selected field could not
/// be resolved; `strict` additionally requires every connection to have its
/// exact page record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkFlags {
    pub canonical: bool,
    pub strict: bool,
}

impl Default for OkFlags {
    fn default() -> Self {
        Self {
            canonical: true,
            strict: true,
        }
    }
}

/// Where a materialization came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Source {
    /// The memoized result was reused.
    #[strum(to_string = "cache")]
    Cache,
    /// A fresh walk over the graph.
    #[strum(to_string = "graph")]
    Graph,
    /// Nothing could be read.
    #[strum(to_string = "none")]
    None,
}

#[derive(Debug, Clone)]
pub struct MaterializeResult {
    pub data: Option<JsonValue>,
    pub ok: OkFlags,
    pub source: Source,
    /// Whether the memoized materialization was reused.
    pub hot: bool,
    pub fingerprint: Option<u64>,
}

/// A fresh walk's output plus its dependency set (record key → version at
/// visit time), which is what memoization validates against.
#[derive(Debug, Clone)]
pub(crate) struct RawMaterialization {
    pub(crate) data: Option<JsonValue>,
    pub(crate) ok: OkFlags,
    pub(crate) deps: IndexMap<String, u64>,
}

impl RawMaterialization {
    /// Content identity: the set of visited records with their versions.
    /// Two walks over identical graph state hash identically.
    pub(crate) fn fingerprint(&self, overlay_epoch: Option<u64>) -> u64 {
        let mut hasher = DefaultHasher::new();
        let mut deps: Vec<(&String, &u64)> = self.deps.iter().collect();
        deps.sort_by(|a, b| a.0.cmp(b.0));
        for (key, version) in deps {
            key.hash(&mut hasher);
            version.hash(&mut hasher);
        }
        overlay_epoch.hash(&mut hasher);
        self.ok.canonical.hash(&mut hasher);
        self.ok.strict.hash(&mut hasher);
        hasher.finish()
    }
}

pub(crate) struct MaterializeParams<'a> {
    pub(crate) plan: &'a Plan,
    pub(crate) variables: &'a FieldMap,
    pub(crate) root_id: &'a str,
    /// Read connections through their canonical identity keys; when false,
    /// require the exact page at the requested arguments.
    pub(crate) canonical: bool,
    pub(crate) prefer_optimistic: bool,
}

pub(crate) fn run(
    config: &CacheConfig,
    graph: &Graph,
    overlays: &OverlayStack,
    params: &MaterializeParams<'_>,
) -> RawMaterialization {
    let mut walker = Walker {
        config,
        graph,
        overlays,
        variables: params.variables,
        canonical: params.canonical,
        prefer_optimistic: params.prefer_optimistic,
        deps: IndexMap::new(),
        ok: OkFlags::default(),
        // One memo entry per (record, plan node) pair; the plan's node count
        // is the per-record bound.
        memo: HashMap::with_capacity(params.plan.node_count as usize),
    };
    let data = walker.walk_record(params.root_id, params.plan.root_type(), &params.plan.root, u32::MAX);
    let mut ok = walker.ok;
    ok.strict = ok.strict && ok.canonical;
    if data.is_none() {
        ok = OkFlags {
            canonical: false,
            strict: false,
        };
    }
    RawMaterialization {
        data,
        ok,
        deps: walker.deps,
    }
}

struct Walker<'a> {
    config: &'a CacheConfig,
    graph: &'a Graph,
    overlays: &'a OverlayStack,
    variables: &'a FieldMap,
    canonical: bool,
    prefer_optimistic: bool,
    deps: IndexMap<String, u64>,
    ok: OkFlags,
    /// Per-walk memoization keyed by `(record key, plan node id)`; cyclic
    /// references re-emit the memoized subtree instead of re-walking it.
    memo: HashMap<(String, u32), Option<JsonValue>>,
}

impl Walker<'_> {
    fn record_fields(&mut self, key: &str) -> Option<FieldMap> {
        self.deps.insert(key.to_string(), self.graph.version_of(key));
        if self.prefer_optimistic {
            self.overlays.effective_fields(self.graph, key)
        } else {
            self.graph.get_record(key).map(|record| record.fields().clone())
        }
    }

    fn walk_record(
        &mut self,
        key: &str,
        fallback_typename: &str,
        set: &PlanSelectionSet,
        plan_node: u32,
    ) -> Option<JsonValue> {
        let memo_key = (key.to_string(), plan_node);
        if let Some(memoized) = self.memo.get(&memo_key) {
            return memoized.clone();
        }

        let Some(fields) = self.record_fields(key) else {
            self.ok.canonical = false;
            self.memo.insert(memo_key, None);
            return None;
        };
        // Synthetic roots carry the `@` typename; the plan knows the real
        // root type for condition matching.
        let typename = fields
            .get(TYPENAME_FIELD)
            .and_then(JsonValue::as_str)
            .filter(|typename| *typename != crate::graph::ROOT_TYPENAME)
            .unwrap_or(fallback_typename)
            .to_string();

        let mut selected: Vec<&Rc<PlanField>> = Vec::new();
        set.collect_fields(self.config, &typename, self.variables, &mut selected);

        let mut out = FieldMap::new();
        for field in selected {
            let value = self.build_field(key, &fields, &typename, field);
            match out.get_mut(&field.response_key) {
                Some(existing) => merge_value(existing, value),
                None => {
                    out.insert(field.response_key.clone(), value);
                }
            }
        }
        let result = Some(JsonValue::Object(out));
        self.memo.insert(memo_key, result.clone());
        result
    }

    fn build_field(
        &mut self,
        parent_key: &str,
        record: &FieldMap,
        parent_typename: &str,
        field: &Rc<PlanField>,
    ) -> JsonValue {
        if field.field_name == TYPENAME_FIELD {
            return JsonValue::String(parent_typename.to_string());
        }

        let args = match field.args(self.variables) {
            Ok(args) => args,
            Err(_) => {
                self.ok.canonical = false;
                return JsonValue::Null;
            }
        };

        if let (Some(spec), false) = (&field.connection, field.is_leaf()) {
            let page_key = crate::canonical::page_key(parent_key, &field.field_name, &args);
            // Strict completeness always tracks the exact page.
            self.deps
                .insert(page_key.clone(), self.graph.version_of(&page_key));
            let page_exists = if self.prefer_optimistic {
                self.overlays.effective_fields(self.graph, &page_key).is_some()
            } else {
                self.graph.get_record(&page_key).is_some()
            };
            if !page_exists {
                self.ok.strict = false;
            }
            let connection_key = if self.canonical {
                crate::canonical::identity_key(
                    parent_key,
                    &field.field_name,
                    &args,
                    &spec.filters,
                )
            } else {
                page_key
            };
            return match self.walk_record(&connection_key, "", &field.selections, field.id) {
                Some(value) => value,
                None => {
                    self.ok.canonical = false;
                    JsonValue::Null
                }
            };
        }

        let storage = field.storage_key(&args);
        let Some(value) = record.get(&storage) else {
            self.ok.canonical = false;
            return JsonValue::Null;
        };

        if field.is_leaf() {
            return value.clone();
        }

        match value {
            JsonValue::Null => JsonValue::Null,
            JsonValue::Object(_) => match ref_key(value) {
                Some(target) => match self.walk_record(target, "", &field.selections, field.id) {
                    Some(resolved) => resolved,
                    None => {
                        self.ok.canonical = false;
                        JsonValue::Null
                    }
                },
                // A nested plain value stored verbatim.
                None => value.clone(),
            },
            JsonValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match ref_key(item) {
                        Some(target) => {
                            match self.walk_record(target, "", &field.selections, field.id) {
                                Some(resolved) => out.push(resolved),
                                None => {
                                    self.ok.canonical = false;
                                    out.push(JsonValue::Null);
                                }
                            }
                        }
                        None => out.push(item.clone()),
                    }
                }
                JsonValue::Array(out)
            }
            other => other.clone(),
        }
    }
}

/// Duplicate response keys (interface queries spreading the same field) merge
/// object-by-object; anything else is last-writer-wins.
fn merge_value(existing: &mut JsonValue, incoming: JsonValue) {
    match (existing, incoming) {
        (JsonValue::Object(existing), JsonValue::Object(incoming)) => {
            for (field, value) in incoming {
                match existing.get_mut(&field) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        existing.insert(field, value);
                    }
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

/// Keys a memoized materialization: the plan, the root, the canonicalized
/// variables, and the read mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MemoKey {
    pub(crate) plan: usize,
    pub(crate) root: String,
    pub(crate) variables: String,
    pub(crate) canonical: bool,
    pub(crate) optimistic: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoEntry {
    pub(crate) data: Option<JsonValue>,
    pub(crate) ok: OkFlags,
    pub(crate) deps: IndexMap<String, u64>,
    pub(crate) overlay_epoch: u64,
    pub(crate) fingerprint: u64,
}

/// The cross-call memoization store: an entry is valid while every dependency
/// record still has the version it was read at (and, for optimistic reads,
/// the overlay stack has not moved).
#[derive(Debug, Default)]
pub(crate) struct MemoStore {
    entries: HashMap<MemoKey, MemoEntry>,
}

impl MemoStore {
    pub(crate) fn lookup(
        &self,
        key: &MemoKey,
        graph: &Graph,
        overlay_epoch: u64,
    ) -> Option<&MemoEntry> {
        let entry = self.entries.get(key)?;
        if key.optimistic && entry.overlay_epoch != overlay_epoch {
            return None;
        }
        let valid = entry
            .deps
            .iter()
            .all(|(dep, version)| graph.version_of(dep) == *version);
        valid.then_some(entry)
    }

    pub(crate) fn store(&mut self, key: MemoKey, entry: MemoEntry) {
        self.entries.insert(key, entry);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
