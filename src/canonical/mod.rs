//! Connection composition: per-page records are merged into a canonical
//! ordered union per identity key, with dedup, slice anchoring by cursor, and
//! page-info reconciliation.

use crate::config::ConnectionMode;
use crate::config::ConnectionSpec;
use crate::config::DedupeBy;
use crate::error::Diagnostic;
use crate::graph::make_ref;
use crate::graph::FieldMap;
use crate::graph::Graph;
use crate::planner::arguments;
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::Value as JsonValue;

pub(crate) const EDGES_FIELD: &str = "edges";
pub(crate) const PAGE_INFO_FIELD: &str = "pageInfo";
pub(crate) const CURSOR_FIELD: &str = "cursor";
pub(crate) const NODE_FIELD: &str = "node";

/// `<parent>.<field>(<full args>)` — the record key of one fetched page.
pub(crate) fn page_key(parent: &str, field_name: &str, args: &FieldMap) -> String {
    format!("{parent}.{}", arguments::storage_key(field_name, args))
}

/// `<parent>.<field>(<filter-only args>)` — the canonical connection key.
pub(crate) fn identity_key(
    parent: &str,
    field_name: &str,
    args: &FieldMap,
    filters: &[String],
) -> String {
    let filtered = arguments::filter_args(args, filters);
    format!("{parent}.{}", arguments::storage_key(field_name, &filtered))
}

/// One edge of an incoming page, with its node already normalized to a key.
#[derive(Debug, Clone)]
pub(crate) struct EdgeInput {
    pub(crate) cursor: Option<String>,
    pub(crate) node_ref: Option<String>,
    pub(crate) extras: FieldMap,
}

/// One incoming page, extracted by the normalizer.
#[derive(Debug, Clone, Default)]
pub(crate) struct PageInput {
    pub(crate) typename: Option<String>,
    pub(crate) edges: Vec<EdgeInput>,
    pub(crate) page_info: Option<FieldMap>,
    pub(crate) extras: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SliceAnchor {
    /// `after`/`before` absent: the page re-establishes the leading slice.
    Leader,
    After(String),
    Before(String),
    /// `page` mode: the latest page wins outright.
    Latest,
}

#[derive(Debug, Clone)]
struct PageState {
    page_key: String,
    anchor: SliceAnchor,
    arrival: u64,
}

#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) mode: ConnectionMode,
    pub(crate) dedupe: DedupeBy,
    pub(crate) typename: Option<String>,
    pages: Vec<PageState>,
    /// Stable slot per dedup key, so canonical edge records keep their
    /// identity across recompositions.
    edge_slots: IndexMap<String, u64>,
    next_slot: u64,
    arrivals: u64,
}

/// An edge as placed during composition. Fields are captured at collect
/// time: canonical edge records double as composition sources when a
/// hydrated baseline is re-composed, so deferring the read would alias.
struct ComposedEdge {
    dedupe_key: String,
    cursor: Option<String>,
    fields: FieldMap,
    contributor: String,
    arrival: u64,
}

#[derive(Default)]
pub struct CanonicalStore {
    connections: IndexMap<String, ConnectionState>,
    diagnostics: Vec<Diagnostic>,
}

impl CanonicalStore {
    /// Every canonical connection key seen by this cache instance.
    pub fn connection_keys(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.connections.clear();
        self.diagnostics.clear();
    }

    pub(crate) fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Records one fetched page (edge records, page info, the page record
    /// itself) and recomposes the canonical connection it belongs to.
    ///
    /// Returns `(page key, identity key)`.
    pub(crate) fn record_page(
        &mut self,
        graph: &mut Graph,
        parent: &str,
        field_name: &str,
        spec: &ConnectionSpec,
        args: &FieldMap,
        page: PageInput,
    ) -> (String, String) {
        let page_key = page_key(parent, field_name, args);
        let identity = identity_key(parent, field_name, args, &spec.filters);

        let mut edge_refs = Vec::with_capacity(page.edges.len());
        for (index, edge) in page.edges.iter().enumerate() {
            let edge_key = format!("{page_key}.{EDGES_FIELD}.{index}");
            let mut fields = edge.extras.clone();
            fields.insert(
                CURSOR_FIELD.to_string(),
                edge.cursor
                    .clone()
                    .map(JsonValue::String)
                    .unwrap_or(JsonValue::Null),
            );
            fields.insert(
                NODE_FIELD.to_string(),
                edge.node_ref
                    .clone()
                    .map(make_ref)
                    .unwrap_or(JsonValue::Null),
            );
            graph.put_record(&edge_key, fields);
            edge_refs.push(make_ref(edge_key));
        }

        let mut fields = page.extras.clone();
        if let Some(typename) = &page.typename {
            fields.insert(
                "__typename".to_string(),
                JsonValue::String(typename.clone()),
            );
        }
        fields.insert(EDGES_FIELD.to_string(), JsonValue::Array(edge_refs));
        if let Some(page_info) = &page.page_info {
            let page_info_key = format!("{page_key}.{PAGE_INFO_FIELD}");
            graph.put_record(&page_info_key, page_info.clone());
            fields.insert(PAGE_INFO_FIELD.to_string(), make_ref(page_info_key));
        }
        graph.put_record(&page_key, fields);

        let anchor = match spec.mode {
            ConnectionMode::Page => SliceAnchor::Latest,
            ConnectionMode::Forward => match args.get("after").and_then(JsonValue::as_str) {
                Some(cursor) => SliceAnchor::After(cursor.to_string()),
                None => SliceAnchor::Leader,
            },
            ConnectionMode::Backward => match args.get("before").and_then(JsonValue::as_str) {
                Some(cursor) => SliceAnchor::Before(cursor.to_string()),
                None => SliceAnchor::Leader,
            },
        };

        // A canonical record that predates this registry (hydrated from a
        // snapshot) seeds composition as the leading slice, so pagination
        // can continue from restored state.
        let seed_baseline =
            !self.connections.contains_key(&identity) && graph.get_record(&identity).is_some();
        let state = self
            .connections
            .entry(identity.clone())
            .or_insert_with(|| ConnectionState {
                mode: spec.mode,
                dedupe: spec.dedupe,
                typename: None,
                pages: Vec::new(),
                edge_slots: IndexMap::new(),
                next_slot: 0,
                arrivals: 0,
            });
        if seed_baseline {
            state.pages.push(PageState {
                page_key: identity.clone(),
                anchor: SliceAnchor::Leader,
                arrival: 0,
            });
        }
        if page.typename.is_some() {
            state.typename = page.typename.clone();
        }
        state.arrivals += 1;
        let arrival = state.arrivals;
        match state.pages.iter_mut().find(|p| p.page_key == page_key) {
            Some(existing) => {
                existing.anchor = anchor;
                existing.arrival = arrival;
            }
            None => state.pages.push(PageState {
                page_key: page_key.clone(),
                anchor,
                arrival,
            }),
        }

        self.compose(graph, &identity);
        (page_key, identity)
    }

    /// Rebuilds the canonical record at `identity` from its recorded pages.
    pub(crate) fn compose(&mut self, graph: &mut Graph, identity: &str) {
        let Some(state) = self.connections.get_mut(identity) else {
            return;
        };

        let mut composed: Vec<ComposedEdge> = Vec::new();
        let mut missing_anchor: Option<String> = None;

        match state.mode {
            ConnectionMode::Page => {
                let latest = state.pages.iter().max_by_key(|page| page.arrival);
                if let Some(page) = latest {
                    append_slice(graph, &mut composed, page, state.dedupe, None);
                }
            }
            ConnectionMode::Forward => {
                let leader = state
                    .pages
                    .iter()
                    .filter(|page| page.anchor == SliceAnchor::Leader)
                    .max_by_key(|page| page.arrival);
                if let Some(page) = leader {
                    append_slice(graph, &mut composed, page, state.dedupe, None);
                }
                let followers = state
                    .pages
                    .iter()
                    .filter(|page| matches!(page.anchor, SliceAnchor::After(_)))
                    .sorted_by_key(|page| page.arrival);
                for page in followers {
                    let SliceAnchor::After(cursor) = &page.anchor else {
                        continue;
                    };
                    let position = composed
                        .iter()
                        .position(|edge| edge.cursor.as_deref() == Some(cursor.as_str()))
                        .map(|index| index + 1);
                    if position.is_none() && !composed.is_empty() {
                        missing_anchor = Some(cursor.clone());
                    }
                    append_slice(graph, &mut composed, page, state.dedupe, position);
                }
            }
            ConnectionMode::Backward => {
                let leader = state
                    .pages
                    .iter()
                    .filter(|page| page.anchor == SliceAnchor::Leader)
                    .max_by_key(|page| page.arrival);
                if let Some(page) = leader {
                    append_slice(graph, &mut composed, page, state.dedupe, None);
                }
                let followers = state
                    .pages
                    .iter()
                    .filter(|page| matches!(page.anchor, SliceAnchor::Before(_)))
                    .sorted_by_key(|page| page.arrival);
                for page in followers {
                    let SliceAnchor::Before(cursor) = &page.anchor else {
                        continue;
                    };
                    let position = composed
                        .iter()
                        .position(|edge| edge.cursor.as_deref() == Some(cursor.as_str()));
                    if position.is_none() && !composed.is_empty() {
                        missing_anchor = Some(cursor.clone());
                    }
                    append_slice(graph, &mut composed, page, state.dedupe, Some(position.unwrap_or(0)));
                }
            }
        }

        // Persist canonical edge records under stable slots.
        let mut edge_refs = Vec::with_capacity(composed.len());
        for edge in &composed {
            let slot = match state.edge_slots.get(&edge.dedupe_key) {
                Some(slot) => *slot,
                None => {
                    let slot = state.next_slot;
                    state.next_slot += 1;
                    state.edge_slots.insert(edge.dedupe_key.clone(), slot);
                    slot
                }
            };
            let canonical_edge_key = format!("{identity}.{EDGES_FIELD}.{slot}");
            graph.put_record(&canonical_edge_key, edge.fields.clone());
            edge_refs.push(make_ref(canonical_edge_key));
        }

        // Reconcile page info from the head-most and tail-most slices.
        let head_page = composed.first().map(|edge| edge.contributor.clone());
        let tail_page = composed.last().map(|edge| edge.contributor.clone());
        let fallback = state
            .pages
            .iter()
            .max_by_key(|page| page.arrival)
            .map(|page| page.page_key.clone());
        let head_info = page_info_fields(graph, head_page.as_deref().or(fallback.as_deref()));
        let tail_info = page_info_fields(graph, tail_page.as_deref().or(fallback.as_deref()));

        let mut page_info = FieldMap::new();
        if let Some(tail) = &tail_info {
            // Unreconciled extras (typename and the like) come from the tail.
            for (field, value) in tail {
                page_info.insert(field.clone(), value.clone());
            }
        }
        if let Some(head) = &head_info {
            for field in ["startCursor", "hasPreviousPage"] {
                if let Some(value) = head.get(field) {
                    page_info.insert(field.to_string(), value.clone());
                }
            }
        }
        let has_page_info = head_info.is_some() || tail_info.is_some();
        let page_info_key = format!("{identity}.{PAGE_INFO_FIELD}");
        if has_page_info {
            graph.put_record(&page_info_key, page_info);
        }

        let mut fields = FieldMap::new();
        if let Some(typename) = &state.typename {
            fields.insert(
                "__typename".to_string(),
                JsonValue::String(typename.clone()),
            );
        }
        if let Some(latest) = state.pages.iter().max_by_key(|page| page.arrival) {
            if let Some(record) = graph.get_record(&latest.page_key) {
                for (field, value) in record.fields() {
                    if field == EDGES_FIELD || field == PAGE_INFO_FIELD || field == "__typename" {
                        continue;
                    }
                    fields.insert(field.clone(), value.clone());
                }
            }
        }
        fields.insert(EDGES_FIELD.to_string(), JsonValue::Array(edge_refs));
        if has_page_info {
            fields.insert(PAGE_INFO_FIELD.to_string(), make_ref(page_info_key));
        }
        graph.put_record(identity, fields);

        if let Some(cursor) = missing_anchor {
            tracing::warn!(
                connection = identity,
                cursor = cursor.as_str(),
                "page anchor cursor not present in canonical edges, slice placed at boundary",
            );
            if cfg!(debug_assertions) {
                self.diagnostics.push(Diagnostic::new(format!(
                    "connection {identity}: anchor cursor \"{cursor}\" not found",
                )));
            }
        }
    }
}

/// Splices one page's edges into the composed list at `position` (`None` =
/// tail), deduplicating by the connection's discipline: the first insertion
/// keeps its position, later arrivals overwrite edge content.
fn append_slice(
    graph: &Graph,
    composed: &mut Vec<ComposedEdge>,
    page: &PageState,
    dedupe: DedupeBy,
    position: Option<usize>,
) {
    let Some(record) = graph.get_record(&page.page_key) else {
        return;
    };
    let Some(JsonValue::Array(edge_refs)) = record.get(EDGES_FIELD) else {
        return;
    };
    let mut insert_at = position.unwrap_or(composed.len()).min(composed.len());
    for edge_ref in edge_refs {
        let Some(edge_key) = crate::graph::ref_key(edge_ref) else {
            continue;
        };
        let Some(edge) = graph.get_record(edge_key) else {
            continue;
        };
        let cursor = edge
            .get(CURSOR_FIELD)
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let node = edge.get(NODE_FIELD).and_then(crate::graph::ref_key);
        let dedupe_key = match dedupe {
            DedupeBy::Node => node
                .map(str::to_string)
                .or_else(|| cursor.clone())
                .unwrap_or_else(|| edge_key.to_string()),
            DedupeBy::Cursor => cursor
                .clone()
                .or_else(|| node.map(str::to_string))
                .unwrap_or_else(|| edge_key.to_string()),
        };
        let fields = edge.fields().clone();
        match composed
            .iter_mut()
            .find(|existing| existing.dedupe_key == dedupe_key)
        {
            Some(existing) => {
                // Duplicate: keep the original position; the later fetch
                // wins the edge contents.
                if page.arrival >= existing.arrival {
                    existing.cursor = cursor;
                    existing.fields = fields;
                    existing.contributor = page.page_key.clone();
                    existing.arrival = page.arrival;
                }
            }
            None => {
                composed.insert(
                    insert_at,
                    ComposedEdge {
                        dedupe_key,
                        cursor,
                        fields,
                        contributor: page.page_key.clone(),
                        arrival: page.arrival,
                    },
                );
                insert_at += 1;
            }
        }
    }
}

fn page_info_fields(graph: &Graph, page_key: Option<&str>) -> Option<FieldMap> {
    let page_key = page_key?;
    let record = graph.get_record(page_key)?;
    let info_ref = record.get(PAGE_INFO_FIELD)?;
    let info_key = crate::graph::ref_key(info_ref)?;
    graph.get_record(info_key).map(|info| info.fields().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: JsonValue) -> FieldMap {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn edge(cursor: &str, node: &str) -> EdgeInput {
        EdgeInput {
            cursor: Some(cursor.to_string()),
            node_ref: Some(node.to_string()),
            extras: FieldMap::new(),
        }
    }

    fn page(edges: Vec<EdgeInput>, start: &str, end: &str, has_next: bool) -> PageInput {
        PageInput {
            typename: Some("UserConnection".to_string()),
            edges,
            page_info: Some(fields(json!({
                "__typename": "PageInfo",
                "startCursor": start,
                "endCursor": end,
                "hasNextPage": has_next,
                "hasPreviousPage": false,
            }))),
            extras: FieldMap::new(),
        }
    }

    fn canonical_nodes(graph: &Graph, identity: &str) -> Vec<String> {
        let record = graph.get_record(identity).unwrap();
        let Some(JsonValue::Array(edges)) = record.get(EDGES_FIELD) else {
            panic!("canonical edges missing");
        };
        edges
            .iter()
            .map(|edge_ref| {
                let edge_key = crate::graph::ref_key(edge_ref).unwrap();
                let edge = graph.get_record(edge_key).unwrap();
                crate::graph::ref_key(edge.get(NODE_FIELD).unwrap())
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn forward_pages_append_after_cursor() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::forward(Vec::<String>::new());

        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 2})),
            page(vec![edge("u1", "User:1"), edge("u2", "User:2")], "u1", "u2", true),
        );
        let (_, identity) = store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 2, "after": "u2"})),
            page(vec![edge("u3", "User:3")], "u3", "u3", false),
        );

        assert_eq!(identity, "@.users");
        assert_eq!(
            canonical_nodes(&graph, &identity),
            vec!["User:1", "User:2", "User:3"],
        );
        let info = graph.get_record("@.users.pageInfo").unwrap();
        assert_eq!(info.get("startCursor"), Some(&json!("u1")));
        assert_eq!(info.get("endCursor"), Some(&json!("u3")));
        assert_eq!(info.get("hasNextPage"), Some(&json!(false)));
        assert_eq!(info.get("hasPreviousPage"), Some(&json!(false)));
    }

    #[test]
    fn duplicate_nodes_keep_first_position() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::forward(Vec::<String>::new());

        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 2})),
            page(vec![edge("u1", "User:1"), edge("u2", "User:2")], "u1", "u2", true),
        );
        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 2, "after": "u2"})),
            page(vec![edge("u2b", "User:2"), edge("u3", "User:3")], "u2b", "u3", false),
        );

        assert_eq!(
            canonical_nodes(&graph, "@.users"),
            vec!["User:1", "User:2", "User:3"],
        );
    }

    #[test]
    fn unknown_after_cursor_appends_at_tail() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::forward(Vec::<String>::new());

        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 1})),
            page(vec![edge("u1", "User:1")], "u1", "u1", true),
        );
        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 1, "after": "zz"})),
            page(vec![edge("u9", "User:9")], "u9", "u9", false),
        );

        assert_eq!(canonical_nodes(&graph, "@.users"), vec!["User:1", "User:9"]);
        if cfg!(debug_assertions) {
            assert!(!store.take_diagnostics().is_empty());
        }
    }

    #[test]
    fn backward_pages_prepend_before_cursor() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::backward(Vec::<String>::new());

        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"last": 2})),
            page(vec![edge("u8", "User:8"), edge("u9", "User:9")], "u8", "u9", false),
        );
        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"last": 2, "before": "u8"})),
            page(vec![edge("u6", "User:6"), edge("u7", "User:7")], "u6", "u7", false),
        );

        assert_eq!(
            canonical_nodes(&graph, "@.users"),
            vec!["User:6", "User:7", "User:8", "User:9"],
        );
    }

    #[test]
    fn page_mode_replaces_with_latest() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::page(Vec::<String>::new());

        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"page": 1})),
            page(vec![edge("u1", "User:1")], "u1", "u1", true),
        );
        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"page": 2})),
            page(vec![edge("u2", "User:2")], "u2", "u2", false),
        );

        assert_eq!(canonical_nodes(&graph, "@.users"), vec!["User:2"]);
    }

    #[test]
    fn filters_participate_in_identity() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::forward(["role"]);

        let (_, admins) = store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 1, "role": "admin"})),
            page(vec![edge("a1", "User:1")], "a1", "a1", false),
        );
        let (_, guests) = store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 1, "role": "guest"})),
            page(vec![edge("g1", "User:2")], "g1", "g1", false),
        );

        assert_eq!(admins, r#"@.users({"role":"admin"})"#);
        assert_eq!(guests, r#"@.users({"role":"guest"})"#);
        assert_eq!(canonical_nodes(&graph, &admins), vec!["User:1"]);
        assert_eq!(canonical_nodes(&graph, &guests), vec!["User:2"]);
    }

    #[test]
    fn empty_page_composes_empty_canonical() {
        let mut graph = Graph::new();
        let mut store = CanonicalStore::default();
        let spec = ConnectionSpec::forward(Vec::<String>::new());

        store.record_page(
            &mut graph,
            "@",
            "users",
            &spec,
            &fields(json!({"first": 10})),
            PageInput {
                typename: Some("UserConnection".to_string()),
                edges: vec![],
                page_info: Some(fields(json!({"hasNextPage": false, "hasPreviousPage": false}))),
                extras: FieldMap::new(),
            },
        );

        assert_eq!(canonical_nodes(&graph, "@.users"), Vec::<String>::new());
        let info = graph.get_record("@.users.pageInfo").unwrap();
        assert_eq!(info.get("hasNextPage"), Some(&json!(false)));
    }
}
