//! Optimistic overlays: stacked transactional layers of entity patches,
//! deletions and connection operations. Layers never mutate base records;
//! optimistic-preferring reads compose base ⊕ stack bottom-to-top, so the
//! topmost layer wins conflicting fields and removing a layer converges to
//! "base ⊕ remaining stack" under any revert order.

use crate::config::CacheConfig;
use crate::graph::make_ref;
use crate::graph::ref_key;
use crate::graph::FieldMap;
use crate::graph::Graph;
use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;

use crate::canonical::EDGES_FIELD;
use crate::canonical::NODE_FIELD;
use crate::canonical::PAGE_INFO_FIELD;

pub type LayerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchMode {
    #[default]
    Merge,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddPosition {
    Start,
    #[default]
    End,
    At(usize),
}

/// Options for appending/prepending a node into a canonical connection.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub cursor: Option<String>,
    pub position: Option<AddPosition>,
    /// Extra edge-level fields.
    pub edge: FieldMap,
}

#[derive(Debug, Clone)]
pub(crate) enum EntityOp {
    Patch { fields: FieldMap, mode: PatchMode },
    Delete,
}

#[derive(Debug, Clone)]
pub(crate) enum ConnectionOp {
    AddNode {
        node_key: String,
        cursor: Option<String>,
        position: AddPosition,
        edge: FieldMap,
    },
    RemoveNode {
        node_key: String,
    },
    UpdatePageInfo {
        fields: FieldMap,
    },
    Patch {
        fields: FieldMap,
    },
}

/// Addresses a canonical connection from an optimistic transaction.
#[derive(Debug, Clone)]
pub struct ConnectionArgs {
    pub parent: String,
    pub field: String,
    pub filters: FieldMap,
}

impl ConnectionArgs {
    /// A connection hanging off the query root.
    pub fn root(field: impl Into<String>) -> Self {
        Self {
            parent: crate::graph::ROOT_KEY.to_string(),
            field: field.into(),
            filters: FieldMap::new(),
        }
    }

    /// A connection hanging off an entity (`Type:id`).
    pub fn entity(parent: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            field: field.into(),
            filters: FieldMap::new(),
        }
    }

    pub fn filter(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.filters.insert(name.into(), value);
        self
    }

    pub(crate) fn identity_key(&self) -> String {
        crate::canonical::identity_key(
            &self.parent,
            &self.field,
            &self.filters,
            &self
                .filters
                .keys()
                .cloned()
                .collect::<Vec<_>>(),
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct TxState {
    pub(crate) entities: IndexMap<String, EntityOp>,
    pub(crate) connections: IndexMap<String, Vec<ConnectionOp>>,
}

/// Reads the current overlaid composition of a record, for function-shaped
/// patches that derive the new fields from the present ones.
pub(crate) type OverlayResolver = Rc<dyn Fn(&str) -> Option<FieldMap>>;

/// The overlay context handed to `modify_optimistic`'s closure. Operations
/// queue up; nothing takes effect until the returned handle commits.
pub struct OptimisticTx {
    state: Rc<RefCell<TxState>>,
    config: CacheConfig,
    resolver: Option<OverlayResolver>,
}

impl OptimisticTx {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(TxState::default())),
            config,
            resolver: None,
        }
    }

    pub(crate) fn with_resolver(mut self, resolver: OverlayResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub(crate) fn into_state(self) -> TxState {
        match Rc::try_unwrap(self.state) {
            Ok(state) => state.into_inner(),
            Err(state) => {
                // A connection handle escaped the transaction closure; take
                // what was queued so far.
                std::mem::take(&mut *state.borrow_mut())
            }
        }
    }

    /// Queues a patch of an entity record addressed by key.
    pub fn patch(&self, key: impl Into<String>, fields: FieldMap, mode: PatchMode) {
        queue_patch(&mut self.state.borrow_mut(), key.into(), fields, mode);
    }

    /// Queues a patch computed from the record's current overlaid fields
    /// (`None` when the record does not exist yet).
    pub fn patch_with(
        &self,
        key: impl Into<String>,
        mode: PatchMode,
        build: impl FnOnce(Option<FieldMap>) -> FieldMap,
    ) {
        let key = key.into();
        let current = self.resolver.as_ref().and_then(|resolve| resolve(&key));
        let fields = build(current);
        queue_patch(&mut self.state.borrow_mut(), key, fields, mode);
    }

    /// Queues a patch of an entity-like object; its identity is derived the
    /// same way `normalize` derives it. Unidentifiable objects are skipped.
    pub fn patch_entity(&self, entity: FieldMap, mode: PatchMode) {
        match self.config.identify(&entity) {
            Some(key) => queue_patch(&mut self.state.borrow_mut(), key, entity, mode),
            None => tracing::warn!("optimistic patch skipped: entity has no identity"),
        }
    }

    pub fn delete(&self, key: impl Into<String>) {
        self.state
            .borrow_mut()
            .entities
            .insert(key.into(), EntityOp::Delete);
    }

    pub fn delete_entity(&self, entity: &FieldMap) {
        match self.config.identify(entity) {
            Some(key) => self.delete(key),
            None => tracing::warn!("optimistic delete skipped: entity has no identity"),
        }
    }

    /// A handle for queueing operations against one canonical connection.
    pub fn connection(&self, args: ConnectionArgs) -> ConnectionHandle {
        ConnectionHandle {
            state: self.state.clone(),
            identity: args.identity_key(),
            config: self.config.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

fn queue_patch(state: &mut TxState, key: String, fields: FieldMap, mode: PatchMode) {
    if mode == PatchMode::Merge {
        if let Some(EntityOp::Patch {
            fields: existing, ..
        }) = state.entities.get_mut(&key)
        {
            for (field, value) in fields {
                existing.insert(field, value);
            }
            return;
        }
    }
    state.entities.insert(key, EntityOp::Patch { fields, mode });
}

pub struct ConnectionHandle {
    state: Rc<RefCell<TxState>>,
    identity: String,
    config: CacheConfig,
    resolver: Option<OverlayResolver>,
}

impl ConnectionHandle {
    fn push(&self, op: ConnectionOp) {
        self.state
            .borrow_mut()
            .connections
            .entry(self.identity.clone())
            .or_default()
            .push(op);
    }

    fn queue_add(&self, node: FieldMap, position: AddPosition, options: AddOptions) {
        let Some(node_key) = self.config.identify(&node) else {
            tracing::warn!(
                connection = self.identity.as_str(),
                "optimistic add skipped: node has no identity",
            );
            return;
        };
        // The node's own fields ride along as a merge patch so reads through
        // the overlay can resolve the new edge.
        queue_patch(
            &mut self.state.borrow_mut(),
            node_key.clone(),
            node,
            PatchMode::Merge,
        );
        self.push(ConnectionOp::AddNode {
            node_key,
            cursor: options.cursor,
            position: options.position.unwrap_or(position),
            edge: options.edge,
        });
    }

    pub fn append(&self, node: FieldMap, options: AddOptions) {
        self.queue_add(node, AddPosition::End, options);
    }

    pub fn prepend(&self, node: FieldMap, options: AddOptions) {
        self.queue_add(node, AddPosition::Start, options);
    }

    /// Alias for `append`/`prepend` by position.
    pub fn add_node(&self, node: FieldMap, position: AddPosition) {
        self.queue_add(node, position, AddOptions::default());
    }

    pub fn remove(&self, node_key: impl Into<String>) {
        self.push(ConnectionOp::RemoveNode {
            node_key: node_key.into(),
        });
    }

    /// Alias for `remove`.
    pub fn remove_node(&self, node_key: impl Into<String>) {
        self.remove(node_key);
    }

    pub fn update_page_info(&self, fields: FieldMap) {
        self.push(ConnectionOp::UpdatePageInfo { fields });
    }

    pub fn patch(&self, fields: FieldMap) {
        self.push(ConnectionOp::Patch { fields });
    }

    /// Queues a patch computed from the canonical record's current overlaid
    /// fields.
    pub fn patch_with(&self, build: impl FnOnce(Option<FieldMap>) -> FieldMap) {
        let current = self
            .resolver
            .as_ref()
            .and_then(|resolve| resolve(&self.identity));
        let fields = build(current);
        self.push(ConnectionOp::Patch { fields });
    }

    pub fn identity_key(&self) -> &str {
        &self.identity
    }
}

/// What `replay_optimistic` touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub entities: Vec<String>,
    pub connections: Vec<String>,
    /// Node keys of remove operations that found nothing to remove.
    pub removed: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct Layer {
    pub(crate) id: LayerId,
    pub(crate) entities: IndexMap<String, EntityOp>,
    pub(crate) connections: IndexMap<String, Vec<ConnectionOp>>,
    /// Synthetic edge records owned by this layer's add operations.
    pub(crate) virtual_edges: IndexMap<String, FieldMap>,
    /// Pre-images of the base fields this layer shadows, captured at commit.
    pub(crate) undo: IndexMap<String, FieldMap>,
}

#[derive(Debug, Default)]
pub struct OverlayStack {
    layers: Vec<Layer>,
    next_id: LayerId,
    epoch: u64,
}

impl OverlayStack {
    pub(crate) fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Monotonic counter bumped on commit, revert and replay. Memoized
    /// optimistic reads key on it.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn clear(&mut self) {
        self.layers.clear();
        self.epoch += 1;
    }

    /// Installs a transaction as the topmost layer. Captures pre-images of
    /// the shadowed base fields and records change notifications for every
    /// key the layer touches.
    pub(crate) fn commit(&mut self, graph: &mut Graph, state: TxState) -> LayerId {
        let id = self.next_id;
        self.next_id += 1;

        let mut layer = Layer {
            id,
            entities: state.entities,
            connections: state.connections,
            virtual_edges: IndexMap::new(),
            undo: IndexMap::new(),
        };

        for (key, op) in &layer.entities {
            let base = graph.get_record(key).map(|record| record.fields().clone());
            let (pre_image, changed): (FieldMap, Vec<String>) = match op {
                EntityOp::Patch { fields, .. } => {
                    let mut pre = FieldMap::new();
                    if let Some(base) = &base {
                        for field in fields.keys() {
                            if let Some(value) = base.get(field) {
                                pre.insert(field.clone(), value.clone());
                            }
                        }
                    }
                    (pre, fields.keys().cloned().collect())
                }
                EntityOp::Delete => {
                    let pre = base.clone().unwrap_or_default();
                    let changed = pre.keys().cloned().collect();
                    (pre, changed)
                }
            };
            layer.undo.insert(key.clone(), pre_image);
            graph.touch(key, changed);
        }

        let connection_keys: Vec<String> = layer.connections.keys().cloned().collect();
        for identity in &connection_keys {
            let mut pre = FieldMap::new();
            if let Some(record) = graph.get_record(identity) {
                if let Some(edges) = record.get(EDGES_FIELD) {
                    pre.insert(EDGES_FIELD.to_string(), edges.clone());
                }
            }
            layer.undo.insert(identity.clone(), pre);

            // Materialize this layer's synthetic edge records.
            let ops = layer.connections.get(identity).cloned().unwrap_or_default();
            for (index, op) in ops.iter().enumerate() {
                if let ConnectionOp::AddNode {
                    node_key,
                    cursor,
                    edge,
                    ..
                } = op
                {
                    let edge_key = format!("{identity}.{EDGES_FIELD}.opt.{id}.{index}");
                    let mut fields = edge.clone();
                    fields.insert(
                        crate::canonical::CURSOR_FIELD.to_string(),
                        cursor
                            .clone()
                            .map(JsonValue::String)
                            .unwrap_or(JsonValue::Null),
                    );
                    fields.insert(NODE_FIELD.to_string(), make_ref(node_key.clone()));
                    layer.virtual_edges.insert(edge_key, fields);
                }
            }

            graph.touch(
                identity,
                [EDGES_FIELD.to_string(), PAGE_INFO_FIELD.to_string()],
            );
            graph.touch(&format!("{identity}.{PAGE_INFO_FIELD}"), Vec::new());
        }

        tracing::debug!(
            layer = id,
            entities = layer.entities.len(),
            connections = layer.connections.len(),
            "committed optimistic layer",
        );
        self.layers.push(layer);
        self.epoch += 1;
        id
    }

    /// Removes a layer from the stack (any position) and records change
    /// notifications for everything it shadowed.
    pub(crate) fn revert(&mut self, graph: &mut Graph, id: LayerId) -> bool {
        let Some(index) = self.layers.iter().position(|layer| layer.id == id) else {
            return false;
        };
        let layer = self.layers.remove(index);
        for (key, op) in &layer.entities {
            let fields: Vec<String> = match op {
                EntityOp::Patch { fields, .. } => fields.keys().cloned().collect(),
                EntityOp::Delete => layer
                    .undo
                    .get(key)
                    .map(|pre| pre.keys().cloned().collect())
                    .unwrap_or_default(),
            };
            graph.touch(key, fields);
        }
        for identity in layer.connections.keys() {
            graph.touch(
                identity,
                [EDGES_FIELD.to_string(), PAGE_INFO_FIELD.to_string()],
            );
            graph.touch(&format!("{identity}.{PAGE_INFO_FIELD}"), Vec::new());
        }
        tracing::debug!(layer = id, "reverted optimistic layer");
        self.epoch += 1;
        true
    }

    /// Which of `keys` any layer shadows, split into entity keys and
    /// connection identity keys.
    pub(crate) fn intersecting(&self, keys: &[String]) -> (Vec<String>, Vec<String>) {
        let mut entities = IndexSet::new();
        let mut connections = IndexSet::new();
        for layer in &self.layers {
            for key in keys {
                if layer.entities.contains_key(key) {
                    entities.insert(key.clone());
                }
                if layer.connections.contains_key(key) {
                    connections.insert(key.clone());
                }
            }
        }
        (
            entities.into_iter().collect(),
            connections.into_iter().collect(),
        )
    }

    /// Re-applies the stack to the named keys after the base changed and
    /// reports what was touched. Removes that found nothing to remove are
    /// no-ops but show up in the report's `removed` set.
    pub(crate) fn replay(
        &mut self,
        graph: &mut Graph,
        entities: Option<Vec<String>>,
        connections: Option<Vec<String>>,
    ) -> ReplayReport {
        let mut report = ReplayReport::default();
        let entity_keys = entities.unwrap_or_else(|| {
            self.layers
                .iter()
                .flat_map(|layer| layer.entities.keys().cloned())
                .collect()
        });
        let connection_keys = connections.unwrap_or_else(|| {
            self.layers
                .iter()
                .flat_map(|layer| layer.connections.keys().cloned())
                .collect()
        });

        for key in entity_keys {
            if self
                .layers
                .iter()
                .any(|layer| layer.entities.contains_key(&key))
            {
                graph.touch(&key, Vec::new());
                report.entities.push(key);
            }
        }
        for identity in connection_keys {
            if !self
                .layers
                .iter()
                .any(|layer| layer.connections.contains_key(&identity))
            {
                continue;
            }
            let mut misses = Vec::new();
            let _ = self.effective_fields_inner(graph, &identity, Some(&mut misses));
            report.removed.extend(misses);
            graph.touch(
                &identity,
                [EDGES_FIELD.to_string(), PAGE_INFO_FIELD.to_string()],
            );
            report.connections.push(identity);
        }

        if !report.entities.is_empty() || !report.connections.is_empty() {
            self.epoch += 1;
        }
        report
    }

    /// The overlaid composition of the record at `key`: base fields with the
    /// stack applied bottom-to-top. `None` means the record does not exist
    /// (or an overlay deleted it).
    pub(crate) fn effective_fields(&self, graph: &Graph, key: &str) -> Option<FieldMap> {
        self.effective_fields_inner(graph, key, None)
    }

    fn effective_fields_inner(
        &self,
        graph: &Graph,
        key: &str,
        mut remove_misses: Option<&mut Vec<String>>,
    ) -> Option<FieldMap> {
        // Synthetic edges belong to exactly one layer; topmost lookup.
        for layer in self.layers.iter().rev() {
            if let Some(fields) = layer.virtual_edges.get(key) {
                return Some(fields.clone());
            }
        }

        let mut acc = graph.get_record(key).map(|record| record.fields().clone());

        let page_info_parent = key
            .strip_suffix(&format!(".{PAGE_INFO_FIELD}"))
            .map(str::to_string);

        for layer in &self.layers {
            if let Some(op) = layer.entities.get(key) {
                match op {
                    EntityOp::Delete => acc = None,
                    EntityOp::Patch { fields, mode } => {
                        let mut base = match (*mode, acc.take()) {
                            (PatchMode::Replace, _) => FieldMap::new(),
                            (PatchMode::Merge, Some(base)) => base,
                            (PatchMode::Merge, None) => FieldMap::new(),
                        };
                        for (field, value) in fields {
                            base.insert(field.clone(), value.clone());
                        }
                        acc = Some(base);
                    }
                }
            }
            if let Some(ops) = layer.connections.get(key) {
                acc = Some(self.apply_connection_ops(
                    graph,
                    key,
                    layer.id,
                    acc.take(),
                    ops,
                    remove_misses.as_deref_mut(),
                ));
            }
            if let Some(identity) = &page_info_parent {
                if let Some(ops) = layer.connections.get(identity) {
                    for op in ops {
                        if let ConnectionOp::UpdatePageInfo { fields } = op {
                            let mut base = acc.take().unwrap_or_default();
                            for (field, value) in fields {
                                base.insert(field.clone(), value.clone());
                            }
                            acc = Some(base);
                        }
                    }
                }
            }
        }
        acc
    }

    fn apply_connection_ops(
        &self,
        graph: &Graph,
        identity: &str,
        layer_id: LayerId,
        base: Option<FieldMap>,
        ops: &[ConnectionOp],
        mut remove_misses: Option<&mut Vec<String>>,
    ) -> FieldMap {
        let mut fields = base.unwrap_or_default();
        let mut edges: Vec<JsonValue> = match fields.get(EDGES_FIELD) {
            Some(JsonValue::Array(edges)) => edges.clone(),
            _ => Vec::new(),
        };

        for (index, op) in ops.iter().enumerate() {
            match op {
                ConnectionOp::AddNode {
                    node_key, position, ..
                } => {
                    let edge_key = format!("{identity}.{EDGES_FIELD}.opt.{layer_id}.{index}");
                    // Re-adding a present node moves it to the requested
                    // position and refreshes the edge.
                    edges.retain(|edge_ref| {
                        self.edge_node_key(graph, edge_ref)
                            .map_or(true, |existing| existing != *node_key)
                    });
                    let at = match position {
                        AddPosition::Start => 0,
                        AddPosition::End => edges.len(),
                        AddPosition::At(index) => (*index).min(edges.len()),
                    };
                    edges.insert(at, make_ref(edge_key));
                }
                ConnectionOp::RemoveNode { node_key } => {
                    let before = edges.len();
                    edges.retain(|edge_ref| {
                        self.edge_node_key(graph, edge_ref)
                            .map_or(true, |existing| existing != *node_key)
                    });
                    if edges.len() == before {
                        if let Some(misses) = remove_misses.as_deref_mut() {
                            misses.push(node_key.clone());
                        }
                    }
                }
                ConnectionOp::UpdatePageInfo { .. } => {
                    fields
                        .entry(PAGE_INFO_FIELD.to_string())
                        .or_insert_with(|| make_ref(format!("{identity}.{PAGE_INFO_FIELD}")));
                }
                ConnectionOp::Patch { fields: patch } => {
                    for (field, value) in patch {
                        if field == EDGES_FIELD {
                            continue;
                        }
                        fields.insert(field.clone(), value.clone());
                    }
                }
            }
        }

        fields.insert(EDGES_FIELD.to_string(), JsonValue::Array(edges));
        fields
    }

    /// Resolves the node key behind an edge ref, looking through synthetic
    /// edges of every layer before the graph.
    fn edge_node_key(&self, graph: &Graph, edge_ref: &JsonValue) -> Option<String> {
        let edge_key = ref_key(edge_ref)?;
        for layer in self.layers.iter().rev() {
            if let Some(fields) = layer.virtual_edges.get(edge_key) {
                return fields
                    .get(NODE_FIELD)
                    .and_then(ref_key)
                    .map(str::to_string);
            }
        }
        graph
            .get_record(edge_key)?
            .get(NODE_FIELD)
            .and_then(ref_key)
            .map(str::to_string)
    }
}
