//! The record store: string-keyed records with `{"__ref": key}` edges,
//! per-record versions, a global tick, and batched change notifications.

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Value as JsonValue;
use std::rc::Rc;

/// Key of the synthetic root record.
pub const ROOT_KEY: &str = "@";
/// Typename carried by the synthetic root record.
pub const ROOT_TYPENAME: &str = "@";
/// Field name of the ref marker object.
pub const REF_FIELD: &str = "__ref";
pub const TYPENAME_FIELD: &str = "__typename";

pub type FieldMap = serde_json::Map<String, JsonValue>;

/// Builds a `{"__ref": key}` value.
pub fn make_ref(key: impl Into<String>) -> JsonValue {
    let mut map = FieldMap::new();
    map.insert(REF_FIELD.to_string(), JsonValue::String(key.into()));
    JsonValue::Object(map)
}

/// Reads the target key out of a `{"__ref": key}` value.
pub fn ref_key(value: &JsonValue) -> Option<&str> {
    value
        .as_object()
        .filter(|map| map.len() == 1)
        .and_then(|map| map.get(REF_FIELD))
        .and_then(JsonValue::as_str)
}

#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: FieldMap,
    version: u64,
}

impl Record {
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn typename(&self) -> Option<&str> {
        self.fields.get(TYPENAME_FIELD).and_then(JsonValue::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }
}

/// One coalesced delivery of changes: `{key → changed fields}` plus the graph
/// tick at delivery time.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub changes: IndexMap<String, IndexSet<String>>,
    pub tick: u64,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.changes.keys()
    }
}

pub type ListenerId = u64;

/// Fan-out of [`ChangeBatch`]es to subscribers. Kept separate from [`Graph`]
/// so a delivery can read the graph without re-entrant borrows.
#[derive(Default)]
pub struct ChangeHub {
    listeners: IndexMap<ListenerId, Rc<dyn Fn(&ChangeBatch)>>,
    next_id: ListenerId,
}

impl ChangeHub {
    pub fn subscribe(&mut self, listener: Rc<dyn Fn(&ChangeBatch)>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.insert(id, listener);
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.shift_remove(&id);
    }

    pub fn snapshot(&self) -> Vec<Rc<dyn Fn(&ChangeBatch)>> {
        self.listeners.values().cloned().collect()
    }
}

pub struct Graph {
    records: IndexMap<String, Record>,
    tick: u64,
    pending: IndexMap<String, IndexSet<String>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut graph = Self {
            records: IndexMap::new(),
            tick: 0,
            pending: IndexMap::new(),
        };
        graph.seed_root();
        graph
    }

    fn seed_root(&mut self) {
        let mut fields = FieldMap::new();
        fields.insert(
            TYPENAME_FIELD.to_string(),
            JsonValue::String(ROOT_TYPENAME.to_string()),
        );
        self.records.insert(
            ROOT_KEY.to_string(),
            Record {
                fields,
                version: 1,
            },
        );
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn get_record(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn version_of(&self, key: &str) -> u64 {
        self.records.get(key).map_or(0, Record::version)
    }

    /// Shallow-merges `partial` into the record at `key`, creating it when
    /// absent. The record version and the global tick bump only when at least
    /// one field actually changed; unchanged writes are silent.
    ///
    /// Returns whether anything changed.
    pub fn put_record(&mut self, key: &str, partial: FieldMap) -> bool {
        let record = self.records.entry(key.to_string()).or_default();
        let mut changed_fields: IndexSet<String> = IndexSet::new();
        for (field, value) in partial {
            if record.fields.get(&field) != Some(&value) {
                record.fields.insert(field.clone(), value);
                changed_fields.insert(field);
            }
        }
        if changed_fields.is_empty() {
            // A freshly created empty record still counts as a change.
            if record.version != 0 {
                return false;
            }
        }
        record.version += 1;
        self.tick += 1;
        self.pending
            .entry(key.to_string())
            .or_default()
            .extend(changed_fields);
        true
    }

    /// Records a change notification without touching record contents. Used
    /// by the optimistic layer, whose writes shadow rather than mutate.
    pub fn touch(&mut self, key: &str, fields: impl IntoIterator<Item = String>) {
        self.pending
            .entry(key.to_string())
            .or_default()
            .extend(fields);
    }

    /// Deletes the record and every purely-dependent embedded record (pages,
    /// edges, page infos) whose key extends the record's path.
    pub fn remove_record(&mut self, key: &str) -> bool {
        let mut removed = Vec::new();
        let child_prefix = format!("{key}.");
        let args_prefix = format!("{key}(");
        self.records.retain(|candidate, _| {
            let dependent = candidate == key
                || candidate.starts_with(&child_prefix)
                || candidate.starts_with(&args_prefix);
            if dependent {
                removed.push(candidate.clone());
            }
            !dependent
        });
        if removed.is_empty() {
            return false;
        }
        self.tick += 1;
        for key in removed {
            tracing::debug!(key = key.as_str(), "removed record");
            self.pending.entry(key).or_default();
        }
        true
    }

    /// Empties the graph and re-seeds the root record.
    pub fn clear(&mut self) {
        let keys: Vec<String> = self.records.keys().cloned().collect();
        self.records.clear();
        self.seed_root();
        self.tick += 1;
        for key in keys {
            self.pending.entry(key).or_default();
        }
    }

    /// Keys with changes queued for the next flush, without draining them.
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    /// Drains the pending change set into a batch, or `None` when no write
    /// happened since the last flush.
    pub fn take_pending(&mut self) -> Option<ChangeBatch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(ChangeBatch {
            changes: std::mem::take(&mut self.pending),
            tick: self.tick,
        })
    }

    /// Entity keys (`Type:id`) currently in the graph: everything that is
    /// neither the root nor an embedded path record.
    pub fn entity_keys(&self) -> Vec<String> {
        self.records
            .keys()
            .filter(|key| {
                key.as_str() != ROOT_KEY && key.contains(':') && !key.contains('.') && !key.contains('(')
            })
            .cloned()
            .collect()
    }
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

    #[test]
    fn put_record_merges_and_versions() {
        let mut graph = Graph::new();
        assert!(graph.put_record("User:1", fields(json!({"__typename": "User", "name": "A"}))));
        assert!(graph.put_record("User:1", fields(json!({"age": 3}))));
        let record = graph.get_record("User:1").unwrap();
        assert_eq!(record.version(), 2);
        assert_eq!(record.get("name"), Some(&json!("A")));
        assert_eq!(record.get("age"), Some(&json!(3)));
    }

    #[test]
    fn unchanged_write_does_not_bump_version() {
        let mut graph = Graph::new();
        graph.put_record("User:1", fields(json!({"name": "A"})));
        let tick = graph.tick();
        assert!(!graph.put_record("User:1", fields(json!({"name": "A"}))));
        assert_eq!(graph.version_of("User:1"), 1);
        assert_eq!(graph.tick(), tick);
    }

    #[test]
    fn pending_changes_batch_field_names() {
        let mut graph = Graph::new();
        graph.put_record("User:1", fields(json!({"name": "A"})));
        graph.put_record("User:1", fields(json!({"name": "B", "age": 3})));
        let batch = graph.take_pending().unwrap();
        let changed = batch.changes.get("User:1").unwrap();
        assert!(changed.contains("name"));
        assert!(changed.contains("age"));
        assert!(graph.take_pending().is_none());
    }

    #[test]
    fn remove_record_drops_dependents() {
        let mut graph = Graph::new();
        graph.put_record("User:1", fields(json!({"__typename": "User"})));
        graph.put_record(
            "User:1.posts({\"first\":2})",
            fields(json!({"__typename": "PostConnection"})),
        );
        graph.put_record(
            "User:1.posts({\"first\":2}).edges.0",
            fields(json!({"cursor": "p1"})),
        );
        graph.take_pending();
        assert!(graph.remove_record("User:1"));
        assert!(graph.get_record("User:1").is_none());
        assert!(graph.get_record("User:1.posts({\"first\":2})").is_none());
        assert!(graph.get_record("User:1.posts({\"first\":2}).edges.0").is_none());
        let batch = graph.take_pending().unwrap();
        assert!(batch.contains_key("User:1"));
    }

    #[test]
    fn clear_reseeds_root() {
        let mut graph = Graph::new();
        graph.put_record("User:1", fields(json!({"name": "A"})));
        graph.clear();
        assert!(graph.get_record("User:1").is_none());
        let root = graph.get_record(ROOT_KEY).unwrap();
        assert_eq!(root.typename(), Some(ROOT_TYPENAME));
    }

    #[test]
    fn refs_round_trip() {
        let reference = make_ref("User:1");
        assert_eq!(ref_key(&reference), Some("User:1"));
        assert_eq!(ref_key(&json!({"a": 1})), None);
        assert_eq!(ref_key(&json!("User:1")), None);
    }

    #[test]
    fn entity_keys_excludes_embedded_records() {
        let mut graph = Graph::new();
        graph.put_record("User:1", fields(json!({"__typename": "User"})));
        graph.put_record(
            "@.users({\"first\":2})",
            fields(json!({"__typename": "UserConnection"})),
        );
        assert_eq!(graph.entity_keys(), vec!["User:1".to_string()]);
    }
}
