//! Reactive read-only projections: entity views with stable identity,
//! subscriber sessions, and per-session composed connection views. A reverse
//! index from record keys to sessions is maintained lazily on access and
//! drives coalesced change callbacks.

use crate::canonical::CURSOR_FIELD;
use crate::canonical::EDGES_FIELD;
use crate::canonical::NODE_FIELD;
use crate::canonical::PAGE_INFO_FIELD;
use crate::config::DedupeBy;
use crate::graph::ref_key;
use crate::graph::ChangeBatch;
use crate::graph::FieldMap;
use crate::graph::Graph;
use crate::graph::TYPENAME_FIELD;
use crate::optimistic::OverlayStack;
use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

pub type SessionId = u64;

/// Shared read access to the store for views. Views read through the
/// optimistic overlay: that is the UI-facing path.
#[derive(Clone)]
pub(crate) struct StoreHandle {
    pub(crate) graph: Rc<RefCell<Graph>>,
    pub(crate) overlays: Rc<RefCell<OverlayStack>>,
}

impl StoreHandle {
    pub(crate) fn effective_fields(&self, key: &str) -> Option<FieldMap> {
        let graph = self.graph.borrow();
        self.overlays.borrow().effective_fields(&graph, key)
    }
}

#[derive(Default)]
struct SessionEntry {
    callbacks: Vec<Rc<dyn Fn(&[String])>>,
    active: bool,
}

/// Registry of view identities and the reverse dependency index.
#[derive(Default)]
pub(crate) struct ViewRegistry {
    views: IndexMap<(SessionId, String), Rc<ViewState>>,
    deps: IndexMap<String, IndexSet<SessionId>>,
    sessions: IndexMap<SessionId, SessionEntry>,
    next_session: SessionId,
}

impl ViewRegistry {
    fn create_session(&mut self) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(
            id,
            SessionEntry {
                callbacks: Vec::new(),
                active: true,
            },
        );
        id
    }

    fn drop_session(&mut self, id: SessionId) {
        self.sessions.shift_remove(&id);
        self.views.retain(|(session, _), _| *session != id);
        for dependents in self.deps.values_mut() {
            dependents.shift_remove(&id);
        }
        self.deps.retain(|_, dependents| !dependents.is_empty());
    }

    fn record_dep(&mut self, session: SessionId, key: &str) {
        self.deps
            .entry(key.to_string())
            .or_default()
            .insert(session);
    }

    /// Dispatch plan for one change batch: per affected session, the list of
    /// changed keys it depends on.
    fn dispatch_plan(&self, batch: &ChangeBatch) -> Vec<(Vec<Rc<dyn Fn(&[String])>>, Vec<String>)> {
        let mut per_session: IndexMap<SessionId, Vec<String>> = IndexMap::new();
        for key in batch.keys() {
            let Some(dependents) = self.deps.get(key) else {
                continue;
            };
            for session in dependents {
                per_session
                    .entry(*session)
                    .or_default()
                    .push(key.clone());
            }
        }
        per_session
            .into_iter()
            .filter_map(|(session, keys)| {
                let entry = self.sessions.get(&session)?;
                if !entry.active || entry.callbacks.is_empty() {
                    return None;
                }
                Some((entry.callbacks.clone(), keys))
            })
            .collect()
    }
}

/// Delivers a change batch to every session with a dependency on a changed
/// record. Callbacks run with no registry borrow held.
pub(crate) fn notify(registry: &Rc<RefCell<ViewRegistry>>, batch: &ChangeBatch) {
    let plan = registry.borrow().dispatch_plan(batch);
    for (callbacks, keys) in plan {
        for callback in callbacks {
            callback(&keys);
        }
    }
}

pub(crate) struct ViewState {
    session: SessionId,
    key: String,
    store: StoreHandle,
    registry: Weak<RefCell<ViewRegistry>>,
}

impl ViewState {
    fn touch(&self, key: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().record_dep(self.session, key);
        }
    }

    fn view(&self, key: &str) -> EntityView {
        let Some(registry) = self.registry.upgrade() else {
            // The cache instance is gone; hand out a detached view that can
            // still read whatever the store handle keeps alive.
            return EntityView {
                state: Rc::new(ViewState {
                    session: self.session,
                    key: key.to_string(),
                    store: self.store.clone(),
                    registry: Weak::new(),
                }),
            };
        };
        let state = {
            let mut registry_mut = registry.borrow_mut();
            registry_mut.record_dep(self.session, key);
            registry_mut
                .views
                .entry((self.session, key.to_string()))
                .or_insert_with(|| {
                    Rc::new(ViewState {
                        session: self.session,
                        key: key.to_string(),
                        store: self.store.clone(),
                        registry: Rc::downgrade(&registry),
                    })
                })
                .clone()
        };
        EntityView { state }
    }
}

/// A field read through a view.
#[derive(Clone)]
pub enum FieldValue {
    /// The field is not present on the record (an incomplete read).
    Missing,
    Null,
    Scalar(JsonValue),
    Entity(EntityView),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_entity(&self) -> Option<&EntityView> {
        match self {
            FieldValue::Entity(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&JsonValue> {
        match self {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }
}

/// A live, read-only proxy over one record. Field reads reflect the graph
/// (with the optimistic overlay) at read time; two accesses to the same key
/// within a session yield the same view identity.
#[derive(Clone)]
pub struct EntityView {
    state: Rc<ViewState>,
}

impl EntityView {
    pub fn key(&self) -> &str {
        &self.state.key
    }

    /// Identity comparison: same session-scoped view state.
    pub fn same_view(&self, other: &EntityView) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    pub fn exists(&self) -> bool {
        self.state.touch(&self.state.key);
        self.state.store.effective_fields(&self.state.key).is_some()
    }

    pub fn typename(&self) -> Option<String> {
        match self.field(TYPENAME_FIELD) {
            FieldValue::Scalar(JsonValue::String(typename)) => Some(typename),
            _ => None,
        }
    }

    /// Reads a field: scalars come back as values, refs as sub-views, arrays
    /// of refs as lists of sub-views.
    pub fn field(&self, name: &str) -> FieldValue {
        self.state.touch(&self.state.key);
        let Some(fields) = self.state.store.effective_fields(&self.state.key) else {
            return FieldValue::Missing;
        };
        match fields.get(name) {
            None => FieldValue::Missing,
            Some(value) => self.project(value),
        }
    }

    pub fn scalar(&self, name: &str) -> Option<JsonValue> {
        match self.field(name) {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    fn project(&self, value: &JsonValue) -> FieldValue {
        match value {
            JsonValue::Null => FieldValue::Null,
            other => match ref_key(other) {
                Some(target) => FieldValue::Entity(self.state.view(target)),
                None => match other {
                    JsonValue::Array(items) => {
                        FieldValue::List(items.iter().map(|item| self.project(item)).collect())
                    }
                    scalar => FieldValue::Scalar(scalar.clone()),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionViewMode {
    /// Concatenate pages in the order they were added, deduplicated.
    #[strum(to_string = "infinite")]
    Infinite,
    /// Expose a single selected page.
    #[strum(to_string = "page")]
    Page,
}

/// One composed edge of a [`ConnectionView`].
#[derive(Clone)]
pub struct ConnectionEdge {
    pub cursor: Option<String>,
    pub node: Option<EntityView>,
}

/// A per-subscriber composition of connection pages.
pub struct ConnectionView {
    state: Rc<ViewState>,
    parent: String,
    field: String,
    mode: ConnectionViewMode,
    dedupe: DedupeBy,
    pages: RefCell<Vec<FieldMap>>,
}

impl ConnectionView {
    /// Adds a page (by its full argument set) to the composition. In `page`
    /// mode the new page replaces the previous selection.
    pub fn add_page(&self, args: FieldMap) {
        let mut pages = self.pages.borrow_mut();
        match self.mode {
            ConnectionViewMode::Page => {
                pages.clear();
                pages.push(args);
            }
            ConnectionViewMode::Infinite => {
                if !pages.contains(&args) {
                    pages.push(args);
                }
            }
        }
    }

    /// Alias for `add_page` in `page` mode.
    pub fn select_page(&self, args: FieldMap) {
        let mut pages = self.pages.borrow_mut();
        pages.clear();
        pages.push(args);
    }

    pub fn edges(&self) -> Vec<ConnectionEdge> {
        let mut out: Vec<ConnectionEdge> = Vec::new();
        let mut seen: IndexSet<String> = IndexSet::new();
        for args in self.pages.borrow().iter() {
            let page_key = crate::canonical::page_key(&self.parent, &self.field, args);
            self.state.touch(&page_key);
            let Some(fields) = self.state.store.effective_fields(&page_key) else {
                continue;
            };
            let Some(JsonValue::Array(edge_refs)) = fields.get(EDGES_FIELD) else {
                continue;
            };
            for edge_ref in edge_refs {
                let Some(edge_key) = ref_key(edge_ref) else {
                    continue;
                };
                self.state.touch(edge_key);
                let Some(edge) = self.state.store.effective_fields(edge_key) else {
                    continue;
                };
                let cursor = edge
                    .get(CURSOR_FIELD)
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                let node_key = edge.get(NODE_FIELD).and_then(ref_key).map(str::to_string);
                let dedupe_key = match self.dedupe {
                    DedupeBy::Node => node_key.clone().or_else(|| cursor.clone()),
                    DedupeBy::Cursor => cursor.clone().or_else(|| node_key.clone()),
                };
                if let Some(dedupe_key) = dedupe_key {
                    if !seen.insert(dedupe_key) {
                        continue;
                    }
                }
                out.push(ConnectionEdge {
                    cursor,
                    node: node_key.as_deref().map(|key| self.state.view(key)),
                });
            }
        }
        out
    }

    pub fn nodes(&self) -> Vec<EntityView> {
        self.edges()
            .into_iter()
            .filter_map(|edge| edge.node)
            .collect()
    }

    /// The latest added page's page info.
    pub fn page_info(&self) -> Option<JsonValue> {
        let pages = self.pages.borrow();
        let args = pages.last()?;
        let page_key = crate::canonical::page_key(&self.parent, &self.field, args);
        let fields = self.state.store.effective_fields(&page_key)?;
        let info_key = fields.get(PAGE_INFO_FIELD).and_then(ref_key)?;
        self.state.touch(info_key);
        self.state
            .store
            .effective_fields(info_key)
            .map(JsonValue::Object)
    }
}

/// Settings for mounting a [`ConnectionView`] in a session.
#[derive(Debug, Clone)]
pub struct ConnectionViewArgs {
    pub parent: String,
    pub field: String,
    pub mode: ConnectionViewMode,
    pub dedupe: DedupeBy,
}

impl ConnectionViewArgs {
    pub fn infinite(parent: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            field: field.into(),
            mode: ConnectionViewMode::Infinite,
            dedupe: DedupeBy::Node,
        }
    }

    pub fn page(parent: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            field: field.into(),
            mode: ConnectionViewMode::Page,
            dedupe: DedupeBy::Node,
        }
    }

    pub fn dedupe_by(mut self, dedupe: DedupeBy) -> Self {
        self.dedupe = dedupe;
        self
    }
}

struct SessionInner {
    id: SessionId,
    store: StoreHandle,
    registry: Rc<RefCell<ViewRegistry>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.registry.borrow_mut().drop_session(self.id);
    }
}

/// A subscriber scope: it mounts views, holds them alive, and releases them
/// (with their dependency index entries) when dropped.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    pub(crate) fn new(store: StoreHandle, registry: Rc<RefCell<ViewRegistry>>) -> Self {
        let id = registry.borrow_mut().create_session();
        Self {
            inner: Rc::new(SessionInner {
                id,
                store,
                registry,
            }),
        }
    }

    fn root_state(&self, key: &str) -> Rc<ViewState> {
        let mut registry = self.inner.registry.borrow_mut();
        registry.record_dep(self.inner.id, key);
        registry
            .views
            .entry((self.inner.id, key.to_string()))
            .or_insert_with(|| {
                Rc::new(ViewState {
                    session: self.inner.id,
                    key: key.to_string(),
                    store: self.inner.store.clone(),
                    registry: Rc::downgrade(&self.inner.registry),
                })
            })
            .clone()
    }

    /// Mounts an entity view over `key`.
    pub fn entity(&self, key: impl Into<String>) -> EntityView {
        EntityView {
            state: self.root_state(&key.into()),
        }
    }

    /// Mounts a composed connection view.
    pub fn connection(&self, args: ConnectionViewArgs) -> ConnectionView {
        let identity = crate::canonical::identity_key(
            &args.parent,
            &args.field,
            &FieldMap::new(),
            &[],
        );
        ConnectionView {
            state: self.root_state(&identity),
            parent: args.parent,
            field: args.field,
            mode: args.mode,
            dedupe: args.dedupe,
            pages: RefCell::new(Vec::new()),
        }
    }

    /// Registers a coalesced change callback: it fires once per flush with
    /// the changed keys this session depends on.
    pub fn on_change(&self, callback: impl Fn(&[String]) + 'static) {
        let mut registry = self.inner.registry.borrow_mut();
        if let Some(entry) = registry.sessions.get_mut(&self.inner.id) {
            entry.callbacks.push(Rc::new(callback));
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (StoreHandle, Rc<RefCell<ViewRegistry>>) {
        let store = StoreHandle {
            graph: Rc::new(RefCell::new(Graph::new())),
            overlays: Rc::new(RefCell::new(OverlayStack::default())),
        };
        (store, Rc::new(RefCell::new(ViewRegistry::default())))
    }

    fn fields(value: JsonValue) -> FieldMap {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn views_read_live_fields_and_follow_refs() {
        let (store, registry) = store();
        store.graph.borrow_mut().put_record(
            "User:1",
            fields(json!({
                "__typename": "User",
                "name": "A",
                "bestFriend": {"__ref": "User:2"},
            })),
        );
        store
            .graph
            .borrow_mut()
            .put_record("User:2", fields(json!({"__typename": "User", "name": "B"})));

        let session = Session::new(store.clone(), registry);
        let user = session.entity("User:1");
        assert_eq!(user.scalar("name"), Some(json!("A")));

        let friend = user.field("bestFriend");
        let friend = friend.as_entity().unwrap();
        assert_eq!(friend.scalar("name"), Some(json!("B")));

        store
            .graph
            .borrow_mut()
            .put_record("User:2", fields(json!({"name": "B2"})));
        assert_eq!(friend.scalar("name"), Some(json!("B2")));
    }

    #[test]
    fn view_identity_is_stable_within_a_session() {
        let (store, registry) = store();
        store
            .graph
            .borrow_mut()
            .put_record("User:1", fields(json!({"__typename": "User"})));
        let session = Session::new(store, registry);
        let first = session.entity("User:1");
        let second = session.entity("User:1");
        assert!(first.same_view(&second));
    }

    #[test]
    fn change_callbacks_fire_for_dependencies_only() {
        let (store, registry) = store();
        store
            .graph
            .borrow_mut()
            .put_record("User:1", fields(json!({"__typename": "User", "name": "A"})));
        store
            .graph
            .borrow_mut()
            .put_record("User:2", fields(json!({"__typename": "User", "name": "B"})));
        store.graph.borrow_mut().take_pending();

        let session = Session::new(store.clone(), registry.clone());
        let user = session.entity("User:1");
        let _ = user.scalar("name");

        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        session.on_change(move |keys| sink.borrow_mut().extend(keys.iter().cloned()));

        store
            .graph
            .borrow_mut()
            .put_record("User:2", fields(json!({"name": "B2"})));
        let batch = store.graph.borrow_mut().take_pending().unwrap();
        notify(&registry, &batch);
        assert!(seen.borrow().is_empty());

        store
            .graph
            .borrow_mut()
            .put_record("User:1", fields(json!({"name": "A2"})));
        let batch = store.graph.borrow_mut().take_pending().unwrap();
        notify(&registry, &batch);
        assert_eq!(seen.borrow().as_slice(), ["User:1".to_string()]);
    }

    #[test]
    fn session_teardown_releases_dependencies() {
        let (store, registry) = store();
        store
            .graph
            .borrow_mut()
            .put_record("User:1", fields(json!({"__typename": "User", "name": "A"})));
        store.graph.borrow_mut().take_pending();

        {
            let session = Session::new(store.clone(), registry.clone());
            let user = session.entity("User:1");
            let _ = user.scalar("name");
            assert!(!registry.borrow().deps.is_empty());
        }
        assert!(registry.borrow().deps.is_empty());
        assert!(registry.borrow().sessions.is_empty());
    }
}
