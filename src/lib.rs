//! A normalized GraphQL client cache.
//!
//! Documents (preparsed `apollo-compiler` ASTs) are compiled into traversal
//! plans; results are normalized into a graph of records addressed by stable
//! keys with `{"__ref": key}` edges; paginated connections compose into
//! canonical views; optimistic layers stack on top of committed state; and
//! reactive views and watchers re-emit when the records under them change.
//!
//! The cache is a single-threaded cooperative structure: all state lives on
//! one logical task, the only suspension points are transport calls, and
//! concurrent use from multiple threads must be externally serialized.

pub mod canonical;
pub mod config;
pub mod documents;
pub mod error;
pub mod graph;
pub mod operations;
pub mod optimistic;
pub mod planner;
pub mod ssr;
pub mod views;

pub use crate::config::CacheConfig;
pub use crate::config::CachePolicy;
pub use crate::config::ConnectionMode;
pub use crate::config::ConnectionSpec;
pub use crate::config::DedupeBy;
pub use crate::config::OperationKind;
pub use crate::config::Transport;
pub use crate::config::TransportRequest;
pub use crate::config::TransportResponse;
pub use crate::documents::MaterializeResult;
pub use crate::documents::OkFlags;
pub use crate::documents::Source;
pub use crate::error::CacheError;
pub use crate::error::TransportError;
pub use crate::graph::ChangeBatch;
pub use crate::graph::FieldMap;
pub use crate::operations::MutationRequest;
pub use crate::operations::QueryRequest;
pub use crate::operations::QueryResponse;
pub use crate::operations::QueryWatcher;
pub use crate::operations::ReadFragmentRequest;
pub use crate::operations::ReadQueryRequest;
pub use crate::operations::SubscriptionRequest;
pub use crate::operations::WatchEvent;
pub use crate::operations::WatchFragmentRequest;
pub use crate::operations::WatchRequest;
pub use crate::operations::WriteFragmentRequest;
pub use crate::operations::WriteQueryRequest;
pub use crate::optimistic::AddOptions;
pub use crate::optimistic::AddPosition;
pub use crate::optimistic::ConnectionArgs;
pub use crate::optimistic::OptimisticTx;
pub use crate::optimistic::PatchMode;
pub use crate::optimistic::ReplayReport;
pub use crate::planner::Document;
pub use crate::ssr::Snapshot;
pub use crate::views::ConnectionView;
pub use crate::views::ConnectionViewArgs;
pub use crate::views::ConnectionViewMode;
pub use crate::views::EntityView;
pub use crate::views::FieldValue;
pub use crate::views::Session;

use crate::canonical::CanonicalStore;
use crate::documents::MemoStore;
use crate::error::Diagnostic;
use crate::graph::ChangeHub;
use crate::graph::Graph;
use crate::graph::ListenerId;
use crate::optimistic::LayerId;
use crate::optimistic::OverlayStack;
use crate::optimistic::TxState;
use crate::planner::Planner;
use crate::ssr::HydrationGate;
use crate::views::StoreHandle;
use crate::views::ViewRegistry;
use serde_json::Value as JsonValue;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) struct CacheInner {
    pub(crate) config: Rc<CacheConfig>,
    pub(crate) planner: Planner,
    pub(crate) graph: Rc<RefCell<Graph>>,
    pub(crate) canonical: RefCell<CanonicalStore>,
    pub(crate) optimistic: Rc<RefCell<OverlayStack>>,
    pub(crate) memo: RefCell<MemoStore>,
    pub(crate) hub: RefCell<ChangeHub>,
    pub(crate) views: Rc<RefCell<ViewRegistry>>,
    pub(crate) hydration: HydrationGate,
    pub(crate) suspension: RefCell<operations::SuspensionWindow>,
    pub(crate) mutation_seq: Cell<u64>,
    pub(crate) subscription_seq: Cell<u64>,
    pub(crate) diagnostics: RefCell<Vec<Diagnostic>>,
}

/// A cache instance. Cloning is cheap and shares the instance; independent
/// instances are fully isolated from each other.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Rc<CacheInner>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                config: Rc::new(config),
                planner: Planner::default(),
                graph: Rc::new(RefCell::new(Graph::new())),
                canonical: RefCell::new(CanonicalStore::default()),
                optimistic: Rc::new(RefCell::new(OverlayStack::default())),
                memo: RefCell::new(MemoStore::default()),
                hub: RefCell::new(ChangeHub::default()),
                views: Rc::new(RefCell::new(ViewRegistry::default())),
                hydration: HydrationGate::default(),
                suspension: RefCell::new(operations::SuspensionWindow::default()),
                mutation_seq: Cell::new(0),
                subscription_seq: Cell::new(0),
                diagnostics: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns `Type:id` for an identifiable object, `None` otherwise.
    pub fn identify(&self, object: &FieldMap) -> Option<String> {
        self.inner.config.identify(object)
    }

    /// Shallow-merges fields into the record at `key`, creating it when
    /// absent. Returns whether anything changed.
    pub fn put_record(&self, key: &str, fields: FieldMap) -> bool {
        let changed = self.inner.graph.borrow_mut().put_record(key, fields);
        self.after_write();
        changed
    }

    /// Derives the entity's key and merges its fields into the graph.
    /// Returns the key, or `None` when the object has no identity.
    pub fn put_entity(&self, entity: FieldMap) -> Option<String> {
        let key = self.identify(&entity)?;
        self.inner.graph.borrow_mut().put_record(&key, entity);
        self.after_write();
        Some(key)
    }

    /// The committed record at `key` (no optimistic overlay).
    pub fn get_record(&self, key: &str) -> Option<FieldMap> {
        self.inner
            .graph
            .borrow()
            .get_record(key)
            .map(|record| record.fields().clone())
    }

    /// Deletes the record and its dependent embedded records (pages, edges).
    pub fn remove_record(&self, key: &str) -> bool {
        let removed = self.inner.graph.borrow_mut().remove_record(key);
        self.flush();
        removed
    }

    /// Opens a subscriber scope for views and composed connection views.
    pub fn session(&self) -> Session {
        Session::new(self.store_handle(), self.inner.views.clone())
    }

    /// Low-level change subscription: the listener receives each flushed
    /// change batch. Views and watchers are built on top of this.
    pub fn subscribe(&self, listener: Rc<dyn Fn(&ChangeBatch)>) -> ListenerId {
        self.inner.hub.borrow_mut().subscribe(listener)
    }

    pub fn unsubscribe(&self, listener: ListenerId) {
        self.inner.hub.borrow_mut().unsubscribe(listener);
    }

    /// Builds an optimistic transaction. The closure queues operations on
    /// the overlay context; nothing takes effect until `commit()` on the
    /// returned handle. An uncommitted handle is inert.
    pub fn modify_optimistic(&self, build: impl FnOnce(&OptimisticTx)) -> OptimisticHandle {
        let store = self.store_handle();
        let tx = OptimisticTx::new((*self.inner.config).clone())
            .with_resolver(Rc::new(move |key: &str| store.effective_fields(key)));
        build(&tx);
        OptimisticHandle {
            cache: self.clone(),
            pending: RefCell::new(Some(tx.into_state())),
            layer: Cell::new(None),
        }
    }

    /// Selectively re-applies committed overlay layers after base changes.
    pub fn replay_optimistic(
        &self,
        entities: Option<Vec<String>>,
        connections: Option<Vec<String>>,
    ) -> ReplayReport {
        let report = {
            let mut overlays = self.inner.optimistic.borrow_mut();
            let mut graph = self.inner.graph.borrow_mut();
            overlays.replay(&mut graph, entities, connections)
        };
        self.flush();
        report
    }

    /// Empties the graph (re-seeding the root), the canonical registry, the
    /// overlay stack and the memoization cache.
    pub fn clear(&self) {
        {
            let mut graph = self.inner.graph.borrow_mut();
            graph.clear();
            self.inner.canonical.borrow_mut().clear();
            self.inner.optimistic.borrow_mut().clear();
            self.inner.memo.borrow_mut().clear();
        }
        self.flush();
    }

    /// Entity keys currently present in the graph.
    pub fn inspect_entity_keys(&self) -> Vec<String> {
        self.inner.graph.borrow().entity_keys()
    }

    /// Canonical connection keys seen by this instance.
    pub fn inspect_connection_keys(&self) -> Vec<String> {
        self.inner.canonical.borrow().connection_keys()
    }

    pub fn inspect_record_count(&self) -> usize {
        self.inner.graph.borrow().record_count()
    }

    /// Serializes the graph into a JSON-safe snapshot.
    pub fn dehydrate(&self) -> Snapshot {
        ssr::dehydrate(&self.inner.graph.borrow())
    }

    /// Installs a snapshot and opens the hydration window, during which
    /// `network-only` queries prefer complete cached data.
    pub fn hydrate(&self, snapshot: Snapshot) {
        {
            let mut graph = self.inner.graph.borrow_mut();
            ssr::hydrate(&mut graph, snapshot);
        }
        self.inner
            .hydration
            .open(self.inner.config.hydration_timeout());
        self.after_write();
    }

    /// `hydrate` with a lazily produced snapshot.
    pub fn hydrate_with(&self, snapshot: impl FnOnce() -> Snapshot) {
        self.hydrate(snapshot());
    }

    pub fn is_hydrating(&self) -> bool {
        self.inner.hydration.is_hydrating()
    }

    /// Soft warnings retained in debug builds (anchor cursors that were not
    /// found, and the like).
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.inner.diagnostics.borrow_mut())
    }

    pub(crate) fn store_handle(&self) -> StoreHandle {
        StoreHandle {
            graph: self.inner.graph.clone(),
            overlays: self.inner.optimistic.clone(),
        }
    }

    /// Replays overlay layers that intersect the pending changes, collects
    /// composition diagnostics, and flushes one batched notification.
    pub(crate) fn after_write(&self) {
        let changed = self.inner.graph.borrow().pending_keys();
        {
            let mut overlays = self.inner.optimistic.borrow_mut();
            if !overlays.is_empty() {
                let (entities, connections) = overlays.intersecting(&changed);
                if !entities.is_empty() || !connections.is_empty() {
                    let mut graph = self.inner.graph.borrow_mut();
                    overlays.replay(&mut graph, Some(entities), Some(connections));
                }
            }
        }
        if cfg!(debug_assertions) {
            let diagnostics = self.inner.canonical.borrow_mut().take_diagnostics();
            self.inner.diagnostics.borrow_mut().extend(diagnostics);
        }
        self.flush();
    }

    /// Delivers the pending change batch: hub listeners first (watchers),
    /// then view sessions. No graph borrow is held while listeners run.
    pub(crate) fn flush(&self) {
        let batch = self.inner.graph.borrow_mut().take_pending();
        let Some(batch) = batch else {
            return;
        };
        self.inner.hydration.on_flush();
        let listeners = self.inner.hub.borrow().snapshot();
        for listener in listeners {
            listener(&batch);
        }
        views::notify(&self.inner.views, &batch);
    }
}

/// Handle of an optimistic transaction: commit installs the queued layer,
/// revert removes it again. Dropping an uncommitted handle discards it.
pub struct OptimisticHandle {
    cache: Cache,
    pending: RefCell<Option<TxState>>,
    layer: Cell<Option<LayerId>>,
}

impl OptimisticHandle {
    /// Installs the transaction as the topmost overlay layer. Returns false
    /// when the handle was already committed.
    pub fn commit(&self) -> bool {
        let Some(state) = self.pending.borrow_mut().take() else {
            return false;
        };
        let id = {
            let mut overlays = self.cache.inner.optimistic.borrow_mut();
            let mut graph = self.cache.inner.graph.borrow_mut();
            overlays.commit(&mut graph, state)
        };
        self.layer.set(Some(id));
        self.cache.flush();
        true
    }

    /// Removes the committed layer from the stack. Returns false when the
    /// handle was never committed or was already reverted.
    pub fn revert(&self) -> bool {
        let Some(id) = self.layer.take() else {
            return false;
        };
        let reverted = {
            let mut overlays = self.cache.inner.optimistic.borrow_mut();
            let mut graph = self.cache.inner.graph.borrow_mut();
            overlays.revert(&mut graph, id)
        };
        self.cache.flush();
        reverted
    }

    pub fn layer_id(&self) -> Option<LayerId> {
        self.layer.get()
    }
}

/// Converts a JSON value into a field map, for callers assembling data or
/// variables from `serde_json::json!` literals.
pub fn object(value: JsonValue) -> Option<FieldMap> {
    match value {
        JsonValue::Object(map) => Some(map),
        _ => None,
    }
}
