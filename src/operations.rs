//! The public execution surface: write/read of queries and fragments,
//! query/mutation/subscription execution with cache policies, and reactive
//! watchers with latest-wins epoch gating.

use crate::config::CachePolicy;
use crate::config::OperationKind;
use crate::config::TransportRequest;
use crate::config::TransportResponse;
use crate::documents::normalize;
use crate::documents::MaterializeResult;
use crate::documents::ReadOptions;
use crate::error::CacheError;
use crate::error::TransportError;
use crate::graph::FieldMap;
use crate::graph::ListenerId;
use crate::graph::ROOT_KEY;
use crate::planner::Document;
use crate::planner::Plan;
use crate::Cache;
use futures::channel::mpsc::unbounded;
use futures::channel::mpsc::UnboundedReceiver;
use futures::channel::mpsc::UnboundedSender;
use futures::future;
use futures::stream::LocalBoxStream;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Completed query responses held per request fingerprint, so identical
/// queries inside the suspension window share one result without touching
/// the network again.
#[derive(Default)]
pub struct SuspensionWindow {
    held: HashMap<String, (Instant, QueryResponse)>,
}

impl SuspensionWindow {
    fn lookup(&mut self, key: &str, timeout: Duration) -> Option<QueryResponse> {
        match self.held.get(key) {
            Some((at, response)) if at.elapsed() <= timeout => Some(response.clone()),
            Some(_) => {
                self.held.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&mut self, key: String, response: QueryResponse) {
        self.held.insert(key, (Instant::now(), response));
    }
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub data: Option<JsonValue>,
    pub error: Option<CacheError>,
}

impl QueryResponse {
    fn failed(error: CacheError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Clone)]
pub struct QueryRequest {
    pub query: Document,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
    pub cache_policy: CachePolicy,
}

impl QueryRequest {
    pub fn new(query: Document) -> Self {
        Self {
            query,
            operation_name: None,
            variables: FieldMap::new(),
            cache_policy: CachePolicy::CacheFirst,
        }
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn variables(mut self, variables: FieldMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }
}

#[derive(Clone)]
pub struct MutationRequest {
    pub mutation: Document,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
}

impl MutationRequest {
    pub fn new(mutation: Document) -> Self {
        Self {
            mutation,
            operation_name: None,
            variables: FieldMap::new(),
        }
    }

    pub fn variables(mut self, variables: FieldMap) -> Self {
        self.variables = variables;
        self
    }
}

#[derive(Clone)]
pub struct SubscriptionRequest {
    pub subscription: Document,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
}

impl SubscriptionRequest {
    pub fn new(subscription: Document) -> Self {
        Self {
            subscription,
            operation_name: None,
            variables: FieldMap::new(),
        }
    }

    pub fn variables(mut self, variables: FieldMap) -> Self {
        self.variables = variables;
        self
    }
}

pub struct WriteQueryRequest {
    pub query: Document,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
    pub data: FieldMap,
    /// Synthetic root override (`@mutation.N`, `@subscription.N`); defaults
    /// to the query root.
    pub root_id: Option<String>,
}

impl WriteQueryRequest {
    pub fn new(query: Document, data: FieldMap) -> Self {
        Self {
            query,
            operation_name: None,
            variables: FieldMap::new(),
            data,
            root_id: None,
        }
    }

    pub fn variables(mut self, variables: FieldMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn root_id(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }
}

pub struct ReadQueryRequest {
    pub query: Document,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
    /// Read connections through their canonical views (default) or require
    /// exact pages.
    pub canonical: bool,
    pub prefer_optimistic: bool,
    pub root_id: Option<String>,
}

impl ReadQueryRequest {
    pub fn new(query: Document) -> Self {
        Self {
            query,
            operation_name: None,
            variables: FieldMap::new(),
            canonical: true,
            prefer_optimistic: true,
            root_id: None,
        }
    }

    pub fn variables(mut self, variables: FieldMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn strict(mut self) -> Self {
        self.canonical = false;
        self
    }

    pub fn committed_only(mut self) -> Self {
        self.prefer_optimistic = false;
        self
    }

    pub fn root_id(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }
}

pub struct WriteFragmentRequest {
    pub fragment: Document,
    pub fragment_name: Option<String>,
    /// The entity key (`Type:id`) the fragment writes into.
    pub id: String,
    pub variables: FieldMap,
    pub data: FieldMap,
}

impl WriteFragmentRequest {
    pub fn new(fragment: Document, id: impl Into<String>, data: FieldMap) -> Self {
        Self {
            fragment,
            fragment_name: None,
            id: id.into(),
            variables: FieldMap::new(),
            data,
        }
    }
}

pub struct ReadFragmentRequest {
    pub fragment: Document,
    pub fragment_name: Option<String>,
    pub id: String,
    pub variables: FieldMap,
    pub prefer_optimistic: bool,
}

impl ReadFragmentRequest {
    pub fn new(fragment: Document, id: impl Into<String>) -> Self {
        Self {
            fragment,
            fragment_name: None,
            id: id.into(),
            variables: FieldMap::new(),
            prefer_optimistic: true,
        }
    }
}

impl Cache {
    pub(crate) fn normalize_plan(
        &self,
        plan: &Rc<Plan>,
        variables: &FieldMap,
        data: &FieldMap,
        root_id: &str,
    ) -> Result<(), CacheError> {
        {
            let mut graph = self.inner.graph.borrow_mut();
            let mut canonical = self.inner.canonical.borrow_mut();
            normalize::normalize(
                &self.inner.config,
                &mut graph,
                &mut canonical,
                plan,
                variables,
                data,
                root_id,
            )?;
        }
        self.after_write();
        Ok(())
    }

    pub(crate) fn materialize_plan(
        &self,
        plan: &Rc<Plan>,
        variables: &FieldMap,
        root_id: &str,
        options: ReadOptions,
    ) -> MaterializeResult {
        let graph = self.inner.graph.borrow();
        let overlays = self.inner.optimistic.borrow();
        let mut memo = self.inner.memo.borrow_mut();
        crate::documents::materialize(
            &self.inner.config,
            &graph,
            &overlays,
            &mut memo,
            plan,
            variables,
            root_id,
            options,
        )
    }

    /// Normalizes `data` for the document into the graph.
    pub fn write_query(&self, request: WriteQueryRequest) -> Result<(), CacheError> {
        let plan = self.inner.planner.plan_operation(
            &self.inner.config,
            &request.query,
            request.operation_name.as_deref(),
        )?;
        let root_id = request.root_id.as_deref().unwrap_or(ROOT_KEY);
        self.normalize_plan(&plan, &request.variables, &request.data, root_id)
    }

    /// Materializes the document against the graph. Incompleteness is a
    /// diagnostic on the result (`ok`), not an error.
    pub fn read_query(&self, request: ReadQueryRequest) -> Result<MaterializeResult, CacheError> {
        let plan = self.inner.planner.plan_operation(
            &self.inner.config,
            &request.query,
            request.operation_name.as_deref(),
        )?;
        let root_id = request.root_id.as_deref().unwrap_or(ROOT_KEY);
        Ok(self.materialize_plan(
            &plan,
            &request.variables,
            root_id,
            ReadOptions {
                canonical: request.canonical,
                prefer_optimistic: request.prefer_optimistic,
                ..ReadOptions::default()
            },
        ))
    }

    /// Writes entity-shaped data through a fragment's selection set.
    pub fn write_fragment(&self, request: WriteFragmentRequest) -> Result<(), CacheError> {
        let plan = self.inner.planner.plan_fragment(
            &self.inner.config,
            &request.fragment,
            request.fragment_name.as_deref(),
        )?;
        self.normalize_plan(&plan, &request.variables, &request.data, &request.id)
    }

    pub fn read_fragment(
        &self,
        request: ReadFragmentRequest,
    ) -> Result<MaterializeResult, CacheError> {
        let plan = self.inner.planner.plan_fragment(
            &self.inner.config,
            &request.fragment,
            request.fragment_name.as_deref(),
        )?;
        Ok(self.materialize_plan(
            &plan,
            &request.variables,
            &request.id,
            ReadOptions {
                prefer_optimistic: request.prefer_optimistic,
                ..ReadOptions::default()
            },
        ))
    }

    /// Executes a query under a cache policy. Suspends only on transport.
    pub async fn execute_query(&self, request: QueryRequest) -> QueryResponse {
        let plan = match self.inner.planner.plan_operation(
            &self.inner.config,
            &request.query,
            request.operation_name.as_deref(),
        ) {
            Ok(plan) => plan,
            Err(error) => return QueryResponse::failed(error),
        };

        let policy = request.cache_policy;
        let try_cache = match policy {
            CachePolicy::CacheFirst | CachePolicy::CacheOnly | CachePolicy::CacheAndNetwork => {
                true
            }
            // The hydration window makes even network-only prefer cache.
            CachePolicy::NetworkOnly => self.is_hydrating(),
        };
        if try_cache {
            let cached = self.materialize_plan(
                &plan,
                &request.variables,
                ROOT_KEY,
                ReadOptions::default(),
            );
            if cached.ok.canonical && cached.data.is_some() {
                return QueryResponse {
                    data: cached.data,
                    error: None,
                };
            }
            if policy == CachePolicy::CacheOnly {
                return QueryResponse::failed(CacheError::CacheOnlyMiss);
            }
        }

        self.fetch_query(
            &plan,
            &request.query,
            request.operation_name.clone(),
            &request.variables,
        )
        .await
    }

    async fn fetch_query(
        &self,
        plan: &Rc<Plan>,
        query: &Document,
        operation_name: Option<String>,
        variables: &FieldMap,
    ) -> QueryResponse {
        let fingerprint = request_fingerprint(query, operation_name.as_deref(), variables);
        let timeout = self.inner.config.suspension_timeout();
        if let Some(held) = self
            .inner
            .suspension
            .borrow_mut()
            .lookup(&fingerprint, timeout)
        {
            tracing::debug!("identical query served from the suspension window");
            return held;
        }

        let Some(transport) = self.inner.config.transport().cloned() else {
            return QueryResponse::failed(CacheError::Network(TransportError::new(
                "no transport configured",
            )));
        };
        let result = transport
            .http(TransportRequest {
                document: query.clone(),
                operation_name,
                variables: variables.clone(),
                kind: OperationKind::Query,
            })
            .await;

        match result {
            Ok(TransportResponse { data, error: None }) => match data.as_object() {
                Some(map) => {
                    if let Err(error) = self.normalize_plan(plan, variables, map, ROOT_KEY) {
                        return QueryResponse::failed(error);
                    }
                    let materialized = self.materialize_plan(
                        plan,
                        variables,
                        ROOT_KEY,
                        ReadOptions::default(),
                    );
                    let response = QueryResponse {
                        data: materialized.data,
                        error: None,
                    };
                    self.inner
                        .suspension
                        .borrow_mut()
                        .store(fingerprint, response.clone());
                    response
                }
                None => QueryResponse::failed(CacheError::invariant(
                    "transport data is not an object",
                )),
            },
            Ok(TransportResponse {
                error: Some(error), ..
            }) => QueryResponse::failed(CacheError::Network(error)),
            Err(error) => QueryResponse::failed(CacheError::Network(error)),
        }
    }

    /// Executes a mutation. The result lands under a synthetic root
    /// (`@mutation.N`) so it never clobbers the query root, while entities
    /// inside it merge into the graph as usual.
    pub async fn execute_mutation(&self, request: MutationRequest) -> QueryResponse {
        let plan = match self.inner.planner.plan_operation(
            &self.inner.config,
            &request.mutation,
            request.operation_name.as_deref(),
        ) {
            Ok(plan) => plan,
            Err(error) => return QueryResponse::failed(error),
        };

        let root_id = format!("@mutation.{}", self.inner.mutation_seq.get());
        self.inner
            .mutation_seq
            .set(self.inner.mutation_seq.get() + 1);

        let Some(transport) = self.inner.config.transport().cloned() else {
            return QueryResponse::failed(CacheError::Network(TransportError::new(
                "no transport configured",
            )));
        };
        let result = transport
            .http(TransportRequest {
                document: request.mutation.clone(),
                operation_name: request.operation_name.clone(),
                variables: request.variables.clone(),
                kind: OperationKind::Mutation,
            })
            .await;

        match result {
            Ok(TransportResponse { data, error: None }) => match data.as_object() {
                Some(map) => {
                    if let Err(error) =
                        self.normalize_plan(&plan, &request.variables, map, &root_id)
                    {
                        return QueryResponse::failed(error);
                    }
                    let materialized = self.materialize_plan(
                        &plan,
                        &request.variables,
                        &root_id,
                        ReadOptions::default(),
                    );
                    QueryResponse {
                        data: materialized.data,
                        error: None,
                    }
                }
                None => QueryResponse::failed(CacheError::invariant(
                    "transport data is not an object",
                )),
            },
            Ok(TransportResponse {
                error: Some(error), ..
            }) => QueryResponse::failed(CacheError::Network(error)),
            Err(error) => QueryResponse::failed(CacheError::Network(error)),
        }
    }

    /// Starts a subscription: a lazy stream of responses materialized under
    /// a synthetic root (`@subscription.N`). A transport error terminates
    /// the stream after surfacing on the error channel.
    pub fn execute_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> Result<LocalBoxStream<'static, QueryResponse>, CacheError> {
        let plan = self.inner.planner.plan_operation(
            &self.inner.config,
            &request.subscription,
            request.operation_name.as_deref(),
        )?;
        let root_id = format!("@subscription.{}", self.inner.subscription_seq.get());
        self.inner
            .subscription_seq
            .set(self.inner.subscription_seq.get() + 1);

        let transport = self
            .inner
            .config
            .transport()
            .cloned()
            .ok_or_else(|| CacheError::Network(TransportError::new("no transport configured")))?;
        let events = transport.ws(TransportRequest {
            document: request.subscription.clone(),
            operation_name: request.operation_name.clone(),
            variables: request.variables.clone(),
            kind: OperationKind::Subscription,
        });

        let cache = self.clone();
        let variables = request.variables;
        let stream = events
            .scan(false, move |terminated, event| {
                if *terminated {
                    return future::ready(None);
                }
                let response = match event {
                    Ok(TransportResponse { data, error: None }) => match data.as_object() {
                        Some(map) => match cache.normalize_plan(&plan, &variables, map, &root_id)
                        {
                            Ok(()) => {
                                let materialized = cache.materialize_plan(
                                    &plan,
                                    &variables,
                                    &root_id,
                                    ReadOptions::default(),
                                );
                                QueryResponse {
                                    data: materialized.data,
                                    error: None,
                                }
                            }
                            Err(error) => {
                                *terminated = true;
                                QueryResponse::failed(error)
                            }
                        },
                        None => {
                            *terminated = true;
                            QueryResponse::failed(CacheError::invariant(
                                "transport data is not an object",
                            ))
                        }
                    },
                    Ok(TransportResponse {
                        error: Some(error), ..
                    }) => {
                        *terminated = true;
                        QueryResponse::failed(CacheError::Network(error))
                    }
                    Err(error) => {
                        *terminated = true;
                        QueryResponse::failed(CacheError::Network(error))
                    }
                };
                future::ready(Some(response))
            })
            .boxed_local();
        Ok(stream)
    }

    /// Mounts a reactive watcher over a query. The cache-side emission (per
    /// policy) happens synchronously; the network leg is driven by awaiting
    /// [`QueryWatcher::load`] or [`QueryWatcher::refetch`].
    pub fn watch_query(&self, request: WatchRequest) -> Result<QueryWatcher, CacheError> {
        let plan = self.inner.planner.plan_operation(
            &self.inner.config,
            &request.query,
            request.operation_name.as_deref(),
        )?;
        let watcher = self.mount_watcher(
            plan,
            request.query,
            request.operation_name,
            request.variables,
            request.cache_policy,
            None,
        );

        let emit_cached = match request.cache_policy {
            CachePolicy::CacheFirst | CachePolicy::CacheOnly | CachePolicy::CacheAndNetwork => {
                true
            }
            CachePolicy::NetworkOnly => self.is_hydrating(),
        };
        if emit_cached {
            recheck(&watcher.shared);
            if request.cache_policy == CachePolicy::CacheOnly && !watcher.shared.emitted.get() {
                let _ = watcher.shared.sender.unbounded_send(WatchEvent {
                    data: None,
                    error: Some(CacheError::CacheOnlyMiss),
                });
            }
        }
        Ok(watcher)
    }

    /// Mounts a reactive watcher over a fragment for one entity. Fragment
    /// watchers have no network leg; they follow the graph.
    pub fn watch_fragment(&self, request: WatchFragmentRequest) -> Result<QueryWatcher, CacheError> {
        let plan = self.inner.planner.plan_fragment(
            &self.inner.config,
            &request.fragment,
            request.fragment_name.as_deref(),
        )?;
        let watcher = self.mount_watcher(
            plan,
            request.fragment,
            request.fragment_name,
            request.variables,
            CachePolicy::CacheOnly,
            Some(request.id),
        );
        recheck(&watcher.shared);
        Ok(watcher)
    }

    fn mount_watcher(
        &self,
        plan: Rc<Plan>,
        document: Document,
        operation_name: Option<String>,
        variables: FieldMap,
        policy: CachePolicy,
        fragment_root: Option<String>,
    ) -> QueryWatcher {
        let (sender, receiver) = unbounded();
        let shared = Rc::new(WatchShared {
            cache: self.clone(),
            plan,
            document,
            operation_name,
            variables: RefCell::new(variables),
            policy,
            fragment_root,
            epoch: Cell::new(0),
            active: Cell::new(true),
            emitted: Cell::new(false),
            last_fingerprint: Cell::new(None),
            sender,
            listener: Cell::new(None),
        });
        let weak: Weak<WatchShared> = Rc::downgrade(&shared);
        let listener = self.subscribe(Rc::new(move |_batch| {
            if let Some(shared) = weak.upgrade() {
                recheck(&shared);
            }
        }));
        shared.listener.set(Some(listener));
        QueryWatcher { shared, receiver }
    }
}

fn request_fingerprint(query: &Document, operation_name: Option<&str>, variables: &FieldMap) -> String {
    format!(
        "{}:{}:{}",
        Arc::as_ptr(query) as usize,
        operation_name.unwrap_or_default(),
        crate::planner::canonical_json(&JsonValue::Object(variables.clone())),
    )
}

pub struct WatchRequest {
    pub query: Document,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
    pub cache_policy: CachePolicy,
}

impl WatchRequest {
    pub fn new(query: Document) -> Self {
        Self {
            query,
            operation_name: None,
            variables: FieldMap::new(),
            cache_policy: CachePolicy::CacheAndNetwork,
        }
    }

    pub fn variables(mut self, variables: FieldMap) -> Self {
        self.variables = variables;
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }
}

pub struct WatchFragmentRequest {
    pub fragment: Document,
    pub fragment_name: Option<String>,
    pub id: String,
    pub variables: FieldMap,
}

impl WatchFragmentRequest {
    pub fn new(fragment: Document, id: impl Into<String>) -> Self {
        Self {
            fragment,
            fragment_name: None,
            id: id.into(),
            variables: FieldMap::new(),
        }
    }
}

/// One emission of a watcher: data or an error, never both.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub data: Option<JsonValue>,
    pub error: Option<CacheError>,
}

struct WatchShared {
    cache: Cache,
    plan: Rc<Plan>,
    document: Document,
    operation_name: Option<String>,
    variables: RefCell<FieldMap>,
    policy: CachePolicy,
    fragment_root: Option<String>,
    /// Monotonic per-operation counter: completions from a stale epoch are
    /// discarded wholesale ("latest wins"), errors included.
    epoch: Cell<u64>,
    active: Cell<bool>,
    emitted: Cell<bool>,
    last_fingerprint: Cell<Option<u64>>,
    sender: UnboundedSender<WatchEvent>,
    listener: Cell<Option<ListenerId>>,
}

impl WatchShared {
    fn root_id(&self) -> &str {
        self.fragment_root.as_deref().unwrap_or(ROOT_KEY)
    }
}

/// Re-materializes and emits when the result actually changed (fingerprint
/// comparison), which is also what suppresses an identical network payload
/// after a cached emission.
fn recheck(shared: &Rc<WatchShared>) {
    if !shared.active.get() {
        return;
    }
    let variables = shared.variables.borrow().clone();
    let result = shared.cache.materialize_plan(
        &shared.plan,
        &variables,
        shared.root_id(),
        ReadOptions::default(),
    );
    if !result.ok.canonical || result.data.is_none() {
        return;
    }
    if shared.emitted.get() && result.fingerprint == shared.last_fingerprint.get() {
        return;
    }
    shared.last_fingerprint.set(result.fingerprint);
    shared.emitted.set(true);
    let _ = shared.sender.unbounded_send(WatchEvent {
        data: result.data,
        error: None,
    });
}

async fn fetch(shared: Rc<WatchShared>, variables: Option<FieldMap>) {
    if shared.fragment_root.is_some() {
        tracing::debug!("fragment watchers have no network leg");
        return;
    }
    let epoch = shared.epoch.get() + 1;
    shared.epoch.set(epoch);
    if let Some(variables) = variables {
        *shared.variables.borrow_mut() = variables;
    }
    let current = shared.variables.borrow().clone();

    let Some(transport) = shared.cache.inner.config.transport().cloned() else {
        if shared.active.get() {
            let _ = shared.sender.unbounded_send(WatchEvent {
                data: None,
                error: Some(CacheError::Network(TransportError::new(
                    "no transport configured",
                ))),
            });
        }
        return;
    };
    let result = transport
        .http(TransportRequest {
            document: shared.document.clone(),
            operation_name: shared.operation_name.clone(),
            variables: current.clone(),
            kind: OperationKind::Query,
        })
        .await;

    if shared.epoch.get() != epoch {
        tracing::debug!(epoch, "discarding completion from a stale epoch");
        return;
    }

    match result {
        Ok(TransportResponse { data, error: None }) => {
            let Some(map) = data.as_object() else {
                if shared.active.get() {
                    let _ = shared.sender.unbounded_send(WatchEvent {
                        data: None,
                        error: Some(CacheError::invariant("transport data is not an object")),
                    });
                }
                return;
            };
            // Writing the result flushes a change batch, which re-checks the
            // watcher; the direct recheck covers the no-change case where
            // nothing was emitted yet.
            if let Err(error) = shared
                .cache
                .normalize_plan(&shared.plan, &current, map, ROOT_KEY)
            {
                if shared.active.get() {
                    let _ = shared.sender.unbounded_send(WatchEvent {
                        data: None,
                        error: Some(error),
                    });
                }
                return;
            }
            recheck(&shared);
        }
        Ok(TransportResponse {
            error: Some(error), ..
        }) => {
            if shared.active.get() {
                let _ = shared.sender.unbounded_send(WatchEvent {
                    data: None,
                    error: Some(CacheError::Network(error)),
                });
            }
        }
        Err(error) => {
            if shared.active.get() {
                let _ = shared.sender.unbounded_send(WatchEvent {
                    data: None,
                    error: Some(CacheError::Network(error)),
                });
            }
        }
    }
}

/// A mounted reactive query: an event stream plus refetch/unsubscribe.
/// Unsubscribing (or dropping) detaches emissions; an in-flight network
/// completion may still populate the graph.
pub struct QueryWatcher {
    shared: Rc<WatchShared>,
    receiver: UnboundedReceiver<WatchEvent>,
}

impl QueryWatcher {
    /// Drives the policy-appropriate network leg: nothing for `cache-only`,
    /// a fetch on cache miss for `cache-first`, always for `network-only`
    /// and `cache-and-network`.
    pub async fn load(&self) {
        match self.shared.policy {
            CachePolicy::CacheOnly => {}
            CachePolicy::CacheFirst => {
                if !self.shared.emitted.get() {
                    fetch(self.shared.clone(), None).await;
                }
            }
            CachePolicy::NetworkOnly | CachePolicy::CacheAndNetwork => {
                fetch(self.shared.clone(), None).await;
            }
        }
    }

    /// Forces a network fetch with the current variables.
    pub async fn refetch(&self) {
        fetch(self.shared.clone(), None).await;
    }

    /// Forces a network fetch with new variables (a new epoch).
    pub async fn refetch_with(&self, variables: FieldMap) {
        fetch(self.shared.clone(), Some(variables)).await;
    }

    /// Marks the watcher inactive and detaches it from change delivery.
    pub fn unsubscribe(&self) {
        self.shared.active.set(false);
        if let Some(listener) = self.shared.listener.take() {
            self.shared.cache.unsubscribe(listener);
        }
        self.shared.sender.close_channel();
    }

    /// Non-blocking poll of the next emission.
    pub fn try_next_event(&mut self) -> Option<WatchEvent> {
        self.receiver.try_next().ok().flatten()
    }

    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.receiver.next().await
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch.get()
    }
}

impl Drop for QueryWatcher {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
