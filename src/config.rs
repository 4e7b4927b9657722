use crate::error::TransportError;
use crate::graph::FieldMap;
use apollo_compiler::ExecutableDocument;
use futures::stream;
use futures::stream::LocalBoxStream;
use futures::StreamExt;
use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Value as JsonValue;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Derives the identity of an entity from its fields, or `None` when the
/// entity has no global identity (it is then stored as an embedded record).
pub type KeyFn = Rc<dyn Fn(&FieldMap) -> Option<String>>;

/// How the pages of a connection compose into its canonical view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum ConnectionMode {
    /// Pages fetched with `after` append behind their anchor cursor; a page
    /// with no `after` replaces the leader slice.
    #[strum(to_string = "forward")]
    Forward,
    /// Symmetric to [`ConnectionMode::Forward`] for `before`/prepend.
    #[strum(to_string = "backward")]
    Backward,
    /// No appending; the canonical view is the latest page.
    #[strum(to_string = "page")]
    Page,
}

/// Which edge attribute deduplicates the canonical edge list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
pub enum DedupeBy {
    #[strum(to_string = "cursor")]
    Cursor,
    #[strum(to_string = "node")]
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum OperationKind {
    #[strum(to_string = "query")]
    Query,
    #[strum(to_string = "mutation")]
    Mutation,
    #[strum(to_string = "subscription")]
    Subscription,
}

/// Cache/network interaction for a single query execution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum CachePolicy {
    /// Serve from cache when complete; hit the network only on a miss.
    #[default]
    #[strum(to_string = "cache-first")]
    CacheFirst,
    /// Serve from cache or fail with `CacheOnlyMiss`.
    #[strum(to_string = "cache-only")]
    CacheOnly,
    /// Always hit the network (except inside the hydration window).
    #[strum(to_string = "network-only")]
    NetworkOnly,
    /// Emit the cached view first, then the network result unless identical.
    #[strum(to_string = "cache-and-network")]
    CacheAndNetwork,
}

impl CachePolicy {
    /// Parses a policy string. An unknown policy is an invariant failure: it
    /// panics in debug builds and falls back to `network-only` with a warning
    /// in release builds.
    pub fn parse_lenient(input: &str) -> Self {
        match input.parse() {
            Ok(policy) => policy,
            Err(_) => {
                debug_assert!(false, "unknown cache policy {input:?}");
                tracing::warn!(policy = input, "unknown cache policy, using network-only");
                Self::NetworkOnly
            }
        }
    }
}

/// Connection behavior for one `(parent type, field)` pair.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub mode: ConnectionMode,
    /// The argument names that participate in the connection identity.
    /// Pagination arguments (`first`/`last`/`after`/`before`) never do.
    pub filters: Vec<String>,
    pub dedupe: DedupeBy,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Forward,
            filters: Vec::new(),
            dedupe: DedupeBy::Node,
        }
    }
}

impl ConnectionSpec {
    pub fn forward(filters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: ConnectionMode::Forward,
            filters: filters.into_iter().map(Into::into).collect(),
            dedupe: DedupeBy::Node,
        }
    }

    pub fn backward(filters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: ConnectionMode::Backward,
            filters: filters.into_iter().map(Into::into).collect(),
            dedupe: DedupeBy::Node,
        }
    }

    pub fn page(filters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mode: ConnectionMode::Page,
            filters: filters.into_iter().map(Into::into).collect(),
            dedupe: DedupeBy::Node,
        }
    }

    pub fn dedupe_by(mut self, dedupe: DedupeBy) -> Self {
        self.dedupe = dedupe;
        self
    }
}

/// The request handed to the user-supplied transport.
pub struct TransportRequest {
    pub document: Arc<ExecutableDocument>,
    pub operation_name: Option<String>,
    pub variables: FieldMap,
    pub kind: OperationKind,
}

/// What a transport resolves with: GraphQL-shaped `data` plus an optional
/// error. Tagged results are preferred over thrown errors on this boundary.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub data: JsonValue,
    pub error: Option<TransportError>,
}

impl TransportResponse {
    pub fn data(data: JsonValue) -> Self {
        Self { data, error: None }
    }
}

/// The network seam. The cache core is synchronous; these are the only
/// suspension points. Futures and streams are `!Send` on purpose: the cache
/// is a single-threaded cooperative structure.
#[async_trait::async_trait(?Send)]
pub trait Transport {
    async fn http(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    fn ws(
        &self,
        request: TransportRequest,
    ) -> LocalBoxStream<'static, Result<TransportResponse, TransportError>> {
        let _ = request;
        stream::once(async {
            Err(TransportError::new(
                "subscriptions are not supported by this transport",
            ))
        })
        .boxed_local()
    }
}

pub const DEFAULT_HYDRATION_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_SUSPENSION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Construction-time configuration of a cache instance.
#[derive(Clone)]
pub struct CacheConfig {
    keys: IndexMap<String, KeyFn>,
    interfaces: IndexMap<String, IndexSet<String>>,
    connections: IndexMap<String, IndexMap<String, ConnectionSpec>>,
    transport: Option<Rc<dyn Transport>>,
    hydration_timeout: Duration,
    suspension_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keys: IndexMap::new(),
            interfaces: IndexMap::new(),
            connections: IndexMap::new(),
            transport: None,
            hydration_timeout: DEFAULT_HYDRATION_TIMEOUT,
            suspension_timeout: DEFAULT_SUSPENSION_TIMEOUT,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("interfaces", &self.interfaces)
            .field("connections", &self.connections)
            .field("transport", &self.transport.is_some())
            .field("hydration_timeout", &self.hydration_timeout)
            .field("suspension_timeout", &self.suspension_timeout)
            .finish()
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a key function for a type (or interface) name.
    pub fn with_key(
        mut self,
        typename: impl Into<String>,
        key: impl Fn(&FieldMap) -> Option<String> + 'static,
    ) -> Self {
        self.keys.insert(typename.into(), Rc::new(key));
        self
    }

    /// Registers the common case: identity is the stringified `id` field.
    pub fn with_id_key(self, typename: impl Into<String>) -> Self {
        self.with_key(typename, |object| match object.get("id") {
            Some(JsonValue::String(id)) => Some(id.clone()),
            Some(JsonValue::Number(id)) => Some(id.to_string()),
            _ => None,
        })
    }

    pub fn with_interface(
        mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.interfaces
            .entry(name.into())
            .or_default()
            .extend(members.into_iter().map(Into::into));
        self
    }

    pub fn with_connection(
        mut self,
        parent: impl Into<String>,
        field: impl Into<String>,
        spec: ConnectionSpec,
    ) -> Self {
        self.connections
            .entry(parent.into())
            .or_default()
            .insert(field.into(), spec);
        self
    }

    pub fn with_transport(mut self, transport: Rc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_hydration_timeout(mut self, timeout: Duration) -> Self {
        self.hydration_timeout = timeout;
        self
    }

    pub fn with_suspension_timeout(mut self, timeout: Duration) -> Self {
        self.suspension_timeout = timeout;
        self
    }

    pub fn transport(&self) -> Option<&Rc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub fn hydration_timeout(&self) -> Duration {
        self.hydration_timeout
    }

    pub fn suspension_timeout(&self) -> Duration {
        self.suspension_timeout
    }

    /// Returns `Type:id` for an identifiable object, or `None` when the
    /// object has no `__typename` or its key function yields nothing.
    pub fn identify(&self, object: &FieldMap) -> Option<String> {
        let typename = object.get("__typename")?.as_str()?;
        let key_fn = self.key_fn_for(typename)?;
        let id = key_fn(object)?;
        Some(format!("{typename}:{id}"))
    }

    /// Whether a concrete type satisfies a fragment type condition, either
    /// exactly or through declared interface membership.
    pub fn type_matches(&self, concrete: &str, condition: &str) -> bool {
        if concrete == condition {
            return true;
        }
        self.interfaces
            .get(condition)
            .is_some_and(|members| members.contains(concrete))
    }

    /// The connection spec for a `(parent type, field)` pair, resolving the
    /// parent through interface membership when needed.
    pub fn connection(&self, parent_type: &str, field: &str) -> Option<&ConnectionSpec> {
        if let Some(spec) = self
            .connections
            .get(parent_type)
            .and_then(|fields| fields.get(field))
        {
            return Some(spec);
        }
        self.interfaces
            .iter()
            .filter(|(_, members)| members.contains(parent_type))
            .find_map(|(interface, _)| {
                self.connections
                    .get(interface)
                    .and_then(|fields| fields.get(field))
            })
    }

    fn key_fn_for(&self, typename: &str) -> Option<&KeyFn> {
        if let Some(key_fn) = self.keys.get(typename) {
            return Some(key_fn);
        }
        self.interfaces
            .iter()
            .filter(|(_, members)| members.contains(typename))
            .find_map(|(interface, _)| self.keys.get(interface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: JsonValue) -> FieldMap {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn identify_uses_key_function() {
        let config = CacheConfig::new().with_id_key("User");
        let user = object(json!({"__typename": "User", "id": 1, "name": "A"}));
        assert_eq!(config.identify(&user), Some("User:1".to_string()));
    }

    #[test]
    fn identify_falls_back_to_interface_key() {
        let config = CacheConfig::new()
            .with_id_key("Node")
            .with_interface("Node", ["User"]);
        let user = object(json!({"__typename": "User", "id": "u1"}));
        assert_eq!(config.identify(&user), Some("User:u1".to_string()));
    }

    #[test]
    fn identify_without_identity_is_none() {
        let config = CacheConfig::new().with_id_key("User");
        let anonymous = object(json!({"__typename": "User", "name": "A"}));
        assert_eq!(config.identify(&anonymous), None);
        let untyped = object(json!({"id": "u1"}));
        assert_eq!(config.identify(&untyped), None);
    }

    #[test]
    fn policy_strings_round_trip() {
        assert_eq!(
            "cache-and-network".parse::<CachePolicy>().unwrap(),
            CachePolicy::CacheAndNetwork,
        );
        assert_eq!(CachePolicy::CacheOnly.to_string(), "cache-only");
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn unknown_policy_falls_back_to_network_only() {
        assert_eq!(
            CachePolicy::parse_lenient("cache-sometimes"),
            CachePolicy::NetworkOnly,
        );
    }
}
