use async_trait::async_trait;
use futures::channel::oneshot;
use futures::stream;
use futures::stream::LocalBoxStream;
use futures::StreamExt;
use graph_cache::Cache;
use graph_cache::CacheConfig;
use graph_cache::ConnectionSpec;
use graph_cache::Document;
use graph_cache::FieldMap;
use graph_cache::Transport;
use graph_cache::TransportError;
use graph_cache::TransportRequest;
use graph_cache::TransportResponse;
use serde_json::json;
use serde_json::Value as JsonValue;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

pub const SCHEMA: &str = r#"
type Query {
  me: User
  user(id: ID!): User
  users(first: Int, last: Int, after: String, before: String, role: String): UserConnection
}

type Mutation {
  renameUser(id: ID!, name: String): User
}

type Subscription {
  userUpdated(id: ID!): User
}

type User {
  id: ID!
  name: String
  email: String
  role: String
  bestFriend: User
}

type UserConnection {
  edges: [UserEdge]
  pageInfo: PageInfo
  totalCount: Int
}

type UserEdge {
  cursor: String
  node: User
}

type PageInfo {
  startCursor: String
  endCursor: String
  hasNextPage: Boolean
  hasPreviousPage: Boolean
}
"#;

pub fn parse(operation: &str) -> Document {
    let schema = apollo_compiler::Schema::parse_and_validate(SCHEMA, "schema.graphql")
        .expect("test schema should parse and validate");
    let document = apollo_compiler::ExecutableDocument::parse(&schema, operation, "document.graphql")
        .expect("test document should parse");
    Arc::new(document)
}

pub fn config() -> CacheConfig {
    CacheConfig::new()
        .with_id_key("User")
        .with_connection("Query", "users", ConnectionSpec::forward(["role"]))
}

pub fn cache() -> Cache {
    Cache::new(config())
}

pub fn obj(value: JsonValue) -> FieldMap {
    match value {
        JsonValue::Object(map) => map,
        _ => panic!("expected a JSON object"),
    }
}

/// A page of the `users` connection in response shape.
pub fn users_page(edges: &[(&str, &str, &str)], has_next: bool, has_previous: bool) -> JsonValue {
    let edge_values: Vec<JsonValue> = edges
        .iter()
        .map(|(cursor, id, name)| {
            json!({
                "__typename": "UserEdge",
                "cursor": cursor,
                "node": {"__typename": "User", "id": id, "name": name},
            })
        })
        .collect();
    json!({
        "__typename": "UserConnection",
        "edges": edge_values,
        "pageInfo": {
            "__typename": "PageInfo",
            "startCursor": edges.first().map(|(cursor, _, _)| *cursor),
            "endCursor": edges.last().map(|(cursor, _, _)| *cursor),
            "hasNextPage": has_next,
            "hasPreviousPage": has_previous,
        },
    })
}

pub enum Scripted {
    Ready(Result<TransportResponse, TransportError>),
    Wait(oneshot::Receiver<Result<TransportResponse, TransportError>>),
}

/// A scripted transport: `http` pops the next scripted response in order;
/// `ws` replays the scripted event stream.
#[derive(Default)]
pub struct MockTransport {
    script: RefCell<VecDeque<Scripted>>,
    ws_events: RefCell<Vec<Result<TransportResponse, TransportError>>>,
    calls: Cell<usize>,
}

impl MockTransport {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn respond(&self, data: JsonValue) {
        self.script
            .borrow_mut()
            .push_back(Scripted::Ready(Ok(TransportResponse::data(data))));
    }

    pub fn fail(&self, message: &str) {
        self.script
            .borrow_mut()
            .push_back(Scripted::Ready(Err(TransportError::new(message))));
    }

    /// Scripts a response that resolves only when the returned sender fires.
    pub fn respond_when(
        &self,
    ) -> oneshot::Sender<Result<TransportResponse, TransportError>> {
        let (sender, receiver) = oneshot::channel();
        self.script.borrow_mut().push_back(Scripted::Wait(receiver));
        sender
    }

    pub fn ws_event(&self, data: JsonValue) {
        self.ws_events
            .borrow_mut()
            .push(Ok(TransportResponse::data(data)));
    }

    pub fn ws_fail(&self, message: &str) {
        self.ws_events
            .borrow_mut()
            .push(Err(TransportError::new(message)));
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

#[async_trait(?Send)]
impl Transport for MockTransport {
    async fn http(&self, _request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.set(self.calls.get() + 1);
        match self.script.borrow_mut().pop_front() {
            Some(Scripted::Ready(result)) => result,
            Some(Scripted::Wait(receiver)) => receiver
                .await
                .unwrap_or_else(|_| Err(TransportError::new("scripted response dropped"))),
            None => Err(TransportError::new("unscripted request")),
        }
    }

    fn ws(
        &self,
        _request: TransportRequest,
    ) -> LocalBoxStream<'static, Result<TransportResponse, TransportError>> {
        let events: Vec<_> = self.ws_events.borrow_mut().drain(..).collect();
        stream::iter(events).boxed_local()
    }
}

pub fn cache_with_transport() -> (Cache, Rc<MockTransport>) {
    let transport = MockTransport::new();
    let cache = Cache::new(config().with_transport(transport.clone()));
    (cache, transport)
}
