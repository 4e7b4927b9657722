use crate::common::cache_with_transport;
use crate::common::obj;
use crate::common::parse;
use crate::common::users_page;
use futures::executor::block_on;
use graph_cache::CacheError;
use graph_cache::CachePolicy;
use graph_cache::QueryRequest;
use graph_cache::TransportError;
use graph_cache::WatchRequest;
use graph_cache::WriteQueryRequest;
use pretty_assertions::assert_eq;
use serde_json::json;

const ME_QUERY: &str = "query { me { id name } }";
const USER_QUERY: &str = "query User($id: ID!) { user(id: $id) { id name } }";
const USERS_QUERY: &str = r#"
query Users($first: Int, $after: String) {
  users(first: $first, after: $after) {
    edges { cursor node { id name } }
    pageInfo { endCursor hasNextPage }
  }
}
"#;

#[test]
fn cache_first_fetches_once_then_serves_from_cache() {
    let (cache, transport) = cache_with_transport();
    let query = parse(ME_QUERY);
    transport.respond(json!({"me": {"__typename": "User", "id": "1", "name": "A"}}));

    let first = block_on(cache.execute_query(QueryRequest::new(query.clone())));
    assert!(first.error.is_none());
    assert_eq!(first.data.unwrap(), json!({"me": {"id": "1", "name": "A"}}));
    assert_eq!(transport.calls(), 1);

    let second = block_on(cache.execute_query(QueryRequest::new(query)));
    assert_eq!(second.data.unwrap(), json!({"me": {"id": "1", "name": "A"}}));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn cache_only_miss_is_an_error() {
    let (cache, transport) = cache_with_transport();
    let query = parse(ME_QUERY);

    let response = block_on(cache.execute_query(
        QueryRequest::new(query).cache_policy(CachePolicy::CacheOnly),
    ));
    assert!(response.data.is_none());
    assert_eq!(response.error, Some(CacheError::CacheOnlyMiss));
    assert_eq!(transport.calls(), 0);
}

#[test]
fn network_only_ignores_cached_data() {
    let (cache, transport) = cache_with_transport();
    let query = parse(ME_QUERY);
    cache
        .write_query(WriteQueryRequest::new(
            query.clone(),
            obj(json!({"me": {"__typename": "User", "id": "1", "name": "Old"}})),
        ))
        .unwrap();
    transport.respond(json!({"me": {"__typename": "User", "id": "1", "name": "New"}}));

    let response = block_on(cache.execute_query(
        QueryRequest::new(query).cache_policy(CachePolicy::NetworkOnly),
    ));
    assert_eq!(response.data.unwrap(), json!({"me": {"id": "1", "name": "New"}}));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn identical_queries_share_the_suspension_window() {
    let (cache, transport) = cache_with_transport();
    let query = parse(USER_QUERY);
    transport.respond(json!({"user": {"__typename": "User", "id": "1", "name": "A"}}));

    let request = || {
        QueryRequest::new(query.clone())
            .variables(obj(json!({"id": "1"})))
            .cache_policy(CachePolicy::NetworkOnly)
    };
    let first = block_on(cache.execute_query(request()));
    let second = block_on(cache.execute_query(request()));
    assert_eq!(first.data, second.data);
    // The second identical request re-used the held completion.
    assert_eq!(transport.calls(), 1);
}

#[test]
fn transport_failure_surfaces_as_network_error() {
    let (cache, transport) = cache_with_transport();
    let query = parse(ME_QUERY);
    transport.fail("boom");

    let response = block_on(cache.execute_query(QueryRequest::new(query)));
    assert!(response.data.is_none());
    assert_eq!(
        response.error,
        Some(CacheError::Network(TransportError::new("boom"))),
    );
}

#[test]
fn stale_epoch_completions_are_discarded() {
    let (cache, transport) = cache_with_transport();
    let query = parse(USER_QUERY);

    let mut watcher = cache
        .watch_query(
            WatchRequest::new(query)
                .variables(obj(json!({"id": "1"})))
                .cache_policy(CachePolicy::NetworkOnly),
        )
        .unwrap();
    assert!(watcher.try_next_event().is_none());

    // Request A resolves late (with an error); request B wins the epoch race.
    let release_a = transport.respond_when();
    transport.respond(json!({"user": {"__typename": "User", "id": "2", "name": "B"}}));

    block_on(async {
        let a = watcher.refetch_with(obj(json!({"id": "1"})));
        let b = async {
            watcher.refetch_with(obj(json!({"id": "2"}))).await;
            release_a
                .send(Err(TransportError::new("slow failure")))
                .ok();
        };
        futures::join!(a, b);
    });

    let event = watcher.try_next_event().expect("the winning emission");
    assert!(event.error.is_none());
    assert_eq!(event.data.unwrap(), json!({"user": {"id": "2", "name": "B"}}));
    // A's late error never surfaced.
    assert!(watcher.try_next_event().is_none());
}

#[test]
fn cache_and_network_suppresses_identical_payload() {
    let (cache, transport) = cache_with_transport();
    let query = parse(USERS_QUERY);
    let page = users_page(&[("u1", "1", "A"), ("u2", "2", "B")], false, false);

    cache
        .write_query(
            WriteQueryRequest::new(query.clone(), obj(json!({"users": page.clone()})))
                .variables(obj(json!({"first": 2}))),
        )
        .unwrap();

    let mut watcher = cache
        .watch_query(
            WatchRequest::new(query)
                .variables(obj(json!({"first": 2})))
                .cache_policy(CachePolicy::CacheAndNetwork),
        )
        .unwrap();
    let cached = watcher.try_next_event().expect("cached emission");
    assert!(cached.error.is_none());

    transport.respond(json!({"users": page}));
    block_on(watcher.load());
    assert_eq!(transport.calls(), 1);

    // The identical network payload does not re-emit.
    assert!(watcher.try_next_event().is_none());
}

#[test]
fn cache_and_network_emits_changed_payload() {
    let (cache, transport) = cache_with_transport();
    let query = parse(USERS_QUERY);

    cache
        .write_query(
            WriteQueryRequest::new(
                query.clone(),
                obj(json!({"users": users_page(&[("u1", "1", "A")], false, false)})),
            )
            .variables(obj(json!({"first": 2}))),
        )
        .unwrap();

    let mut watcher = cache
        .watch_query(
            WatchRequest::new(query)
                .variables(obj(json!({"first": 2})))
                .cache_policy(CachePolicy::CacheAndNetwork),
        )
        .unwrap();
    let cached = watcher.try_next_event().expect("cached emission");
    assert_eq!(
        cached.data.unwrap()["users"]["edges"][0]["node"]["name"],
        json!("A"),
    );

    transport.respond(json!({"users": users_page(&[("u1", "1", "A2")], false, false)}));
    block_on(watcher.load());

    let refreshed = watcher.try_next_event().expect("network emission");
    assert_eq!(
        refreshed.data.unwrap()["users"]["edges"][0]["node"]["name"],
        json!("A2"),
    );
}

#[test]
fn watcher_error_emission_keeps_last_good_data() {
    let (cache, transport) = cache_with_transport();
    let query = parse(ME_QUERY);
    cache
        .write_query(WriteQueryRequest::new(
            query.clone(),
            obj(json!({"me": {"__typename": "User", "id": "1", "name": "A"}})),
        ))
        .unwrap();

    let mut watcher = cache
        .watch_query(WatchRequest::new(query).cache_policy(CachePolicy::CacheAndNetwork))
        .unwrap();
    let cached = watcher.try_next_event().expect("cached emission");
    assert_eq!(cached.data.unwrap(), json!({"me": {"id": "1", "name": "A"}}));

    transport.fail("offline");
    block_on(watcher.load());

    let error_event = watcher.try_next_event().expect("error emission");
    assert!(error_event.data.is_none());
    assert!(matches!(error_event.error, Some(CacheError::Network(_))));

    // The graph still serves the last good data.
    let replay = block_on(cache.execute_query(QueryRequest::new(parse(ME_QUERY))));
    assert_eq!(replay.data.unwrap(), json!({"me": {"id": "1", "name": "A"}}));
}

#[test]
fn unsubscribed_watchers_stop_emitting() {
    let (cache, _transport) = cache_with_transport();
    let query = parse(ME_QUERY);
    cache
        .write_query(WriteQueryRequest::new(
            query.clone(),
            obj(json!({"me": {"__typename": "User", "id": "1", "name": "A"}})),
        ))
        .unwrap();

    let mut watcher = cache
        .watch_query(WatchRequest::new(query.clone()).cache_policy(CachePolicy::CacheFirst))
        .unwrap();
    assert!(watcher.try_next_event().is_some());
    watcher.unsubscribe();

    cache
        .write_query(WriteQueryRequest::new(
            query,
            obj(json!({"me": {"__typename": "User", "id": "1", "name": "B"}})),
        ))
        .unwrap();
    assert!(watcher.try_next_event().is_none());
}

#[test]
fn mutations_land_under_synthetic_roots() {
    let (cache, transport) = cache_with_transport();
    let query = parse(ME_QUERY);
    cache
        .write_query(WriteQueryRequest::new(
            query.clone(),
            obj(json!({"me": {"__typename": "User", "id": "1", "name": "A"}})),
        ))
        .unwrap();

    let mutation = parse(
        r#"mutation Rename($id: ID!, $name: String) {
  renameUser(id: $id, name: $name) { id name }
}"#,
    );
    transport.respond(json!({"renameUser": {"__typename": "User", "id": "1", "name": "Renamed"}}));
    let response = block_on(cache.execute_mutation(
        graph_cache::MutationRequest::new(mutation).variables(obj(json!({
            "id": "1",
            "name": "Renamed",
        }))),
    ));
    assert_eq!(
        response.data.unwrap(),
        json!({"renameUser": {"id": "1", "name": "Renamed"}}),
    );

    // The mutation merged into the shared entity without clobbering `@`.
    let me = block_on(cache.execute_query(QueryRequest::new(query)));
    assert_eq!(me.data.unwrap(), json!({"me": {"id": "1", "name": "Renamed"}}));
}
