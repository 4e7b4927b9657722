use crate::common::cache_with_transport;
use crate::common::obj;
use crate::common::parse;
use futures::executor::block_on;
use futures::StreamExt;
use graph_cache::CacheError;
use graph_cache::ReadQueryRequest;
use graph_cache::SubscriptionRequest;
use graph_cache::WriteFragmentRequest;
use pretty_assertions::assert_eq;
use serde_json::json;

const SUBSCRIPTION: &str = r#"
subscription OnUserUpdated($id: ID!) {
  userUpdated(id: $id) { id name }
}
"#;

#[test]
fn subscription_results_land_under_their_root() {
    let (cache, transport) = cache_with_transport();
    transport.ws_event(json!({
        "userUpdated": {"__typename": "User", "id": "7", "name": "Old"},
    }));

    let subscription = parse(SUBSCRIPTION);
    let mut stream = cache
        .execute_subscription(
            SubscriptionRequest::new(subscription.clone()).variables(obj(json!({"id": "7"}))),
        )
        .unwrap();

    let first = block_on(stream.next()).expect("one subscription event");
    assert!(first.error.is_none());
    assert_eq!(
        first.data.unwrap(),
        json!({"userUpdated": {"id": "7", "name": "Old"}}),
    );
    assert!(block_on(stream.next()).is_none());

    // The subscription root resolves the entity reference at read time.
    cache
        .write_fragment(WriteFragmentRequest::new(
            parse("fragment UserName on User { id name }"),
            "User:7",
            obj(json!({"__typename": "User", "id": "7", "name": "New"})),
        ))
        .unwrap();

    let result = cache
        .read_query(
            ReadQueryRequest::new(subscription)
                .variables(obj(json!({"id": "7"})))
                .root_id("@subscription.0"),
        )
        .unwrap();
    assert_eq!(
        result.data.unwrap(),
        json!({"userUpdated": {"id": "7", "name": "New"}}),
    );
}

#[test]
fn subscription_roots_do_not_clobber_the_query_root() {
    let (cache, transport) = cache_with_transport();
    cache
        .write_query(graph_cache::WriteQueryRequest::new(
            parse("query { me { id name } }"),
            obj(json!({"me": {"__typename": "User", "id": "1", "name": "Me"}})),
        ))
        .unwrap();

    transport.ws_event(json!({
        "userUpdated": {"__typename": "User", "id": "2", "name": "Other"},
    }));
    let mut stream = cache
        .execute_subscription(
            SubscriptionRequest::new(parse(SUBSCRIPTION)).variables(obj(json!({"id": "2"}))),
        )
        .unwrap();
    block_on(stream.next()).expect("one subscription event");

    let me = cache
        .read_query(ReadQueryRequest::new(parse("query { me { id name } }")))
        .unwrap();
    assert_eq!(me.data.unwrap(), json!({"me": {"id": "1", "name": "Me"}}));
}

#[test]
fn transport_error_terminates_the_subscription() {
    let (cache, transport) = cache_with_transport();
    transport.ws_event(json!({
        "userUpdated": {"__typename": "User", "id": "7", "name": "A"},
    }));
    transport.ws_fail("socket closed");
    transport.ws_event(json!({
        "userUpdated": {"__typename": "User", "id": "7", "name": "Never"},
    }));

    let mut stream = cache
        .execute_subscription(
            SubscriptionRequest::new(parse(SUBSCRIPTION)).variables(obj(json!({"id": "7"}))),
        )
        .unwrap();

    let first = block_on(stream.next()).unwrap();
    assert!(first.error.is_none());
    let second = block_on(stream.next()).unwrap();
    assert!(matches!(second.error, Some(CacheError::Network(_))));
    // The stream terminated; the later event is never delivered.
    assert!(block_on(stream.next()).is_none());
}

#[test]
fn each_subscription_gets_its_own_root() {
    let (cache, transport) = cache_with_transport();
    transport.ws_event(json!({
        "userUpdated": {"__typename": "User", "id": "1", "name": "First"},
    }));
    let mut first = cache
        .execute_subscription(
            SubscriptionRequest::new(parse(SUBSCRIPTION)).variables(obj(json!({"id": "1"}))),
        )
        .unwrap();
    block_on(first.next()).expect("first event");

    transport.ws_event(json!({
        "userUpdated": {"__typename": "User", "id": "2", "name": "Second"},
    }));
    let mut second = cache
        .execute_subscription(
            SubscriptionRequest::new(parse(SUBSCRIPTION)).variables(obj(json!({"id": "2"}))),
        )
        .unwrap();
    block_on(second.next()).expect("second event");

    let read = |root: &str, id: &str| {
        cache
            .read_query(
                ReadQueryRequest::new(parse(SUBSCRIPTION))
                    .variables(obj(json!({"id": id})))
                    .root_id(root),
            )
            .unwrap()
            .data
            .unwrap()
    };
    assert_eq!(
        read("@subscription.0", "1")["userUpdated"]["name"],
        json!("First"),
    );
    assert_eq!(
        read("@subscription.1", "2")["userUpdated"]["name"],
        json!("Second"),
    );
}
