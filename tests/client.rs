mod common;

use std::sync::Arc;
use std::time::Duration;

use bucketline::bucket::{BucketKey, RouteGroup, Verb};
use bucketline::client::Client;
use bucketline::config::{ClientConfig, DispatcherConfig};
use bucketline::error::{ClientError, DispatchError};
use bucketline::session::SessionState;
use bucketline::transport::RawResponse;
use common::{session_config, within, FakeGateway, Outcome, ScriptedRest};
use serde_json::json;

struct Harness {
    rest: Arc<ScriptedRest>,
    gateway: Arc<FakeGateway>,
    client: Client,
}

fn harness() -> Harness {
    let rest = ScriptedRest::new();
    let gateway = FakeGateway::new();
    let config = ClientConfig::new(DispatcherConfig::default(), session_config());
    let client = Client::new(config, rest.clone(), gateway.clone());
    Harness { rest, gateway, client }
}

fn message(id: &str, channel: &str, content: &str) -> RawResponse {
    RawResponse::new(200)
        .with_body(json!({ "id": id, "channel_id": channel, "content": content }).to_string())
}

#[tokio::test(start_paused = true)]
async fn message_content_is_validated_before_sending() {
    let h = harness();
    let empty = h.client.send_message(7, Some(42), "").await;
    assert!(matches!(empty, Err(ClientError::Validation(_))));
    let long = h.client.send_message(7, Some(42), &"x".repeat(2001)).await;
    assert!(matches!(long, Err(ClientError::Validation(_))));
    let edit = h.client.edit_message(7, Some(42), 1, "").await;
    assert!(matches!(edit, Err(ClientError::Validation(_))));
    assert!(h.rest.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn guild_and_direct_messages_use_different_buckets() {
    let h = harness();
    h.rest.respond("channels/7/messages", message("1", "7", "hi"));
    h.rest.respond("channels/8/messages", message("2", "8", "yo"));

    let sent = within("guild message", h.client.send_message(7, Some(42), "hi")).await.unwrap();
    assert_eq!(sent.id, "1");
    assert_eq!(sent.content, "hi");
    within("direct message", h.client.send_message(8, None, "yo")).await.unwrap();

    let dispatcher = h.client.dispatcher();
    let guild = BucketKey::owned(RouteGroup::OwnerSendEditMessage, 42);
    assert!(dispatcher.bucket_snapshot(guild).is_some());
    assert!(dispatcher.bucket_snapshot(BucketKey::global(RouteGroup::DirectMessage)).is_some());

    let calls = h.rest.calls();
    assert_eq!(calls[0].verb, Verb::Post);
    assert_eq!(calls[0].json(), json!({ "content": "hi" }));
}

#[tokio::test(start_paused = true)]
async fn bulk_delete_validates_and_delegates() {
    let h = harness();

    let none = h.client.delete_messages(7, Some(42), &[]).await;
    assert!(matches!(none, Err(ClientError::Validation(_))));
    let ids: Vec<u64> = (0..101).collect();
    let too_many = h.client.delete_messages(7, Some(42), &ids).await;
    assert!(matches!(too_many, Err(ClientError::Validation(_))));
    assert!(h.rest.calls().is_empty());

    within("single delete", h.client.delete_messages(7, Some(42), &[5])).await.unwrap();
    within("bulk delete", h.client.delete_messages(7, Some(42), &[5, 6])).await.unwrap();

    let calls = h.rest.calls();
    assert_eq!(calls[0].verb, Verb::Delete);
    assert_eq!(calls[0].route, "channels/7/messages/5");
    assert_eq!(calls[1].verb, Verb::Post);
    assert_eq!(calls[1].route, "channels/7/messages/bulk-delete");
    assert_eq!(calls[1].json(), json!({ "messages": ["5", "6"] }));

    let dispatcher = h.client.dispatcher();
    for group in [RouteGroup::OwnerDeleteMessage, RouteGroup::OwnerDeleteMessages] {
        assert!(dispatcher.bucket_snapshot(BucketKey::owned(group, 42)).is_some());
    }
}

#[tokio::test(start_paused = true)]
async fn nickname_routes() {
    let h = harness();
    within("own nickname", h.client.modify_nickname(3, None, "me")).await.unwrap();
    within("member nickname", h.client.modify_nickname(3, Some(9), "them")).await.unwrap();

    let calls = h.rest.calls();
    assert_eq!(calls[0].route, "guilds/3/members/@me/nick");
    assert_eq!(calls[1].route, "guilds/3/members/9");
    assert_eq!(calls[1].json(), json!({ "nick": "them" }));

    let dispatcher = h.client.dispatcher();
    let own = BucketKey::owned(RouteGroup::OwnerNickname, 3);
    let member = BucketKey::owned(RouteGroup::OwnerModifyMember, 3);
    assert!(dispatcher.bucket_snapshot(own).is_some());
    assert!(dispatcher.bucket_snapshot(member).is_some());
}

#[tokio::test(start_paused = true)]
async fn rejected_request_surfaces_as_dispatch_error() {
    let h = harness();
    h.rest.respond(
        "channels/7/messages/1",
        RawResponse::new(403).with_body(r#"{"code":50013,"message":"Missing Permissions"}"#),
    );

    let err = within("edit", h.client.edit_message(7, Some(42), 1, "new")).await.unwrap_err();
    match err {
        ClientError::Dispatch(DispatchError::Rejected { status, code, message }) => {
            assert_eq!(status, 403);
            assert_eq!(code, Some(50013));
            assert_eq!(message, "Missing Permissions");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn undecodable_response_is_a_decode_error() {
    let h = harness();
    let err = within("send", h.client.send_message(7, Some(42), "hi")).await.unwrap_err();
    assert!(matches!(err, ClientError::Dispatch(DispatchError::Decode(_))));
}

#[tokio::test(start_paused = true)]
async fn start_uses_the_advertised_gateway() {
    let h = harness();
    h.rest.respond("gateway", RawResponse::new(200).with_body(r#"{"url":"wss://gw.example"}"#));

    within("start", h.client.start()).await.unwrap();
    let mut conn = h.gateway.accept().await;
    assert_eq!(conn.url, "wss://gw.example?encoding=json&v=6");

    conn.hello(45_000).await;
    conn.expect_op(2).await;
    conn.ready("abc", 1).await;
    within("connected", h.client.session().wait_for(SessionState::Connected)).await;
}

#[tokio::test(start_paused = true)]
async fn logout_stops_the_session_and_cancels_requests() {
    let h = harness();
    h.rest.respond("gateway", RawResponse::new(200).with_body(r#"{"url":"wss://gw.example"}"#));
    h.rest.script("channels/7/messages", Outcome::Hang);

    within("start", h.client.start()).await.unwrap();
    let mut conn = h.gateway.accept().await;
    conn.hello(45_000).await;
    conn.expect_op(2).await;
    conn.ready("abc", 1).await;
    within("connected", h.client.session().wait_for(SessionState::Connected)).await;

    let client = h.client.clone();
    let pending = tokio::spawn(async move { client.send_message(7, Some(42), "stuck").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    within("logout", h.client.logout()).await;
    let result = within("cancelled send", pending).await.unwrap();
    assert_eq!(result.unwrap_err(), ClientError::Dispatch(DispatchError::Cancelled));
    assert_eq!(h.client.session().state(), SessionState::Disconnected);
    assert_eq!(conn.close_codes(), vec![1000]);
    assert_eq!(h.client.dispatcher().bucket_count(), 0);
}
