//! End-to-end tests of the connection manager against a real WebSocket
//! server.

mod common;

use std::sync::Arc;

use common::{start_test_server, WAIT};
use serde_json::json;
use sov_sync::connection::{ConnectionManager, ConnectionState};
use sov_sync::protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
    let mut rx = manager.handle().state_changes();
    timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("state not reached")
        .unwrap();
}

#[tokio::test]
async fn test_replay_order_auth_queue_subscriptions() {
    let mut server = start_test_server().await;
    let manager = ConnectionManager::new(server.config());
    let conn = manager.handle();

    conn.authenticate("tok-1");
    conn.send(ClientMessage::Catchup {
        feed: "campaigns".into(),
        topic: "public.campaigns".into(),
        since: 3,
    });
    conn.send(ClientMessage::Ping);
    conn.subscribe("public.campaigns", Some(7));
    assert!(manager.start());

    let mut peer = server.accept().await;
    assert_eq!(peer.recv().await, json!({ "type": "auth", "token": "tok-1" }));
    assert_eq!(
        peer.recv().await,
        json!({ "type": "campaigns.catchup", "topic": "public.campaigns", "since": 3 })
    );
    assert_eq!(peer.recv().await, json!({ "type": "ping" }));
    assert_eq!(
        peer.recv().await,
        json!({ "type": "subscribe", "topic": "public.campaigns", "lastVersion": 7 })
    );
    // subscriptions are not duplicated by the queue
    assert!(peer.is_quiet(Duration::from_millis(150)).await);

    wait_for_state(&manager, ConnectionState::Open).await;
    manager.stop().await;
}

#[tokio::test]
async fn test_resubscribes_and_reauths_after_server_close() {
    let mut server = start_test_server().await;
    let manager = ConnectionManager::new(server.config());
    let conn = manager.handle();
    manager.start();

    conn.authenticate("tok");
    conn.subscribe("session.4", None);
    let mut first = server.accept().await;
    assert_eq!(first.recv_non_ping().await["type"], "auth");
    assert_eq!(first.recv_non_ping().await["topic"], "session.4");

    conn.subscribe("session.9", None);
    conn.unsubscribe("session.9");
    conn.subscribe("public.campaigns", Some(2));
    assert_eq!(first.recv_non_ping().await["topic"], "session.9");
    assert_eq!(first.recv_non_ping().await["type"], "unsubscribe");
    assert_eq!(first.recv_non_ping().await["topic"], "public.campaigns");

    first.close();

    let mut second = server.accept().await;
    assert_eq!(second.recv_non_ping().await["type"], "auth");
    let mut topics = vec![
        second.recv_non_ping().await,
        second.recv_non_ping().await,
    ];
    topics.sort_by_key(|v| v["topic"].as_str().unwrap_or_default().to_string());
    assert_eq!(
        topics,
        vec![
            json!({ "type": "subscribe", "topic": "public.campaigns", "lastVersion": 2 }),
            json!({ "type": "subscribe", "topic": "session.4" }),
        ]
    );
    assert_eq!(conn.stats().reconnects, 1);
    manager.stop().await;
}

#[tokio::test]
async fn test_unsubscribed_topic_not_replayed() {
    let mut server = start_test_server().await;
    let manager = ConnectionManager::new(server.config());
    let conn = manager.handle();
    manager.start();

    conn.subscribe("session.4", None);
    let mut first = server.accept().await;
    assert_eq!(first.recv_non_ping().await["type"], "subscribe");
    conn.unsubscribe("session.4");
    assert_eq!(first.recv_non_ping().await["type"], "unsubscribe");
    first.close();

    let mut second = server.accept().await;
    assert!(second.is_quiet(Duration::from_millis(150)).await);
    manager.stop().await;
}

#[tokio::test]
async fn test_handlers_fan_out_and_survive_bad_frames() {
    let mut server = start_test_server().await;
    let manager = ConnectionManager::new(server.config());
    let conn = manager.handle();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx_a = tx.clone();
    let _a = conn.add_message_handler(move |msg| {
        let _ = tx_a.send(("a", msg.clone()));
    });
    let _buggy = conn.add_message_handler(|_| panic!("handler bug"));
    let tx_removed = tx.clone();
    let removed = conn.add_message_handler(move |msg| {
        let _ = tx_removed.send(("removed", msg.clone()));
    });
    assert!(removed.unsubscribe());
    let dropped = conn.add_message_handler(move |msg| {
        let _ = tx.send(("dropped", msg.clone()));
    });
    drop(dropped);

    manager.start();
    conn.ensure();
    let peer = server.accept().await;

    peer.push_raw("{not json");
    peer.push(json!({ "type": "mystery.event" }));
    peer.push(json!({ "type": "ack", "requestId": "r-1" }));

    peer.push(json!({ "type": "ack", "requestId": "r-2" }));

    for expected in ["r-1", "r-2"] {
        let (who, msg) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(who, "a");
        assert_eq!(
            msg,
            ServerMessage::Ack {
                request_id: Some(expected.into())
            }
        );
    }

    // r-2 reached the first handler, so r-1 went through every handler
    let stats = conn.stats();
    assert_eq!(stats.frames_ignored, 2);
    assert_eq!(stats.messages_received, 2);
    assert!(stats.handler_panics >= 1);
    assert_eq!(stats.active_handlers, 2);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    manager.stop().await;
}

#[tokio::test]
async fn test_shared_topic_survives_one_holder_leaving() {
    let mut server = start_test_server().await;
    let manager = ConnectionManager::new(server.config());
    let conn = manager.handle();
    manager.start();

    conn.subscribe("public.campaigns", None);
    conn.subscribe("public.campaigns", None);
    let mut first = server.accept().await;
    assert_eq!(first.recv_non_ping().await["type"], "subscribe");
    // the second holder shares the live subscription
    assert!(first.is_quiet(Duration::from_millis(150)).await);

    conn.unsubscribe("public.campaigns");
    assert!(first.is_quiet(Duration::from_millis(150)).await);

    first.close();
    let mut second = server.accept().await;
    assert_eq!(
        second.recv_non_ping().await,
        json!({ "type": "subscribe", "topic": "public.campaigns" })
    );

    conn.unsubscribe("public.campaigns");
    assert_eq!(
        second.recv_non_ping().await,
        json!({ "type": "unsubscribe", "topic": "public.campaigns" })
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_send_tracked_carries_request_id() {
    let mut server = start_test_server().await;
    let manager = ConnectionManager::new(server.config());
    let conn = manager.handle();
    manager.start();

    let id = conn.send_tracked(ClientMessage::Ping);
    let mut peer = server.accept().await;
    let frame = peer.recv().await;
    assert_eq!(frame["type"], "ping");
    assert_eq!(frame["requestId"], json!(id));
    assert_eq!(id.len(), 36);
    manager.stop().await;
}

#[tokio::test]
async fn test_messages_sent_while_down_are_delivered_after_reconnect() {
    let mut server = start_test_server().await;
    let mut config = server.config();
    config.backoff.base = Duration::from_millis(300);
    config.backoff.ceiling = Duration::from_secs(1);
    let manager = ConnectionManager::new(config);
    let conn = manager.handle();
    manager.start();
    conn.ensure();

    let first = server.accept().await;
    wait_for_state(&manager, ConnectionState::Open).await;
    first.close();
    wait_for_state(&manager, ConnectionState::ClosedPendingRetry).await;

    conn.send(ClientMessage::Unsubscribe {
        topic: "a".into(),
    });
    conn.send(ClientMessage::Unsubscribe {
        topic: "b".into(),
    });

    let mut second = server.accept().await;
    assert_eq!(second.recv_non_ping().await["topic"], "a");
    assert_eq!(second.recv_non_ping().await["topic"], "b");
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_closes_and_goes_idle() {
    let mut server = start_test_server().await;
    let manager = Arc::new(ConnectionManager::new(server.config()));
    manager.start();
    manager.handle().ensure();
    let _peer = server.accept().await;
    wait_for_state(&manager, ConnectionState::Open).await;

    manager.stop().await;
    assert_eq!(manager.handle().state(), ConnectionState::Idle);
    assert!(!manager.start());
}

#[tokio::test]
async fn test_unreachable_server_schedules_retries() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut config = sov_sync::ClientConfig::new(&format!("http://127.0.0.1:{port}")).unwrap();
    config.backoff.base = Duration::from_millis(20);
    config.backoff.floor = Duration::from_millis(10);
    let manager = ConnectionManager::new(config);
    manager.start();
    manager.handle().ensure();

    wait_for_state(&manager, ConnectionState::ClosedPendingRetry).await;
    manager.stop().await;
    assert_eq!(manager.handle().state(), ConnectionState::Idle);
}
