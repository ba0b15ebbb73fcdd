use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientMessage, ServerMessage};
use super::websocket::{client_id_from_query, handle_request, serve};
use crate::broker::Hub;
use crate::client::Connection;
use crate::config::{HubSettings, Settings};
use crate::persistence::MemoryStore;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn settings() -> HubSettings {
    let mut hub = Settings::default().hub;
    hub.send_timeout_ms = 200;
    hub.topic_ttl_secs = 0;
    hub
}

fn hub(settings: &HubSettings) -> Arc<Hub> {
    Arc::new(Hub::new(Arc::new(MemoryStore::new()), settings))
}

async fn request(hub: &Hub, client_id: &str, body: serde_json::Value) -> ServerMessage {
    handle_request(hub, client_id, &body.to_string(), &settings())
        .await
        .unwrap()
}

#[test]
fn test_client_message_shapes() {
    let msg: ClientMessage =
        serde_json::from_str(r#"{"type":"publish","topic":"news","payload":"hi"}"#).unwrap();
    assert!(matches!(
        msg,
        ClientMessage::Publish { ref topic, ref payload } if topic == "news" && payload == "hi"
    ));

    let text = serde_json::to_string(&ServerMessage::Subscribed {
        topic: "news".into(),
    })
    .unwrap();
    assert_eq!(text, r#"{"type":"subscribed","topic":"news"}"#);
}

#[test]
fn test_client_id_from_query() {
    assert_eq!(client_id_from_query("id=alice"), Some("alice".to_string()));
    assert_eq!(
        client_id_from_query("token=x&id=bob"),
        Some("bob".to_string())
    );
    assert_eq!(client_id_from_query("id="), None);
    assert_eq!(client_id_from_query("name=alice"), None);
    assert_eq!(client_id_from_query(""), None);
}

#[test]
fn test_client_id_from_query_is_percent_decoded() {
    assert_eq!(
        client_id_from_query("id=alice%40example"),
        Some("alice@example".to_string())
    );
    assert_eq!(
        client_id_from_query("id=team+blue&x=1"),
        Some("team blue".to_string())
    );
    assert_eq!(client_id_from_query("id=%E2%9C%93"), Some("✓".to_string()));
}

#[tokio::test]
async fn test_handle_subscribe() {
    let hub = hub(&settings());

    let reply = request(&hub, "alice", json!({"type": "subscribe", "topic": "news"})).await;

    assert_eq!(
        reply,
        ServerMessage::Subscribed {
            topic: "news".into()
        }
    );
    assert!(hub.is_member("news", "alice").await.unwrap());
}

#[tokio::test]
async fn test_handle_unsubscribe() {
    let hub = hub(&settings());
    hub.subscribe("news", "alice").await.unwrap();

    let reply = request(&hub, "alice", json!({"type": "unsubscribe", "topic": "news"})).await;

    assert_eq!(
        reply,
        ServerMessage::Unsubscribed {
            topic: "news".into()
        }
    );
    assert!(!hub.is_member("news", "alice").await.unwrap());
    assert!(hub.topics_of("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_handle_publish() {
    let hub = hub(&settings());
    let (conn, mut rx) = Connection::channel(8);
    hub.on_open("bob", conn).await.unwrap();
    hub.subscribe("news", "bob").await.unwrap();

    let reply = request(
        &hub,
        "alice",
        json!({"type": "publish", "topic": "news", "payload": "hello"}),
    )
    .await;

    assert_eq!(
        reply,
        ServerMessage::Published {
            topic: "news".into(),
            delivered: 1,
            evicted: vec![],
        }
    );
    let frame = rx.try_recv().unwrap();
    match serde_json::from_str::<ServerMessage>(frame.to_text().unwrap()).unwrap() {
        ServerMessage::Message { topic, payload, .. } => {
            assert_eq!(topic, "news");
            assert_eq!(payload, "hello");
        }
        other => panic!("expected a message frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handle_publish_requires_membership() {
    let mut settings = settings();
    settings.publish_requires_membership = true;
    let hub = hub(&settings);
    let body = json!({"type": "publish", "topic": "news", "payload": "hello"}).to_string();

    let reply = handle_request(&hub, "alice", &body, &settings).await.unwrap();
    assert!(matches!(reply, ServerMessage::Error { .. }));

    hub.subscribe("news", "alice").await.unwrap();
    let reply = handle_request(&hub, "alice", &body, &settings).await.unwrap();
    assert!(matches!(reply, ServerMessage::Published { delivered: 0, .. }));
}

#[tokio::test]
async fn test_handle_invalid_message() {
    let hub = hub(&settings());

    let reply = handle_request(&hub, "alice", "not json", &settings())
        .await
        .unwrap();
    assert_eq!(
        reply,
        ServerMessage::Error {
            message: "invalid message".into()
        }
    );

    let reply = request(&hub, "alice", json!({"type": "subscribe", "topic": "a\0b"})).await;
    assert!(matches!(reply, ServerMessage::Error { .. }));
}

async fn start_server(hub: Arc<Hub>, settings: HubSettings) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, hub, settings));
    format!("ws://{addr}")
}

async fn next_reply(ws: &mut Socket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send(ws: &mut Socket, body: serde_json::Value) {
    ws.send(WsMessage::text(body.to_string())).await.unwrap();
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_websocket_pubsub_roundtrip() {
    let settings = settings();
    let hub = hub(&settings);
    let url = start_server(hub.clone(), settings).await;

    let (mut alice, _) = connect_async(format!("{url}/?id=alice")).await.unwrap();
    let (mut bob, _) = connect_async(format!("{url}/?id=bob")).await.unwrap();

    assert!(matches!(
        next_reply(&mut alice).await,
        ServerMessage::Connected { ref client_id, .. } if client_id == "alice"
    ));
    assert!(matches!(
        next_reply(&mut bob).await,
        ServerMessage::Connected { ref client_id, .. } if client_id == "bob"
    ));

    send(&mut bob, json!({"type": "subscribe", "topic": "news"})).await;
    assert_eq!(
        next_reply(&mut bob).await,
        ServerMessage::Subscribed {
            topic: "news".into()
        }
    );

    send(
        &mut alice,
        json!({"type": "publish", "topic": "news", "payload": "hello"}),
    )
    .await;
    assert_eq!(
        next_reply(&mut alice).await,
        ServerMessage::Published {
            topic: "news".into(),
            delivered: 1,
            evicted: vec![],
        }
    );

    match next_reply(&mut bob).await {
        ServerMessage::Message { topic, payload, .. } => {
            assert_eq!(topic, "news");
            assert_eq!(payload, "hello");
        }
        other => panic!("expected a message frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_disconnect_leaves_topics() {
    let settings = settings();
    let hub = hub(&settings);
    let url = start_server(hub.clone(), settings).await;

    let (mut bob, _) = connect_async(format!("{url}/?id=bob")).await.unwrap();
    next_reply(&mut bob).await;
    send(&mut bob, json!({"type": "subscribe", "topic": "news"})).await;
    next_reply(&mut bob).await;
    assert!(hub.is_member("news", "bob").await.unwrap());

    bob.close(None).await.unwrap();
    drop(bob);

    eventually(|| {
        let hub = hub.clone();
        async move {
            hub.connections("bob").is_empty() && hub.topics_of("bob").await.unwrap().is_empty()
        }
    })
    .await;
    assert!(hub.members("news").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_websocket_generates_client_id() {
    let settings = settings();
    let hub = hub(&settings);
    let url = start_server(hub.clone(), settings).await;

    let (mut ws, _) = connect_async(format!("{url}/")).await.unwrap();

    match next_reply(&mut ws).await {
        ServerMessage::Connected {
            client_id,
            connection_id,
        } => {
            assert!(client_id.starts_with("client-"));
            assert_eq!(hub.client_for(&connection_id), Some(client_id));
        }
        other => panic!("expected a connected frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_websocket_single_session_closes_old_socket() {
    let mut settings = settings();
    settings.session_policy = crate::client::SessionPolicy::Single;
    let hub = hub(&settings);
    let url = start_server(hub.clone(), settings).await;

    let (mut first, _) = connect_async(format!("{url}/?id=alice")).await.unwrap();
    next_reply(&mut first).await;
    let (mut second, _) = connect_async(format!("{url}/?id=alice")).await.unwrap();
    next_reply(&mut second).await;

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(hub.connections("alice").len(), 1);
}
