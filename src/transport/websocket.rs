//! WebSocket transport
//!
//! Accepts WebSocket connections and wires each one into the hub:
//! - the client identity comes from the `id` query parameter of the
//!   handshake request (`ws://host:port/?id=alice`); sockets without one get
//!   a generated `client-<uuid>` identity
//! - every socket becomes a `Connection` registered through `Hub::on_open`,
//!   and leaving the read loop for any reason ends in exactly one
//!   `Hub::on_close` for it
//! - a writer task drains the connection's bounded channel into the socket
//!   and sends a Close frame once the connection is closed, including when
//!   the hub evicts it under single-session policy
//! - text frames are decoded as `ClientMessage` and answered with a
//!   `ServerMessage`

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::{Hub, Message};
use crate::client::Connection;
use crate::config::HubSettings;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::HubError;

const CLOSE_RETRIES: u32 = 3;

pub async fn start_websocket_server(
    addr: &str,
    hub: Arc<Hub>,
    settings: HubSettings,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, hub, settings).await
}

/// Accepts connections on an already bound listener until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    settings: HubSettings,
) -> std::io::Result<()> {
    tracing::info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted tcp connection");
                tokio::spawn(handle_socket(stream, hub.clone(), settings.clone()));
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {e}");
            }
        }
    }
}

async fn handle_socket(stream: TcpStream, hub: Arc<Hub>, settings: HubSettings) {
    let mut query = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake error: {e}");
            return;
        }
    };

    let client_id = query
        .as_deref()
        .and_then(client_id_from_query)
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
    let timeout = settings.send_timeout();

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (connection, mut rx) = Connection::channel(settings.outbound_buffer);
    let connection_id = connection.id.clone();

    if let Err(err) = hub.on_open(&client_id, connection.clone()).await {
        tracing::warn!(client_id, "Rejecting connection: {err}");
        if let Ok(text) = serde_json::to_string(&error_reply(&err)) {
            let _ = ws_sender.send(WsMessage::text(text)).await;
        }
        let _ = ws_sender.close().await;
        return;
    }

    let writer = {
        let connection = connection.clone();
        let client_id = client_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = ws_sender.send(msg).await {
                                tracing::debug!("Failed to send message to {client_id}: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = connection.closed() => {
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            connection.close();
            tracing::debug!("Send loop closed for {client_id}");
        })
    };

    reply(
        &connection,
        &ServerMessage::Connected {
            client_id: client_id.clone(),
            connection_id: connection_id.clone(),
        },
        timeout,
    )
    .await;

    loop {
        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            _ = connection.closed() => break,
        };

        match frame {
            Some(Ok(msg)) if msg.is_text() => {
                let Ok(text) = msg.to_text() else { continue };
                if let Some(response) = handle_request(&hub, &client_id, text, &settings).await {
                    reply(&connection, &response, timeout).await;
                }
            }
            Some(Ok(msg)) if msg.is_close() => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!("Read error from {client_id}: {e}");
                break;
            }
            None => break,
        }
    }

    connection.close();
    close_with_retry(&hub, &client_id, &connection_id).await;
    let _ = writer.await;
}

/// Reports the close to the hub, re-running the cascade with backoff when
/// the store is briefly unavailable.
async fn close_with_retry(hub: &Hub, client_id: &str, connection_id: &str) {
    let mut result = hub.on_close(connection_id).await.map(|_| ());
    let mut attempt = 0;
    while let Err(err) = &result {
        if !err.is_transient() || attempt >= CLOSE_RETRIES {
            tracing::error!(client_id, connection_id, "Disconnect cleanup failed: {err}");
            return;
        }
        attempt += 1;
        tracing::warn!(client_id, attempt, "Disconnect cleanup failed, retrying: {err}");
        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
        result = hub.purge_client(client_id).await.map(|_| ());
    }
    tracing::info!("{client_id} disconnected");
}

/// Executes one client request against the hub and builds the reply.
pub(crate) async fn handle_request(
    hub: &Hub,
    client_id: &str,
    text: &str,
    settings: &HubSettings,
) -> Option<ServerMessage> {
    let request = match serde_json::from_str::<ClientMessage>(text) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(
                "Invalid client message from {client_id}: {err} | {}",
                text.chars().take(100).collect::<String>()
            );
            return Some(ServerMessage::Error {
                message: "invalid message".to_string(),
            });
        }
    };

    let response = match request {
        ClientMessage::Subscribe { topic } => hub
            .subscribe(&topic, client_id)
            .await
            .map(|()| ServerMessage::Subscribed { topic }),

        ClientMessage::Unsubscribe { topic } => hub
            .unsubscribe(&topic, client_id)
            .await
            .map(|()| ServerMessage::Unsubscribed { topic }),

        ClientMessage::Publish { topic, payload } => {
            if settings.publish_requires_membership {
                match hub.is_member(&topic, client_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Some(ServerMessage::Error {
                            message: format!("not subscribed to {topic}"),
                        });
                    }
                    Err(err) => return Some(error_reply(&err)),
                }
            }
            hub.publish(&Message::new(topic.clone(), payload))
                .await
                .map(|report| ServerMessage::Published {
                    topic,
                    delivered: report.delivered,
                    evicted: report.evicted,
                })
        }
    };

    Some(response.unwrap_or_else(|err| {
        tracing::warn!("Request from {client_id} failed: {err}");
        error_reply(&err)
    }))
}

async fn reply(connection: &Connection, msg: &ServerMessage, timeout: Duration) {
    let text = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize reply: {e}");
            return;
        }
    };
    if let Err(e) = connection.send(WsMessage::text(text), timeout).await {
        tracing::debug!(connection_id = %connection.id, "Failed to reply: {e}");
    }
}

fn error_reply(err: &HubError) -> ServerMessage {
    ServerMessage::Error {
        message: err.to_string(),
    }
}

/// Extracts a non-empty, percent-decoded `id` parameter from a raw query string.
pub(crate) fn client_id_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| key == "id" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}
