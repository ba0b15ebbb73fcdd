use serde::{Deserialize, Serialize};

/// Requests a client can send over its socket.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },

    #[serde(rename = "publish")]
    Publish { topic: String, payload: String },
}

/// Frames the server sends to a client.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected {
        client_id: String,
        connection_id: String,
    },
    #[serde(rename = "subscribed")]
    Subscribed { topic: String },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { topic: String },
    #[serde(rename = "published")]
    Published {
        topic: String,
        delivered: usize,
        evicted: Vec<String>,
    },
    #[serde(rename = "message")]
    Message {
        topic: String,
        payload: String,
        timestamp: i64,
    },
    #[serde(rename = "error")]
    Error { message: String },
}
