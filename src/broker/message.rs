use serde::{Deserialize, Serialize};
use tungstenite::protocol::Message as WsMessage;

/// Represents a message broadcast to the members of a topic.
///
/// A message consists of a topic identifier, the payload content,
/// and a timestamp indicating when it was published.
///
/// # Fields
///
/// - `topic` - The name of the topic this message is broadcast to.
/// - `payload` - The actual message content, usually a JSON-encoded string.
/// - `timestamp` - Unix time in milliseconds at which the message was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub timestamp: i64,
}

/// Wire shape of a broadcast frame, matching `ServerMessage::Message`.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope<'a> {
    Message {
        topic: &'a str,
        payload: &'a str,
        timestamp: i64,
    },
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Encodes the message as the text frame sent to every subscriber.
    pub fn to_frame(&self) -> Result<WsMessage, serde_json::Error> {
        let text = serde_json::to_string(&Envelope::Message {
            topic: &self.topic,
            payload: &self.payload,
            timestamp: self.timestamp,
        })?;
        Ok(WsMessage::text(text))
    }
}
