use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

/// Server-to-client keepalive, written by the send loop on every tick.
pub const HEARTBEAT_PING: &str = "#1";
/// Client-to-server keepalive answer. Advisory only.
pub const HEARTBEAT_ACK: &str = "#2";
/// Advertised to the widget in the handshake reply.
pub const PING_TIMEOUT_MS: u64 = 20_000;

pub const PUBLISH_EVENT: &str = "#publish";
pub const RECEIVED_MESSAGE_EVENT: &str = "receivedMessageFromChannel";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_as_zero")]
    pub cid: i64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEvent {
    Handshake,
    RegisterUser,
    GetHistory,
    SendMessageToChannel,
    Subscribe,
}

impl InboundEvent {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "#handshake" | "handshake" => Some(Self::Handshake),
            "registerUser" => Some(Self::RegisterUser),
            "getHistory" => Some(Self::GetHistory),
            "sendMessageToChannel" => Some(Self::SendMessageToChannel),
            "#subscribe" | "subscribe" => Some(Self::Subscribe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "#handshake",
            Self::RegisterUser => "registerUser",
            Self::GetHistory => "getHistory",
            Self::SendMessageToChannel => "sendMessageToChannel",
            Self::Subscribe => "#subscribe",
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> Option<InboundEvent> {
        InboundEvent::parse(&self.event)
    }

    /// Decodes `data` against an event-specific schema. Absent data decodes
    /// as an empty object so payloads with all-default fields still parse.
    pub fn decode_data<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        match &self.data {
            Value::Null => serde_json::from_value(json!({})),
            other => T::deserialize(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    HeartbeatAck,
    Envelope(Envelope),
    Malformed,
}

pub fn classify_frame(text: &str) -> InboundFrame {
    if text == HEARTBEAT_ACK {
        return InboundFrame::HeartbeatAck;
    }
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => InboundFrame::Envelope(envelope),
        Err(_) => InboundFrame::Malformed,
    }
}

pub fn handshake_reply_frame(rid: i64, connection_id: &str) -> Value {
    json!({
        "rid": rid,
        "data": {
            "id": connection_id,
            "pingTimeout": PING_TIMEOUT_MS,
            "isAuthenticated": false
        }
    })
}

/// The widget reads call results from the `error` slot as a JSON string,
/// so successful replies are encoded there too.
pub fn result_reply_frame(rid: i64, result: &Value) -> Value {
    json!({
        "rid": rid,
        "error": result.to_string()
    })
}

pub fn publish_frame(channel: &str, payload: &Value) -> Value {
    json!({
        "event": PUBLISH_EVENT,
        "data": {
            "channel": channel,
            "data": payload
        }
    })
}

pub fn received_message_frame(payload: &Value) -> Value {
    json!({
        "event": RECEIVED_MESSAGE_EVENT,
        "data": payload
    })
}
