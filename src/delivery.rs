use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::hub::HubHandle;
use crate::protocol::{publish_frame, received_message_frame};

/// A message the backend pushes to a widget through `POST /`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryPayload {
    pub id: String,
    pub text: String,
    pub to: String,
    pub to_no_plus: String,
    pub from: String,
    pub from_no_plus: String,
    pub channel: String,
    pub metadata: Value,
    pub attachments: Value,
}

impl DeliveryPayload {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Routes the payload twice to the connection subscribed as `to`: first as a
/// `#publish` frame, then as `receivedMessageFromChannel`. Both requests enter
/// the hub queue back to back, so the widget sees them in that order.
pub async fn deliver(hub: &HubHandle, payload: DeliveryPayload) -> Result<(), serde_json::Error> {
    let data = serde_json::to_value(&payload)?;
    debug!("delivering message id={} to={}", payload.id, payload.to);
    hub.route(&payload.to, publish_frame(&payload.to, &data)).await;
    hub.route(&payload.to, received_message_frame(&data)).await;
    Ok(())
}
