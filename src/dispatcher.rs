use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::backend::{BackendError, BackendGateway};
use crate::client::Client;
use crate::language::normalize_language;
use crate::protocol::{handshake_reply_frame, result_reply_frame, Envelope, InboundEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid {event} payload: {source}")]
    Decode {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("user token does not match the connection token")]
    AuthMismatch,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("outbound channel is closed")]
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Replied,
    Relayed,
    Subscribed,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RegisterUserData {
    #[serde(default)]
    language: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetHistoryData {
    #[serde(default)]
    user_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageData {
    #[serde(default)]
    text: String,
    #[serde(default)]
    user_urn: String,
    #[serde(default)]
    user_uuid: String,
}

#[derive(Debug, Deserialize)]
struct SubscribeData {
    #[serde(default)]
    channel: String,
}

pub async fn dispatch(
    client: &mut Client,
    envelope: &Envelope,
    backend: &dyn BackendGateway,
) -> Result<DispatchOutcome, DispatchError> {
    let Some(event) = envelope.kind() else {
        debug!(
            "ignoring unknown event {:?} on conn_id={}",
            envelope.event, client.connection_id
        );
        return Ok(DispatchOutcome::Ignored);
    };
    match event {
        InboundEvent::Handshake => handshake(client, envelope).await,
        InboundEvent::RegisterUser => register_user(client, envelope, backend).await,
        InboundEvent::GetHistory => get_history(client, envelope, backend).await,
        InboundEvent::SendMessageToChannel => send_message(client, envelope, backend).await,
        InboundEvent::Subscribe => subscribe(client, envelope).await,
    }
}

fn decode<T>(envelope: &Envelope, event: InboundEvent) -> Result<T, DispatchError>
where
    T: serde::de::DeserializeOwned,
{
    envelope
        .decode_data()
        .map_err(|source| DispatchError::Decode {
            event: event.as_str(),
            source,
        })
}

async fn handshake(
    client: &Client,
    envelope: &Envelope,
) -> Result<DispatchOutcome, DispatchError> {
    client
        .enqueue(handshake_reply_frame(envelope.cid, &client.connection_id))
        .await?;
    Ok(DispatchOutcome::Replied)
}

async fn register_user(
    client: &mut Client,
    envelope: &Envelope,
    backend: &dyn BackendGateway,
) -> Result<DispatchOutcome, DispatchError> {
    let data: RegisterUserData = decode(envelope, InboundEvent::RegisterUser)?;
    let language = normalize_language(&data.language);
    let contact = backend
        .register(
            client.backend_target(),
            &client.connection_id,
            &client.session_token,
            &language,
        )
        .await?;
    if client.session_token.is_empty() {
        client.session_token = contact.contact_token.clone();
    }
    let result = json!({
        "urn": contact.contact_urn,
        "uuid": contact.contact_uuid,
        "token": contact.contact_token,
    });
    client
        .enqueue(result_reply_frame(envelope.cid, &result))
        .await?;
    Ok(DispatchOutcome::Replied)
}

async fn get_history(
    client: &Client,
    envelope: &Envelope,
    backend: &dyn BackendGateway,
) -> Result<DispatchOutcome, DispatchError> {
    let data: GetHistoryData = decode(envelope, InboundEvent::GetHistory)?;
    if data.user_token != client.session_token {
        return Err(DispatchError::AuthMismatch);
    }
    let page = backend
        .history(client.backend_target(), &client.session_token)
        .await?;
    let result = serde_json::to_value(&page).map_err(|source| DispatchError::Decode {
        event: InboundEvent::GetHistory.as_str(),
        source,
    })?;
    client
        .enqueue(result_reply_frame(envelope.cid, &result))
        .await?;
    Ok(DispatchOutcome::Replied)
}

async fn send_message(
    client: &Client,
    envelope: &Envelope,
    backend: &dyn BackendGateway,
) -> Result<DispatchOutcome, DispatchError> {
    let data: SendMessageData = decode(envelope, InboundEvent::SendMessageToChannel)?;
    debug!(
        "relaying message from urn={} uuid={} on conn_id={}",
        data.user_urn, data.user_uuid, client.connection_id
    );
    backend
        .relay_inbound(client.backend_target(), &data.user_urn, &data.text)
        .await?;
    Ok(DispatchOutcome::Relayed)
}

async fn subscribe(
    client: &mut Client,
    envelope: &Envelope,
) -> Result<DispatchOutcome, DispatchError> {
    let data: SubscribeData = decode(envelope, InboundEvent::Subscribe)?;
    client.subscribe(data.channel).await;
    Ok(DispatchOutcome::Subscribed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::{dispatch, DispatchError, DispatchOutcome};
    use crate::backend::testing::{BackendCall, RecordingBackend};
    use crate::backend::{ContactIdentity, HistoryEntry};
    use crate::client::{Client, ConnectParams};
    use crate::hub::HubHandle;
    use crate::protocol::Envelope;

    fn envelope(cid: i64, event: &str, data: Value) -> Envelope {
        Envelope {
            cid,
            event: event.to_owned(),
            data,
        }
    }

    fn test_client(hub: HubHandle) -> (Client, mpsc::Receiver<Value>) {
        let params = ConnectParams {
            channel_id: "ch1".to_owned(),
            backend_base_url: "https://api.example".to_owned(),
            session_token: "tok1".to_owned(),
        };
        Client::new("conn-1".to_owned(), params, hub)
    }

    fn reply_result(frame: &Value) -> Value {
        let encoded = frame
            .get("error")
            .and_then(Value::as_str)
            .expect("result slot");
        serde_json::from_str(encoded).expect("result json")
    }

    #[tokio::test]
    async fn handshake_replies_with_connection_id() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend::default();

        let outcome = dispatch(&mut client, &envelope(1, "#handshake", Value::Null), &backend)
            .await
            .expect("handshake");
        assert_eq!(outcome, DispatchOutcome::Replied);
        assert_eq!(
            outbound.recv().await,
            Some(json!({"rid":1,"data":{"id":"conn-1","pingTimeout":20000,"isAuthenticated":false}}))
        );
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn register_user_normalizes_language_and_forwards_contact() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend {
            contact: Some(ContactIdentity {
                contact_uuid: "uuid-1".to_owned(),
                contact_token: "minted".to_owned(),
                contact_urn: "ext:conn-1".to_owned(),
            }),
            ..RecordingBackend::default()
        };

        dispatch(
            &mut client,
            &envelope(2, "registerUser", json!({"language": "EN-us"})),
            &backend,
        )
        .await
        .expect("register");
        let first = outbound.recv().await.expect("register reply");
        dispatch(
            &mut client,
            &envelope(3, "registerUser", json!({"language": "xx-unknown"})),
            &backend,
        )
        .await
        .expect("register again");
        assert!(outbound.recv().await.is_some());

        let languages = backend
            .calls()
            .into_iter()
            .map(|call| match call {
                BackendCall::Register {
                    base_url,
                    channel_id,
                    urn,
                    user_token,
                    language,
                } => {
                    assert_eq!(base_url, "https://api.example");
                    assert_eq!(channel_id, "ch1");
                    assert_eq!(urn, "conn-1");
                    assert_eq!(user_token, "tok1");
                    language
                }
                other => panic!("unexpected call {other:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(languages, vec!["en".to_owned(), String::new()]);

        assert_eq!(first["rid"], json!(2));
        assert_eq!(
            reply_result(&first),
            json!({"urn": "ext:conn-1", "uuid": "uuid-1", "token": "minted"})
        );
        assert_eq!(client.session_token, "tok1");
    }

    #[tokio::test]
    async fn register_user_adopts_minted_token_when_connection_had_none() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, _outbound) = test_client(hub);
        client.session_token.clear();
        let backend = RecordingBackend {
            contact: Some(ContactIdentity {
                contact_uuid: "uuid-1".to_owned(),
                contact_token: "minted".to_owned(),
                contact_urn: "ext:conn-1".to_owned(),
            }),
            ..RecordingBackend::default()
        };
        dispatch(&mut client, &envelope(1, "registerUser", json!({})), &backend)
            .await
            .expect("register");
        assert_eq!(client.session_token, "minted");
    }

    #[tokio::test]
    async fn get_history_token_mismatch_never_calls_backend_or_replies() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend::default();

        let err = dispatch(
            &mut client,
            &envelope(4, "getHistory", json!({"userToken": "someone-else"})),
            &backend,
        )
        .await
        .expect_err("mismatch");
        assert!(matches!(err, DispatchError::AuthMismatch));
        assert!(backend.calls().is_empty());
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_history_forwards_first_page() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend {
            history_page: vec![HistoryEntry {
                message: "hello".to_owned(),
                origin: "contact".to_owned(),
                metadata: Value::Null,
                attachments: json!([]),
            }],
            ..RecordingBackend::default()
        };

        dispatch(
            &mut client,
            &envelope(5, "getHistory", json!({"userToken": "tok1"})),
            &backend,
        )
        .await
        .expect("history");
        assert_eq!(
            backend.calls(),
            vec![BackendCall::History {
                channel_id: "ch1".to_owned(),
                user_token: "tok1".to_owned(),
            }]
        );
        let reply = outbound.recv().await.expect("history reply");
        assert_eq!(reply["rid"], json!(5));
        assert_eq!(
            reply_result(&reply),
            json!([{"message":"hello","origin":"contact","metadata":null,"attachments":[]}])
        );
    }

    #[tokio::test]
    async fn backend_failure_is_reported_without_reply() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend::failing();

        let err = dispatch(
            &mut client,
            &envelope(6, "getHistory", json!({"userToken": "tok1"})),
            &backend,
        )
        .await
        .expect_err("backend error");
        assert!(matches!(err, DispatchError::Backend(_)));

        let err = dispatch(
            &mut client,
            &envelope(7, "sendMessageToChannel", json!({"text": "hi", "userUrn": "urn:x"})),
            &backend,
        )
        .await
        .expect_err("relay error");
        assert!(matches!(err, DispatchError::Backend(_)));
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_message_relays_without_acknowledgement() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend::default();

        let outcome = dispatch(
            &mut client,
            &envelope(
                8,
                "sendMessageToChannel",
                json!({"text": "hi there", "userUrn": "urn:tel:+1555", "userUuid": "u-1"}),
            ),
            &backend,
        )
        .await
        .expect("relay");
        assert_eq!(outcome, DispatchOutcome::Relayed);
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Relay {
                channel_id: "ch1".to_owned(),
                from: "urn:tel:+1555".to_owned(),
                text: "hi there".to_owned(),
            }]
        );
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_makes_client_routable() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub.clone());
        let backend = RecordingBackend::default();

        let outcome = dispatch(
            &mut client,
            &envelope(9, "#subscribe", json!({"channel": "urn:tel:+1555"})),
            &backend,
        )
        .await
        .expect("subscribe");
        assert_eq!(outcome, DispatchOutcome::Subscribed);
        assert_eq!(client.user_handle.as_deref(), Some("urn:tel:+1555"));

        hub.route("urn:tel:+1555", json!({"event": "ping"})).await;
        assert_eq!(outbound.recv().await, Some(json!({"event": "ping"})));
    }

    #[tokio::test]
    async fn unknown_events_and_bad_payloads() {
        let (hub, _task) = HubHandle::spawn(Duration::from_millis(100));
        let (mut client, mut outbound) = test_client(hub);
        let backend = RecordingBackend::default();

        let outcome = dispatch(&mut client, &envelope(10, "#publish", json!({})), &backend)
            .await
            .expect("unknown event");
        assert_eq!(outcome, DispatchOutcome::Ignored);

        let err = dispatch(&mut client, &envelope(11, "#subscribe", json!([1, 2])), &backend)
            .await
            .expect_err("bad payload");
        assert!(matches!(err, DispatchError::Decode { event: "#subscribe", .. }));
        assert!(client.user_handle.is_none());
        assert!(outbound.try_recv().is_err());
    }
}
