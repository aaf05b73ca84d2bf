use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::backend::{BackendGateway, BackendTarget};
use crate::dispatcher::{dispatch, DispatchError};
use crate::hub::{HubHandle, HubMember};
use crate::protocol::{classify_frame, InboundFrame, HEARTBEAT_PING};

// One slot: a full channel means the writer is behind and senders wait.
const OUTBOUND_CAPACITY: usize = 1;

/// Connection parameters the widget passes on the upgrade request query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub channel_id: String,
    pub backend_base_url: String,
    pub session_token: String,
}

impl ConnectParams {
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "channelUUID" => params.channel_id = value.into_owned(),
                "hostApi" => params.backend_base_url = value.into_owned(),
                "userToken" => params.session_token = value.into_owned(),
                _ => {}
            }
        }
        params
    }
}

/// Per-connection state owned by the receive loop.
#[derive(Debug)]
pub struct Client {
    pub connection_id: String,
    pub channel_id: String,
    pub backend_base_url: String,
    pub session_token: String,
    pub user_handle: Option<String>,
    outbound: mpsc::Sender<Value>,
    hub: HubHandle,
}

impl Client {
    pub fn new(
        connection_id: String,
        params: ConnectParams,
        hub: HubHandle,
    ) -> (Self, mpsc::Receiver<Value>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let client = Self {
            connection_id,
            channel_id: params.channel_id,
            backend_base_url: params.backend_base_url,
            session_token: params.session_token,
            user_handle: None,
            outbound,
            hub,
        };
        (client, outbound_rx)
    }

    pub fn backend_target(&self) -> BackendTarget<'_> {
        BackendTarget {
            base_url: &self.backend_base_url,
            channel_id: &self.channel_id,
        }
    }

    pub async fn enqueue(&self, frame: Value) -> Result<(), DispatchError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| DispatchError::Transport)
    }

    /// Makes this connection routable under `handle`. A connection owns at
    /// most one directory entry, so a previous handle is released first.
    pub async fn subscribe(&mut self, handle: String) {
        if let Some(previous) = self.user_handle.take() {
            if previous != handle {
                self.hub.unregister(&previous, &self.connection_id).await;
            }
        }
        self.user_handle = Some(handle.clone());
        self.hub
            .register(HubMember {
                handle,
                connection_id: self.connection_id.clone(),
                outbound: self.outbound.clone(),
            })
            .await;
    }

    async fn disconnect(self) {
        if let Some(handle) = &self.user_handle {
            self.hub.unregister(handle, &self.connection_id).await;
        }
        info!("connection closed conn_id={}", self.connection_id);
    }
}

/// Runs both halves of one upgraded socket until either side fails or the
/// server shuts down.
pub async fn serve_connection<S>(
    socket: S,
    client: Client,
    outbound_rx: mpsc::Receiver<Value>,
    backend: &dyn BackendGateway,
    ping_interval: Duration,
    shutdown: watch::Receiver<bool>,
) where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
{
    let (sink, stream) = socket.split();
    let (writer_done_tx, writer_done_rx) = oneshot::channel::<()>();
    let connection_id = client.connection_id.clone();
    let writer = tokio::spawn(async move {
        let _writer_done = writer_done_tx;
        send_loop(sink, outbound_rx, ping_interval, &connection_id).await;
    });

    let mut client = client;
    read_loop(stream, &mut client, backend, writer_done_rx, shutdown).await;
    // Releasing the reader's sender lets the channel close once the hub lets go.
    client.disconnect().await;
    let _ = writer.await;
}

pub async fn read_loop<R>(
    mut stream: R,
    client: &mut Client,
    backend: &dyn BackendGateway,
    mut writer_done: oneshot::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = &mut writer_done => {
                debug!("send loop ended, closing reader conn_id={}", client.connection_id);
                break;
            }
            _ = shutdown_requested(&mut shutdown) => {
                debug!("shutdown requested, closing reader conn_id={}", client.connection_id);
                break;
            }
            frame = stream.next() => frame,
        };
        match frame {
            None => break,
            Some(Err(err)) => {
                match err {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {}
                    other => warn!("read failed on conn_id={}: {other}", client.connection_id),
                }
                break;
            }
            Some(Ok(Message::Text(text))) => handle_text(client, &text, backend).await,
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
        }
    }
}

async fn handle_text(client: &mut Client, text: &str, backend: &dyn BackendGateway) {
    let envelope = match classify_frame(text) {
        InboundFrame::HeartbeatAck => return,
        InboundFrame::Malformed => {
            debug!("ignoring malformed frame on conn_id={}", client.connection_id);
            return;
        }
        InboundFrame::Envelope(envelope) => envelope,
    };
    if let Err(err) = dispatch(client, &envelope, backend).await {
        warn!(
            "{} failed on conn_id={}: {err}",
            envelope.event, client.connection_id
        );
    }
}

pub async fn send_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<Value>,
    ping_interval: Duration,
    connection_id: &str,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sink.send(Message::Text(HEARTBEAT_PING.to_owned())).await {
                    warn!("heartbeat write failed on conn_id={connection_id}: {err}");
                    break;
                }
            }
            next = outbound.recv() => {
                let Some(frame) = next else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if frame.is_null() {
                    continue;
                }
                if let Err(err) = sink.send(Message::Text(frame.to_string())).await {
                    warn!("frame write failed on conn_id={connection_id}: {err}");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stopping| *stopping).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
