use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use sysinfo::System;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::backend::BackendGateway;
use crate::client::{serve_connection, Client, ConnectParams};
use crate::config::ServerConfig;
use crate::delivery::{deliver, DeliveryPayload};
use crate::hub::HubHandle;

const HTTP_READ_CHUNK_BYTES: usize = 8 * 1024;
const HTTP_MAX_HEADER_BYTES: usize = 16 * 1024;
const HEAD_PEEK_BACKOFF: Duration = Duration::from_millis(10);

pub struct BrokerServer {
    config: ServerConfig,
    backend: Arc<dyn BackendGateway>,
}

/// Shared by every connection task, websocket or plain HTTP.
struct ConnectionContext {
    hub: HubHandle,
    backend: Arc<dyn BackendGateway>,
    ws_path: String,
    ping_interval: Duration,
    handshake_timeout: Duration,
    http_timeout: Duration,
    index_redirect_url: String,
    max_delivery_bytes: usize,
    started: Instant,
    ids: ConnectionIds,
}

impl BrokerServer {
    pub fn new(config: ServerConfig, backend: Arc<dyn BackendGateway>) -> Self {
        Self { config, backend }
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("failed binding listener on {}", self.config.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!(
            "webchat broker listening on ws://{bound_addr}{} and http://{bound_addr}",
            self.config.ws_path
        );

        let (hub, mut hub_task) = HubHandle::spawn(self.config.route_timeout());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ConnectionContext {
            hub: hub.clone(),
            backend: self.backend.clone(),
            ws_path: self.config.ws_path.clone(),
            ping_interval: self.config.ping_interval(),
            handshake_timeout: self.config.handshake_timeout(),
            http_timeout: self.config.http_timeout(),
            index_redirect_url: self.config.index_redirect_url.clone(),
            max_delivery_bytes: self.config.max_delivery_bytes,
            started: Instant::now(),
            ids: ConnectionIds::default(),
        });

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let ctx = ctx.clone();
                            let shutdown = shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(err) = route_connection(stream, remote_addr, ctx, shutdown).await {
                                    warn!("connection from {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    }
                }
            }
        }

        info!(
            "webchat broker shutting down with {} open connections",
            connections.len()
        );
        let _ = shutdown_tx.send(true);
        drop(listener);
        let grace = self.config.shutdown_grace();
        let drained = timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {}ms, aborting",
                connections.len(),
                grace.as_millis()
            );
            connections.shutdown().await;
        }
        drop(ctx);
        drop(hub);
        match timeout(grace, &mut hub_task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("hub task ended abnormally: {err}"),
            Err(_) => {
                debug!("hub still referenced after shutdown, aborting");
                hub_task.abort();
            }
        }
        Ok(())
    }
}

/// Mints opaque, unique connection ids from the clock and a process counter.
#[derive(Debug, Default)]
struct ConnectionIds {
    counter: AtomicU64,
}

impl ConnectionIds {
    fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let mut raw = [0_u8; 16];
        raw[..8].copy_from_slice(&nanos.to_be_bytes());
        raw[8..].copy_from_slice(&seq.to_be_bytes());
        URL_SAFE_NO_PAD.encode(raw)
    }
}

fn ws_path_matches(request_path: &str, ws_path: &str) -> bool {
    let expected = ws_path.trim_end_matches('/');
    request_path == ws_path || request_path.trim_end_matches('/') == expected
}

/// Sends upgrade requests through the websocket handshake and everything
/// else to the plain HTTP routes. The head is only peeked, so either path
/// still reads the full request from the socket.
async fn route_connection(
    stream: TcpStream,
    remote_addr: std::net::SocketAddr,
    ctx: Arc<ConnectionContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let head = timeout(ctx.http_timeout, peek_request_head(&stream))
        .await
        .with_context(|| format!("request head from {remote_addr} timed out"))??;
    let Some(head) = head else {
        return Ok(());
    };
    if is_websocket_upgrade(&head) {
        handle_connection(stream, remote_addr, ctx, shutdown).await
    } else {
        handle_http_connection(stream, &ctx).await
    }
}

async fn peek_request_head(stream: &TcpStream) -> Result<Option<String>> {
    let mut buf = vec![0_u8; HTTP_MAX_HEADER_BYTES];
    let mut seen = 0;
    loop {
        let peeked = stream
            .peek(&mut buf)
            .await
            .context("failed peeking request head")?;
        if peeked == 0 {
            return Ok(None);
        }
        if let Some((header_end, _)) = find_http_header_terminator(&buf[..peeked]) {
            return Ok(Some(String::from_utf8_lossy(&buf[..header_end]).into_owned()));
        }
        if peeked == buf.len() {
            anyhow::bail!("http request headers exceed max size");
        }
        // peek returns at once while unread bytes are queued; wait for more.
        if peeked == seen {
            sleep(HEAD_PEEK_BACKOFF).await;
        }
        seen = peeked;
    }
}

fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    })
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: std::net::SocketAddr,
    ctx: Arc<ConnectionContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut query: Option<String> = None;
    let ws_path = ctx.ws_path.as_str();
    let check_request = |request: &Request, response: Response| {
        if !ws_path_matches(request.uri().path(), ws_path) {
            let mut rejection = ErrorResponse::new(Some("not found".to_owned()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        query = request.uri().query().map(str::to_owned);
        Ok(response)
    };
    let ws = timeout(ctx.handshake_timeout, accept_hdr_async(stream, check_request))
        .await
        .with_context(|| format!("websocket handshake timed out for {remote_addr}"))?
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;

    let params = ConnectParams::from_query(query.as_deref());
    let connection_id = ctx.ids.next();
    info!(
        "connection opened conn_id={connection_id} remote={remote_addr} channel={}",
        params.channel_id
    );
    let (client, outbound_rx) = Client::new(connection_id, params, ctx.hub.clone());
    serve_connection(
        ws,
        client,
        outbound_rx,
        ctx.backend.as_ref(),
        ctx.ping_interval,
        shutdown,
    )
    .await;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
    oversized: bool,
}

async fn handle_http_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    let request = timeout(
        ctx.http_timeout,
        read_http_request(&mut stream, ctx.max_delivery_bytes),
    )
    .await
    .context("http request read timed out")??;
    let Some(request) = request else {
        return Ok(());
    };
    debug!("http {} {}", request.method, request.path);
    timeout(ctx.http_timeout, respond_http(&mut stream, ctx, request))
        .await
        .context("http response write timed out")?
}

async fn respond_http(
    stream: &mut TcpStream,
    ctx: &ConnectionContext,
    request: HttpRequest,
) -> Result<()> {
    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/") => {
            if request.oversized {
                let payload = json!({ "ok": false, "error": "payload_too_large" });
                return write_http_json_response(stream, 413, &payload).await;
            }
            match DeliveryPayload::parse(&request.body) {
                Ok(delivery) => {
                    deliver(&ctx.hub, delivery)
                        .await
                        .context("failed encoding delivery payload")?;
                    write_http_json_response(stream, 200, &json!({ "ok": true })).await
                }
                Err(err) => {
                    let payload = json!({
                        "ok": false,
                        "error": "invalid_payload",
                        "message": err.to_string()
                    });
                    write_http_json_response(stream, 400, &payload).await
                }
            }
        }
        ("GET" | "HEAD", "/") => write_http_redirect(stream, &ctx.index_redirect_url).await,
        ("GET", "/ping") => {
            let payload = ping_payload(ctx).await;
            write_http_json_response(stream, 200, &payload).await
        }
        ("GET" | "POST", _) => {
            let payload = json!({
                "ok": false,
                "error": "not_found",
                "path": request.path
            });
            write_http_json_response(stream, 404, &payload).await
        }
        _ => {
            let payload = json!({ "ok": false, "error": "method_not_allowed" });
            write_http_json_response(stream, 405, &payload).await
        }
    }
}

async fn ping_payload(ctx: &ConnectionContext) -> Value {
    let free_mem = {
        let mut system = System::new();
        system.refresh_memory();
        system.free_memory()
    };
    json!({
        "pid": std::process::id(),
        "hostname": System::host_name().unwrap_or_default(),
        "uptimeSecs": ctx.started.elapsed().as_secs(),
        "freeMem": free_mem,
        "version": env!("CARGO_PKG_VERSION"),
        "clients": ctx.hub.connected_count().await,
    })
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(idx) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
        return Some((idx, 4));
    }
    buf.windows(2)
        .position(|window| window == b"\n\n")
        .map(|idx| (idx, 2))
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })
}

/// Reads one request. A body longer than `max_body` is not buffered; the
/// request comes back flagged as oversized instead.
async fn read_http_request(stream: &mut TcpStream, max_body: usize) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(HTTP_READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; HTTP_READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading http request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);

        if header_info.is_none() {
            match find_http_header_terminator(&buffer) {
                Some((header_end, separator_len)) => {
                    let headers = String::from_utf8_lossy(&buffer[..header_end]);
                    let content_length = parse_http_content_length(&headers).unwrap_or(0);
                    header_info = Some((header_end, separator_len, content_length));
                }
                None if buffer.len() > HTTP_MAX_HEADER_BYTES => {
                    anyhow::bail!("http request headers exceed max size");
                }
                None => {}
            }
        }

        if let Some((header_end, separator_len, content_length)) = header_info {
            if buffer.len() >= header_end + separator_len + content_length {
                break;
            }
            // Oversized bodies are drained up to a bound so the reply is not reset.
            if content_length > max_body && buffer.len() > max_body.saturating_mul(4) {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    let (header_end, separator_len, content_length) = header_info
        .ok_or_else(|| anyhow::anyhow!("invalid http request: missing header terminator"))?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments.next().unwrap_or_default().to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid http request line");
    }
    let path_raw = segments.next().unwrap_or("/");
    let path = path_raw.split('?').next().unwrap_or(path_raw).to_owned();

    if content_length > max_body {
        return Ok(Some(HttpRequest {
            method,
            path,
            body: Vec::new(),
            oversized: true,
        }));
    }
    let body_start = header_end + separator_len;
    if buffer.len() < body_start + content_length {
        anyhow::bail!("truncated http request body");
    }
    Ok(Some(HttpRequest {
        method,
        path,
        body: buffer[body_start..body_start + content_length].to_vec(),
        oversized: false,
    }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing http JSON body")?;
    write_http_response(
        stream,
        status_code,
        &[("Content-Type", "application/json; charset=utf-8")],
        &body,
    )
    .await
}

async fn write_http_redirect(stream: &mut TcpStream, location: &str) -> Result<()> {
    write_http_response(
        stream,
        301,
        &[("Location", location), ("Content-Type", "text/plain; charset=utf-8")],
        b"Moved Permanently",
    )
    .await
}

async fn write_http_response(
    stream: &mut TcpStream,
    status_code: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        301 => "Moved Permanently",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    };
    let mut head = format!("HTTP/1.1 {status_code} {status_text}\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    ));
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing http headers")?;
    stream
        .write_all(body)
        .await
        .context("failed writing http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}
