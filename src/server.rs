//! TCP/TLS listener. Peeks at the HTTP request line to pick a route, then
//! either upgrades to a WebSocket (room or user socket) or answers the room
//! lookup endpoint directly.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::groups::GroupEvent;
use crate::room::{Lookup, RoomError};
use crate::signaling::protocol::error_reply;
use crate::signaling::{PresenceHub, RoomHub, SignalingContext};

const MAX_HEADER_LINES: usize = 100;
const MAX_LINE_LENGTH: usize = 8 * 1024;
const MAX_BODY_SIZE: usize = 64 * 1024;
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    RoomSocket(String),
    UserSocket(String),
    RoomLookup(String),
    NotFound,
}

/// Matches `GET /ws/rooms/<name>/`, `GET /ws/users/<id>/` and
/// `POST /rooms/<name>/`. Names are limited to `[A-Za-z0-9_-]`.
pub fn route(method: &str, target: &str) -> Route {
    let path = target.split(['?', '#']).next().unwrap_or("");
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        ("GET", ["ws", "rooms", name]) if valid_name(name) => Route::RoomSocket(name.to_string()),
        ("GET", ["ws", "users", id]) if valid_name(id) => Route::UserSocket(id.to_string()),
        ("POST", ["rooms", name]) if valid_name(name) => Route::RoomLookup(name.to_string()),
        _ => Route::NotFound,
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn load_tls_config(
    cert_path: &str,
    key_path: &str,
) -> Result<native_tls::TlsAcceptor, Box<dyn std::error::Error>> {
    let cert = std::fs::read(cert_path)?;
    let key = std::fs::read(key_path)?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;

    Ok(acceptor)
}

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: TcpListener, tls_acceptor: Option<TlsAcceptor>, context: SignalingContext) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_INTERVAL).await;
                continue;
            }
        };
        let tls_acceptor = tls_acceptor.clone();
        let context = context.clone();

        tokio::spawn(async move {
            let stream: Box<dyn AsyncStream> = if let Some(tls_acceptor) = tls_acceptor {
                match tls_acceptor.accept(stream).await {
                    Ok(tls_stream) => Box::new(tls_stream),
                    Err(e) => {
                        warn!("Failed to accept TLS connection from {}: {}", peer, e);
                        return;
                    }
                }
            } else {
                Box::new(stream)
            };
            handle_connection(stream, &context).await;
        });
    }
}

async fn handle_connection(stream: impl AsyncRead + AsyncWrite + Unpin, context: &SignalingContext) {
    let mut rewindable_stream = RewindableStream::new(stream);

    let request_line = match rewindable_stream.read_line().await {
        Ok(line) => line,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            debug!("Rejecting request: {}", e);
            let _ = write_response(&mut rewindable_stream, 400, &json!({"detail": "Bad request."})).await;
            return;
        }
        Err(e) => {
            debug!("Failed to read from stream: {}", e);
            return;
        }
    };
    let request_line_str = String::from_utf8_lossy(&request_line);
    let mut parts = request_line_str.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");

    match route(method, target) {
        Route::RoomLookup(room_name) => {
            handle_room_lookup(&mut rewindable_stream, context, &room_name).await
        }
        Route::NotFound => {
            debug!("No route for {} {}", method, target);
            let _ = read_body(&mut rewindable_stream).await;
            let _ = write_response(&mut rewindable_stream, 404, &json!({"detail": "Not found."})).await;
        }
        Route::RoomSocket(room_name) => {
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Value>();
            match RoomHub::connect(&context.registry, context.groups.clone(), &room_name, outgoing_tx).await {
                Ok((hub, events)) => {
                    rewindable_stream.rewind();
                    match tokio_tungstenite::accept_async(rewindable_stream).await {
                        Ok(ws_stream) => serve_room(ws_stream, hub, events, outgoing_rx).await,
                        Err(e) => {
                            warn!("Failed to accept websocket: {}", e);
                            hub.disconnect().await;
                        }
                    }
                }
                Err(e) => {
                    error!("Could not join group for room {}: {}", room_name, e);
                    refuse_upgrade(&mut rewindable_stream).await;
                }
            }
        }
        Route::UserSocket(user_id) => {
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Value>();
            match PresenceHub::connect(
                context.groups.clone(),
                context.identity.clone(),
                &user_id,
                outgoing_tx,
            )
            .await
            {
                Ok((hub, events)) => {
                    rewindable_stream.rewind();
                    match tokio_tungstenite::accept_async(rewindable_stream).await {
                        Ok(ws_stream) => serve_user(ws_stream, hub, events, outgoing_rx).await,
                        Err(e) => {
                            warn!("Failed to accept websocket: {}", e);
                            hub.disconnect().await;
                        }
                    }
                }
                Err(e) => {
                    error!("Could not join notification group of {}: {}", user_id, e);
                    refuse_upgrade(&mut rewindable_stream).await;
                }
            }
        }
    }
}

/// Answers a socket request whose group join failed without upgrading it.
async fn refuse_upgrade<S>(stream: &mut RewindableStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = read_body(stream).await;
    let body = json!({"detail": "Group layer unavailable."});
    let _ = write_response(stream, 503, &body).await;
}

async fn serve_room<S>(
    mut ws_stream: WebSocketStream<S>,
    mut hub: RoomHub,
    mut events: mpsc::UnboundedReceiver<GroupEvent>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Value>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("Room socket opened for {}", hub.room_name());

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            break;
                        }
                        if msg.is_text() {
                            if let Ok(text) = msg.into_text() {
                                hub.handle_text(&text).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Error reading room socket: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            Some(event) = events.recv() => hub.handle_group_event(event),
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(value) => {
                        if ws_stream.send(Message::Text(value.to_string())).await.is_err() {
                            debug!("Failed to send through room socket");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let room_name = hub.room_name().to_string();
    hub.disconnect().await;
    info!("Room socket closed for {}", room_name);
}

async fn serve_user<S>(
    mut ws_stream: WebSocketStream<S>,
    mut hub: PresenceHub,
    mut events: mpsc::UnboundedReceiver<GroupEvent>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Value>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Notification socket opened for {}", hub.user_id());

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            break;
                        }
                        if msg.is_text() {
                            if let Ok(text) = msg.into_text() {
                                hub.handle_text(&text).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Error reading notification socket: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            Some(event) = events.recv() => hub.handle_group_event(event),
            outgoing = outgoing_rx.recv() => {
                match outgoing {
                    Some(value) => {
                        if ws_stream.send(Message::Text(value.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let user_id = hub.user_id().to_string();
    hub.disconnect().await;
    debug!("Notification socket closed for {}", user_id);
}

#[derive(Debug, Default, Deserialize)]
struct LookupRequest {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    user_id: Option<Value>,
}

impl LookupRequest {
    fn user_id(&self) -> Option<String> {
        match &self.user_id {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }
    }
}

/// Status code and JSON body for a lookup outcome.
pub fn lookup_response(result: Result<Lookup, RoomError>) -> (u16, Value) {
    match result {
        Ok(Lookup::Found(view)) => (200, serde_json::to_value(view).unwrap_or(Value::Null)),
        Ok(Lookup::NotAuthenticated) => (
            401,
            json!({"detail": "Authentication credentials were not provided."}),
        ),
        Ok(Lookup::NotFound) => (404, json!({})),
        Ok(Lookup::PasswordMismatch) => (400, json!({"password": ["passwords do not match"]})),
        Err(e) => (503, error_reply(e.code(), &e.to_string())),
    }
}

async fn handle_room_lookup<S>(stream: &mut RewindableStream<S>, context: &SignalingContext, room_name: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = match read_body(stream).await {
        Ok(body) => body,
        Err(status) => {
            let _ = write_response(stream, status, &json!({"detail": "Bad request."})).await;
            return;
        }
    };
    let request: LookupRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LookupRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(_) => {
                let _ = write_response(stream, 400, &json!({"detail": "Malformed JSON."})).await;
                return;
            }
        }
    };

    let user_id = request.user_id();
    let password = request.password.as_deref().unwrap_or("");
    let result = context
        .registry
        .service(room_name)
        .lookup(user_id.as_deref(), password)
        .await;
    let (status, body) = lookup_response(result);
    if let Err(e) = write_response(stream, status, &body).await {
        debug!("Failed to write lookup response: {}", e);
    }
}

/// Reads headers up to the blank line and then `Content-Length` bytes.
/// Errors carry the HTTP status to answer with.
async fn read_body<S>(stream: &mut RewindableStream<S>) -> Result<Vec<u8>, u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut content_length = 0usize;
    for _ in 0..MAX_HEADER_LINES {
        let line = stream.read_line().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => 431u16,
            _ => 400,
        })?;
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end();
        if line.is_empty() {
            if content_length > MAX_BODY_SIZE {
                return Err(413);
            }
            return stream.read_exact_buffered(content_length).await.map_err(|_| 400);
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| 400u16)?;
            }
        }
    }
    Err(431)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

async fn write_response<S>(stream: &mut S, status: u16, body: &Value) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

struct RewindableStream<S> {
    stream: S,
    buffer: Vec<u8>,
    position: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> RewindableStream<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            position: 0,
        }
    }

    fn rewind(&mut self) {
        self.position = 0;
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        let mut buf = [0u8; 1024];
        let n = self.stream.read(&mut buf).await?;
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Reads through the next `\n`. Fails with `InvalidData` once a line
    /// exceeds `MAX_LINE_LENGTH` bytes.
    async fn read_line(&mut self) -> std::io::Result<Vec<u8>> {
        let mut result = Vec::new();
        loop {
            if self.position < self.buffer.len() {
                let byte = self.buffer[self.position];
                self.position += 1;
                result.push(byte);
                if byte == b'\n' {
                    break;
                }
                if result.len() >= MAX_LINE_LENGTH {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "request line too long",
                    ));
                }
            } else if self.fill().await? == 0 {
                break;
            }
        }
        Ok(result)
    }

    async fn read_exact_buffered(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        while self.buffer.len() - self.position < len {
            if self.fill().await? == 0 {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
        }
        let body = self.buffer[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(body)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for RewindableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.position < self.buffer.len() {
            let remaining = self.buffer.len() - self.position;
            let to_read = buf.remaining().min(remaining);
            let start = self.position;
            buf.put_slice(&self.buffer[start..start + to_read]);
            self.position += to_read;
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.stream).poll_read(cx, buf)
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for RewindableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
