//! A single websocket connection: the shared handle user code holds, the
//! retry policy, and the driver task that owns the transport.
//!
//! The handle is shared between the session and user code; every method on
//! it is callable from the loop thread only, which the single-threaded
//! runtime guarantees. The driver moves the connection through
//! Closed -> Connecting -> Open -> Closed, reconnecting with table-driven
//! backoff until the policy is exhausted or the user closes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn, Level};

use super::session::ConnEvent;
use crate::logging::hexdump;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// User callback invoked once per complete logical message.
pub type DataCallback =
    Box<dyn FnMut(Arc<WebSocketConnection>, Vec<u8>) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum WebSocketCloseCode {
    Normal = 1000,
    EndpointUnavailable = 1001,
    ProtocolError = 1002,
    InvalidMessageType = 1003,
    Empty = 1005,
    AbnormalClosure = 1006,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    MandatoryExtension = 1010,
    InternalServerError = 1011,
    TlsHandshake = 1015,
}

impl WebSocketCloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// Build the close frame body: the 16-bit status code in network byte
/// order, followed by the payload.
pub fn encode_close_payload(code: WebSocketCloseCode, payload: &[u8]) -> Vec<u8> {
    let code = code.as_u16();

    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push((code >> 8) as u8);
    frame.push((code & 0xff) as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Reassembles partial frame deliveries into one logical message.
///
/// Holds exactly the concatenation of the partials received so far; the
/// buffer is handed off and cleared when a push reports zero bytes left.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buf: Vec<u8>,
}

impl MessageAssembler {
    pub fn push(&mut self, chunk: &[u8], bytes_left: usize) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        (bytes_left == 0).then(|| std::mem::take(&mut self.buf))
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Table-driven reconnect backoff with random jitter. `conceal_count`
/// failures are retried before the connection gives up for good.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Vec<Duration>,
    pub conceal_count: u32,
    pub jitter_percent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: [1000, 2000, 3000, 4000, 5000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            conceal_count: 5,
            jitter_percent: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.conceal_count || self.backoff.is_empty() {
            return None;
        }

        let index = usize::min(retry_count as usize, self.backoff.len() - 1);
        Some(apply_jitter(self.backoff[index], self.jitter_percent))
    }
}

fn apply_jitter(base: Duration, jitter_percent: u32) -> Duration {
    let span = base.as_millis() as u64 * u64::from(jitter_percent) / 100;
    if span == 0 {
        return base;
    }

    base + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

pub(crate) enum Command {
    Send { data: Vec<u8>, kind: FrameKind },
    Close { code: WebSocketCloseCode, payload: Vec<u8> },
}

pub(crate) struct DriverParts {
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) on_data: DataCallback,
}

pub struct WebSocketConnection {
    url: String,
    open: AtomicBool,
    ready: AtomicBool,
    user_closed: AtomicBool,
    exhausted: AtomicBool,
    last_error: Mutex<Option<String>>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Notify,
    driver_parts: Mutex<Option<DriverParts>>,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("url", &self.url)
            .field("open", &self.open)
            .field("ready", &self.ready)
            .field("user_closed", &self.user_closed)
            .field("exhausted", &self.exhausted)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl WebSocketConnection {
    pub(crate) fn new(url: String, on_data: DataCallback) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            url,
            open: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            user_closed: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            last_error: Mutex::new(None),
            commands: commands_tx,
            shutdown: Notify::new(),
            driver_parts: Mutex::new(Some(DriverParts {
                commands: commands_rx,
                on_data,
            })),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Transport established and not yet closed.
    pub fn open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Registered with the session loop. Operations other than status
    /// queries are defined only once this is true.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Retries were exhausted and the connection is permanently closed.
    pub fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// The most recent transport error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock_error().clone()
    }

    /// Queue a text frame. Returns the number of bytes accepted, or 0 with
    /// the error buffer set when the connection cannot take the frame.
    pub fn send(&self, data: Vec<u8>) -> usize {
        self.send_frame(data, FrameKind::Text)
    }

    pub fn send_frame(&self, data: Vec<u8>, kind: FrameKind) -> usize {
        if !self.ready() {
            self.record_error("connection is not ready");
            return 0;
        }

        trace!(target: "web", url = %self.url, bytes = data.len(), "queueing websocket frame");

        let queued = data.len();
        if self.commands.send(Command::Send { data, kind }).is_err() {
            self.record_error("transport is gone");
            return 0;
        }

        queued
    }

    /// Close with `Normal` status and no payload.
    pub fn close(&self) -> usize {
        self.close_with(WebSocketCloseCode::Normal, Vec::new())
    }

    /// Close the connection, sending a CLOSE frame whose body is the status
    /// code in network byte order followed by `payload`. Idempotent: only
    /// the call that flips the connection from open to closed sends a
    /// frame; later calls return 0.
    pub fn close_with(&self, code: WebSocketCloseCode, payload: Vec<u8>) -> usize {
        if !self.ready() {
            return 0;
        }
        if !self.open.swap(false, Ordering::SeqCst) {
            return 0;
        }

        self.user_closed.store(true, Ordering::SeqCst);

        let encoded = encode_close_payload(code, &payload);
        debug!(
            target: "web",
            url = %self.url,
            code = code.as_u16(),
            bytes = encoded.len(),
            "closing websocket connection"
        );

        if self.commands.send(Command::Close { code, payload }).is_err() {
            self.record_error("transport is gone");
            return 0;
        }

        self.shutdown.notify_waiters();
        encoded.len()
    }

    pub(crate) fn take_driver_parts(&self) -> Option<DriverParts> {
        match self.driver_parts.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub(crate) fn is_user_closed(&self) -> bool {
        self.user_closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
        self.user_closed.store(true, Ordering::SeqCst);
    }

    /// Session-initiated shutdown: close the transport if it is open and
    /// stop any pending reconnect.
    pub(crate) fn request_shutdown(&self) {
        self.user_closed.store(true, Ordering::SeqCst);

        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close {
                code: WebSocketCloseCode::Normal,
                payload: Vec::new(),
            });
        }

        self.shutdown.notify_waiters();
    }

    /// Cleared before each transport call, set on failure.
    pub(crate) fn clear_error(&self) {
        *self.lock_error() = None;
    }

    pub(crate) fn record_error(&self, error: impl ToString) {
        *self.lock_error() = Some(error.to_string());
    }

    fn lock_error(&self) -> MutexGuard<'_, Option<String>> {
        match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for WebSocketConnection {
    /// A connection must not vanish while the transport is up: if the last
    /// handle goes away with `open` still set (a panicked driver, a handle
    /// outliving its session), queue a NORMAL close for whoever still owns
    /// the transport. Best effort: with the driver gone the command has no
    /// receiver.
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close {
                code: WebSocketCloseCode::Normal,
                payload: Vec::new(),
            });
        }
    }
}

enum OpenOutcome {
    UserClosed,
    PeerClosed,
    TransportError,
}

/// Drive one connection to completion: connect, pump frames, reconnect on
/// failure, stop on user close or retry exhaustion.
pub(crate) async fn drive(
    conn: Arc<WebSocketConnection>,
    mut parts: DriverParts,
    policy: RetryPolicy,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut retry_count: u32 = 0;

    loop {
        if conn.is_user_closed() {
            break;
        }

        conn.clear_error();

        match connect_async(conn.url()).await {
            Ok((stream, _response)) => {
                info!(target: "web", url = %conn.url(), "connection established");
                conn.set_open(true);
                retry_count = 0;
                let _ = events.send(ConnEvent::Established {
                    url: conn.url().to_string(),
                });

                let outcome = run_open(&conn, stream, &mut parts).await;
                conn.set_open(false);

                match outcome {
                    OpenOutcome::UserClosed => break,
                    OpenOutcome::PeerClosed => {
                        info!(target: "web", url = %conn.url(), "connection closed by peer");
                    }
                    OpenOutcome::TransportError => {
                        warn!(
                            target: "web",
                            url = %conn.url(),
                            error = conn.last_error().as_deref().unwrap_or("unknown"),
                            "transport error"
                        );
                    }
                }
            }
            Err(err) => {
                conn.record_error(&err);
                warn!(target: "web", url = %conn.url(), error = %err, "connect attempt failed");
            }
        }

        if conn.is_user_closed() {
            break;
        }

        let Some(delay) = policy.delay_for(retry_count) else {
            error!(target: "web", url = %conn.url(), "connection attempts exhausted");
            conn.mark_exhausted();
            let _ = events.send(ConnEvent::RetriesExhausted {
                url: conn.url().to_string(),
            });
            break;
        };

        retry_count += 1;
        debug!(
            target: "web",
            url = %conn.url(),
            retry = retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = conn.shutdown.notified() => {}
        }
    }

    let _ = events.send(ConnEvent::Finished {
        url: conn.url().to_string(),
    });
}

async fn run_open(
    conn: &Arc<WebSocketConnection>,
    mut stream: WsStream,
    parts: &mut DriverParts,
) -> OpenOutcome {
    let mut assembler = MessageAssembler::default();

    loop {
        tokio::select! {
            command = parts.commands.recv() => match command {
                Some(Command::Send { data, kind }) => {
                    conn.clear_error();

                    let message = match kind {
                        FrameKind::Text => match String::from_utf8(data) {
                            Ok(text) => Message::Text(text.into()),
                            Err(err) => {
                                conn.record_error(&err);
                                continue;
                            }
                        },
                        FrameKind::Binary => Message::Binary(data.into()),
                    };

                    if let Err(err) = stream.send(message).await {
                        conn.record_error(&err);
                        return OpenOutcome::TransportError;
                    }
                }
                Some(Command::Close { code, payload }) => {
                    send_close(conn, &mut stream, code, payload).await;
                    return OpenOutcome::UserClosed;
                }
                None => return OpenOutcome::UserClosed,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    deliver(conn, parts, &mut assembler, text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    deliver(conn, parts, &mut assembler, &data).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if stream.send(Message::Pong(payload)).await.is_err() {
                        conn.record_error("failed to answer ping");
                        return OpenOutcome::TransportError;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(target: "web", url = %conn.url(), frame = ?frame, "close frame received");
                    return OpenOutcome::PeerClosed;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    conn.record_error(&err);
                    return OpenOutcome::TransportError;
                }
                None => return OpenOutcome::PeerClosed,
            }
        }
    }
}

async fn send_close(
    conn: &Arc<WebSocketConnection>,
    stream: &mut WsStream,
    code: WebSocketCloseCode,
    payload: Vec<u8>,
) {
    conn.clear_error();

    let frame = CloseFrame {
        code: CloseCode::from(code.as_u16()),
        // Close payloads are UTF-8 on the wire per RFC 6455.
        reason: String::from_utf8_lossy(&payload).into_owned().into(),
    };

    if let Err(err) = stream.send(Message::Close(Some(frame))).await {
        conn.record_error(&err);
        return;
    }

    // Wait briefly for the peer's close echo so the handshake completes.
    let drain = async {
        while let Some(message) = stream.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    };

    let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
}

async fn deliver(
    conn: &Arc<WebSocketConnection>,
    parts: &mut DriverParts,
    assembler: &mut MessageAssembler,
    chunk: &[u8],
) {
    if !conn.open() {
        warn!(target: "web", url = %conn.url(), "data received after close");
        return;
    }

    trace!(target: "web", url = %conn.url(), bytes = chunk.len(), "websocket data frame");
    if tracing::enabled!(target: "web", Level::TRACE) {
        trace!(target: "web", "frame dump\n{}", hexdump(chunk));
    }

    // The transport hands over complete messages; partials would arrive
    // with a nonzero remainder.
    if let Some(message) = assembler.push(chunk, 0) {
        (parts.on_data)(Arc::clone(conn), message).await;
    }
}
