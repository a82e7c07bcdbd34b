//! Levin connections
//!
//! Each socket is driven by two tasks over a split `Framed<_, LevinCodec>`:
//! the reader dispatches frames to a `CommandHandler`, the writer drains a
//! bounded queue of outgoing frames and callback markers. `Connection` is a
//! cheap clonable handle onto the shared state of both tasks.

use super::address::NetworkAddress;
use super::context::ConnectionContext;
use super::throttle::Throttle;
use crate::levin::{
    decode_payload, encode_payload, Frame, FrameKind, LevinCodec, LevinCommand, PacketLimit,
    PayloadError, LEVIN_ERROR_CONNECTION, LEVIN_ERROR_CONNECTION_HANDLER_NOT_DEFINED,
    LEVIN_ERROR_FORMAT, LEVIN_INITIAL_MAX_PACKET_SIZE, LEVIN_OK,
};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Constants
// =============================================================================

/// Outgoing frames that may be queued before the peer counts as too slow
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Connections that receive nothing for this long are closed
pub const P2P_IDLE_CONNECTION_KILL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long a closing connection may take to flush its last frames
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Errors
// =============================================================================

/// Failure to queue a frame
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Write queue full")]
    QueueFull,
    #[error("Connection closed")]
    Closed,
}

/// Failure of a request/response exchange
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Timed out waiting for response")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Peer answered with return code {0}")]
    Remote(i32),
    #[error("Send error: {0}")]
    Send(#[from] SendError),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
}

/// Outcome of a command handler that failed; the connection is closed
/// after the matching return code has been sent
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("No handler for command {0}")]
    NotHandled(u32),
    #[error("Malformed request: {0}")]
    Format(String),
    #[error("Protocol violation: {0}")]
    Violation(String),
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn return_code(&self) -> i32 {
        match self {
            HandlerError::NotHandled(_) => LEVIN_ERROR_CONNECTION_HANDLER_NOT_DEFINED,
            HandlerError::Format(_) => LEVIN_ERROR_FORMAT,
            HandlerError::Violation(_) | HandlerError::Rejected(_) => LEVIN_ERROR_CONNECTION,
        }
    }
}

impl From<PayloadError> for HandlerError {
    fn from(e: PayloadError) -> Self {
        HandlerError::Format(e.to_string())
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Receives the traffic of a connection.
///
/// Handlers run on the connection's own tasks and must not wait for
/// replies on the connection they were called for; follow-up work is
/// scheduled with `Connection::request_callback`.
pub trait CommandHandler: Send + Sync {
    fn on_invoke(&self, conn: &Connection, command: u32, payload: &[u8])
        -> Result<Bytes, HandlerError>;

    fn on_notify(&self, conn: &Connection, command: u32, payload: &[u8])
        -> Result<(), HandlerError>;

    /// Sees a successful response on the reader task before its waiter is
    /// woken, so the next frame is dispatched against the updated context.
    /// An error closes the connection and fails the waiter.
    fn on_response(&self, _conn: &Connection, _command: u32, _payload: &[u8]) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Runs on the writer task when a callback marker is reached
    fn on_callback(&self, _conn: &Connection) {}

    /// Runs once, after both tasks have stopped
    fn on_close(&self, _conn: &Connection) {}
}

// =============================================================================
// Connection
// =============================================================================

/// Settings for a new connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_packet_size: u64,
    pub queue_capacity: usize,
    pub idle_timeout: Duration,
    pub throttle_in: Arc<Throttle>,
    pub throttle_out: Arc<Throttle>,
    /// Cancelling this closes the connection
    pub parent: CancellationToken,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: LEVIN_INITIAL_MAX_PACKET_SIZE,
            queue_capacity: WRITE_QUEUE_CAPACITY,
            idle_timeout: P2P_IDLE_CONNECTION_KILL_INTERVAL,
            throttle_in: Arc::new(Throttle::unlimited()),
            throttle_out: Arc::new(Throttle::unlimited()),
            parent: CancellationToken::new(),
        }
    }
}

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
}

#[derive(Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

enum Outbound {
    Frame(Frame),
    Callback,
    Close,
}

struct Pending {
    command: u32,
    reply: oneshot::Sender<(i32, Bytes)>,
}

struct Inner {
    id: Uuid,
    remote: NetworkAddress,
    incoming: bool,
    context: Mutex<ConnectionContext>,
    queue: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_sequence: AtomicU64,
    cancel: CancellationToken,
    limit: PacketLimit,
    counters: Counters,
    last_recv: Mutex<Instant>,
}

/// Handle to a live connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

enum Dispatch {
    Continue,
    /// Flush what is queued, then close
    Close,
}

impl Connection {
    /// Starts the reader and writer tasks for `stream`
    pub fn spawn<S>(
        stream: S,
        remote: NetworkAddress,
        incoming: bool,
        handler: Arc<dyn CommandHandler>,
        config: ConnectionConfig,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let limit = PacketLimit::new(config.max_packet_size);
        let conn = Connection {
            inner: Arc::new(Inner {
                id,
                remote: remote.clone(),
                incoming,
                context: Mutex::new(ConnectionContext::new(id, remote, incoming)),
                queue,
                pending: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                cancel: config.parent.child_token(),
                limit: limit.clone(),
                counters: Counters::default(),
                last_recv: Mutex::new(Instant::now()),
            }),
        };

        let framed = Framed::new(stream, LevinCodec::new(limit));
        let (sink, frames) = framed.split();

        tokio::spawn(write_loop(
            sink,
            rx,
            conn.clone(),
            handler.clone(),
            config.throttle_out.clone(),
        ));
        tokio::spawn(read_loop(frames, conn.clone(), handler, config));

        log::debug!("{} connection opened", conn);
        conn
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn remote_address(&self) -> &NetworkAddress {
        &self.inner.remote
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    /// Locks the context; keep the guard for in-memory work only
    pub fn context(&self) -> MutexGuard<'_, ConnectionContext> {
        self.inner.context.lock()
    }

    /// Locks the context unless another task holds it
    pub fn try_context(&self) -> Option<MutexGuard<'_, ConnectionContext>> {
        self.inner.context.try_lock()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&mut ConnectionContext) -> R) -> R {
        f(&mut self.inner.context.lock())
    }

    pub fn context_snapshot(&self) -> ConnectionContext {
        self.inner.context.lock().clone()
    }

    pub fn set_max_packet_size(&self, max: u64) {
        self.inner.limit.set(max);
    }

    pub fn max_packet_size(&self) -> u64 {
        self.inner.limit.get()
    }

    pub fn stats(&self) -> TrafficStats {
        let c = &self.inner.counters;
        TrafficStats {
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_out: c.frames_out.load(Ordering::Relaxed),
        }
    }

    /// Time since the last frame arrived
    pub fn idle_time(&self) -> Duration {
        self.inner.last_recv.lock().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Closes immediately; queued frames are dropped
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            log::debug!("{} closing connection", self);
            self.inner.cancel.cancel();
        }
    }

    /// Closes after the frames already queued have been written
    pub fn close_after_flush(&self) {
        if self.inner.queue.try_send(Outbound::Close).is_err() {
            self.close();
        }
    }

    fn next_sequence(&self) -> u64 {
        self.inner.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, item: Outbound) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.inner.queue.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("{} write queue full, dropping connection", self);
                self.close();
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Queues a notification
    pub fn notify(&self, command: u32, payload: Bytes) -> Result<(), SendError> {
        let sequence = self.next_sequence();
        self.enqueue(Outbound::Frame(Frame::notify(command, sequence, payload)))
    }

    pub fn notify_command<T: LevinCommand>(&self, message: &T) -> Result<(), InvokeError> {
        let payload = encode_payload(message)?;
        self.notify(T::ID, payload)?;
        Ok(())
    }

    /// Sends a request and waits for the response with the same sequence number.
    ///
    /// A timeout frees the waiter but leaves the connection open.
    pub async fn invoke(
        &self,
        command: u32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, InvokeError> {
        let sequence = self.next_sequence();
        let (reply, mut rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(sequence, Pending { command, reply });

        if let Err(e) = self.enqueue(Outbound::Frame(Frame::request(command, sequence, payload))) {
            self.inner.pending.lock().remove(&sequence);
            return Err(match e {
                SendError::Closed => InvokeError::ConnectionClosed,
                other => other.into(),
            });
        }

        // a response read just before the close still counts
        let outcome = tokio::select! {
            biased;
            outcome = tokio::time::timeout(timeout, &mut rx) => outcome,
            _ = self.inner.cancel.cancelled() => {
                self.inner.pending.lock().remove(&sequence);
                match rx.try_recv() {
                    Ok(reply) => Ok(Ok(reply)),
                    Err(_) => return Err(InvokeError::ConnectionClosed),
                }
            }
        };
        match outcome {
            Err(_) => {
                self.inner.pending.lock().remove(&sequence);
                log::debug!("{} command {} timed out", self, command);
                Err(InvokeError::Timeout)
            }
            Ok(Err(_)) => Err(InvokeError::ConnectionClosed),
            Ok(Ok((code, _))) if code < LEVIN_OK => Err(InvokeError::Remote(code)),
            Ok(Ok((_, payload))) => Ok(payload),
        }
    }

    /// Typed `invoke`
    pub async fn invoke_command<Req, Resp>(
        &self,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, InvokeError>
    where
        Req: LevinCommand,
        Resp: DeserializeOwned,
    {
        let payload = encode_payload(request)?;
        let response = self.invoke(Req::ID, payload, timeout).await?;
        Ok(decode_payload(&response)?)
    }

    /// Queues a marker; `on_callback` runs when the writer reaches it
    pub fn request_callback(&self) -> Result<(), SendError> {
        self.enqueue(Outbound::Callback)
    }

    fn dispatch(&self, frame: Frame, handler: &dyn CommandHandler) -> Dispatch {
        let command = frame.command();
        let sequence = frame.header.sequence;
        match frame.kind() {
            FrameKind::Request => {
                let (code, payload, result) = match handler.on_invoke(self, command, &frame.payload)
                {
                    Ok(payload) => (LEVIN_OK, payload, Dispatch::Continue),
                    Err(e) => {
                        log::warn!("{} command {} failed: {}", self, command, e);
                        (e.return_code(), Bytes::new(), Dispatch::Close)
                    }
                };
                let response = Frame::response(command, sequence, code, payload);
                if self.enqueue(Outbound::Frame(response)).is_err() {
                    return Dispatch::Close;
                }
                result
            }
            FrameKind::Notify => match handler.on_notify(self, command, &frame.payload) {
                Ok(()) => Dispatch::Continue,
                Err(e) => {
                    log::warn!("{} notification {} failed: {}", self, command, e);
                    Dispatch::Close
                }
            },
            FrameKind::Response => {
                let pending = self.inner.pending.lock().remove(&sequence);
                match pending {
                    Some(p) if p.command == command => {
                        let code = frame.header.return_code;
                        if code >= LEVIN_OK {
                            if let Err(e) = handler.on_response(self, command, &frame.payload) {
                                log::warn!("{} response to command {} rejected: {}", self, command, e);
                                return Dispatch::Close;
                            }
                        }
                        let _ = p.reply.send((code, frame.payload));
                        Dispatch::Continue
                    }
                    Some(p) => {
                        log::warn!(
                            "{} response for command {} answers command {}",
                            self,
                            command,
                            p.command
                        );
                        Dispatch::Close
                    }
                    None if sequence < self.inner.next_sequence.load(Ordering::Relaxed) => {
                        log::debug!("{} late response {} ignored", self, sequence);
                        Dispatch::Continue
                    }
                    None => {
                        log::warn!("{} response to unknown request {}", self, sequence);
                        Dispatch::Close
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        self.inner.cancel.cancel();
        // dropping the senders resolves every waiter as ConnectionClosed
        self.inner.pending.lock().clear();
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}]",
            self.inner.remote,
            if self.inner.incoming { "INC" } else { "OUT" }
        )
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("incoming", &self.inner.incoming)
            .finish()
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn read_loop<R>(
    mut frames: R,
    conn: Connection,
    handler: Arc<dyn CommandHandler>,
    config: ConnectionConfig,
) where
    R: futures::Stream<Item = Result<Frame, crate::levin::LevinError>> + Unpin,
{
    let cancel = conn.inner.cancel.clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(config.idle_timeout, frames.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                log::info!("{} idle for too long, closing", conn);
                break;
            }
            Ok(None) => {
                log::debug!("{} closed by peer", conn);
                break;
            }
            Ok(Some(Err(e))) => {
                log::warn!("{} framing error: {}", conn, e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let size = frame.wire_size();
        config.throttle_in.consume(size).await;
        let counters = &conn.inner.counters;
        counters.bytes_in.fetch_add(size as u64, Ordering::Relaxed);
        counters.frames_in.fetch_add(1, Ordering::Relaxed);
        *conn.inner.last_recv.lock() = Instant::now();
        log::trace!(
            "{} received {:?} {} ({} bytes)",
            conn,
            frame.kind(),
            frame.command(),
            size
        );

        if let Dispatch::Close = conn.dispatch(frame, handler.as_ref()) {
            conn.close_after_flush();
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, cancel.cancelled()).await;
            break;
        }
    }

    conn.shutdown();
    handler.on_close(&conn);
    log::debug!("{} connection closed", conn);
}

async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Outbound>,
    conn: Connection,
    handler: Arc<dyn CommandHandler>,
    throttle: Arc<Throttle>,
) where
    W: futures::Sink<Frame, Error = crate::levin::LevinError> + Unpin,
{
    let cancel = conn.inner.cancel.clone();
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            None | Some(Outbound::Close) => break,
            Some(Outbound::Callback) => handler.on_callback(&conn),
            Some(Outbound::Frame(frame)) => {
                let size = frame.wire_size();
                throttle.consume(size).await;
                if let Err(e) = sink.send(frame).await {
                    log::debug!("{} write failed: {}", conn, e);
                    break;
                }
                let counters = &conn.inner.counters;
                counters.bytes_out.fetch_add(size as u64, Ordering::Relaxed);
                counters.frames_out.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    let _ = sink.close().await;
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levin::LEVIN_DEFAULT_MAX_PACKET_SIZE;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;

    const ECHO: u32 = 1;
    const SLOW: u32 = 2;
    const BAD: u32 = 3;
    const NOTE: u32 = 4;

    #[derive(Default)]
    struct EchoHandler {
        notes: AtomicUsize,
        callbacks: AtomicUsize,
        closes: AtomicUsize,
    }

    impl CommandHandler for EchoHandler {
        fn on_invoke(
            &self,
            _conn: &Connection,
            command: u32,
            payload: &[u8],
        ) -> Result<Bytes, HandlerError> {
            match command {
                ECHO => Ok(Bytes::copy_from_slice(payload)),
                BAD => Err(HandlerError::Format("bad".to_string())),
                other => Err(HandlerError::NotHandled(other)),
            }
        }

        fn on_notify(
            &self,
            _conn: &Connection,
            command: u32,
            _payload: &[u8],
        ) -> Result<(), HandlerError> {
            match command {
                NOTE => {
                    self.notes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                other => Err(HandlerError::NotHandled(other)),
            }
        }

        fn on_callback(&self, _conn: &Connection) {
            self.callbacks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _conn: &Connection) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Used on sockets whose other end is never driven
    struct SilentHandler;

    impl CommandHandler for SilentHandler {
        fn on_invoke(&self, _: &Connection, c: u32, _: &[u8]) -> Result<Bytes, HandlerError> {
            Err(HandlerError::NotHandled(c))
        }

        fn on_notify(&self, _: &Connection, _: u32, _: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    /// Accepts echo responses unless they carry `b"no"`
    #[derive(Default)]
    struct PickyHandler {
        responses: AtomicUsize,
    }

    impl CommandHandler for PickyHandler {
        fn on_invoke(&self, _: &Connection, c: u32, _: &[u8]) -> Result<Bytes, HandlerError> {
            Err(HandlerError::NotHandled(c))
        }

        fn on_notify(&self, _: &Connection, _: u32, _: &[u8]) -> Result<(), HandlerError> {
            Ok(())
        }

        fn on_response(&self, _: &Connection, _: u32, payload: &[u8]) -> Result<(), HandlerError> {
            if payload == b"no" {
                return Err(HandlerError::Rejected("refused".to_string()));
            }
            self.responses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pair(
        a: Arc<dyn CommandHandler>,
        b: Arc<dyn CommandHandler>,
    ) -> (Connection, Connection) {
        let (left, right) = duplex(1 << 20);
        let config = ConnectionConfig {
            max_packet_size: LEVIN_DEFAULT_MAX_PACKET_SIZE,
            ..ConnectionConfig::default()
        };
        let out = Connection::spawn(
            left,
            "10.0.0.2:18080".parse().unwrap(),
            false,
            a,
            config.clone(),
        );
        let inc = Connection::spawn(right, "10.0.0.1:5555".parse().unwrap(), true, b, config);
        (out, inc)
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let (out, _inc) = pair(Arc::new(EchoHandler::default()), Arc::new(EchoHandler::default()));
        let reply = out
            .invoke(ECHO, Bytes::from_static(b"hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&reply[..], b"hello");
        assert!(out.stats().frames_out >= 1);
        assert!(out.stats().bytes_in > 0);
    }

    #[tokio::test]
    async fn test_response_hook_runs_before_invoke_resolves() {
        let picky = Arc::new(PickyHandler::default());
        let (out, _inc) = pair(picky.clone(), Arc::new(EchoHandler::default()));

        out.invoke(ECHO, Bytes::from_static(b"yes"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(picky.responses.load(Ordering::SeqCst), 1);

        let refused = out
            .invoke(ECHO, Bytes::from_static(b"no"), Duration::from_secs(5))
            .await;
        assert!(matches!(refused, Err(InvokeError::ConnectionClosed)));
        assert_eq!(picky.responses.load(Ordering::SeqCst), 1);
        eventually(|| out.is_closed()).await;
    }

    #[tokio::test]
    async fn test_concurrent_invokes_matched_by_sequence() {
        let (out, _inc) = pair(Arc::new(EchoHandler::default()), Arc::new(EchoHandler::default()));
        let calls = (0..16u8).map(|i| {
            let out = out.clone();
            async move {
                let reply = out
                    .invoke(ECHO, Bytes::from(vec![i; 8]), Duration::from_secs(5))
                    .await
                    .unwrap();
                assert_eq!(&reply[..], &[i; 8]);
            }
        });
        futures::future::join_all(calls).await;
    }

    #[tokio::test]
    async fn test_notify_and_callback() {
        let remote = Arc::new(EchoHandler::default());
        let local = Arc::new(EchoHandler::default());
        let (out, _inc) = pair(local.clone(), remote.clone());

        out.notify(NOTE, Bytes::new()).unwrap();
        out.request_callback().unwrap();
        eventually(|| remote.notes.load(Ordering::SeqCst) == 1).await;
        eventually(|| local.callbacks.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_handler_error_returns_code_and_closes() {
        let remote = Arc::new(EchoHandler::default());
        let (out, inc) = pair(Arc::new(EchoHandler::default()), remote.clone());

        let err = out
            .invoke(BAD, Bytes::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Remote(LEVIN_ERROR_FORMAT)));

        eventually(|| inc.is_closed()).await;
        eventually(|| out.is_closed()).await;
        eventually(|| remote.closes.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_unknown_notify_closes() {
        let (out, inc) = pair(Arc::new(EchoHandler::default()), Arc::new(EchoHandler::default()));
        out.notify(9999, Bytes::new()).unwrap();
        eventually(|| inc.is_closed()).await;
    }

    #[tokio::test]
    async fn test_invoke_timeout_keeps_connection() {
        // the remote side never answers because its reader is parked on a
        // socket that nobody writes to
        let (left, _right) = duplex(1024);
        let conn = Connection::spawn(
            left,
            "10.0.0.2:18080".parse().unwrap(),
            false,
            Arc::new(SilentHandler),
            ConnectionConfig::default(),
        );
        let err = conn
            .invoke(SLOW, Bytes::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_resolves_pending_invokes() {
        let (left, _right) = duplex(1024);
        let conn = Connection::spawn(
            left,
            "10.0.0.2:18080".parse().unwrap(),
            false,
            Arc::new(SilentHandler),
            ConnectionConfig::default(),
        );
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.invoke(SLOW, Bytes::new(), Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(InvokeError::ConnectionClosed)));
        assert!(matches!(
            conn.notify(NOTE, Bytes::new()),
            Err(SendError::Closed)
        ));
        let late = conn.invoke(ECHO, Bytes::new(), Duration::from_secs(1)).await;
        assert!(matches!(late, Err(InvokeError::ConnectionClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_response_read_before_close_is_kept() {
        // the remote writes the error code and closes right away; the reply
        // must win over the close on every run
        for _ in 0..32 {
            let (out, _inc) = pair(Arc::new(EchoHandler::default()), Arc::new(EchoHandler::default()));
            let err = out
                .invoke(BAD, Bytes::new(), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, InvokeError::Remote(LEVIN_ERROR_FORMAT)), "{:?}", err);
        }
    }

    #[tokio::test]
    async fn test_parent_cancellation_closes() {
        let parent = CancellationToken::new();
        let (left, _right) = duplex(1024);
        let conn = Connection::spawn(
            left,
            "10.0.0.2:18080".parse().unwrap(),
            false,
            Arc::new(SilentHandler),
            ConnectionConfig {
                parent: parent.clone(),
                ..ConnectionConfig::default()
            },
        );
        parent.cancel();
        eventually(|| conn.is_closed()).await;
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_receiver() {
        let (out, inc) = pair(Arc::new(EchoHandler::default()), Arc::new(EchoHandler::default()));
        inc.set_max_packet_size(16);
        out.notify(NOTE, Bytes::from(vec![0u8; 64])).unwrap();
        eventually(|| inc.is_closed()).await;
    }

    #[tokio::test]
    async fn test_idle_connection_killed() {
        let (left, _right) = duplex(1024);
        let conn = Connection::spawn(
            left,
            "10.0.0.2:18080".parse().unwrap(),
            false,
            Arc::new(SilentHandler),
            ConnectionConfig {
                idle_timeout: Duration::from_millis(50),
                ..ConnectionConfig::default()
            },
        );
        eventually(|| conn.is_closed()).await;
    }
}
