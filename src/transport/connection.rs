//! One mutually authenticated WebSocket connection to the routing daemon.
//!
//! Lifecycle, one direction only:
//!
//! ```text
//! Unconnected ──connect──► Connecting ──► Open ──close──► Closing ──► Closed
//!                              │            │
//!                              └── failure ─┴── peer close / read error ──► Closed
//! ```
//!
//! An open connection runs exactly two tasks: the writer (sole owner of the
//! sink) and the receive loop (sole reader). Teardown is guarded so it runs
//! once, whichever of `close`, drop, a write error or the receive loop ending
//! gets there first. It cancels both tasks and fails every pending request.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{client_async_tls_with_config, client_async_with_config, Connector, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{tls, Endpoint};
use crate::codec::JsonCodec;
use crate::config::ConnectionConfig;
use crate::correlation::PendingRequests;
use crate::error::{DaemonError, Result};
use crate::protocol::Message;
use crate::receiver::receive_loop;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Unconnected = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Unconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Lower-case name, used in errors and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// State shared with the background tasks.
struct Shared {
    state: AtomicU8,
    torn_down: AtomicBool,
    shutdown: CancellationToken,
    pending: PendingRequests,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// The single "cancel everything" event. Returns `false` if it already ran.
    fn teardown(&self, reason: &str) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();
        let failed = self.pending.fail_all(reason);
        tracing::info!(reason, failed, "connection torn down");
        true
    }
}

struct Tasks {
    writer: JoinHandle<Result<()>>,
    reader: JoinHandle<()>,
}

/// A duplex RPC channel to the routing daemon.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
    writer: OnceLock<WriterHandle>,
    tasks: Mutex<Option<Tasks>>,
}

impl Connection {
    /// Create an unconnected connection.
    pub fn new(config: ConnectionConfig) -> Self {
        let pending = PendingRequests::with_unsolicited_capacity(config.unsolicited_capacity);
        Self {
            config,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConnectionState::Unconnected as u8),
                torn_down: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                pending,
            }),
            writer: OnceLock::new(),
            tasks: Mutex::new(None),
        }
    }

    /// Dial `endpoint`: DNS, TCP, mutual TLS, then the WebSocket upgrade.
    ///
    /// # Errors
    ///
    /// - `Connection` if any step fails; the instance is then closed.
    /// - `Cancelled` if `cancel` fired before the handshake finished.
    /// - `InvalidState` if this instance was already connected once.
    pub async fn connect(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> Result<()> {
        self.begin_connect()?;
        tracing::info!(uri = endpoint.uri(), "connecting to daemon");

        let config = self.config.websocket_config();
        let handshake = async {
            let tls_config = tls::client_config(endpoint)
                .map_err(|e| DaemonError::Connection(format!("TLS setup failed: {}", e)))?;

            let tcp = TcpStream::connect((endpoint.host(), endpoint.port()))
                .await
                .map_err(|e| {
                    DaemonError::Connection(format!(
                        "cannot reach {}:{}: {}",
                        endpoint.host(),
                        endpoint.port(),
                        e
                    ))
                })?;
            tcp.set_nodelay(true)
                .map_err(|e| DaemonError::Connection(format!("socket setup failed: {}", e)))?;

            let connector = Connector::Rustls(Arc::new(tls_config));
            let (ws, _response) =
                client_async_tls_with_config(endpoint.uri(), tcp, Some(config), Some(connector))
                    .await
                    .map_err(|e| DaemonError::Connection(format!("handshake failed: {}", e)))?;
            Ok::<_, DaemonError>(ws)
        };

        let ws = self.finish_connect(handshake, cancel).await?;
        self.attach(ws);
        tracing::info!(uri = endpoint.uri(), "connected to daemon");
        Ok(())
    }

    /// Run the WebSocket handshake over an already established stream.
    ///
    /// For streams secured elsewhere (or in-process streams); `uri` only
    /// supplies the request target and `Host` header.
    pub async fn connect_over<S>(&self, stream: S, uri: &str, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.begin_connect()?;

        let config = self.config.websocket_config();
        let handshake = async {
            let (ws, _response) = client_async_with_config(uri, stream, Some(config))
                .await
                .map_err(|e| DaemonError::Connection(format!("handshake failed: {}", e)))?;
            Ok::<_, DaemonError>(ws)
        };

        let ws = self.finish_connect(handshake, cancel).await?;
        self.attach(ws);
        tracing::debug!(uri, "connected over provided stream");
        Ok(())
    }

    fn begin_connect(&self) -> Result<()> {
        if self
            .shared
            .transition(ConnectionState::Unconnected, ConnectionState::Connecting)
        {
            return Ok(());
        }
        Err(DaemonError::InvalidState {
            expected: ConnectionState::Unconnected.as_str(),
            actual: self.state().as_str(),
        })
    }

    async fn finish_connect<F, S>(&self, handshake: F, cancel: &CancellationToken) -> Result<WebSocketStream<S>>
    where
        F: std::future::Future<Output = Result<WebSocketStream<S>>>,
    {
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(DaemonError::Cancelled),
            _ = self.shared.shutdown.cancelled() => {
                Err(DaemonError::Connection("closed while connecting".to_string()))
            }
            result = handshake => result,
        };

        if let Err(e) = &outcome {
            tracing::warn!("Connect failed: {}", e);
            self.shared.teardown("connect failed");
            self.shared.set_closed();
        }
        outcome
    }

    /// Start the writer and the receive loop over an upgraded stream.
    fn attach<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (writer, writer_task) = spawn_writer_task(
            sink,
            self.config.writer_config(),
            self.shared.shutdown.clone(),
        );

        let shared = self.shared.clone();
        let reader_task = tokio::spawn(async move {
            let (exit, stats) =
                receive_loop(stream, shared.pending.clone(), shared.shutdown.clone()).await;
            if stats.malformed > 0 {
                tracing::warn!(malformed = stats.malformed, "malformed frames were dropped");
            }
            shared.teardown(&exit.reason());
            shared.set_closed();
        });

        // Only one attach can happen per instance; begin_connect guards it.
        let _ = self.writer.set(writer);
        *self.tasks.lock().unwrap_or_else(|p| p.into_inner()) = Some(Tasks {
            writer: writer_task,
            reader: reader_task,
        });

        if !self
            .shared
            .transition(ConnectionState::Connecting, ConnectionState::Open)
        {
            tracing::debug!(state = self.state().as_str(), "connection closed during attach");
        }
    }

    /// Queue one envelope on the single writer.
    ///
    /// Returns once the frame is queued; write failures surface as
    /// `ConnectionLost` on pending requests via teardown.
    pub async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        let writer = self.writer.get().ok_or(DaemonError::InvalidState {
            expected: ConnectionState::Open.as_str(),
            actual: self.state().as_str(),
        })?;
        if self.shared.shutdown.is_cancelled() {
            return Err(DaemonError::ConnectionLost("connection closed".to_string()));
        }

        let text = JsonCodec::encode(message)?;
        tracing::trace!(
            command = %message.command,
            destination = %message.destination,
            request_id = %message.request_id,
            "sending frame"
        );
        writer.send_text(text, cancel).await
    }

    /// Send `message` and wait for the reply carrying its `request_id`.
    ///
    /// The pending entry is registered before the frame is queued, so a fast
    /// reply cannot overtake it.
    pub async fn request(&self, message: &Message, cancel: &CancellationToken) -> Result<Message> {
        let slot = self.shared.pending.register(&message.request_id)?;
        // On failure the slot is dropped here, which removes its entry.
        self.send(message, cancel).await?;
        self.shared.pending.wait(slot, cancel).await
    }

    /// Close the connection. Idempotent.
    ///
    /// Pending requests fail with `ConnectionLost`. Waits for the writer to
    /// send the Close frame, unless `cancel` fires first.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let state = self.state();
        if matches!(state, ConnectionState::Closing | ConnectionState::Closed) {
            return Ok(());
        }
        if !self.shared.transition(state, ConnectionState::Closing) {
            // Raced with another close or with teardown.
            return Ok(());
        }

        self.shared.teardown("connection closed by client");

        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tasks) = tasks {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!("close cancelled before the writer finished");
                }
                _ = async {
                    if let Ok(Err(e)) = tasks.writer.await {
                        tracing::debug!("writer ended with error: {}", e);
                    }
                    let _ = tasks.reader.await;
                } => {}
            }
        }

        self.shared.set_closed();
        tracing::info!("connection closed");
        Ok(())
    }

    /// Subscribe to inbound messages that matched no pending request.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.shared.pending.subscribe()
    }

    /// The correlation engine of this connection.
    pub fn pending(&self) -> &PendingRequests {
        &self.shared.pending
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Whether teardown has happened (or is happening).
    pub fn is_closed(&self) -> bool {
        self.shared.torn_down.load(Ordering::Acquire)
    }

    /// Requests currently awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Frames queued on the writer.
    pub fn pending_frames(&self) -> usize {
        self.writer.get().map(WriterHandle::pending_count).unwrap_or(0)
    }

    /// Whether senders are currently waiting on a full writer queue.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer
            .get()
            .map(WriterHandle::is_backpressure_active)
            .unwrap_or(false)
    }

    /// Resolves once teardown has happened, whatever caused it.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.shared.teardown("connection dropped") {
            self.shared.set_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageFactory;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use crate::transport::testing::Authority;
    use crate::transport::Identity;
    use rustls::server::WebPkiClientVerifier;
    use rustls::{RootCertStore, ServerConfig};
    use tokio::net::TcpListener;
    use tokio_rustls::server::TlsStream;
    use tokio_rustls::TlsAcceptor;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type TlsDaemon = JoinHandle<Option<WebSocketStream<TlsStream<TcpStream>>>>;

    async fn open_pair() -> (Connection, WebSocketStream<DuplexStream>) {
        let (client_io, daemon_io) = duplex(64 * 1024);
        let connection = Connection::new(ConnectionConfig::default());
        let daemon = tokio::spawn(async move { accept_async(daemon_io).await.unwrap() });

        connection
            .connect_over(client_io, "ws://localhost/", &CancellationToken::new())
            .await
            .unwrap();
        (connection, daemon.await.unwrap())
    }

    fn ring() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    /// Daemon on a loopback port that demands a client certificate from `client_ca`.
    async fn tls_daemon(server_ca: &Authority, client_ca: &Authority) -> (u16, TlsDaemon) {
        let mut client_roots = RootCertStore::empty();
        client_roots.add(client_ca.root()).unwrap();
        let client_verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), ring())
            .build()
            .unwrap();

        let (cert, key) = server_ca.issue("daemon.internal");
        let config = ServerConfig::builder_with_provider(ring())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(vec![cert], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.ok()?;
            let tls = acceptor.accept(tcp).await.ok()?;
            accept_async(tls).await.ok()
        });
        (port, daemon)
    }

    fn endpoint(port: u16, identity_ca: &Authority, trusted: &Authority) -> Endpoint {
        let (cert, key) = identity_ca.issue("wallet_ui");
        Endpoint::new(
            &format!("wss://127.0.0.1:{}", port),
            Identity::new(vec![cert], key).unwrap(),
        )
        .unwrap()
        .with_root(trusted.root())
    }

    #[tokio::test]
    async fn test_connect_unreachable_endpoint() {
        let ca = Authority::new();
        let connection = Connection::new(ConnectionConfig::default());

        let result = connection
            .connect(&endpoint(1, &ca, &ca), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DaemonError::Connection(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_connect_mutual_tls() {
        let daemon_ca = Authority::new();
        let client_ca = Authority::new();
        let (port, daemon) = tls_daemon(&daemon_ca, &client_ca).await;

        let connection = Connection::new(ConnectionConfig::default());
        connection
            .connect(&endpoint(port, &client_ca, &daemon_ca), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);

        let mut daemon = daemon.await.unwrap().expect("daemon accepted the client");
        connection.close(&CancellationToken::new()).await.unwrap();
        assert!(daemon.next().await.unwrap().unwrap().is_close());
    }

    #[tokio::test]
    async fn test_connect_rejects_untrusted_daemon() {
        let rogue_ca = Authority::new();
        let trusted_ca = Authority::new();
        let client_ca = Authority::new();
        let (port, daemon) = tls_daemon(&rogue_ca, &client_ca).await;

        let connection = Connection::new(ConnectionConfig::default());
        let result = connection
            .connect(&endpoint(port, &client_ca, &trusted_ca), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DaemonError::Connection(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(daemon.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_daemon_rejects_unknown_client_identity() {
        let daemon_ca = Authority::new();
        let client_ca = Authority::new();
        let stranger_ca = Authority::new();
        let (port, daemon) = tls_daemon(&daemon_ca, &client_ca).await;

        let connection = Connection::new(ConnectionConfig::default());
        let result = connection
            .connect(&endpoint(port, &stranger_ca, &daemon_ca), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DaemonError::Connection(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(daemon.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_over_opens() {
        let (connection, _daemon) = open_pair().await;
        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(!connection.is_closed());
        assert!(!connection.is_backpressure_active());
        assert_eq!(connection.pending_frames(), 0);
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let (connection, _daemon) = open_pair().await;
        let (io, _other) = duplex(1024);

        let result = connection
            .connect_over(io, "ws://localhost/", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DaemonError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let connection = Connection::new(ConnectionConfig::default());
        let msg = MessageFactory::new("client").request("ping", None, "daemon");

        let result = connection.send(&msg, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(DaemonError::InvalidState { actual: "unconnected", .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_handshake_closes_instance() {
        let connection = Connection::new(ConnectionConfig::default());
        // Nobody answers the upgrade on the other end.
        let (io, _silent) = duplex(1024);
        let token = CancellationToken::new();
        token.cancel();

        let result = connection.connect_over(io, "ws://localhost/", &token).await;
        assert!(matches!(result, Err(DaemonError::Cancelled)));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_close_frame() {
        let (connection, mut daemon) = open_pair().await;
        let token = CancellationToken::new();

        connection.close(&token).await.unwrap();
        connection.close(&token).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);

        let frame = daemon.next().await.unwrap().unwrap();
        assert!(frame.is_close());

        let msg = MessageFactory::new("client").request("ping", None, "daemon");
        assert!(matches!(
            connection.request(&msg, &token).await,
            Err(DaemonError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_request() {
        let (connection, mut daemon) = open_pair().await;
        let msg = MessageFactory::new("client").request("get_height_info", None, "wallet");

        let daemon_task = tokio::spawn(async move {
            let _request = daemon.next().await.unwrap().unwrap();
            let _ = daemon.close(None).await;
        });

        let result = connection.request(&msg, &CancellationToken::new()).await;
        assert!(matches!(result, Err(DaemonError::ConnectionLost(_))));
        daemon_task.await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
        assert_eq!(connection.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (connection, mut daemon) = open_pair().await;
        let msg = MessageFactory::new("client").request("ping", None, "daemon");

        tokio::spawn(async move {
            let frame = daemon.next().await.unwrap().unwrap();
            let request = JsonCodec::decode(frame.to_text().unwrap()).unwrap();
            let reply = Message::reply(&request, Some(serde_json::json!({"success": true})));
            daemon
                .send(WsMessage::text(JsonCodec::encode(&reply).unwrap()))
                .await
                .unwrap();
            // Keep the socket open until the client is done.
            let _ = daemon.next().await;
        });

        let reply = connection
            .request(&msg, &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.ack);
        assert_eq!(reply.request_id, msg.request_id);
        assert_eq!(connection.pending_requests(), 0);
    }
}
