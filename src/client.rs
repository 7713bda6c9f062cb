//! Routing client on top of a [`Connection`].
//!
//! The [`ClientBuilder`] provides a fluent API for configuring the client's
//! identity and transport. The [`DaemonClient`] manages the lifecycle:
//! 1. Connect to the daemon
//! 2. Register this identity as a routing destination
//! 3. Send requests stamped with `origin` and `destination`
//! 4. Close
//!
//! # Example
//!
//! ```ignore
//! use daemon_client::{DaemonClient, Endpoint};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(endpoint: Endpoint) -> daemon_client::Result<()> {
//!     let token = CancellationToken::new();
//!     let client = DaemonClient::builder()
//!         .endpoint(endpoint)
//!         .origin("wallet_ui")
//!         .build();
//!
//!     client.connect(&token).await?;
//!     client.register("wallet_ui", &token).await?;
//!     let height = client.send_request("get_height_info", None, "wallet", &token).await?;
//!     println!("{:?}", height.data);
//!
//!     client.close(&token).await
//! }
//! ```

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ConnectionConfig};
use crate::error::{DaemonError, Result};
use crate::protocol::{Message, MessageFactory, DAEMON_SERVICE, PING, REGISTER_SERVICE};
use crate::transport::{Connection, Endpoint};

/// Lifecycle of the routing client.
///
/// Only `Registered` guarantees that requests addressed to this identity are
/// routed here; `Connected` only lets this side initiate requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unregistered,
    Connected,
    Registered,
    Closed,
}

/// Builder for configuring and creating a [`DaemonClient`].
pub struct ClientBuilder {
    endpoint: Option<Endpoint>,
    origin: String,
    connection: ConnectionConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::from_config(ClientConfig::default())
    }

    /// Seed a builder from a deserialized [`ClientConfig`].
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            endpoint: None,
            origin: config.origin,
            connection: config.connection,
        }
    }

    /// Set the daemon to dial in [`DaemonClient::connect`].
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Set the identity stamped as `origin` on every request.
    ///
    /// Default: `"client"`
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Set the largest accepted message, after frame reassembly.
    ///
    /// Default: 50 MiB
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.connection.max_message_size = bytes;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.connection.channel_capacity = capacity;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// When this limit is reached, senders wait until the writer catches up
    /// or the backpressure timeout expires.
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.connection.max_pending_frames = limit;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.connection.backpressure_timeout = timeout;
        self
    }

    /// Set the buffer of the unsolicited message channel.
    ///
    /// Slow subscribers miss the oldest messages beyond this.
    /// Default: 256
    pub fn unsolicited_capacity(mut self, capacity: usize) -> Self {
        self.connection.unsolicited_capacity = capacity;
        self
    }

    /// Build an unconnected client.
    pub fn build(self) -> DaemonClient {
        DaemonClient {
            endpoint: self.endpoint,
            factory: MessageFactory::new(self.origin),
            connection: Connection::new(self.connection),
            registration: Mutex::new(Registration {
                connected: false,
                services: HashSet::new(),
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Registration {
    connected: bool,
    services: HashSet<String>,
}

/// Client that talks to backend services through the routing daemon.
///
/// All methods take `&self`; share the client behind an `Arc` to issue
/// requests from several tasks at once.
pub struct DaemonClient {
    endpoint: Option<Endpoint>,
    factory: MessageFactory,
    connection: Connection,
    registration: Mutex<Registration>,
}

impl DaemonClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to the configured endpoint.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| DaemonError::Connection("no endpoint configured".to_string()))?;
        self.connection.connect(endpoint, cancel).await?;
        self.mark_connected();
        Ok(())
    }

    /// Connect over an already established stream.
    ///
    /// See [`Connection::connect_over`].
    pub async fn connect_over<S>(&self, stream: S, uri: &str, cancel: &CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.connection.connect_over(stream, uri, cancel).await?;
        self.mark_connected();
        Ok(())
    }

    fn mark_connected(&self) {
        self.lock_registration().connected = true;
        tracing::debug!(origin = self.factory.origin(), "client connected");
    }

    /// Send `command` to `destination` and wait for its reply.
    ///
    /// # Errors
    ///
    /// - `Remote` if the reply carries a non-empty `error`.
    /// - `ConnectionLost` if the connection dies first.
    /// - `Cancelled` if `cancel` fires first.
    pub async fn send_request(
        &self,
        command: &str,
        data: Option<Value>,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let request = self.factory.request(command, data, destination);
        let reply = self.connection.request(&request, cancel).await?;

        if let Some(message) = reply.remote_error() {
            return Err(DaemonError::Remote {
                command: command.to_string(),
                message: message.to_string(),
            });
        }
        Ok(reply)
    }

    /// Announce this identity to the daemon as `service_name`.
    ///
    /// Idempotent per connection: a name that is already registered returns
    /// immediately without another round trip.
    pub async fn register(&self, service_name: &str, cancel: &CancellationToken) -> Result<()> {
        if self.lock_registration().services.contains(service_name) {
            tracing::debug!(service = service_name, "already registered");
            return Ok(());
        }

        self.send_request(
            REGISTER_SERVICE,
            Some(json!({ "service": service_name })),
            DAEMON_SERVICE,
            cancel,
        )
        .await?;

        self.lock_registration()
            .services
            .insert(service_name.to_string());
        tracing::info!(service = service_name, "registered with daemon");
        Ok(())
    }

    /// Liveness check against the daemon.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<Message> {
        self.send_request(PING, None, DAEMON_SERVICE, cancel).await
    }

    /// Send a request whose reply nobody waits for.
    ///
    /// The request still occupies a pending entry; a background task takes
    /// the reply (or the connection failure) and drops it. Returns the
    /// request id.
    pub async fn send_and_forget(
        &self,
        command: &str,
        data: Option<Value>,
        destination: &str,
    ) -> Result<String> {
        let request = self.factory.request(command, data, destination);
        let pending = self.connection.pending().clone();
        let slot = pending.register(&request.request_id)?;

        self.connection
            .send(&request, &CancellationToken::new())
            .await?;

        let command = request.command.clone();
        tokio::spawn(async move {
            // Teardown resolves the slot, so this wait always ends.
            match pending.wait(slot, &CancellationToken::new()).await {
                Ok(reply) => {
                    if let Some(error) = reply.remote_error() {
                        tracing::debug!(command = %command, error, "discarded failed reply");
                    }
                }
                Err(e) => tracing::trace!(command = %command, "discarded outcome: {}", e),
            }
        });

        Ok(request.request_id)
    }

    /// Subscribe to inbound messages that matched no pending request.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.connection.subscribe()
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.connection.close(cancel).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        if self.connection.is_closed() {
            return ClientState::Closed;
        }
        let registration = self.lock_registration();
        if !registration.services.is_empty() {
            ClientState::Registered
        } else if registration.connected {
            ClientState::Connected
        } else {
            ClientState::Unregistered
        }
    }

    /// Identity stamped as `origin`.
    pub fn origin(&self) -> &str {
        self.factory.origin()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn lock_registration(&self) -> std::sync::MutexGuard<'_, Registration> {
        self.registration.lock().unwrap_or_else(|p| p.into_inner())
    }
}
