//! # daemon-client
//!
//! Client-side transport and correlation layer for a central routing daemon.
//!
//! A process connects once over mutually authenticated TLS (WebSocket on top),
//! registers its service identity, and then exchanges JSON envelopes with any
//! backend service the daemon relays to. Replies are matched to callers by
//! `request_id` alone, so any number of tasks can share one connection and
//! replies may arrive in any order.
//!
//! ## Architecture
//!
//! - **Envelope** ([`Message`]): one JSON object per WebSocket message
//! - **Transport** ([`Connection`]): mutual TLS, single writer task, single reader task
//! - **Correlation** ([`correlation::PendingRequests`]): `request_id` to waiting caller
//! - **Routing** ([`DaemonClient`]): origin/destination stamping, registration
//!
//! ## Example
//!
//! ```ignore
//! use daemon_client::{DaemonClient, Endpoint, Identity};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> daemon_client::Result<()> {
//!     let endpoint = Endpoint::new("wss://localhost:55400", load_identity()?)?
//!         .with_root(load_daemon_ca()?);
//!     let client = DaemonClient::builder()
//!         .endpoint(endpoint)
//!         .origin("wallet_ui")
//!         .build();
//!
//!     let token = CancellationToken::new();
//!     client.connect(&token).await?;
//!     client.register("wallet_ui", &token).await?;
//!     client.ping(&token).await?;
//!     client.close(&token).await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod transport;

mod client;
mod writer;

pub use client::{ClientBuilder, ClientState, DaemonClient};
pub use config::{ClientConfig, ConnectionConfig};
pub use error::{DaemonError, Result};
pub use protocol::{Message, MessageFactory};
pub use transport::{Connection, ConnectionState, Endpoint, Identity, PeerVerification};
pub use writer::WriterConfig;
