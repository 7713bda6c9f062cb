//! Transport module - the secured connection to the routing daemon.
//!
//! Provides:
//! - [`Endpoint`] / [`Identity`]: where to connect and which credential to present
//! - [`PeerVerification`]: how strictly the daemon's certificate is checked
//! - [`Connection`]: the WebSocket channel, its writer and its receive loop

mod connection;
mod endpoint;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connection, ConnectionState};
pub use endpoint::{Endpoint, Identity, DEFAULT_WSS_PORT};
pub use tls::PeerVerification;
