//! Codec module - serialization/deserialization for envelopes.
//!
//! - [`JsonCodec`] - JSON text, one envelope per WebSocket message
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! Every failure is reported as [`DaemonError::Protocol`](crate::DaemonError::Protocol).

mod json;

pub use json::JsonCodec;
