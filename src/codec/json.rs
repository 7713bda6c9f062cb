//! JSON codec for [`Message`] envelopes.
//!
//! Decoding is all-or-nothing: either every required field is present and the
//! shape checks pass, or a [`DaemonError::Protocol`] comes back. A partially
//! populated `Message` is never returned.
//!
//! # Example
//!
//! ```
//! use daemon_client::codec::JsonCodec;
//! use daemon_client::protocol::MessageFactory;
//!
//! let msg = MessageFactory::new("wallet_ui").request("ping", None, "daemon");
//! let text = JsonCodec::encode(&msg).unwrap();
//! let decoded = JsonCodec::decode(&text).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::{DaemonError, Result};
use crate::protocol::Message;

/// JSON codec for wire envelopes.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode an envelope to its wire text.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the envelope violates the wire shape.
    #[inline]
    pub fn encode(message: &Message) -> Result<String> {
        message.validate()?;
        serde_json::to_string(message)
            .map_err(|e| DaemonError::Protocol(format!("encode failed: {}", e)))
    }

    /// Decode wire text into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on malformed JSON, a missing required field or a
    /// payload that is not an object.
    pub fn decode(text: &str) -> Result<Message> {
        let message: Message = serde_json::from_str(text)
            .map_err(|e| DaemonError::Protocol(format!("decode failed: {}", e)))?;
        message.validate()?;
        Ok(message)
    }

    /// Decode a binary frame carrying UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Message> {
        let message: Message = serde_json::from_slice(bytes)
            .map_err(|e| DaemonError::Protocol(format!("decode failed: {}", e)))?;
        message.validate()?;
        Ok(message)
    }
}
