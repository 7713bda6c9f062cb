//! Protocol module - the wire envelope and routing vocabulary.

mod message;

pub use message::{new_request_id, Message, MessageFactory, DAEMON_SERVICE, PING, REGISTER_SERVICE};
