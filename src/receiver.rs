//! The single reader of a connection.
//!
//! One task per open connection pulls WebSocket messages, decodes each into a
//! [`Message`] and hands it to the correlation engine. The WebSocket layer
//! reassembles continuation frames into whole messages (bounded by the
//! configured maximum message size), so every text or binary message seen here
//! carries exactly one envelope.
//!
//! A frame that fails to decode is logged and skipped; only a transport-level
//! close or error ends the loop.

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::codec::JsonCodec;
use crate::correlation::PendingRequests;
use crate::error::Result;
use crate::protocol::Message;

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The connection's shutdown token fired.
    Shutdown,
    /// The peer sent a Close frame or the stream ended.
    PeerClosed(String),
    /// The transport reported a fatal read error.
    Failed(String),
}

impl LoopExit {
    /// Reason text handed to callers still waiting on a reply.
    pub fn reason(&self) -> String {
        match self {
            LoopExit::Shutdown => "connection closed".to_string(),
            LoopExit::PeerClosed(detail) => format!("peer closed the connection: {}", detail),
            LoopExit::Failed(detail) => format!("read failed: {}", detail),
        }
    }
}

/// Counters for one run of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    /// Envelopes decoded and handed to the correlation engine.
    pub delivered: u64,
    /// Frames dropped because they did not decode.
    pub malformed: u64,
}

/// Read until shutdown, peer close or a fatal error.
///
/// The caller is responsible for running teardown (and with it
/// [`PendingRequests::fail_all`]) once this returns.
pub async fn receive_loop<R>(
    mut stream: R,
    pending: PendingRequests,
    shutdown: CancellationToken,
) -> (LoopExit, LoopStats)
where
    R: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    let mut stats = LoopStats::default();

    let exit = loop {
        let next = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break LoopExit::Shutdown,
            next = stream.next() => next,
        };

        let frame = match next {
            None => break LoopExit::PeerClosed("stream ended".to_string()),
            Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                break LoopExit::PeerClosed("connection closed".to_string())
            }
            Some(Err(e)) => break LoopExit::Failed(e.to_string()),
            Some(Ok(frame)) => frame,
        };

        let decoded = match frame {
            WsMessage::Text(text) => decode(JsonCodec::decode(text.as_str())),
            WsMessage::Binary(bytes) => decode(JsonCodec::decode_bytes(&bytes)),
            WsMessage::Close(close) => {
                let detail = close
                    .map(|c| format!("{} {}", u16::from(c.code), c.reason.as_str()))
                    .unwrap_or_else(|| "no close frame".to_string());
                break LoopExit::PeerClosed(detail);
            }
            // Control frames are answered by the WebSocket layer.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        match decoded {
            Some(message) => {
                stats.delivered += 1;
                pending.resolve(message);
            }
            None => stats.malformed += 1,
        }
    };

    match &exit {
        LoopExit::Failed(_) => tracing::error!(reason = %exit.reason(), "receive loop failed"),
        _ => tracing::debug!(reason = %exit.reason(), delivered = stats.delivered, "receive loop ended"),
    }
    (exit, stats)
}

fn decode(result: Result<Message>) -> Option<Message> {
    match result {
        Ok(message) => {
            tracing::trace!(
                command = %message.command,
                request_id = %message.request_id,
                ack = message.ack,
                "frame received"
            );
            Some(message)
        }
        Err(e) => {
            tracing::warn!("Dropping malformed frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageFactory;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    type Frames = Vec<std::result::Result<WsMessage, WsError>>;

    fn reply_text(request: &Message) -> WsMessage {
        let reply = Message::reply(request, Some(serde_json::json!({})));
        WsMessage::text(JsonCodec::encode(&reply).unwrap())
    }

    #[tokio::test]
    async fn test_delivers_replies_and_skips_malformed() {
        let pending = PendingRequests::new();
        let factory = MessageFactory::new("client");
        let first = factory.request("ping", None, "daemon");
        let second = factory.request("ping", None, "daemon");
        let slot_a = pending.register(&first.request_id).unwrap();
        let slot_b = pending.register(&second.request_id).unwrap();

        let frames: Frames = vec![
            Ok(WsMessage::text("{garbage")),
            Ok(reply_text(&second)),
            Ok(WsMessage::Ping(Vec::new().into())),
            Ok(WsMessage::text(r#"{"command":"x","request_id":"r","data":7}"#)),
            Ok(reply_text(&first)),
        ];

        let (exit, stats) = receive_loop(
            stream::iter(frames),
            pending.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, LoopExit::PeerClosed("stream ended".to_string()));
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.malformed, 2);

        let token = CancellationToken::new();
        assert_eq!(
            pending.wait(slot_a, &token).await.unwrap().request_id,
            first.request_id
        );
        assert_eq!(
            pending.wait(slot_b, &token).await.unwrap().request_id,
            second.request_id
        );
    }

    #[tokio::test]
    async fn test_binary_frames_are_decoded() {
        let pending = PendingRequests::new();
        let request = MessageFactory::new("client").request("ping", None, "daemon");
        let slot = pending.register(&request.request_id).unwrap();

        let reply = Message::reply(&request, None);
        let bytes = serde_json::to_vec(&reply).unwrap();
        let frames: Frames = vec![Ok(WsMessage::binary(bytes))];

        let (_, stats) = receive_loop(stream::iter(frames), pending.clone(), CancellationToken::new()).await;
        assert_eq!(stats.delivered, 1);
        assert!(pending.wait(slot, &CancellationToken::new()).await.unwrap().ack);
    }

    #[tokio::test]
    async fn test_close_frame_stops_loop() {
        let pending = PendingRequests::new();
        let frames: Frames = vec![
            Ok(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "daemon exiting".into(),
            }))),
            Ok(WsMessage::text("never read")),
        ];

        let (exit, stats) = receive_loop(stream::iter(frames), pending, CancellationToken::new()).await;
        assert_eq!(exit, LoopExit::PeerClosed("1001 daemon exiting".to_string()));
        assert_eq!(stats, LoopStats::default());
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let pending = PendingRequests::new();
        let frames: Frames = vec![Err(WsError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )))];

        let (exit, _) = receive_loop(stream::iter(frames), pending, CancellationToken::new()).await;
        assert!(matches!(exit, LoopExit::Failed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_loop() {
        let pending = PendingRequests::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let (exit, _) = receive_loop(stream::pending(), pending.clone(), shutdown).await;
        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(exit.reason(), "connection closed");
    }
}
