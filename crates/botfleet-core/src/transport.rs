//! Messaging transport port.
//!
//! Telegram is the only implementation today; the shape only asks for what a
//! session needs: connect with a token, receive text, reply, stop.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, InboundMessage},
    Result,
};

/// Factory for per-bot transport connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Verify `token` and begin receiving.
    ///
    /// Updates buffered by the platform before this call are discarded, so a
    /// restarted bot never replays stale messages. Rejected credentials must be
    /// reported as `Error::TransportAuth`.
    async fn connect(&self, token: &str) -> Result<Arc<dyn TransportConnection>>;
}

/// One live connection for one bot token.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Wait for the next inbound text message.
    ///
    /// `Ok(None)` means the connection was closed. The future is cancel-safe:
    /// dropping it must not lose already-received messages.
    async fn recv(&self) -> Result<Option<InboundMessage>>;

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()>;

    /// Stop receiving. Idempotent.
    async fn close(&self);
}
