//! Telegram adapter (teloxide).
//!
//! Implements the core `Transport` over the Telegram Bot API with long
//! polling: one `Bot` per fleet token, `getMe` as the credential check, and
//! `deleteWebhook(drop_pending_updates)` so a restart never replays old
//! messages.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    requests::Request,
    types::{AllowedUpdate, UpdateKind},
    ApiError, RequestError,
};
use tokio::{sync::Mutex, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use botfleet_core::{
    domain::{ChatId, InboundMessage, SenderId},
    errors::Error,
    transport::{Transport, TransportConnection},
    Result,
};

mod text;

pub use text::split_message;

/// The default teloxide HTTP client times out at 17s; polls must finish first.
const MAX_POLL_TIMEOUT_SECS: u64 = 15;
/// Telegram's hard limit is 4096; leave room for entity expansion.
const SAFE_MESSAGE_LEN: usize = 4000;

#[derive(Clone, Debug)]
pub struct TelegramTransport {
    poll_timeout_secs: u32,
}

impl TelegramTransport {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            poll_timeout_secs: clamp_poll_timeout(poll_timeout),
        }
    }
}

fn clamp_poll_timeout(d: Duration) -> u32 {
    d.as_secs().min(MAX_POLL_TIMEOUT_SECS) as u32
}

fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => {
            Error::TransportAuth("telegram rejected the bot token".to_string())
        }
        other => Error::Transport(format!("telegram error: {other}")),
    }
}

async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
    Fut::IntoFuture: Send,
{
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                attempts += 1;
                sleep(d).await;
            }
            Err(other) => return Err(map_err(other)),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn connect(&self, token: &str) -> Result<Arc<dyn TransportConnection>> {
        let bot = Bot::new(token);

        let me = bot.get_me().await.map_err(map_err)?;
        info!(username = %me.username(), "telegram bot authenticated");

        bot.delete_webhook()
            .drop_pending_updates(true)
            .await
            .map_err(map_err)?;

        Ok(Arc::new(TelegramConnection::new(bot, self.poll_timeout_secs)))
    }
}

struct PollState {
    offset: i32,
    buffer: VecDeque<InboundMessage>,
}

/// Long-polling connection for one bot.
pub struct TelegramConnection {
    bot: Bot,
    poll_timeout_secs: u32,
    state: Mutex<PollState>,
    closed: CancellationToken,
}

impl TelegramConnection {
    fn new(bot: Bot, poll_timeout_secs: u32) -> Self {
        Self {
            bot,
            poll_timeout_secs,
            state: Mutex::new(PollState {
                offset: 0,
                buffer: VecDeque::new(),
            }),
            closed: CancellationToken::new(),
        }
    }
}

fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let user = msg.from()?;
    let text = msg.text()?;
    if text.trim().is_empty() {
        return None;
    }
    Some(InboundMessage {
        chat_id: ChatId(msg.chat.id.0),
        sender: SenderId(user.id.0.to_string()),
        username: user.username.clone(),
        text: text.to_string(),
    })
}

#[async_trait]
impl TransportConnection for TelegramConnection {
    async fn recv(&self) -> Result<Option<InboundMessage>> {
        let mut st = self.state.lock().await;
        loop {
            if let Some(msg) = st.buffer.pop_front() {
                return Ok(Some(msg));
            }
            if self.closed.is_cancelled() {
                return Ok(None);
            }

            let req = self
                .bot
                .get_updates()
                .offset(st.offset)
                .timeout(self.poll_timeout_secs)
                .allowed_updates(vec![AllowedUpdate::Message]);

            // The offset only advances after a response, so a dropped poll
            // re-fetches the same updates next time.
            let updates = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                res = req.send() => res.map_err(map_err)?,
            };

            for update in updates {
                st.offset = st.offset.max(update.id + 1);
                match update.kind {
                    UpdateKind::Message(msg) => match to_inbound(&msg) {
                        Some(inbound) => st.buffer.push_back(inbound),
                        None => debug!(chat_id = msg.chat.id.0, "ignoring non-text message"),
                    },
                    _ => debug!(update_id = update.id, "ignoring non-message update"),
                }
            }
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let tg_chat = teloxide::types::ChatId(chat_id.0);
        for chunk in split_message(text, SAFE_MESSAGE_LEN) {
            with_retry(|| self.bot.send_message(tg_chat, chunk.clone())).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_maps_to_auth_error() {
        let err = map_err(RequestError::Api(ApiError::NotFound));
        assert!(err.is_auth());
    }

    #[test]
    fn other_api_errors_are_transient() {
        let err = map_err(RequestError::Api(ApiError::BotBlocked));
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn poll_timeout_is_capped_below_client_timeout() {
        assert_eq!(clamp_poll_timeout(Duration::from_secs(10)), 10);
        assert_eq!(clamp_poll_timeout(Duration::from_secs(60)), 15);
        assert_eq!(clamp_poll_timeout(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn closed_connection_stops_receiving() {
        let conn = TelegramConnection::new(Bot::new("0:test"), 1);
        conn.close().await;
        assert!(conn.recv().await.unwrap().is_none());
    }
}
