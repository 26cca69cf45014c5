use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    completion::{complete_with_deadline, compose_system_prompt, CompletionClient, CompletionOptions},
    config::{Config, DEFAULT_COMMAND_PREFIX},
    domain::{BotId, InboundMessage},
    errors::Error,
    lanes::{LaneTicket, SenderLanes},
    store::{BotConfig, ConfigStore, ContextStore},
    transport::{Transport, TransportConnection},
};

pub const PERMISSION_DENIED_TEXT: &str = "You do not have permission to use this command.";
pub const FALLBACK_TEXT: &str = "Sorry, I'm unable to answer right now. Please try again later.";

const RECV_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RECV_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Extra time beyond the grace period before a stuck session task is aborted.
const FORCE_STOP_MARGIN: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

/// Observable runtime status of one bot session. Never persisted.
#[derive(Clone, Debug, Serialize)]
pub struct SessionHandle {
    pub bot_id: BotId,
    pub state: SessionState,
    pub last_error: Option<String>,
    /// Set when the transport rejected the bot's credentials.
    pub auth_failed: bool,
    pub started_at: DateTime<Utc>,
}

impl SessionHandle {
    pub(crate) fn starting(bot_id: BotId) -> Self {
        Self {
            bot_id,
            state: SessionState::Starting,
            last_error: None,
            auth_failed: false,
            started_at: Utc::now(),
        }
    }

    pub(crate) fn record_failure(&mut self, err: &Error) {
        self.state = SessionState::Errored;
        self.last_error = Some(err.to_string());
        self.auth_failed = err.is_auth();
    }

    /// Errored for a reason other than rejected credentials; the fleet starts
    /// such sessions again on the next reload.
    pub fn is_retryable(&self) -> bool {
        self.state == SessionState::Errored && !self.auth_failed
    }
}

/// Collaborators shared by every session in the fleet.
#[derive(Clone)]
pub struct SessionDeps {
    pub config_store: Arc<dyn ConfigStore>,
    pub context_store: Arc<dyn ContextStore>,
    pub completion: Arc<dyn CompletionClient>,
    pub transport: Arc<dyn Transport>,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub command_prefix: String,
    pub completion: CompletionOptions,
    pub completion_deadline: Duration,
    pub connect_timeout: Duration,
    pub stop_grace_period: Duration,
}

impl SessionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            command_prefix: cfg.admin_command_prefix.clone(),
            completion: CompletionOptions {
                max_output_tokens: cfg.completion_max_tokens,
                temperature: cfg.completion_temperature,
            },
            completion_deadline: cfg.completion_timeout,
            connect_timeout: cfg.connect_timeout,
            stop_grace_period: cfg.stop_grace_period,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            completion: CompletionOptions::default(),
            completion_deadline: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

/// Whether `text` is a privileged command under `prefix`.
pub fn is_privileged_command(text: &str, prefix: &str) -> bool {
    !prefix.is_empty() && text.trim_start().starts_with(prefix)
}

/// One bot's running message loop.
///
/// `Starting -> Running -> Stopping -> Stopped`, or `Errored` when the
/// transport rejects the bot. Failures never leave the session.
pub struct BotSession {
    bot_id: BotId,
    status: Arc<Mutex<SessionHandle>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    grace: Duration,
}

impl BotSession {
    /// Connect the transport and spawn the receive loop.
    ///
    /// Always returns a session; a failed connect leaves it `Errored` with the
    /// reason in `last_error` and no task running.
    pub async fn start(
        bot_id: BotId,
        token: &str,
        deps: SessionDeps,
        settings: Arc<SessionSettings>,
    ) -> Self {
        let status = Arc::new(Mutex::new(SessionHandle::starting(bot_id.clone())));
        let cancel = CancellationToken::new();
        let grace = settings.stop_grace_period;

        info!(bot_id = %bot_id, "starting bot session");
        let connected =
            match tokio::time::timeout(settings.connect_timeout, deps.transport.connect(token))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(Error::Transport(format!(
                    "connect timed out after {}ms",
                    settings.connect_timeout.as_millis()
                ))),
            };

        let conn = match connected {
            Ok(c) => c,
            Err(e) => {
                error!(bot_id = %bot_id, error = %e, "bot session failed to start");
                status.lock().await.record_failure(&e);
                return Self {
                    bot_id,
                    status,
                    cancel,
                    task: None,
                    grace,
                };
            }
        };

        if let Err(e) = deps.context_store.load_or_init(&bot_id).await {
            warn!(bot_id = %bot_id, error = %e, "could not initialize context");
        }

        {
            let mut st = status.lock().await;
            st.state = SessionState::Running;
            st.started_at = Utc::now();
        }
        info!(bot_id = %bot_id, "bot session running");

        let runner = SessionRunner {
            ctx: MessageContext {
                bot_id: bot_id.clone(),
                deps,
                settings,
                conn,
            },
            status: status.clone(),
            cancel: cancel.clone(),
            grace,
        };
        let task = tokio::spawn(runner.run());

        Self {
            bot_id,
            status,
            cancel,
            task: Some(task),
            grace,
        }
    }

    pub fn bot_id(&self) -> &BotId {
        &self.bot_id
    }

    pub async fn snapshot(&self) -> SessionHandle {
        self.status.lock().await.clone()
    }

    /// Stop receiving, let in-flight messages finish within the grace period,
    /// then force. Never fails and never waits much past the grace period.
    pub async fn stop(mut self) -> SessionHandle {
        self.cancel.cancel();

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.grace + FORCE_STOP_MARGIN, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(bot_id = %self.bot_id, error = %e, "session task failed"),
                Err(_) => {
                    warn!(bot_id = %self.bot_id, "session did not stop in time; aborting");
                    task.abort();
                }
            }
        }

        let mut st = self.status.lock().await;
        st.state = SessionState::Stopped;
        info!(bot_id = %self.bot_id, "bot session stopped");
        st.clone()
    }
}

impl Drop for BotSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionRunner {
    ctx: MessageContext,
    status: Arc<Mutex<SessionHandle>>,
    cancel: CancellationToken,
    grace: Duration,
}

impl SessionRunner {
    async fn run(self) {
        let bot_id = self.ctx.bot_id.clone();
        let mut handlers = JoinSet::new();
        let mut lanes = SenderLanes::default();
        let mut backoff = RECV_BACKOFF_INITIAL;

        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                next = self.ctx.conn.recv() => next,
            };

            match next {
                Ok(Some(msg)) => {
                    backoff = RECV_BACKOFF_INITIAL;
                    reap(&mut handlers, &bot_id);
                    let ticket = lanes.enqueue(&msg.sender);
                    handlers.spawn(self.ctx.clone().handle(ticket, msg));
                }
                Ok(None) => {
                    break Some(Error::Transport("transport connection closed".to_string()))
                }
                Err(e) if e.is_auth() => break Some(e),
                Err(e) => {
                    warn!(bot_id = %bot_id, error = %e, retry_in_ms = backoff.as_millis() as u64, "receive failed");
                    let cancelled = tokio::select! {
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(backoff) => false,
                    };
                    if cancelled {
                        break None;
                    }
                    backoff = (backoff * 2).min(RECV_BACKOFF_MAX);
                }
            }
        };

        if failure.is_none() {
            self.status.lock().await.state = SessionState::Stopping;
        }
        self.ctx.conn.close().await;
        drain(&mut handlers, self.grace, &bot_id).await;

        let mut st = self.status.lock().await;
        match failure {
            Some(err) => {
                error!(bot_id = %bot_id, error = %err, "bot session errored");
                st.record_failure(&err);
            }
            None => st.state = SessionState::Stopped,
        }
    }
}

fn reap(handlers: &mut JoinSet<()>, bot_id: &BotId) {
    while let Some(res) = handlers.try_join_next() {
        if let Err(e) = res {
            error!(bot_id = %bot_id, error = %e, "message handler panicked");
        }
    }
}

/// Wait for in-flight handlers up to `grace`, then abort the rest.
/// Aborted handlers never deliver their reply.
async fn drain(handlers: &mut JoinSet<()>, grace: Duration, bot_id: &BotId) {
    let finished = tokio::time::timeout(grace, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(bot_id = %bot_id, pending = handlers.len(), "grace period elapsed; abandoning in-flight messages");
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
    }
}

/// Everything a message handler needs; cloned into each handler task.
#[derive(Clone)]
struct MessageContext {
    bot_id: BotId,
    deps: SessionDeps,
    settings: Arc<SessionSettings>,
    conn: Arc<dyn TransportConnection>,
}

impl MessageContext {
    async fn handle(self, ticket: LaneTicket, msg: InboundMessage) {
        let _lane = ticket.acquire().await;
        let reply = self.reply_for(&msg).await;
        if let Err(e) = self.conn.send_text(msg.chat_id, &reply).await {
            warn!(bot_id = %self.bot_id, sender = %msg.sender, error = %e, "failed to send reply");
        }
    }

    async fn reply_for(&self, msg: &InboundMessage) -> String {
        // Fresh read every message; a missing record behaves as no policy and
        // no operators until the fleet stops this session.
        let record = match self.deps.config_store.get(&self.bot_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(bot_id = %self.bot_id, error = %e, "bot config read failed");
                None
            }
        };

        if is_privileged_command(&msg.text, &self.settings.command_prefix)
            && !record
                .as_ref()
                .is_some_and(|r| r.is_operator(&msg.sender.0))
        {
            info!(bot_id = %self.bot_id, sender = %msg.sender, "privileged command denied");
            return PERMISSION_DENIED_TEXT.to_string();
        }

        let context = match self.deps.context_store.load_or_init(&self.bot_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(bot_id = %self.bot_id, error = %e, "context read failed; answering without it");
                String::new()
            }
        };

        let policy = record.as_ref().map(|r: &BotConfig| r.system_policy.as_str());
        let system = compose_system_prompt(policy.unwrap_or(""), &context);

        match complete_with_deadline(
            self.deps.completion.as_ref(),
            &system,
            &msg.text,
            self.settings.completion,
            self.settings.completion_deadline,
        )
        .await
        {
            Ok(reply) => {
                debug!(bot_id = %self.bot_id, sender = %msg.sender, "completion ok");
                reply
            }
            Err(e) => {
                warn!(bot_id = %self.bot_id, sender = %msg.sender, error = %e, "completion failed");
                FALLBACK_TEXT.to_string()
            }
        }
    }
}
