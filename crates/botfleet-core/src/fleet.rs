//! Fleet manager: keeps one session per runnable bot record.
//!
//! - `start` launches every enabled bot with a token that is not running yet
//! - `reload` diffs the store against the running table (idempotent)
//! - `stop` / `stop_all` always succeed and are bounded by the grace period
//! - an optional watcher calls `reload` periodically
//!
//! A bot is listed in `status()` from the moment its start begins until its
//! stop has finished, so `Starting` and `Stopping` are observable.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    domain::BotId,
    session::{BotSession, SessionDeps, SessionHandle, SessionSettings, SessionState},
    Result,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub started: usize,
    pub stopped: usize,
    pub restarted: usize,
    /// Errored sessions started again after a non-auth failure.
    pub retried: usize,
    pub unchanged: usize,
}

impl ReloadSummary {
    pub fn is_noop(&self) -> bool {
        self.started == 0 && self.stopped == 0 && self.restarted == 0 && self.retried == 0
    }
}

#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    deps: SessionDeps,
    settings: Arc<SessionSettings>,
    sessions: Mutex<HashMap<BotId, FleetEntry>>,
    /// Serializes start/reload/restart/stop so their diffs never interleave.
    ops: Mutex<()>,
    watcher: Mutex<Option<Watcher>>,
}

struct FleetEntry {
    /// Token the session was started with; a different token means restart.
    token: String,
    slot: Slot,
}

enum Slot {
    /// Connect or stop in progress, or a start task that died; the handle is
    /// the status to report.
    Pending(SessionHandle),
    Live(BotSession),
}

impl FleetEntry {
    async fn snapshot(&self) -> SessionHandle {
        match &self.slot {
            Slot::Pending(handle) => handle.clone(),
            Slot::Live(session) => session.snapshot().await,
        }
    }
}

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FleetManager {
    pub fn new(deps: SessionDeps, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(FleetInner {
                deps,
                settings: Arc::new(settings),
                sessions: Mutex::new(HashMap::new()),
                ops: Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Start a session for every runnable record that has none yet.
    ///
    /// Returns how many sessions reached `Running`. Per-bot failures are
    /// logged and left visible in `status()`; only an unreadable store fails
    /// the call.
    pub async fn start(&self) -> Result<usize> {
        let _op = self.inner.ops.lock().await;

        let desired = self.desired().await?;
        let batch: Vec<_> = {
            let sessions = self.inner.sessions.lock().await;
            desired
                .into_iter()
                .filter(|(id, _)| !sessions.contains_key(id))
                .collect()
        };

        info!(count = batch.len(), "starting bot sessions");
        Ok(self.launch(batch).await)
    }

    /// Re-read the store and converge the running table onto it.
    ///
    /// Sessions that errored for a non-auth reason (unreachable transport,
    /// connect timeout, dropped connection) are started again. A session
    /// whose credentials were rejected is left as it is until its token
    /// changes or [`FleetManager::restart`] is called.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let _op = self.inner.ops.lock().await;

        let desired = self.desired().await?;
        let mut summary = ReloadSummary::default();

        let (retire, batch) = {
            let sessions = self.inner.sessions.lock().await;
            let mut retire = Vec::new();

            for (id, entry) in sessions.iter() {
                let retryable = entry.snapshot().await.is_retryable();
                let replace = match desired.get(id) {
                    None => {
                        summary.stopped += 1;
                        true
                    }
                    Some(token) if &entry.token != token => {
                        summary.restarted += 1;
                        true
                    }
                    Some(_) if retryable => {
                        summary.retried += 1;
                        true
                    }
                    Some(_) => {
                        summary.unchanged += 1;
                        false
                    }
                };
                if replace {
                    retire.push(id.clone());
                }
            }

            let retiring: HashSet<&BotId> = retire.iter().collect();
            let batch: Vec<_> = desired
                .into_iter()
                .filter(|(id, _)| !sessions.contains_key(id) || retiring.contains(id))
                .collect();
            (retire, batch)
        };
        summary.started = batch.len() - summary.restarted - summary.retried;

        if summary.is_noop() {
            debug!(unchanged = summary.unchanged, "reload: no changes");
            return Ok(summary);
        }

        self.stop_entries(retire).await;
        self.launch(batch).await;

        info!(
            started = summary.started,
            stopped = summary.stopped,
            restarted = summary.restarted,
            retried = summary.retried,
            unchanged = summary.unchanged,
            "fleet reloaded"
        );
        Ok(summary)
    }

    /// Stop one bot's session. Returns its final status, or `None` if the bot
    /// had no session.
    pub async fn stop(&self, id: &BotId) -> Option<SessionHandle> {
        let _op = self.inner.ops.lock().await;
        self.stop_entries(vec![id.clone()]).await.pop()
    }

    /// Stop every session concurrently and return their final statuses.
    pub async fn stop_all(&self) -> Vec<SessionHandle> {
        let _op = self.inner.ops.lock().await;
        let ids: Vec<BotId> = self.inner.sessions.lock().await.keys().cloned().collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "stopping all bot sessions");
        }
        self.stop_entries(ids).await
    }

    /// Stop (if running) and start again, if the record is still runnable.
    ///
    /// Retries any `Errored` session, including one whose credentials were
    /// rejected. The record is read first, so an unreadable store leaves the
    /// current session untouched.
    pub async fn restart(&self, id: &BotId) -> Result<Option<SessionHandle>> {
        let _op = self.inner.ops.lock().await;

        let record = self.inner.deps.config_store.get(id).await?;
        let token = record
            .as_ref()
            .filter(|r| r.is_runnable())
            .and_then(|r| r.active_token())
            .map(str::to_string);

        self.stop_entries(vec![id.clone()]).await;
        let Some(token) = token else {
            info!(bot_id = %id, "restart: bot is not runnable");
            return Ok(None);
        };

        self.launch(vec![(id.clone(), token)]).await;
        let sessions = self.inner.sessions.lock().await;
        match sessions.get(id) {
            Some(entry) => Ok(Some(entry.snapshot().await)),
            None => Ok(None),
        }
    }

    /// Read-only snapshot of every session, ordered by bot id.
    pub async fn status(&self) -> Vec<SessionHandle> {
        let sessions = self.inner.sessions.lock().await;
        let mut out = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            out.push(entry.snapshot().await);
        }
        out.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        out
    }

    /// Start the periodic reload task, if not already running.
    pub async fn ensure_watcher(&self, interval: Duration) {
        let mut watcher = self.inner.watcher.lock().await;
        if watcher.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let tok = cancel.clone();
        let weak: Weak<FleetInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = tok.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let fleet = FleetManager { inner };
                        if let Err(e) = fleet.reload().await {
                            warn!(error = %e, "periodic reload failed; keeping current sessions");
                        }
                    }
                }
            }
        });

        *watcher = Some(Watcher { cancel, handle });
        info!(interval_secs = interval.as_secs(), "fleet watcher started");
    }

    /// Teardown: stop the watcher, then every session.
    pub async fn shutdown(&self) -> Vec<SessionHandle> {
        let watcher = self.inner.watcher.lock().await.take();
        if let Some(w) = watcher {
            w.cancel.cancel();
            let grace = self.inner.settings.stop_grace_period;
            if tokio::time::timeout(grace, w.handle).await.is_err() {
                warn!("fleet watcher did not exit in time");
            }
        }
        self.stop_all().await
    }

    /// Runnable records keyed by id, with their tokens.
    async fn desired(&self) -> Result<BTreeMap<BotId, String>> {
        let records = self.inner.deps.config_store.list().await.map_err(|e| {
            error!(error = %e, "failed to read bot configs");
            e
        })?;

        let mut out = BTreeMap::new();
        for record in records {
            if !record.is_runnable() {
                debug!(bot_id = %record.id, enabled = record.enabled, "bot not runnable; skipping");
                continue;
            }
            if let Some(token) = record.active_token() {
                out.insert(record.id.clone(), token.to_string());
            }
        }
        Ok(out)
    }

    /// Start sessions concurrently and record them. Returns how many are running.
    ///
    /// Each bot is listed as `Starting` until its connect attempt resolves.
    async fn launch(&self, batch: Vec<(BotId, String)>) -> usize {
        let mut set = JoinSet::new();
        {
            let mut sessions = self.inner.sessions.lock().await;
            for (id, token) in batch {
                sessions.insert(
                    id.clone(),
                    FleetEntry {
                        token: token.clone(),
                        slot: Slot::Pending(SessionHandle::starting(id.clone())),
                    },
                );
                let deps = self.inner.deps.clone();
                let settings = self.inner.settings.clone();
                set.spawn(async move { BotSession::start(id, &token, deps, settings).await });
            }
        }

        let mut running = 0usize;
        while let Some(joined) = set.join_next().await {
            let session = match joined {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "bot start task failed");
                    continue;
                }
            };

            let snap = session.snapshot().await;
            if snap.state == SessionState::Running {
                running += 1;
            } else {
                warn!(
                    bot_id = %snap.bot_id,
                    error = snap.last_error.as_deref().unwrap_or("unknown"),
                    "bot failed to start"
                );
            }

            if let Some(entry) = self.inner.sessions.lock().await.get_mut(&snap.bot_id) {
                entry.slot = Slot::Live(session);
            }
        }

        // A start task that died leaves its placeholder behind; surface it
        // as a retryable failure instead of a permanent `Starting`.
        let mut sessions = self.inner.sessions.lock().await;
        for entry in sessions.values_mut() {
            if let Slot::Pending(handle) = &mut entry.slot {
                if handle.state == SessionState::Starting {
                    handle.state = SessionState::Errored;
                    handle.last_error = Some("start task failed".to_string());
                }
            }
        }
        running
    }

    /// Stop the given bots concurrently. Each stays listed as `Stopping`
    /// until its stop resolves. Returns final statuses ordered by bot id.
    async fn stop_entries(&self, ids: Vec<BotId>) -> Vec<SessionHandle> {
        let mut live = Vec::new();
        let mut out = Vec::new();
        {
            let mut sessions = self.inner.sessions.lock().await;
            for id in &ids {
                let Some(entry) = sessions.get_mut(id) else {
                    continue;
                };
                let mut placeholder = entry.snapshot().await;
                placeholder.state = SessionState::Stopping;
                match std::mem::replace(&mut entry.slot, Slot::Pending(placeholder)) {
                    Slot::Live(session) => live.push(session),
                    Slot::Pending(mut handle) => {
                        handle.state = SessionState::Stopped;
                        out.push(handle);
                    }
                }
            }
        }

        let mut set = JoinSet::new();
        for session in live {
            set.spawn(session.stop());
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(handle) => out.push(handle),
                Err(e) => error!(error = %e, "session stop task failed"),
            }
        }

        let mut sessions = self.inner.sessions.lock().await;
        for id in &ids {
            sessions.remove(id);
        }
        drop(sessions);

        out.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        out
    }
}
