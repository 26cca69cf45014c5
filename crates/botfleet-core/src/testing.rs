//! Fakes for the core's ports, shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    completion::{CompletionClient, CompletionOptions},
    domain::{BotId, ChatId, InboundMessage, SenderId},
    errors::Error,
    session::SessionSettings,
    store::{BotConfig, ConfigStore, ContextRecord, ContextStore},
    transport::{Transport, TransportConnection},
    Result,
};

pub fn tmp_dir(prefix: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    let pid = std::process::id();
    let seq = SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}-{seq}"));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_settings() -> SessionSettings {
    SessionSettings {
        command_prefix: "/admin".to_string(),
        completion: CompletionOptions::default(),
        completion_deadline: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        stop_grace_period: Duration::from_millis(200),
    }
}

// ============== Transport ==============

#[derive(Default)]
pub struct FakeTransport {
    rejected: StdMutex<HashSet<String>>,
    fail_next: StdMutex<HashMap<String, Vec<Error>>>,
    connect_delay: StdMutex<Duration>,
    connects: AtomicUsize,
    conns: StdMutex<HashMap<String, Arc<FakeConnection>>>,
}

impl FakeTransport {
    pub fn reject(&self, token: &str) {
        self.rejected.lock().unwrap().insert(token.to_string());
    }

    pub fn accept(&self, token: &str) {
        self.rejected.lock().unwrap().remove(token);
    }

    /// Fail the next connect for `token` with `err`, then behave normally.
    pub fn fail_next_connect(&self, token: &str, err: Error) {
        self.fail_next
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default()
            .push(err);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Latest connection opened for `token`.
    pub fn connection(&self, token: &str) -> Option<Arc<FakeConnection>> {
        self.conns.lock().unwrap().get(token).cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, token: &str) -> Result<Arc<dyn TransportConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .fail_next
            .lock()
            .unwrap()
            .get_mut(token)
            .and_then(|errs| errs.pop());
        if let Some(err) = scripted {
            return Err(err);
        }
        if self.rejected.lock().unwrap().contains(token) {
            return Err(Error::TransportAuth(format!("token {token} rejected")));
        }
        let conn = Arc::new(FakeConnection::new());
        self.conns
            .lock()
            .unwrap()
            .insert(token.to_string(), conn.clone());
        Ok(conn)
    }
}

pub struct FakeConnection {
    inbox_tx: mpsc::UnboundedSender<Result<InboundMessage>>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Result<InboundMessage>>>,
    sent: StdMutex<Vec<(ChatId, String)>>,
    closed: CancellationToken,
}

impl FakeConnection {
    fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            sent: StdMutex::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Deliver a text message from `sender` (private chat: chat id = sender id).
    pub fn push_text(&self, sender: &str, text: &str) {
        let msg = InboundMessage {
            chat_id: ChatId(sender.parse().unwrap_or(0)),
            sender: SenderId(sender.to_string()),
            username: None,
            text: text.to_string(),
        };
        let _ = self.inbox_tx.send(Ok(msg));
    }

    pub fn push_error(&self, err: Error) {
        let _ = self.inbox_tx.send(Err(err));
    }

    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Poll until at least `n` replies were sent, or panic after `within`.
    pub async fn wait_for_sent(&self, n: usize, within: Duration) -> Vec<(ChatId, String)> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let sent = self.sent();
            if sent.len() >= n {
                return sent;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {n} sent messages, got {}: {sent:?}", sent.len());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn recv(&self) -> Result<Option<InboundMessage>> {
        let mut rx = self.inbox_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            next = rx.recv() => match next {
                Some(Ok(msg)) => Ok(Some(msg)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

// ============== Completion ==============

type ErrorFactory = Box<dyn Fn() -> Error + Send + Sync>;

enum Reply {
    Fixed(String),
    Echo,
    Fail(ErrorFactory),
}

pub struct FakeCompletion {
    reply: Reply,
    delay: Duration,
    delay_for: HashMap<String, Duration>,
    calls: AtomicUsize,
    last_system: StdMutex<Option<String>>,
}

impl FakeCompletion {
    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            delay: Duration::ZERO,
            delay_for: HashMap::new(),
            calls: AtomicUsize::new(0),
            last_system: StdMutex::new(None),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with_reply(Reply::Fixed(text.to_string()))
    }

    /// Replies with the user text verbatim.
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    pub fn failing() -> Self {
        Self::failing_with(|| Error::Provider("quota exceeded".to_string()))
    }

    pub fn failing_with(f: impl Fn() -> Error + Send + Sync + 'static) -> Self {
        Self::with_reply(Reply::Fail(Box::new(f)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_delay_for(mut self, user_text: &str, delay: Duration) -> Self {
        self.delay_for.insert(user_text.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_system(&self) -> Option<String> {
        self.last_system.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for FakeCompletion {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        _options: CompletionOptions,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system.lock().unwrap() = Some(system.to_string());

        let delay = self.delay_for.get(user).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match &self.reply {
            Reply::Fixed(text) => Ok(text.clone()),
            Reply::Echo => Ok(user.to_string()),
            Reply::Fail(f) => Err(f()),
        }
    }
}

// ============== Stores ==============

#[derive(Default)]
pub struct MemoryConfigStore {
    records: StdMutex<Vec<BotConfig>>,
    fail_reads: AtomicBool,
}

impl MemoryConfigStore {
    pub fn new(records: Vec<BotConfig>) -> Self {
        Self {
            records: StdMutex::new(records),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn replace_all(&self, records: Vec<BotConfig>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "bots.json unreadable",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, id: &BotId) -> Result<Option<BotConfig>> {
        self.check()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.id == id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<BotConfig>> {
        self.check()?;
        Ok(self.records.lock().unwrap().clone())
    }

    async fn put(&self, record: BotConfig) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryContextStore {
    blobs: StdMutex<HashMap<BotId, String>>,
    fail_reads: AtomicBool,
}

impl MemoryContextStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, id: &BotId) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "context unreadable",
            )));
        }
        Ok(self.blobs.lock().unwrap().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ContextRecord>> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .iter()
            .map(|(id, text)| ContextRecord {
                bot_id: id.clone(),
                text: text.clone(),
            })
            .collect())
    }

    async fn put(&self, id: &BotId, text: &str) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(id.clone(), text.to_string());
        Ok(())
    }
}
