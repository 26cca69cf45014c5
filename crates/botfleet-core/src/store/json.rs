use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    domain::BotId,
    errors::Error,
    store::{BotConfig, ConfigStore},
    Result,
};

/// ConfigStore backed by a single JSON array file.
///
/// Records that fail to parse are skipped (and left untouched on disk by
/// `put`), so one bad entry never hides the rest of the fleet. A file that
/// does not parse as a whole is an error, never an empty fleet.
pub struct JsonConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_raw(&self) -> Result<Vec<Value>> {
        let txt = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if txt.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Value>(&txt) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(Error::Config(format!(
                "{} is not a JSON array",
                self.path.display()
            ))),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "bot config file does not parse");
                Err(e.into())
            }
        }
    }
}

fn parse_records(path: &Path, items: Vec<Value>) -> Vec<BotConfig> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());

    for (idx, item) in items.into_iter().enumerate() {
        let record = match serde_json::from_value::<BotConfig>(item) {
            Ok(r) if !r.id.as_str().trim().is_empty() => r,
            Ok(_) => {
                warn!(path = %path.display(), index = idx, "skipping bot record with empty id");
                continue;
            }
            Err(e) => {
                warn!(path = %path.display(), index = idx, error = %e, "skipping malformed bot record");
                continue;
            }
        };
        if !seen.insert(record.id.clone()) {
            warn!(bot_id = %record.id, "skipping duplicate bot record");
            continue;
        }
        out.push(record);
    }

    out
}

fn record_id(item: &Value) -> Option<&str> {
    item.get("id").and_then(|v| v.as_str())
}

pub(crate) async fn write_atomic(path: &Path, payload: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = tmp_path_for(path);
    tokio::fs::write(&tmp, payload).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Sibling temp file unique per process and write, so concurrent writers of
/// the same target never share one.
fn tmp_path_for(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.{seq}.tmp", std::process::id()));
    PathBuf::from(tmp)
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn get(&self, id: &BotId) -> Result<Option<BotConfig>> {
        Ok(self.list().await?.into_iter().find(|r| &r.id == id))
    }

    async fn list(&self) -> Result<Vec<BotConfig>> {
        let items = self.read_raw().await?;
        Ok(parse_records(&self.path, items))
    }

    async fn put(&self, record: BotConfig) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut items = self.read_raw().await?;
        let new_item = serde_json::to_value(&record)?;
        match items
            .iter()
            .position(|item| record_id(item) == Some(record.id.as_str()))
        {
            Some(pos) => items[pos] = new_item,
            None => items.push(new_item),
        }

        let txt = serde_json::to_string_pretty(&Value::Array(items))?;
        write_atomic(&self.path, &txt).await
    }
}
