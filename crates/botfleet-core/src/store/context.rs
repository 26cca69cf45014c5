use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;

use crate::{
    domain::BotId,
    errors::Error,
    store::{json::write_atomic, ContextRecord, ContextStore},
    Result,
};

const CONTEXT_EXT: &str = "txt";
const MAX_PLAIN_STEM_LEN: usize = 128;
/// Keeps `<stem>.txt` plus a temp suffix under common 255-byte name limits.
const MAX_STEM_LEN: usize = 200;
/// Marks a hex-encoded stem; never valid in a plain stem.
const ENCODED_PREFIX: char = '~';

/// ContextStore keeping one `<id>.txt` file per bot under a directory.
///
/// Ids that are plain file names are used as-is. Any other id is stored as
/// `~<hex of its utf-8 bytes>`, so every non-empty id maps to exactly one
/// file inside the directory.
pub struct FileContextStore {
    dir: PathBuf,
}

impl FileContextStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &BotId) -> Result<PathBuf> {
        let stem = file_stem_for(id.as_str()).ok_or_else(|| Error::InvalidPath {
            path: self.dir.clone(),
            reason: format!("bot id {:?} cannot be stored as a file name", id.as_str()),
        })?;
        Ok(self.dir.join(format!("{stem}.{CONTEXT_EXT}")))
    }
}

fn is_plain_stem(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_PLAIN_STEM_LEN
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn file_stem_for(id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    if is_plain_stem(id) {
        return Some(id.to_string());
    }
    let stem = format!("{ENCODED_PREFIX}{}", hex::encode(id.as_bytes()));
    (stem.len() <= MAX_STEM_LEN).then_some(stem)
}

fn id_from_file_stem(stem: &str) -> Option<BotId> {
    match stem.strip_prefix(ENCODED_PREFIX) {
        Some(encoded) => {
            let bytes = hex::decode(encoded).ok()?;
            let id = String::from_utf8(bytes).ok()?;
            // Reject non-canonical names such as an encoded plain id.
            (file_stem_for(&id).as_deref() == Some(stem)).then(|| BotId::new(id))
        }
        None => is_plain_stem(stem).then(|| BotId::new(stem)),
    }
}

#[async_trait]
impl ContextStore for FileContextStore {
    async fn get(&self, id: &BotId) -> Result<Option<String>> {
        let path = self.path_for(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ContextRecord>> {
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(ent) = rd.next_entry().await? {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONTEXT_EXT) {
                continue;
            }
            let Some(bot_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(id_from_file_stem)
            else {
                continue;
            };
            // Unreadable blobs are treated as absent.
            let Ok(text) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            out.push(ContextRecord { bot_id, text });
        }

        out.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        Ok(out)
    }

    async fn put(&self, id: &BotId, text: &str) -> Result<()> {
        let path = self.path_for(id)?;
        write_atomic(&path, text).await
    }
}
