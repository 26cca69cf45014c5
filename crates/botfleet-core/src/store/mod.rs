//! Durable per-bot records and the ports the core reads them through.
//!
//! The core only reads these stores (plus lazy creation of a missing context
//! blob); operator tooling owns all other writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{domain::BotId, Result};

mod context;
mod json;

pub use context::FileContextStore;
pub use json::JsonConfigStore;

/// Placeholder written the first time a bot's context is accessed.
pub const DEFAULT_CONTEXT: &str = "Company info:\n";

/// One operator-configured bot identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    pub id: BotId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub system_policy: String,
    #[serde(default, deserialize_with = "operator_ids")]
    pub authorized_operator_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl BotConfig {
    /// New enabled record with a timestamp-derived id.
    pub fn new(token: impl Into<String>, system_policy: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: BotId(now.timestamp_millis().to_string()),
            token: Some(token.into()),
            enabled: true,
            system_policy: system_policy.into(),
            authorized_operator_ids: Vec::new(),
            created_at: Some(now),
        }
    }

    /// The transport token, if one is set and non-blank.
    pub fn active_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Whether the fleet should run a session for this record.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.active_token().is_some()
    }

    pub fn is_operator(&self, sender: &str) -> bool {
        self.authorized_operator_ids.iter().any(|id| id == sender)
    }
}

fn default_enabled() -> bool {
    true
}

/// Operator ids may be written as JSON numbers (Telegram user ids) or strings.
fn operator_ids<'de, D>(de: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(de)?;
    raw.into_iter()
        .map(|v| match v {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "operator id must be a string or number, got {other}"
            ))),
        })
        .collect()
}

/// A bot's private knowledge blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextRecord {
    pub bot_id: BotId,
    pub text: String,
}

/// Durable mapping from bot identity to its configuration record.
///
/// Implementations treat a missing backing store as empty and a corrupt
/// record as absent.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, id: &BotId) -> Result<Option<BotConfig>>;
    async fn list(&self) -> Result<Vec<BotConfig>>;
    async fn put(&self, record: BotConfig) -> Result<()>;
}

/// Durable per-bot context blobs.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, id: &BotId) -> Result<Option<String>>;
    async fn list(&self) -> Result<Vec<ContextRecord>>;
    async fn put(&self, id: &BotId, text: &str) -> Result<()>;

    /// Read the blob, creating it with [`DEFAULT_CONTEXT`] if absent.
    async fn load_or_init(&self, id: &BotId) -> Result<String> {
        if let Some(text) = self.get(id).await? {
            return Ok(text);
        }
        self.put(id, DEFAULT_CONTEXT).await?;
        Ok(DEFAULT_CONTEXT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: BotConfig = serde_json::from_value(json!({ "id": "b1" })).unwrap();
        assert_eq!(cfg.id, BotId::new("b1"));
        assert!(cfg.enabled);
        assert!(cfg.token.is_none());
        assert!(cfg.system_policy.is_empty());
        assert!(!cfg.is_runnable());
    }

    #[test]
    fn numeric_operator_ids_become_strings() {
        let cfg: BotConfig = serde_json::from_value(json!({
            "id": "b1",
            "token": "t",
            "authorizedOperatorIds": [42, "alice"]
        }))
        .unwrap();
        assert_eq!(cfg.authorized_operator_ids, vec!["42", "alice"]);
        assert!(cfg.is_operator("42"));
        assert!(!cfg.is_operator("43"));
    }

    #[test]
    fn blank_token_or_disabled_is_not_runnable() {
        let mut cfg = BotConfig::new("   ", "");
        assert!(!cfg.is_runnable());
        cfg.token = Some("123:abc".to_string());
        assert!(cfg.is_runnable());
        cfg.enabled = false;
        assert!(!cfg.is_runnable());
    }

    #[test]
    fn serializes_camel_case_fields() {
        let mut cfg = BotConfig::new("123:abc", "Be brief.");
        cfg.authorized_operator_ids = vec!["7".to_string()];
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["systemPolicy"], "Be brief.");
        assert_eq!(v["authorizedOperatorIds"], json!(["7"]));
        assert!(v.get("createdAt").is_some());
    }
}
