//! Completion provider port.

use std::time::Duration;

use async_trait::async_trait;

use crate::{errors::Error, Result};

/// Fixed instruction placed ahead of every bot's own policy text.
pub const SYSTEM_PREAMBLE: &str = "You are a helpful customer-support assistant. \
Answer only questions you can answer from the information given to you. \
If the answer is not in that information, say you do not know.";

/// Output bounds applied to every completion call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompletionOptions {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: 300,
            temperature: 0.2,
        }
    }
}

/// Stateless "system text + user text -> reply text" capability.
///
/// Adapters may retry internally, but any failure they give up on must surface
/// as [`Error::Provider`].
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: CompletionOptions,
    ) -> Result<String>;
}

/// Run one completion under an overall deadline.
///
/// A timeout and any non-provider error are both reported as `Error::Provider`.
pub async fn complete_with_deadline(
    client: &dyn CompletionClient,
    system: &str,
    user: &str,
    options: CompletionOptions,
    deadline: Duration,
) -> Result<String> {
    match tokio::time::timeout(deadline, client.complete(system, user, options)).await {
        Err(_) => Err(Error::Provider(format!(
            "completion timed out after {}ms",
            deadline.as_millis()
        ))),
        Ok(Ok(reply)) if reply.trim().is_empty() => {
            Err(Error::Provider("completion returned empty text".to_string()))
        }
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e @ Error::Provider(_))) => Err(e),
        Ok(Err(e)) => Err(Error::Provider(e.to_string())),
    }
}

/// Build the system instruction for one bot.
pub fn compose_system_prompt(policy: &str, context: &str) -> String {
    let mut out = String::from(SYSTEM_PREAMBLE);
    let policy = policy.trim();
    if !policy.is_empty() {
        out.push_str("\n\n");
        out.push_str(policy);
    }
    out.push_str("\n\nUse only the following context:\n");
    out.push_str(context);
    out
}
