//! OpenAI adapter (chat completions).
//!
//! Implements the core `CompletionClient` over any OpenAI-compatible
//! `/chat/completions` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use botfleet_core::{
    completion::{CompletionClient, CompletionOptions},
    errors::Error,
    Result,
};

const MAX_RETRIES: usize = 1;
const RETRY_DELAY: Duration = Duration::from_millis(750);

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Outcome of one HTTP attempt.
enum Attempt {
    Done(String),
    Retryable(Error),
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;

        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn attempt(&self, body: &ChatRequest<'_>) -> Result<Attempt> {
        let resp = match self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Ok(Attempt::Retryable(Error::Provider(format!(
                    "openai request error: {e}"
                ))))
            }
            Err(e) => return Err(Error::Provider(format!("openai request error: {e}"))),
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = Error::Provider(format!(
                "openai completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            ));
            if is_retryable_status(status.as_u16()) {
                return Ok(Attempt::Retryable(err));
            }
            return Err(err);
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| Error::Provider(format!("openai json error: {e}")))?;
        extract_reply(parsed).map(Attempt::Done)
    }
}

fn is_retryable_status(code: u16) -> bool {
    code == 429 || (500..600).contains(&code)
}

fn extract_reply(resp: ChatResponse) -> Result<String> {
    let text = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(Error::Provider(
            "openai completion returned empty text".to_string(),
        ));
    }
    Ok(text)
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        options: CompletionOptions,
    ) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: options.max_output_tokens,
            temperature: options.temperature,
        };

        let mut attempts = 0usize;
        loop {
            match self.attempt(&body).await? {
                Attempt::Done(text) => return Ok(text),
                Attempt::Retryable(e) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    warn!(error = %e, "openai call failed; retrying");
                    sleep(RETRY_DELAY).await;
                }
                Attempt::Retryable(e) => return Err(e),
            }
        }
    }
}
