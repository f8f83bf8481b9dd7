//! DeepSeek chat/completions translation backend.
//! Pooled reqwest client; bounded retries on 429 and 5xx.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{TranslateError, Translator};

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";

/// Kept short: every request pays for it.
const SYSTEM_PROMPT: &str = "You are a translator for live chat. Output only the translation of \
    field t into language l (source language s when given), nothing else.";

const MAX_429_RETRIES: u32 = 2;
const MAX_5XX_RETRIES: u32 = 1;

pub struct DeepSeekTranslator {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl DeepSeekTranslator {
    pub fn new(api_key: impl Into<String>) -> Result<Self, TranslateError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TranslateError::ApiError(e.to_string()))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            model: "deepseek-chat".into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// 429: Retry-After or 1s/2s. 5xx: one retry after 500ms.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TranslateError> {
        let mut rate_limited: u32 = 0;
        let mut server_errors: u32 = 0;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => return Err(TranslateError::Timeout),
                Err(e) => return Err(TranslateError::ApiError(e.to_string())),
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            if status.as_u16() == 429 {
                let wait = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| Duration::from_secs(1 << rate_limited));
                if rate_limited >= MAX_429_RETRIES {
                    return Err(TranslateError::RateLimited {
                        retry_after_ms: wait.as_millis() as u64,
                    });
                }
                warn!(attempt = rate_limited, wait_ms = wait.as_millis() as u64, "429 rate limited, retrying");
                tokio::time::sleep(wait).await;
                rate_limited += 1;
                continue;
            }

            if status.is_server_error() && server_errors < MAX_5XX_RETRIES {
                warn!(status = status.as_u16(), "5xx error, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
                server_errors += 1;
                continue;
            }

            let body_text = resp.text().await.unwrap_or_default();
            return Err(TranslateError::ApiError(format!(
                "unexpected status {}: {}",
                status,
                body_text.chars().take(200).collect::<String>()
            )));
        }
    }
}

#[async_trait]
impl Translator for DeepSeekTranslator {
    async fn translate(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        if text.trim().is_empty() {
            return Err(TranslateError::InvalidInput("empty text".into()));
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(text, source_lang, target_lang)}
            ],
            "max_tokens": estimate_max_tokens(text),
            "stream": false,
            "temperature": 0.1
        });

        let response = self.send_with_retry(&body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::ApiError(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(TranslateError::EmptyResult)
    }
}

/// Compact user prompt: {"t":"text","l":"en"} plus "s" when the source is known.
fn build_user_prompt(text: &str, source_lang: Option<&str>, target_lang: &str) -> String {
    let mut prompt = serde_json::json!({ "t": text, "l": target_lang });
    if let Some(source) = source_lang {
        prompt["s"] = serde_json::Value::from(source);
    }
    prompt.to_string()
}

/// Chat lines are short: (input_tokens * 1.5 + 32), capped at 512.
fn estimate_max_tokens(text: &str) -> u32 {
    let estimated_input_tokens = text.len() as f64 / 3.0;
    let max = (estimated_input_tokens * 1.5 + 32.0) as u32;
    max.clamp(64, 512)
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: Option<String>,
}
