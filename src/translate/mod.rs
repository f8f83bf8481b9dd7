//! Translation: backend adapter trait, memo cache, text normalization and the
//! cached, time-bounded translation service the pipeline calls.

pub mod cache;
pub mod deepseek;
pub mod moderation;
pub mod normalize;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{metric_names, MetricsRegistry};
use cache::TranslationCache;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("API error: {0}")]
    ApiError(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("translation timeout")]
    Timeout,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("translation came back empty")]
    EmptyResult,
}

/// Translation backend adapter.
#[async_trait]
pub trait Translator: Send + Sync {
    /// `source_lang` of `None` lets the backend detect it.
    async fn translate(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> Result<String, TranslateError>;
}

/// Outcome of [`TranslationService::translate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub cached: bool,
}

/// Cache-fronted translator with a fixed call timeout.
///
/// Check-then-call-then-store is not atomic: two identical misses in flight at
/// once both reach the backend and the later write wins.
pub struct TranslationService {
    translator: Arc<dyn Translator>,
    cache: Arc<TranslationCache>,
    metrics: Arc<MetricsRegistry>,
    target_lang: String,
    timeout: Duration,
}

impl TranslationService {
    pub fn new(
        translator: Arc<dyn Translator>,
        cache: Arc<TranslationCache>,
        metrics: Arc<MetricsRegistry>,
        target_lang: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            translator,
            cache,
            metrics,
            target_lang: target_lang.into(),
            timeout,
        }
    }

    pub fn target_lang(&self) -> &str {
        &self.target_lang
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    /// Translate `text` from `source_lang` into the target language.
    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
    ) -> Result<Translation, TranslateError> {
        if let Some(hit) = self.cache.get(text, source_lang, &self.target_lang) {
            debug!(source_lang, "translation cache hit");
            self.metrics.increment(metric_names::CACHE_HIT);
            return Ok(Translation {
                text: hit,
                cached: true,
            });
        }
        self.metrics.increment(metric_names::CACHE_MISS);

        let start = Instant::now();
        let call = self
            .translator
            .translate(text, Some(source_lang), &self.target_lang);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TranslateError::Timeout),
        };
        self.metrics.record(
            metric_names::TRANSLATE_CALL,
            start.elapsed().as_micros() as f64,
        );

        let translated = match result {
            Ok(t) => t.trim().to_string(),
            Err(e) => {
                warn!(source_lang, error = %e, "translator call failed");
                return Err(e);
            }
        };
        if translated.is_empty() {
            return Err(TranslateError::EmptyResult);
        }

        self.cache
            .put(text, source_lang, &self.target_lang, translated.clone());
        Ok(Translation {
            text: translated,
            cached: false,
        })
    }
}
