//! Per-message dispatch: validate, then either run a chat command or walk the
//! auto-translate gates in order. The first gate that fails drops the message.
//!
//! The pipeline holds no per-message state of its own; everything durable lives
//! in the injected stores.

pub mod commands;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error};

use crate::channel_config::{ChannelConfig, ConfigStore};
use crate::credentials::CredentialManager;
use crate::ignore_list::IgnoreList;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::rate_limit::{RateLimiter, Scope};
use crate::storage::StoreError;
use crate::translate::moderation::ModerationFilter;
use crate::translate::normalize::{LanguageDetector, Sanitizer};
use crate::translate::TranslationService;
use crate::transport::ChatMessage;

/// Names per outbound line when listing the global ignore list.
pub const IGNORE_LIST_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    TooLong,
    Empty,
    CommandsDisabled,
    Unauthorized,
    UnknownCommand,
    AutoTranslateDisabled,
    ExcludedUser,
    IgnoredUser,
    TooShort,
    Moderated,
    RateLimited,
    NoLanguage,
    LowConfidence,
    AlreadyTarget,
    LanguageFiltered,
    TranslationFailed,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::TooLong => "too_long",
            DropReason::Empty => "empty",
            DropReason::CommandsDisabled => "commands_disabled",
            DropReason::Unauthorized => "unauthorized",
            DropReason::UnknownCommand => "unknown_command",
            DropReason::AutoTranslateDisabled => "auto_translate_disabled",
            DropReason::ExcludedUser => "excluded_user",
            DropReason::IgnoredUser => "ignored_user",
            DropReason::TooShort => "too_short",
            DropReason::Moderated => "moderated",
            DropReason::RateLimited => "rate_limited",
            DropReason::NoLanguage => "no_language",
            DropReason::LowConfidence => "low_confidence",
            DropReason::AlreadyTarget => "already_target",
            DropReason::LanguageFiltered => "language_filtered",
            DropReason::TranslationFailed => "translation_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Lines to send back to the message's channel, in order.
    Reply(Vec<String>),
    Dropped(DropReason),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not persist change: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_message_length: usize,
    pub max_message_length: usize,
    pub min_confidence: f64,
    /// Username allowed to manage the global ignore list. When unset, each
    /// channel's owner may.
    pub bot_owner: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_message_length: 4,
            max_message_length: 500,
            min_confidence: 0.5,
            bot_owner: None,
        }
    }
}

/// Everything the pipeline reads or mutates, constructed once at startup.
#[derive(Clone)]
pub struct PipelineServices {
    pub config: Arc<ConfigStore>,
    pub ignore_list: Arc<IgnoreList>,
    pub rate_limiter: Arc<RateLimiter>,
    pub translation: Arc<TranslationService>,
    pub credentials: Arc<CredentialManager>,
    pub detector: Arc<dyn LanguageDetector>,
    pub moderation: Arc<ModerationFilter>,
    pub metrics: Arc<MetricsRegistry>,
}

pub struct MessagePipeline {
    services: PipelineServices,
    settings: PipelineSettings,
    sanitizer: Sanitizer,
}

impl MessagePipeline {
    pub fn new(services: PipelineServices, settings: PipelineSettings) -> Result<Self, regex::Error> {
        Ok(Self {
            services,
            settings,
            sanitizer: Sanitizer::new()?,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one message to its terminal outcome. Never fails; errors become
    /// replies on the command path and drops on the translate path.
    pub async fn handle(&self, msg: &ChatMessage) -> PipelineOutcome {
        let start = Instant::now();
        let metrics = &self.services.metrics;
        metrics.increment(metric_names::MESSAGES_RECEIVED);

        let outcome = self.dispatch(msg).await;

        match &outcome {
            PipelineOutcome::Reply(lines) => {
                debug!(lines = lines.len(), "pipeline replied");
            }
            PipelineOutcome::Dropped(reason) => {
                debug!(reason = reason.as_str(), "message dropped");
                metrics.increment(&metric_names::dropped(reason.as_str()));
            }
        }
        metrics.record(
            metric_names::PIPELINE_DONE,
            start.elapsed().as_micros() as f64,
        );
        outcome
    }

    async fn dispatch(&self, msg: &ChatMessage) -> PipelineOutcome {
        let text = msg.text.trim();
        if text.is_empty() {
            return PipelineOutcome::Dropped(DropReason::Empty);
        }
        if text.chars().count() > self.settings.max_message_length {
            return PipelineOutcome::Dropped(DropReason::TooLong);
        }

        let config = self.services.config.get(&msg.channel);
        let command_body = match config.prefix.as_str() {
            "" => None,
            prefix => text.strip_prefix(prefix),
        };

        match command_body {
            Some(body) => match self.run_command(msg, &config, body).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(channel = %msg.channel, error = %e, "command failed");
                    PipelineOutcome::Reply(vec![format!(
                        "@{}, that change could not be saved, please try again later.",
                        msg.username
                    )])
                }
            },
            None => self.auto_translate(msg, &config, text).await,
        }
    }

    async fn auto_translate(
        &self,
        msg: &ChatMessage,
        config: &ChannelConfig,
        text: &str,
    ) -> PipelineOutcome {
        use DropReason::*;
        let services = &self.services;
        let min_len = self.settings.min_message_length;

        if !config.auto_translate {
            return PipelineOutcome::Dropped(AutoTranslateDisabled);
        }
        if config.is_excluded(&msg.username) {
            return PipelineOutcome::Dropped(ExcludedUser);
        }
        if services.ignore_list.contains(&msg.username) {
            return PipelineOutcome::Dropped(IgnoredUser);
        }
        if text.chars().count() < min_len {
            return PipelineOutcome::Dropped(TooShort);
        }

        let normalized = self.sanitizer.normalize(text);
        if normalized.text.is_empty() || normalized.text.chars().count() < min_len {
            return PipelineOutcome::Dropped(TooShort);
        }
        if services.moderation.is_blocked(&normalized.text) {
            return PipelineOutcome::Dropped(Moderated);
        }
        if !services.rate_limiter.admit(Scope::Channel(&msg.channel)) {
            return PipelineOutcome::Dropped(RateLimited);
        }

        let Some(best) = services.detector.detect(&normalized.text).into_iter().next() else {
            return PipelineOutcome::Dropped(NoLanguage);
        };
        if best.confidence < self.settings.min_confidence {
            return PipelineOutcome::Dropped(LowConfidence);
        }
        let target = services.translation.target_lang();
        if best.lang == target {
            return PipelineOutcome::Dropped(AlreadyTarget);
        }
        if !config.allows_language(&best.lang) {
            return PipelineOutcome::Dropped(LanguageFiltered);
        }

        let translation = match services
            .translation
            .translate(&normalized.text, &best.lang)
            .await
        {
            Ok(translation) => translation,
            Err(e) => {
                debug!(lang = %best.lang, error = %e, "auto-translation failed");
                return PipelineOutcome::Dropped(TranslationFailed);
            }
        };

        PipelineOutcome::Reply(vec![format_translation(
            &msg.username,
            &best.lang,
            target,
            &normalized.respliced(&translation.text),
        )])
    }
}

/// `[<user>, <source>→<target>]: <text>`
pub fn format_translation(user: &str, source: &str, target: &str, text: &str) -> String {
    format!("[{user}, {source}→{target}]: {text}")
}
