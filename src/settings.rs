//! Process settings from the environment (after `.env` loading).
//! Every variable except `DEEPSEEK_API_KEY` carries the `LINGOBOT_` prefix.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "LINGOBOT_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} is required")]
    Missing(String),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub channels: Vec<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub bot_owner: Option<String>,
    pub storage_dir: PathBuf,
    pub target_lang: String,
    pub global_rate_limit: usize,
    pub channel_rate_limit: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub min_confidence: f64,
    pub min_message_length: usize,
    pub max_message_length: usize,
    pub refresh_margin: Duration,
    pub translate_timeout: Duration,
    pub moderation_patterns: PathBuf,
    pub deepseek_api_key: String,
}

impl Settings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        match dotenv::dotenv() {
            Ok(path) => info!(path = %path.display(), "loaded .env"),
            Err(e) => debug!(error = %e, "no .env loaded"),
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let channels: Vec<String> = env
            .required("CHANNELS")?
            .split(',')
            .map(|c| c.trim().trim_start_matches('#').to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        if channels.is_empty() {
            return Err(SettingsError::Missing(prefixed("CHANNELS")));
        }

        let refresh_token = env.optional("REFRESH_TOKEN");
        let client_id = env.optional("CLIENT_ID");
        let client_secret = env.optional("CLIENT_SECRET");
        if refresh_token.is_some() {
            if client_id.is_none() {
                return Err(SettingsError::Missing(prefixed("CLIENT_ID")));
            }
            if client_secret.is_none() {
                return Err(SettingsError::Missing(prefixed("CLIENT_SECRET")));
            }
        }

        let deepseek_api_key = env
            .raw("DEEPSEEK_API_KEY")
            .ok_or_else(|| SettingsError::Missing("DEEPSEEK_API_KEY".into()))?;

        let cache_capacity: usize = env.parsed("CACHE_CAPACITY", 512)?;
        if cache_capacity == 0 {
            return Err(invalid("CACHE_CAPACITY", "0", "must be greater than zero"));
        }

        let min_confidence: f64 = env.parsed("MIN_CONFIDENCE", 0.5)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(invalid(
                "MIN_CONFIDENCE",
                &min_confidence.to_string(),
                "must be between 0 and 1",
            ));
        }

        let min_message_length: usize = env.parsed("MIN_MESSAGE_LENGTH", 4)?;
        let max_message_length: usize = env.parsed("MAX_MESSAGE_LENGTH", 500)?;
        if max_message_length == 0 || max_message_length < min_message_length {
            return Err(invalid(
                "MAX_MESSAGE_LENGTH",
                &max_message_length.to_string(),
                "must be positive and at least MIN_MESSAGE_LENGTH",
            ));
        }

        let translate_timeout_secs: u64 = env.parsed("TRANSLATE_TIMEOUT_SECS", 10)?;
        if translate_timeout_secs == 0 {
            return Err(invalid("TRANSLATE_TIMEOUT_SECS", "0", "must be greater than zero"));
        }

        Ok(Self {
            channels,
            access_token: env.optional("ACCESS_TOKEN"),
            refresh_token,
            client_id: client_id.unwrap_or_default(),
            client_secret: client_secret.unwrap_or_default(),
            bot_owner: env.optional("BOT_OWNER").map(|o| o.trim_start_matches('@').to_lowercase()),
            storage_dir: env.optional("STORAGE_DIR").unwrap_or_else(|| "data".into()).into(),
            target_lang: env
                .optional("TARGET_LANG")
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|| "en".into()),
            global_rate_limit: env.parsed("GLOBAL_RATE_LIMIT", 20)?,
            channel_rate_limit: env.parsed("CHANNEL_RATE_LIMIT", 10)?,
            cache_capacity,
            cache_ttl: Duration::from_secs(env.parsed("CACHE_TTL_SECS", 600)?),
            min_confidence,
            min_message_length,
            max_message_length,
            refresh_margin: Duration::from_secs(env.parsed("REFRESH_MARGIN_SECS", 300)?),
            translate_timeout: Duration::from_secs(translate_timeout_secs),
            moderation_patterns: env
                .optional("MODERATION_PATTERNS")
                .unwrap_or_else(|| "moderation.json".into())
                .into(),
            deepseek_api_key,
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.raw(&prefixed(name))
    }

    fn required(&self, name: &str) -> Result<String, SettingsError> {
        self.optional(name)
            .ok_or_else(|| SettingsError::Missing(prefixed(name)))
    }

    fn parsed<T>(&self, name: &str, default: T) -> Result<T, SettingsError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|e: T::Err| invalid(name, &value, &e.to_string())),
        }
    }
}

fn prefixed(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

fn invalid(name: &str, value: &str, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        var: prefixed(name),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
