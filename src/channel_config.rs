//! Per-channel settings with write-through persistence.
//! Records are keyed by the normalized channel name ("#Foo" and "foo" are the same
//! channel) and created with defaults on first access.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{load_or_init, save_json, Recovery, Repository, StoreError};

pub const DEFAULT_PREFIX: &str = "!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub auto_translate: bool,
    pub respond_to_commands: bool,
    pub excluded_users: BTreeSet<String>,
    /// Source languages eligible for auto-translation. Empty means all.
    pub language_filter: BTreeSet<String>,
    pub prefix: String,
    pub moderator_only: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_translate: true,
            respond_to_commands: true,
            excluded_users: BTreeSet::new(),
            language_filter: BTreeSet::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            moderator_only: false,
        }
    }
}

impl ChannelConfig {
    pub fn is_excluded(&self, username: &str) -> bool {
        self.excluded_users.contains(&normalize_user(username))
    }

    pub fn allows_language(&self, lang: &str) -> bool {
        self.language_filter.is_empty() || self.language_filter.contains(lang)
    }
}

/// Shallow patch over a [`ChannelConfig`]: every `Some` field replaces the stored one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfigPatch {
    pub auto_translate: Option<bool>,
    pub respond_to_commands: Option<bool>,
    pub excluded_users: Option<BTreeSet<String>>,
    pub language_filter: Option<BTreeSet<String>>,
    pub prefix: Option<String>,
    pub moderator_only: Option<bool>,
}

impl ChannelConfigPatch {
    pub fn apply(self, mut config: ChannelConfig) -> ChannelConfig {
        if let Some(v) = self.auto_translate {
            config.auto_translate = v;
        }
        if let Some(v) = self.respond_to_commands {
            config.respond_to_commands = v;
        }
        if let Some(v) = self.excluded_users {
            config.excluded_users = v;
        }
        if let Some(v) = self.language_filter {
            config.language_filter = v;
        }
        if let Some(v) = self.prefix {
            config.prefix = v;
        }
        if let Some(v) = self.moderator_only {
            config.moderator_only = v;
        }
        config
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigKeyError {
    #[error("unknown config key '{0}'")]
    Unknown(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: ConfigKey, reason: String },
}

/// Settings a moderator may read or change from chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    AutoTranslate,
    RespondToCommands,
    ModeratorOnly,
    Prefix,
    LanguageFilter,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 5] = [
        ConfigKey::AutoTranslate,
        ConfigKey::RespondToCommands,
        ConfigKey::ModeratorOnly,
        ConfigKey::Prefix,
        ConfigKey::LanguageFilter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::AutoTranslate => "autoTranslate",
            ConfigKey::RespondToCommands => "respondToCommands",
            ConfigKey::ModeratorOnly => "moderatorOnly",
            ConfigKey::Prefix => "prefix",
            ConfigKey::LanguageFilter => "languageFilter",
        }
    }

    /// Render the key's current value for a chat reply.
    pub fn current_value(self, config: &ChannelConfig) -> String {
        match self {
            ConfigKey::AutoTranslate => config.auto_translate.to_string(),
            ConfigKey::RespondToCommands => config.respond_to_commands.to_string(),
            ConfigKey::ModeratorOnly => config.moderator_only.to_string(),
            ConfigKey::Prefix => config.prefix.clone(),
            ConfigKey::LanguageFilter => {
                if config.language_filter.is_empty() {
                    "none".to_string()
                } else {
                    config
                        .language_filter
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(",")
                }
            }
        }
    }

    /// Coerce a raw chat value into a patch for this key.
    pub fn patch_from_value(self, raw: &str) -> Result<ChannelConfigPatch, ConfigKeyError> {
        let raw = raw.trim();
        let mut patch = ChannelConfigPatch::default();
        match self {
            ConfigKey::AutoTranslate => patch.auto_translate = Some(parse_flag(raw)),
            ConfigKey::RespondToCommands => patch.respond_to_commands = Some(parse_flag(raw)),
            ConfigKey::ModeratorOnly => patch.moderator_only = Some(parse_flag(raw)),
            ConfigKey::Prefix => {
                if raw.is_empty() {
                    return Err(ConfigKeyError::InvalidValue {
                        key: self,
                        reason: "prefix cannot be empty".into(),
                    });
                }
                patch.prefix = Some(raw.to_string());
            }
            ConfigKey::LanguageFilter => {
                let langs = match raw.to_lowercase().as_str() {
                    "none" | "off" | "-" => BTreeSet::new(),
                    lowered => lowered
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|code| !code.is_empty())
                        .map(str::to_string)
                        .collect(),
                };
                patch.language_filter = Some(langs);
            }
        }
        Ok(patch)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigKeyError::Unknown(s.to_string()))
    }
}

/// Only "true" and "on" switch a flag on; anything else switches it off.
fn parse_flag(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "on")
}

/// Lowercase, without the leading channel sigil.
pub fn normalize_channel(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_lowercase()
}

/// Lowercase, without a leading mention sigil.
pub fn normalize_user(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

fn record_key(channel: &str) -> String {
    format!("channel_{channel}")
}

pub struct ConfigStore {
    repo: Arc<dyn Repository>,
    channels: Mutex<HashMap<String, ChannelConfig>>,
}

impl ConfigStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Rehydrate the given channels from storage.
    pub fn preload<'a>(&self, channels: impl IntoIterator<Item = &'a str>) {
        for channel in channels {
            self.get(channel);
        }
    }

    /// Current config, created and persisted with defaults if the channel is new.
    pub fn get(&self, channel: &str) -> ChannelConfig {
        let key = normalize_channel(channel);
        let mut channels = self.channels.lock();
        self.current_locked(&mut channels, &key).clone()
    }

    /// Merge `patch` over the current config and persist before returning.
    pub fn update(
        &self,
        channel: &str,
        patch: ChannelConfigPatch,
    ) -> Result<ChannelConfig, StoreError> {
        let key = normalize_channel(channel);
        let mut channels = self.channels.lock();
        let merged = patch.apply(self.current_locked(&mut channels, &key).clone());
        save_json(self.repo.as_ref(), &record_key(&key), &merged)?;
        channels.insert(key.clone(), merged.clone());
        info!(channel = %key, "channel config saved");
        Ok(merged)
    }

    /// Add `user` to the channel's excluded set. Returns false if already present.
    pub fn exclude_user(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        let user = normalize_user(user);
        self.modify_excluded(channel, |set| set.insert(user))
    }

    /// Remove `user` from the channel's excluded set. Returns false if absent.
    pub fn include_user(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        let user = normalize_user(user);
        self.modify_excluded(channel, |set| set.remove(&user))
    }

    fn modify_excluded<F>(&self, channel: &str, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let key = normalize_channel(channel);
        let mut channels = self.channels.lock();
        let mut updated = self.current_locked(&mut channels, &key).clone();
        if !change(&mut updated.excluded_users) {
            return Ok(false);
        }
        save_json(self.repo.as_ref(), &record_key(&key), &updated)?;
        channels.insert(key, updated);
        Ok(true)
    }

    fn current_locked<'m>(
        &self,
        channels: &'m mut HashMap<String, ChannelConfig>,
        key: &str,
    ) -> &'m ChannelConfig {
        channels.entry(key.to_string()).or_insert_with(|| {
            match load_or_init(self.repo.as_ref(), &record_key(key), ChannelConfig::default) {
                Ok((config, Recovery::Loaded)) => config,
                Ok((config, recovery)) => {
                    info!(channel = %key, ?recovery, "channel config initialized");
                    config
                }
                Err(e) => {
                    warn!(channel = %key, error = %e, "channel config unavailable, using defaults");
                    ChannelConfig::default()
                }
            }
        })
    }
}
