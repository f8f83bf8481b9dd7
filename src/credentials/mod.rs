//! Long-lived chat credential: expiry tracking, refresh with retry/backoff,
//! durable persistence, and notification of every newly issued access token.

pub mod endpoint;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::state_machine::{CredentialLifecycle, CredentialPhase};
use crate::storage::{save_json, Repository, StoreError};
use endpoint::{TokenEndpoint, TokenExchangeError, TokenGrant};

const RECORD_KEY: &str = "credentials";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialState {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub consecutive_refresh_failures: u32,
}

impl CredentialState {
    /// State from bootstrap secrets; expiry unknown until the first refresh.
    pub fn bootstrap(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
            consecutive_refresh_failures: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub base_delay: Duration,
    /// Refresh once expiry is this close.
    pub margin: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            margin: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no stored credential and no bootstrap access token")]
    Missing,
    #[error("stored credential is unreadable: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,
    #[error("token refresh failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: TokenExchangeError,
    },
    #[error("refreshed token could not be persisted: {0}")]
    Persist(#[source] StoreError),
}

pub struct CredentialManager {
    state: Mutex<CredentialState>,
    lifecycle: CredentialLifecycle,
    endpoint: Arc<dyn TokenEndpoint>,
    repo: Arc<dyn Repository>,
    client: ClientSecrets,
    policy: RefreshPolicy,
    /// Serializes refreshes; held across the whole retry loop.
    refresh_lock: tokio::sync::Mutex<()>,
    token_tx: watch::Sender<String>,
}

impl CredentialManager {
    /// Use the stored credential if there is a readable one, otherwise `bootstrap`
    /// (which is then persisted).
    pub fn open(
        repo: Arc<dyn Repository>,
        endpoint: Arc<dyn TokenEndpoint>,
        client: ClientSecrets,
        policy: RefreshPolicy,
        bootstrap: Option<CredentialState>,
    ) -> Result<Self, CredentialError> {
        let stored = match repo.load(RECORD_KEY)? {
            Some(raw) => match serde_json::from_str::<CredentialState>(&raw) {
                Ok(state) => Some(state),
                Err(e) if bootstrap.is_some() => {
                    warn!(error = %e, "stored credential unreadable, falling back to bootstrap secrets");
                    repo.quarantine(RECORD_KEY)?;
                    None
                }
                Err(e) => return Err(CredentialError::Corrupt(e)),
            },
            None => None,
        };

        let state = match (stored, bootstrap) {
            (Some(state), _) => {
                info!(expires_at = ?state.expires_at, "credential loaded from storage");
                state
            }
            (None, Some(state)) => {
                save_json(repo.as_ref(), RECORD_KEY, &state)?;
                info!("credential bootstrapped from secrets");
                state
            }
            (None, None) => return Err(CredentialError::Missing),
        };

        let initial = if expires_within(state.expires_at, policy.margin) {
            CredentialPhase::NeedsRefresh
        } else {
            CredentialPhase::Fresh
        };
        let (token_tx, _) = watch::channel(state.access_token.clone());

        Ok(Self {
            state: Mutex::new(state),
            lifecycle: CredentialLifecycle::new(initial),
            endpoint,
            repo,
            client,
            policy,
            refresh_lock: tokio::sync::Mutex::new(()),
            token_tx,
        })
    }

    pub fn access_token(&self) -> String {
        self.state.lock().access_token.clone()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expires_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_refresh_failures
    }

    pub fn phase(&self) -> CredentialPhase {
        self.lifecycle.current()
    }

    /// Receives every access token issued by a successful refresh.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.token_tx.subscribe()
    }

    /// False when there is no refresh token; nothing can ever be exchanged.
    pub fn can_refresh(&self) -> bool {
        self.state.lock().refresh_token.is_some()
    }

    /// True when expiry is unknown or within the look-ahead margin.
    pub fn needs_refresh(&self) -> bool {
        let due = expires_within(self.state.lock().expires_at, self.policy.margin);
        if due && self.lifecycle.current() == CredentialPhase::Fresh {
            let _ = self.lifecycle.transition(CredentialPhase::NeedsRefresh);
        }
        due
    }

    /// Exchange the refresh token for a new access token, retrying with
    /// exponential backoff. On failure the current credential is kept as-is.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        let _guard = self.refresh_lock.lock().await;

        let refresh_token = self
            .state
            .lock()
            .refresh_token
            .clone()
            .ok_or(RefreshError::MissingRefreshToken)?;

        let _ = self.lifecycle.transition(CredentialPhase::Refreshing);

        let attempts = self.policy.max_attempts.max(1);
        let mut delay = self.policy.base_delay;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            let outcome = self
                .endpoint
                .refresh(&refresh_token, &self.client.client_id, &self.client.client_secret)
                .await
                .and_then(|grant| {
                    let expires_at = expiry_from(grant.expires_in)?;
                    Ok((grant, expires_at))
                });
            match outcome {
                Ok((grant, expires_at)) => return self.apply_grant(grant, expires_at),
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "token refresh attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let failures = {
            let mut state = self.state.lock();
            state.consecutive_refresh_failures += 1;
            state.consecutive_refresh_failures
        };
        let _ = self.lifecycle.transition(CredentialPhase::NeedsRefresh);
        warn!(consecutive_failures = failures, "token refresh exhausted, keeping current token");

        Err(RefreshError::Exhausted {
            attempts,
            last: last_error
                .unwrap_or_else(|| TokenExchangeError::Http("no attempt was made".into())),
        })
    }

    fn apply_grant(
        &self,
        grant: TokenGrant,
        expires_at: DateTime<Utc>,
    ) -> Result<String, RefreshError> {
        let updated = {
            let mut state = self.state.lock();
            state.access_token = grant.access_token;
            if let Some(rotated) = grant.refresh_token {
                state.refresh_token = Some(rotated);
            }
            state.expires_at = Some(expires_at);
            state.consecutive_refresh_failures = 0;
            state.clone()
        };

        // The previous refresh token may already be revoked, so the new state is
        // adopted in memory even if the write fails.
        let persisted = save_json(self.repo.as_ref(), RECORD_KEY, &updated);

        let _ = self.lifecycle.transition(CredentialPhase::Fresh);
        self.token_tx.send_replace(updated.access_token.clone());
        info!(expires_at = %expires_at, "access token refreshed");

        match persisted {
            Ok(()) => Ok(updated.access_token),
            Err(e) => {
                warn!(error = %e, "refreshed credential not persisted");
                Err(RefreshError::Persist(e))
            }
        }
    }
}

/// An `expires_in` that cannot be represented as a timestamp is a malformed grant.
fn expiry_from(expires_in: u64) -> Result<DateTime<Utc>, TokenExchangeError> {
    i64::try_from(expires_in)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| {
            TokenExchangeError::Malformed(format!("expires_in {expires_in} is out of range"))
        })
}

fn expires_within(expires_at: Option<DateTime<Utc>>, margin: Duration) -> bool {
    match expires_at {
        None => true,
        Some(at) => {
            let remaining = at - Utc::now();
            match chrono::Duration::from_std(margin) {
                Ok(margin) => remaining <= margin,
                Err(_) => true,
            }
        }
    }
}
