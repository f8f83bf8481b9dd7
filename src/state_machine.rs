//! Credential lifecycle: Fresh → NeedsRefresh → Refreshing → Fresh | NeedsRefresh.
//! Transitions are validated and logged.

use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CredentialPhase {
    /// Expiry known and outside the look-ahead margin.
    Fresh,
    /// Inside the margin, or expiry unknown.
    NeedsRefresh,
    Refreshing,
}

impl fmt::Display for CredentialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialPhase::Fresh => write!(f, "Fresh"),
            CredentialPhase::NeedsRefresh => write!(f, "NeedsRefresh"),
            CredentialPhase::Refreshing => write!(f, "Refreshing"),
        }
    }
}

impl CredentialPhase {
    pub fn can_transition_to(self, next: CredentialPhase) -> bool {
        use CredentialPhase::*;
        matches!(
            (self, next),
            (Fresh, NeedsRefresh)
                | (Fresh, Refreshing) // manual refresh
                | (NeedsRefresh, Refreshing)
                | (Refreshing, Fresh)
                | (Refreshing, NeedsRefresh) // all attempts failed
        )
    }
}

/// Thread-safe phase holder.
pub struct CredentialLifecycle {
    phase: RwLock<CredentialPhase>,
}

impl CredentialLifecycle {
    pub fn new(initial: CredentialPhase) -> Self {
        Self {
            phase: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> CredentialPhase {
        *self.phase.read()
    }

    /// Attempt a transition. A no-op transition to the current phase succeeds.
    pub fn transition(&self, next: CredentialPhase) -> Result<CredentialPhase, String> {
        let mut phase = self.phase.write();
        let current = *phase;
        if current == next {
            return Ok(next);
        }
        if !current.can_transition_to(next) {
            let msg = format!("invalid credential transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *phase = next;
        info!(from = %current, to = %next, "credential_phase");
        Ok(next)
    }
}
