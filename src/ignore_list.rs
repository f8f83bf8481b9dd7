//! Bot-wide ignore list. Users on it are never auto-translated in any channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::channel_config::normalize_user;
use crate::storage::{load_or_init, save_json, Repository, StoreError};

const RECORD_KEY: &str = "ignored_users";

pub struct IgnoreList {
    repo: Arc<dyn Repository>,
    users: Mutex<BTreeSet<String>>,
}

impl IgnoreList {
    /// Load the persisted list. A corrupt record is quarantined and replaced by an empty list.
    pub fn open(repo: Arc<dyn Repository>) -> Result<Self, StoreError> {
        let (users, recovery) = load_or_init(repo.as_ref(), RECORD_KEY, BTreeSet::new)?;
        info!(count = users.len(), ?recovery, "ignore list loaded");
        Ok(Self {
            repo,
            users: Mutex::new(users),
        })
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.lock().contains(&normalize_user(user))
    }

    /// Returns false if the user was already ignored.
    pub fn add(&self, user: &str) -> Result<bool, StoreError> {
        let user = normalize_user(user);
        self.mutate(|users| users.insert(user))
    }

    /// Returns false if the user was not ignored.
    pub fn remove(&self, user: &str) -> Result<bool, StoreError> {
        let user = normalize_user(user);
        self.mutate(|users| users.remove(&user))
    }

    /// Sorted snapshot.
    pub fn list(&self) -> Vec<String> {
        self.users.lock().iter().cloned().collect()
    }

    fn mutate<F>(&self, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let mut users = self.users.lock();
        let mut next = users.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        if let Err(e) = save_json(self.repo.as_ref(), RECORD_KEY, &next) {
            warn!(error = %e, "ignore list write failed");
            return Err(e);
        }
        *users = next;
        Ok(true)
    }
}
