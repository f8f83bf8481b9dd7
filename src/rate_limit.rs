//! Sliding-window admission control over two scopes: the whole process and each channel.
//! A channel admission must fit in both windows; a rejection records nothing anywhere.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::channel_config::normalize_channel;

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Global,
    Channel(&'a str),
}

#[derive(Default)]
struct Windows {
    global: VecDeque<Instant>,
    channels: HashMap<String, VecDeque<Instant>>,
}

pub struct RateLimiter {
    global_limit: usize,
    channel_limit: usize,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    /// Limits are admissions per trailing 60 seconds.
    pub fn new(global_limit: usize, channel_limit: usize) -> Self {
        Self {
            global_limit,
            channel_limit,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn admit(&self, scope: Scope<'_>) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let Windows { global, channels } = &mut *windows;

        if !has_room(global, self.global_limit, now) {
            return false;
        }

        match scope {
            Scope::Global => {
                global.push_back(now);
                true
            }
            Scope::Channel(channel) => {
                let window = channels.entry(normalize_channel(channel)).or_default();
                if !has_room(window, self.channel_limit, now) {
                    return false;
                }
                global.push_back(now);
                window.push_back(now);
                true
            }
        }
    }

    /// Admissions currently counted against `scope`.
    pub fn in_window(&self, scope: Scope<'_>) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match scope {
            Scope::Global => {
                purge(&mut windows.global, now);
                windows.global.len()
            }
            Scope::Channel(channel) => match windows.channels.get_mut(&normalize_channel(channel)) {
                Some(window) => {
                    purge(window, now);
                    window.len()
                }
                None => 0,
            },
        }
    }
}

fn has_room(window: &mut VecDeque<Instant>, limit: usize, now: Instant) -> bool {
    purge(window, now);
    window.len() < limit
}

fn purge(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&oldest) = window.front() {
        if now.duration_since(oldest) >= WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}
