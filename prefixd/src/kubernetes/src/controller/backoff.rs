use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use kube::{Resource, ResourceExt};

/// Per-requester exponential backoff.
///
/// Each key remembers how many times in a row it was told to wait. The delay doubles
/// with every failure, starting at `initial` and never exceeding `max`.
/// Entries live in memory only and are dropped with [`Backoff::forget`].
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    attempts: u32,
    until: Instant,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key<K: Resource<DynamicType = ()>>(resource: &K) -> String {
        format!(
            "{}/{}/{}",
            K::kind(&()),
            resource.namespace().unwrap_or_default(),
            resource.name_any()
        )
    }

    /// Time left before `key` may retry, if it is still backing off.
    pub fn remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .map(|e| e.until.saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Registers a failure of `key` and returns how long it has to wait.
    pub fn next(&self, key: &str, now: Instant) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = entries.get(key).map(|e| e.attempts).unwrap_or(0);
        let delay = self.delay(attempts);
        entries.insert(
            key.to_string(),
            Entry {
                attempts: attempts.saturating_add(1),
                until: now + delay,
            },
        );
        delay
    }

    pub fn forget(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn delay(&self, attempts: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempts))
            .min(self.max)
    }
}
