//! Single-threaded readiness polling.
//!
//! Drivers register steps keyed by `(driver, device)`. Each call to
//! [`Scheduler::poll`] picks at most one ready step, rotating through the
//! registered entries so no step starves another.

use std::fmt;
use std::time::{Duration, Instant};

use crate::device::DeviceIndex;

/// Position of a driver within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(pub usize);

/// Identifies one acquisition stream: a device of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepKey {
    pub driver: DriverId,
    pub device: DeviceIndex,
}

impl StepKey {
    pub fn new(driver: DriverId, device: DeviceIndex) -> Self {
        Self { driver, device }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver {} device {}", self.driver.0, self.device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceToken(u64);

/// What wakes a step up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The device transport has bytes to read.
    Transport,
    /// Runs on every poll.
    AlwaysReady,
}

/// Why a step was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    /// The source stayed silent for its whole timeout.
    Timeout,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub token: SourceToken,
    pub key: StepKey,
    pub readiness: Readiness,
}

#[derive(Debug)]
struct Entry {
    token: SourceToken,
    key: StepKey,
    source: Source,
    timeout: Option<Duration>,
    last_activity: Instant,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
    next_token: u64,
    cursor: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. With a `timeout`, a transport source that stays
    /// unreadable that long is dispatched with [`Readiness::Timeout`].
    pub fn register(
        &mut self,
        key: StepKey,
        source: Source,
        timeout: Option<Duration>,
    ) -> SourceToken {
        let token = SourceToken(self.next_token);
        self.next_token += 1;
        log::debug!(
            "Registering {:?} source for {} (timeout {:?})",
            source,
            key,
            timeout
        );
        self.entries.push(Entry {
            token,
            key,
            source,
            timeout,
            last_activity: Instant::now(),
        });
        token
    }

    pub fn deregister(&mut self, token: SourceToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.token != token);
        before != self.entries.len()
    }

    /// Drop every step of one stream.
    pub fn deregister_key(&mut self, key: StepKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != key);
        before - self.entries.len()
    }

    pub fn is_registered(&self, token: SourceToken) -> bool {
        self.entries.iter().any(|entry| entry.token == token)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Find the next ready step. `readable` reports whether a transport-backed
    /// stream has data.
    pub fn poll(&mut self, readable: &mut dyn FnMut(StepKey) -> bool) -> Option<Dispatch> {
        self.poll_at(Instant::now(), readable)
    }

    fn poll_at(
        &mut self,
        now: Instant,
        readable: &mut dyn FnMut(StepKey) -> bool,
    ) -> Option<Dispatch> {
        let count = self.entries.len();
        for offset in 0..count {
            let position = (self.cursor + offset) % count;
            let entry = &mut self.entries[position];
            let readiness = match entry.source {
                Source::AlwaysReady => Some(Readiness::Ready),
                Source::Transport if readable(entry.key) => Some(Readiness::Readable),
                Source::Transport => entry
                    .timeout
                    .filter(|timeout| now.duration_since(entry.last_activity) >= *timeout)
                    .map(|_| Readiness::Timeout),
            };
            if let Some(readiness) = readiness {
                entry.last_activity = now;
                self.cursor = position + 1;
                return Some(Dispatch {
                    token: entry.token,
                    key: entry.key,
                    readiness,
                });
            }
        }
        None
    }
}
