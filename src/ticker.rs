//! Client-side ttl countdown.
//!
//! The [`ExpiryTicker`] only keeps time; [`age_keys`] is the pass that runs
//! on every tick. A key whose countdown reaches zero is never removed
//! locally: it is reported as expiring, and the server asks the backend for
//! the authoritative ttl.

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::mirror::DatabaseMirror;
use crate::types::{Key, Ttl};

/// A repeating timer bound to a connection's lifetime.
pub struct ExpiryTicker {
    interval: Duration,
    running: Option<Running>,
    carry: Duration,
}

struct Running {
    ticks: Receiver<Instant>,
    last: Instant,
}

impl ExpiryTicker {
    /// A stopped ticker firing every `interval` once started.
    pub fn new(interval: Duration) -> Self {
        ExpiryTicker {
            interval,
            running: None,
            carry: Duration::ZERO,
        }
    }

    /// Start firing. No-op when running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        log::debug!("expiry ticker started, interval {:?}", self.interval);
        self.carry = Duration::ZERO;
        self.running = Some(Running {
            ticks: crossbeam_channel::tick(self.interval),
            last: Instant::now(),
        });
    }

    /// Stop firing. Ticks not yet consumed are dropped with the channel.
    pub fn stop(&mut self) {
        if self.running.take().is_some() {
            log::debug!("expiry ticker stopped");
        }
    }

    /// Whether the ticker is firing.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Channel of tick instants, one that never fires when stopped.
    pub(crate) fn receiver(&self) -> Receiver<Instant> {
        match &self.running {
            Some(running) => running.ticks.clone(),
            None => crossbeam_channel::never(),
        }
    }

    /// Whole seconds elapsed since the previous tick; the remainder carries
    /// over to the next one.
    pub(crate) fn elapsed_secs(&mut self, now: Instant) -> u64 {
        let Some(running) = self.running.as_mut() else {
            return 0;
        };
        self.carry += now.saturating_duration_since(running.last);
        running.last = now;
        let secs = self.carry.as_secs();
        self.carry -= Duration::from_secs(secs);
        secs
    }
}

/// What one aging pass did to a database.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgingOutcome {
    /// Keys that were already expired and have been removed.
    pub removed: Vec<Key>,
    /// Keys whose ttl was decremented, carrying the new ttl.
    pub changed: Vec<Key>,
    /// Keys whose countdown ran out; left untouched pending confirmation.
    pub expiring: Vec<Key>,
}

/// Age every key of `db` by `elapsed` seconds.
pub fn age_keys(db: &mut DatabaseMirror, elapsed: u64) -> AgingOutcome {
    let mut outcome = AgingOutcome::default();
    if elapsed == 0 {
        return outcome;
    }
    let mut keys: Vec<Key> = db.keys().map(|kv| kv.key.clone()).collect();
    keys.sort_by(|a, b| a.name.cmp(&b.name));
    for key in keys {
        match key.ttl {
            Ttl::NoExpiry => {}
            Ttl::Expired => {
                if db.remove_key(&key.name) {
                    outcome.removed.push(key);
                }
            }
            Ttl::Remaining(secs) if secs > elapsed => {
                let ttl = Ttl::Remaining(secs - elapsed);
                if db.update_key_ttl(&key.name, ttl) {
                    outcome.changed.push(Key::with_ttl(key.name, ttl));
                }
            }
            Ttl::Remaining(_) => outcome.expiring.push(key),
        }
    }
    outcome
}
