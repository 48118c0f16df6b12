use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeySmashError;
use crate::events::DispatchAction;
use crate::keymap::LogicalKey;

/// Intervals older than this are dropped rather than fired in a burst after a
/// stalled tick.
const MAX_BACKLOG_INTERVALS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeySmashMode {
    #[default]
    Sequential,
    Random,
    Chord,
}

impl fmt::Display for KeySmashMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeySmashMode::Sequential => "sequential",
            KeySmashMode::Random => "random",
            KeySmashMode::Chord => "chord",
        })
    }
}

impl FromStr for KeySmashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(KeySmashMode::Sequential),
            "random" => Ok(KeySmashMode::Random),
            "chord" => Ok(KeySmashMode::Chord),
            _ => Err(format!("unknown key smash mode '{s}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySmashConfig {
    pub selected_keys: BTreeSet<LogicalKey>,
    pub rate_per_second: f64,
    pub mode: KeySmashMode,
}

impl KeySmashConfig {
    pub fn validate(&self) -> Result<(), KeySmashError> {
        if self.selected_keys.is_empty() {
            return Err(KeySmashError::NoKeysSelected);
        }
        if !self.rate_per_second.is_finite() || self.rate_per_second <= 0.0 {
            return Err(KeySmashError::InvalidRate(self.rate_per_second));
        }
        Ok(())
    }

    pub fn interval_ms(&self) -> f64 {
        1000.0 / self.rate_per_second
    }
}

/// Endless source of taps, produced on demand one tick at a time.
///
/// The generator keeps its own clock: each call to
/// [`next_batch`](Self::next_batch) advances it and returns the taps for every
/// interval boundary crossed. The config is read per interval, so edits apply
/// from the next boundary on.
#[derive(Debug, Clone)]
pub struct KeySmashGenerator {
    rng: fastrand::Rng,
    clock_ms: f64,
    next_emit_ms: f64,
    next_index: usize,
}

impl Default for KeySmashGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySmashGenerator {
    pub fn new() -> Self {
        Self::with_rng(fastrand::Rng::new())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(fastrand::Rng::with_seed(seed))
    }

    fn with_rng(rng: fastrand::Rng) -> Self {
        Self {
            rng,
            clock_ms: 0.0,
            next_emit_ms: 0.0,
            next_index: 0,
        }
    }

    /// Starts over; the next call fires immediately.
    pub fn restart(&mut self) {
        self.clock_ms = 0.0;
        self.next_emit_ms = 0.0;
        self.next_index = 0;
    }

    /// Milliseconds until the next interval boundary.
    pub fn ms_until_next(&self) -> f64 {
        (self.next_emit_ms - self.clock_ms).max(0.0)
    }

    pub fn next_batch(
        &mut self,
        since_last_tick_ms: f64,
        config: &KeySmashConfig,
    ) -> Vec<DispatchAction> {
        let mut batch = Vec::new();
        if config.validate().is_err() {
            return batch;
        }
        let interval = config.interval_ms();

        self.clock_ms += since_last_tick_ms.max(0.0);
        let backlog_limit = self.clock_ms - interval * MAX_BACKLOG_INTERVALS;
        if self.next_emit_ms < backlog_limit {
            let skipped = ((backlog_limit - self.next_emit_ms) / interval).ceil();
            self.next_emit_ms += skipped * interval;
        }

        while self.next_emit_ms <= self.clock_ms {
            self.emit(self.next_emit_ms, config, &mut batch);
            self.next_emit_ms += interval;
        }
        batch
    }

    fn emit(&mut self, offset_ms: f64, config: &KeySmashConfig, batch: &mut Vec<DispatchAction>) {
        let keys = &config.selected_keys;
        match config.mode {
            KeySmashMode::Sequential => {
                let index = self.next_index % keys.len();
                self.next_index = index + 1;
                if let Some(&key) = keys.iter().nth(index) {
                    batch.push(DispatchAction::tap(offset_ms, key));
                }
            }
            KeySmashMode::Random => {
                let index = self.rng.usize(..keys.len());
                if let Some(&key) = keys.iter().nth(index) {
                    batch.push(DispatchAction::tap(offset_ms, key));
                }
            }
            KeySmashMode::Chord => {
                batch.extend(keys.iter().map(|&key| DispatchAction::tap(offset_ms, key)));
            }
        }
    }
}
