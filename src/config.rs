use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::keymap::{Layout, LogicalKey};
use crate::timing::{KeySmashConfig, KeySmashMode, MAX_SPEED, MIN_SPEED, TimelineOptions};

pub const MAX_TRANSPOSE: i32 = 12;
pub const MIN_KEYSMASH_RATE: f64 = 1.0;
pub const MAX_KEYSMASH_RATE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub layout: Layout,
    pub transpose: i32,
    pub merge_nearby_notes: bool,
    pub merge_threshold_ms: f64,
    pub hold_notes: bool,
    pub fold_out_of_range: bool,
    pub playback_speed: f64,
    pub sink_timeout_ms: u64,
    pub keysmash_keys: BTreeSet<LogicalKey>,
    /// Keys per second.
    pub keysmash_speed: f64,
    pub keysmash_mode: KeySmashMode,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            layout: Layout::Qwerty,
            transpose: 0,
            merge_nearby_notes: false,
            merge_threshold_ms: 50.0,
            hold_notes: false,
            fold_out_of_range: false,
            playback_speed: 1.0,
            sink_timeout_ms: 50,
            keysmash_keys: LogicalKey::all().collect(),
            keysmash_speed: 10.0,
            keysmash_mode: KeySmashMode::Sequential,
        }
    }
}

impl PlayerConfig {
    /// A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ron_string = fs::read_to_string(path)?;
        let config: PlayerConfig = ron::from_str(&ron_string)?;
        Ok(config.clamped())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    /// Pulls every numeric setting back into its supported range.
    pub fn clamped(mut self) -> Self {
        self.transpose = self.transpose.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE);
        self.merge_threshold_ms = finite_or(self.merge_threshold_ms, 50.0).max(0.0);
        self.playback_speed = finite_or(self.playback_speed, 1.0).clamp(MIN_SPEED, MAX_SPEED);
        self.keysmash_speed =
            finite_or(self.keysmash_speed, 10.0).clamp(MIN_KEYSMASH_RATE, MAX_KEYSMASH_RATE);
        self
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms.max(1))
    }

    pub fn merge_window_ms(&self) -> f64 {
        if self.merge_nearby_notes {
            self.merge_threshold_ms
        } else {
            0.0
        }
    }

    pub fn timeline_options(&self, enabled_tracks: impl IntoIterator<Item = usize>) -> TimelineOptions {
        TimelineOptions {
            enabled_tracks: enabled_tracks.into_iter().collect(),
            transpose: self.transpose,
            merge_window_ms: self.merge_window_ms(),
            hold_style: self.hold_notes,
            fold_out_of_range: self.fold_out_of_range,
        }
    }

    pub fn keysmash_config(&self) -> KeySmashConfig {
        KeySmashConfig {
            selected_keys: self.keysmash_keys.clone(),
            rate_per_second: self.keysmash_speed,
            mode: self.keysmash_mode,
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}
