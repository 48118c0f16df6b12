use std::time::Duration;

use thiserror::Error;

use crate::timing::PlaybackStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("cannot {command} while {status}")]
    InvalidTransition {
        command: &'static str,
        status: PlaybackStatus,
    },

    #[error("speed multiplier must be a positive number, got {0}")]
    InvalidSpeed(f64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    /// The injection facility is missing altogether.
    #[error("key injection unavailable: {0}")]
    Unavailable(String),

    #[error("key injection failed: {0}")]
    Failed(String),

    #[error("key injection did not answer within {0:?}")]
    TimedOut(Duration),

    #[error("key injection worker is gone")]
    Disconnected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeySmashError {
    #[error("no keys selected")]
    NoKeysSelected,

    #[error("rate must be a positive number of keys per second, got {0}")]
    InvalidRate(f64),
}

#[derive(Error, Debug)]
pub enum MidiError {
    #[error("failed to read MIDI file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse MIDI data: {0}")]
    Parse(#[from] midly::Error),

    #[error("only metrical timing is supported")]
    UnsupportedTiming,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] ron::Error),
}
