use serde::{Deserialize, Serialize};

use crate::keymap::LogicalKey;

/// One note as handed over by the MIDI parser, already in absolute milliseconds.
///
/// Offsets and durations are always finite and non-negative; anything else is
/// pulled to zero on construction, including when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "NoteFields")]
pub struct RawNoteEvent {
    track_index: usize,
    pitch: u8,
    on_offset_ms: f64,
    duration_ms: f64,
}

#[derive(Deserialize)]
struct NoteFields {
    track_index: usize,
    pitch: u8,
    on_offset_ms: f64,
    duration_ms: f64,
}

impl From<NoteFields> for RawNoteEvent {
    fn from(fields: NoteFields) -> Self {
        RawNoteEvent::new(
            fields.track_index,
            fields.pitch,
            fields.on_offset_ms,
            fields.duration_ms,
        )
    }
}

fn sanitize_ms(ms: f64) -> f64 {
    if ms.is_finite() { ms.max(0.0) } else { 0.0 }
}

impl RawNoteEvent {
    pub fn new(track_index: usize, pitch: u8, on_offset_ms: f64, duration_ms: f64) -> Self {
        Self {
            track_index,
            pitch,
            on_offset_ms: sanitize_ms(on_offset_ms),
            duration_ms: sanitize_ms(duration_ms),
        }
    }

    pub fn track_index(&self) -> usize {
        self.track_index
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    pub fn on_offset_ms(&self) -> f64 {
        self.on_offset_ms
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn off_offset_ms(&self) -> f64 {
        self.on_offset_ms + self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Tap,
    Press,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchAction {
    /// Milliseconds from timeline start at 1.0x speed.
    pub offset_ms: f64,
    pub key: LogicalKey,
    pub kind: ActionKind,
}

impl DispatchAction {
    pub fn tap(offset_ms: f64, key: LogicalKey) -> Self {
        Self {
            offset_ms,
            key,
            kind: ActionKind::Tap,
        }
    }

    pub fn press(offset_ms: f64, key: LogicalKey) -> Self {
        Self {
            offset_ms,
            key,
            kind: ActionKind::Press,
        }
    }

    pub fn release(offset_ms: f64, key: LogicalKey) -> Self {
        Self {
            offset_ms,
            key,
            kind: ActionKind::Release,
        }
    }
}
