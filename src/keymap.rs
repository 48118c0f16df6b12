//! Pitch to instrument key mapping.
//!
//! The lyre has 21 playable positions laid out in three rows of seven diatonic
//! notes (C3-B3, C4-B4, C5-B5). A [`LogicalKey`] names one of those positions
//! independent of the keyboard layout; a [`Layout`] only decides which physical
//! key gets pressed for it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const KEY_COUNT: usize = 21;

/// MIDI pitch of every logical key, lowest row first.
const KEY_PITCHES: [u8; KEY_COUNT] = [
    48, 50, 52, 53, 55, 57, 59, // C3-B3
    60, 62, 64, 65, 67, 69, 71, // C4-B4
    72, 74, 76, 77, 79, 81, 83, // C5-B5
];

const NOTE_NAMES: [&str; KEY_COUNT] = [
    "C3", "D3", "E3", "F3", "G3", "A3", "B3", //
    "C4", "D4", "E4", "F4", "G4", "A4", "B4", //
    "C5", "D5", "E5", "F5", "G5", "A5", "B5",
];

const LOWEST_PITCH: i64 = KEY_PITCHES[0] as i64;
const HIGHEST_PITCH: i64 = KEY_PITCHES[KEY_COUNT - 1] as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LogicalKey(u8);

impl LogicalKey {
    pub fn new(index: usize) -> Option<Self> {
        (index < KEY_COUNT).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = LogicalKey> {
        (0..KEY_COUNT as u8).map(LogicalKey)
    }

    pub fn pitch(self) -> u8 {
        KEY_PITCHES[self.index()]
    }

    pub fn note_name(self) -> &'static str {
        NOTE_NAMES[self.index()]
    }
}

impl TryFrom<u8> for LogicalKey {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        LogicalKey::new(value as usize).ok_or_else(|| format!("no lyre key with index {value}"))
    }
}

impl From<LogicalKey> for u8 {
    fn from(key: LogicalKey) -> Self {
        key.0
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.note_name())
    }
}

/// Maps a pitch to its instrument key after transposition.
///
/// Returns `None` for anything the lyre can't play, including chromatic notes
/// inside the range. Callers drop those events.
pub fn map_pitch_to_key(pitch: u8, transpose_semitones: i32) -> Option<LogicalKey> {
    lookup(transposed(pitch, transpose_semitones))
}

/// Like [`map_pitch_to_key`], but diatonic pitches outside the three octaves
/// are shifted by whole octaves until they land on the instrument.
pub fn map_pitch_to_key_folded(pitch: u8, transpose_semitones: i32) -> Option<LogicalKey> {
    let shifted = transposed(pitch, transpose_semitones);
    let folded = if shifted > HIGHEST_PITCH {
        shifted - (shifted - HIGHEST_PITCH + 11) / 12 * 12
    } else if shifted < LOWEST_PITCH {
        shifted + (LOWEST_PITCH - shifted + 11) / 12 * 12
    } else {
        shifted
    };
    lookup(folded)
}

/// Wide enough that no `u8` pitch and `i32` transpose can overflow.
fn transposed(pitch: u8, transpose_semitones: i32) -> i64 {
    i64::from(pitch) + i64::from(transpose_semitones)
}

fn lookup(pitch: i64) -> Option<LogicalKey> {
    let pitch = u8::try_from(pitch).ok()?;
    KEY_PITCHES
        .iter()
        .position(|&p| p == pitch)
        .map(|index| LogicalKey(index as u8))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    Qwerty,
    Qwertz,
    Azerty,
    Dvorak,
}

const QWERTY_KEYS: [&str; KEY_COUNT] = [
    "z", "x", "c", "v", "b", "n", "m", //
    "a", "s", "d", "f", "g", "h", "j", //
    "q", "w", "e", "r", "t", "y", "u",
];

const QWERTZ_KEYS: [&str; KEY_COUNT] = [
    "y", "x", "c", "v", "b", "n", "m", //
    "a", "s", "d", "f", "g", "h", "j", //
    "q", "w", "e", "r", "t", "z", "u",
];

const AZERTY_KEYS: [&str; KEY_COUNT] = [
    "w", "x", "c", "v", "b", "n", "comma", //
    "q", "s", "d", "f", "g", "h", "j", //
    "a", "z", "e", "r", "t", "y", "u",
];

const DVORAK_KEYS: [&str; KEY_COUNT] = [
    "semicolon", "q", "j", "k", "x", "b", "m", //
    "a", "o", "e", "u", "i", "d", "h", //
    "apostrophe", "comma", "period", "p", "y", "f", "g",
];

impl Layout {
    pub const ALL: [Layout; 4] = [Layout::Qwerty, Layout::Qwertz, Layout::Azerty, Layout::Dvorak];

    pub fn name(self) -> &'static str {
        match self {
            Layout::Qwerty => "QWERTY",
            Layout::Qwertz => "QWERTZ",
            Layout::Azerty => "AZERTY",
            Layout::Dvorak => "DVORAK",
        }
    }

    fn keys(self) -> &'static [&'static str; KEY_COUNT] {
        match self {
            Layout::Qwerty => &QWERTY_KEYS,
            Layout::Qwertz => &QWERTZ_KEYS,
            Layout::Azerty => &AZERTY_KEYS,
            Layout::Dvorak => &DVORAK_KEYS,
        }
    }

    /// Key name understood by the injection tool (xdotool keysym names).
    pub fn physical_key(self, key: LogicalKey) -> &'static str {
        self.keys()[key.index()]
    }

    /// Reverse lookup, used when the user picks keys by their keyboard letter.
    pub fn logical_key(self, physical: &str) -> Option<LogicalKey> {
        self.keys()
            .iter()
            .position(|k| k.eq_ignore_ascii_case(physical))
            .and_then(LogicalKey::new)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layout::ALL
            .into_iter()
            .find(|layout| layout.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown keyboard layout '{s}'"))
    }
}
