pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod keymap;
pub mod midi;
pub mod sender;
pub mod timing;

pub use config::PlayerConfig;
pub use engine::{EngineCommand, EngineUpdate, PlayerHandle, PlayerState, spawn_player};
pub use error::{ConfigError, KeySmashError, MidiError, PlaybackError, SendError};
pub use events::{ActionKind, DispatchAction, RawNoteEvent};
pub use keymap::{Layout, LogicalKey, map_pitch_to_key};
pub use midi::{Song, TrackInfo, load_song, load_song_file};
pub use sender::{
    DryRunSender, KeySender, RecordingSender, SentKey, TimedSender, XdotoolSender,
};
