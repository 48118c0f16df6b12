mod keysmash;
mod scheduler;
mod timeline;

pub use keysmash::{KeySmashConfig, KeySmashGenerator, KeySmashMode};
pub use scheduler::{
    MAX_SPEED, MIN_SPEED, PlaybackSnapshot, PlaybackStatus, Scheduler, TickReport,
};
pub use timeline::{BuildStats, PlaybackTimeline, TimelineOptions, build};
