use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::PlaybackTimeline;
use crate::error::PlaybackError;
use crate::events::{ActionKind, DispatchAction};
use crate::keymap::LogicalKey;
use crate::sender::KeySender;

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaybackStatus::Stopped => "stopped",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
        })
    }
}

/// Read-only view of the scheduler, published after every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub status: PlaybackStatus,
    pub cursor_offset_ms: f64,
    pub total_duration_ms: f64,
    pub speed: f64,
    pub held_keys: Vec<LogicalKey>,
    pub dispatched: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    /// The cursor ran off the end and playback stopped on its own.
    pub finished: bool,
}

/// Walks a [`PlaybackTimeline`] against the wall clock.
///
/// Time is always passed in, so the scheduler never reads a clock itself. The
/// performance-time position is `origin_position_ms` plus the wall time since
/// `origin_instant` scaled by `speed`; pausing, seeking and speed changes all
/// re-anchor that pair instead of touching the cursor.
#[derive(Debug)]
pub struct Scheduler {
    timeline: Arc<PlaybackTimeline>,
    cursor: usize,
    status: PlaybackStatus,
    speed: f64,
    origin_position_ms: f64,
    /// Only set while playing.
    origin_instant: Option<Instant>,
    held: BTreeSet<LogicalKey>,
    dispatched: u64,
    failed: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            timeline: Arc::new(PlaybackTimeline::default()),
            cursor: 0,
            status: PlaybackStatus::Stopped,
            speed: 1.0,
            origin_position_ms: 0.0,
            origin_instant: None,
            held: BTreeSet::new(),
            dispatched: 0,
            failed: 0,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn timeline(&self) -> &Arc<PlaybackTimeline> {
        &self.timeline
    }

    pub fn held_keys(&self) -> impl Iterator<Item = LogicalKey> + '_ {
        self.held.iter().copied()
    }

    pub fn position_ms(&self, now: Instant) -> f64 {
        match self.origin_instant {
            Some(origin) if self.status == PlaybackStatus::Playing => {
                let wall = now.saturating_duration_since(origin);
                let wall_ms = wall.as_nanos() as f64 / 1_000_000.0;
                self.origin_position_ms + wall_ms * self.speed
            }
            _ => self.origin_position_ms,
        }
    }

    pub fn load(&mut self, timeline: Arc<PlaybackTimeline>) -> Result<(), PlaybackError> {
        self.require(&[PlaybackStatus::Stopped], "load")?;
        info!(actions = timeline.len(), "timeline loaded");
        self.timeline = timeline;
        self.cursor = 0;
        self.origin_position_ms = 0.0;
        Ok(())
    }

    pub fn play(&mut self, now: Instant) -> Result<(), PlaybackError> {
        self.require(&[PlaybackStatus::Stopped, PlaybackStatus::Paused], "play")?;
        if self.timeline.is_empty() {
            debug!("nothing to play");
            self.status = PlaybackStatus::Stopped;
            return Ok(());
        }
        self.origin_instant = Some(now);
        self.status = PlaybackStatus::Playing;
        info!(position_ms = self.origin_position_ms, speed = self.speed, "playing");
        Ok(())
    }

    /// Freezes dispatch. Held keys stay down so the instrument keeps sounding.
    pub fn pause(&mut self, now: Instant) -> Result<(), PlaybackError> {
        self.require(&[PlaybackStatus::Playing], "pause")?;
        self.origin_position_ms = self.position_ms(now);
        self.origin_instant = None;
        self.status = PlaybackStatus::Paused;
        info!(position_ms = self.origin_position_ms, "paused");
        Ok(())
    }

    /// Legal from any state. Every held key gets exactly one release.
    pub fn stop(&mut self, sink: &mut dyn KeySender) {
        self.release_all(sink);
        self.cursor = 0;
        self.origin_position_ms = 0.0;
        self.origin_instant = None;
        if self.status != PlaybackStatus::Stopped {
            info!("stopped");
        }
        self.status = PlaybackStatus::Stopped;
    }

    /// Moves the cursor to the first action at or after `target_ms`.
    ///
    /// A held key stays down only if the actions before the new cursor leave it
    /// pressed; everything else is released right away.
    pub fn seek(
        &mut self,
        target_ms: f64,
        now: Instant,
        sink: &mut dyn KeySender,
    ) -> Result<(), PlaybackError> {
        self.require(&[PlaybackStatus::Playing, PlaybackStatus::Paused], "seek")?;
        let target_ms = target_ms.clamp(0.0, self.timeline.duration_ms());
        let new_cursor = self.timeline.first_at_or_after(target_ms);

        let mut down_at_target = BTreeSet::new();
        for action in &self.timeline.actions()[..new_cursor] {
            match action.kind {
                ActionKind::Press => {
                    down_at_target.insert(action.key);
                }
                ActionKind::Release => {
                    down_at_target.remove(&action.key);
                }
                ActionKind::Tap => {}
            }
        }

        let stale: Vec<LogicalKey> = self.held.difference(&down_at_target).copied().collect();
        for key in stale {
            self.held.remove(&key);
            self.send(key, ActionKind::Release, sink);
        }

        self.cursor = new_cursor;
        self.origin_position_ms = target_ms;
        if self.status == PlaybackStatus::Playing {
            self.origin_instant = Some(now);
        }
        info!(target_ms, cursor = new_cursor, "seeked");
        Ok(())
    }

    /// Returns the multiplier actually applied after clamping.
    pub fn set_speed(&mut self, multiplier: f64, now: Instant) -> Result<f64, PlaybackError> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(PlaybackError::InvalidSpeed(multiplier));
        }
        let speed = multiplier.clamp(MIN_SPEED, MAX_SPEED);
        if self.status == PlaybackStatus::Playing {
            self.origin_position_ms = self.position_ms(now);
            self.origin_instant = Some(now);
        }
        self.speed = speed;
        debug!(speed, "speed changed");
        Ok(speed)
    }

    /// Dispatches every action that is due at `now`, in order.
    pub fn tick(&mut self, now: Instant, sink: &mut dyn KeySender) -> TickReport {
        let mut report = TickReport::default();
        if self.status != PlaybackStatus::Playing {
            return report;
        }

        let elapsed_ms = self.position_ms(now);
        let timeline = Arc::clone(&self.timeline);
        while let Some(action) = timeline.get(self.cursor) {
            if action.offset_ms > elapsed_ms {
                break;
            }
            self.dispatch(action, sink);
            self.cursor += 1;
            report.dispatched += 1;
        }

        if self.cursor >= timeline.len() {
            trace!("reached end of timeline");
            self.stop(sink);
            report.finished = true;
        }
        report
    }

    /// Wall time until the next action is due, or `None` when not playing.
    pub fn next_due_in(&self, now: Instant) -> Option<Duration> {
        if self.status != PlaybackStatus::Playing {
            return None;
        }
        let action = self.timeline.get(self.cursor)?;
        let wait_ms = ((action.offset_ms - self.position_ms(now)) / self.speed).max(0.0);
        // offsets past what a Duration can hold just mean "not any time soon"
        Some(Duration::try_from_secs_f64(wait_ms / 1000.0).unwrap_or(Duration::MAX))
    }

    pub fn snapshot(&self, now: Instant) -> PlaybackSnapshot {
        let total_duration_ms = self.timeline.duration_ms();
        PlaybackSnapshot {
            status: self.status,
            cursor_offset_ms: self.position_ms(now).min(total_duration_ms),
            total_duration_ms,
            speed: self.speed,
            held_keys: self.held.iter().copied().collect(),
            dispatched: self.dispatched,
            failed: self.failed,
        }
    }

    fn require(
        &self,
        allowed: &[PlaybackStatus],
        command: &'static str,
    ) -> Result<(), PlaybackError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(PlaybackError::InvalidTransition {
                command,
                status: self.status,
            })
        }
    }

    fn dispatch(&mut self, action: &DispatchAction, sink: &mut dyn KeySender) {
        match action.kind {
            ActionKind::Tap => self.send(action.key, ActionKind::Tap, sink),
            ActionKind::Press => {
                if !self.held.insert(action.key) {
                    // already down: lift it first so it can't stick
                    self.send(action.key, ActionKind::Release, sink);
                }
                self.send(action.key, ActionKind::Press, sink);
            }
            ActionKind::Release => {
                if self.held.remove(&action.key) {
                    self.send(action.key, ActionKind::Release, sink);
                } else {
                    trace!(key = %action.key, "release for a key that is not held");
                }
            }
        }
    }

    fn release_all(&mut self, sink: &mut dyn KeySender) {
        for key in std::mem::take(&mut self.held) {
            self.send(key, ActionKind::Release, sink);
        }
    }

    /// One attempt, no retry: a late key press is worse than a missing one.
    fn send(&mut self, key: LogicalKey, kind: ActionKind, sink: &mut dyn KeySender) {
        match sink.send(key, kind) {
            Ok(()) => {
                self.dispatched += 1;
                debug!(%key, ?kind, "dispatched");
            }
            Err(e) => {
                self.failed += 1;
                warn!(%key, ?kind, error = %e, "dispatch failed");
            }
        }
    }
}
