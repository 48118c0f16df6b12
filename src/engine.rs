use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::{MAX_TRANSPOSE, PlayerConfig};
use crate::events::ActionKind;
use crate::keymap::Layout;
use crate::midi::Song;
use crate::sender::KeySender;
use crate::timing::{
    self, BuildStats, KeySmashConfig, KeySmashGenerator, PlaybackSnapshot, PlaybackStatus,
    PlaybackTimeline, Scheduler, TimelineOptions,
};

/// Longest the engine sleeps while something is running, so the published
/// position keeps moving between sparse actions.
const MAX_WAKE: Duration = Duration::from_millis(16);

#[derive(Debug, Clone)]
pub enum EngineCommand {
    LoadSong(Song),
    LoadTimeline(Arc<PlaybackTimeline>),
    Play,
    Pause,
    Stop,
    Seek(f64),
    SetSpeed(f64),
    SetTranspose(i32),
    SetTrackEnabled { index: usize, enabled: bool },
    SetMergeWindow(f64),
    SetHoldStyle(bool),
    SetLayout(Layout),
    StartKeySmash(KeySmashConfig),
    UpdateKeySmash(KeySmashConfig),
    StopKeySmash,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    Loaded {
        name: Option<String>,
        actions: usize,
        duration_ms: f64,
        stats: BuildStats,
    },
    Status(PlaybackStatus),
    Finished,
    KeySmash { running: bool },
    /// The key sink is missing; playback goes on but every key fails.
    Degraded { reason: String },
    Rejected {
        command: &'static str,
        reason: String,
    },
    Error { message: String },
}

/// Everything a front end needs to draw, replaced wholesale after every
/// command and tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub playback: PlaybackSnapshot,
    pub song_name: Option<String>,
    pub options: TimelineOptions,
    pub stats: BuildStats,
    pub layout: Layout,
    /// Option changes made mid-playback, applied on the next stop.
    pub rebuild_pending: bool,
    pub key_smash_running: bool,
    pub key_smash_dispatched: u64,
    pub key_smash_failed: u64,
    pub degraded: Option<String>,
}

pub struct PlayerHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    pub snapshot: Arc<ArcSwap<PlayerState>>,
    thread: Option<JoinHandle<()>>,
}

impl PlayerHandle {
    pub fn send(&self, command: EngineCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("player thread is gone, command dropped");
        }
    }

    pub fn state(&self) -> Arc<PlayerState> {
        self.snapshot.load_full()
    }

    /// Stops everything, releases held keys and waits for the thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("player thread panicked");
            }
        }
    }
}

pub fn spawn_player<S: KeySender + 'static>(sender: S, config: &PlayerConfig) -> PlayerHandle {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let engine = Engine::new(sender, config, update_tx);
    let snapshot = Arc::clone(&engine.snapshot);

    let thread = thread::Builder::new()
        .name("lyre-player".to_string())
        .spawn(move || engine.run(command_rx));
    let thread = match thread {
        Ok(thread) => Some(thread),
        Err(e) => {
            warn!(error = %e, "could not start player thread");
            None
        }
    };

    PlayerHandle {
        command_tx,
        update_rx,
        snapshot,
        thread,
    }
}

struct KeySmashRun {
    config: KeySmashConfig,
    generator: KeySmashGenerator,
    last_tick: Instant,
}

struct Engine<S> {
    sink: S,
    scheduler: Scheduler,
    song: Option<Song>,
    options: TimelineOptions,
    layout: Layout,
    pending_layout: Option<Layout>,
    rebuild_pending: bool,
    key_smash: Option<KeySmashRun>,
    key_smash_dispatched: u64,
    key_smash_failed: u64,
    degraded: Option<String>,
    updates: Sender<EngineUpdate>,
    snapshot: Arc<ArcSwap<PlayerState>>,
}

impl<S: KeySender> Engine<S> {
    fn new(mut sink: S, config: &PlayerConfig, updates: Sender<EngineUpdate>) -> Self {
        sink.set_layout(config.layout);
        let mut scheduler = Scheduler::new();
        if let Err(e) = scheduler.set_speed(config.playback_speed, Instant::now()) {
            warn!(error = %e, "ignoring configured playback speed");
        }

        let mut engine = Self {
            sink,
            scheduler,
            song: None,
            options: config.timeline_options(std::iter::empty()),
            layout: config.layout,
            pending_layout: None,
            rebuild_pending: false,
            key_smash: None,
            key_smash_dispatched: 0,
            key_smash_failed: 0,
            degraded: None,
            updates,
            snapshot: Arc::new(ArcSwap::from_pointee(PlayerState {
                playback: PlaybackSnapshot::default(),
                song_name: None,
                options: config.timeline_options(std::iter::empty()),
                stats: BuildStats::default(),
                layout: config.layout,
                rebuild_pending: false,
                key_smash_running: false,
                key_smash_dispatched: 0,
                key_smash_failed: 0,
                degraded: None,
            })),
        };
        engine.publish(Instant::now());
        engine
    }

    fn run(mut self, commands: Receiver<EngineCommand>) {
        info!("player thread started");
        loop {
            let command = match self.wake_in(Instant::now()) {
                Some(wait) => match commands.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(EngineCommand::Shutdown) => break,
                Some(command) => self.handle(command, Instant::now()),
                None => {}
            }

            let now = Instant::now();
            self.tick(now);
            self.publish(now);
        }

        self.stop_key_smash();
        self.scheduler.stop(&mut self.sink);
        self.publish(Instant::now());
        info!("player thread finished");
    }

    /// How long to wait for a command before the next tick; `None` blocks.
    fn wake_in(&self, now: Instant) -> Option<Duration> {
        if let Some(run) = &self.key_smash {
            let due_ms = run
                .generator
                .ms_until_next()
                .min(MAX_WAKE.as_secs_f64() * 1000.0);
            return Some(Duration::try_from_secs_f64(due_ms / 1000.0).unwrap_or(MAX_WAKE));
        }
        self.scheduler
            .next_due_in(now)
            .map(|due| due.min(MAX_WAKE))
    }

    fn handle(&mut self, command: EngineCommand, now: Instant) {
        debug!(?command, "command");
        match command {
            EngineCommand::LoadSong(song) => {
                self.halt();
                self.options.enabled_tracks = song.track_indices().collect();
                self.song = Some(song);
                self.rebuild();
            }
            EngineCommand::LoadTimeline(timeline) => {
                self.halt();
                self.song = None;
                self.load(timeline);
            }
            EngineCommand::Play => {
                if self.key_smash.is_some() {
                    self.stop_key_smash();
                }
                if self.scheduler.status() == PlaybackStatus::Stopped {
                    self.start_session();
                }
                match self.scheduler.play(now) {
                    Ok(()) => self.notify(EngineUpdate::Status(self.scheduler.status())),
                    Err(e) => self.reject("play", e),
                }
            }
            EngineCommand::Pause => match self.scheduler.pause(now) {
                Ok(()) => self.notify(EngineUpdate::Status(PlaybackStatus::Paused)),
                Err(e) => self.reject("pause", e),
            },
            EngineCommand::Stop => self.halt(),
            EngineCommand::Seek(target_ms) => {
                if let Err(e) = self.scheduler.seek(target_ms, now, &mut self.sink) {
                    self.reject("seek", e);
                }
            }
            EngineCommand::SetSpeed(multiplier) => {
                if let Err(e) = self.scheduler.set_speed(multiplier, now) {
                    self.reject("set speed", e);
                }
            }
            EngineCommand::SetTranspose(semitones) => {
                self.options.transpose = semitones.clamp(-MAX_TRANSPOSE, MAX_TRANSPOSE);
                self.options_changed();
            }
            EngineCommand::SetTrackEnabled { index, enabled } => {
                let changed = if enabled {
                    self.options.enabled_tracks.insert(index)
                } else {
                    self.options.enabled_tracks.remove(&index)
                };
                if changed {
                    self.options_changed();
                }
            }
            EngineCommand::SetMergeWindow(window_ms) => {
                if !window_ms.is_finite() || window_ms < 0.0 {
                    self.reject("set merge window", format!("invalid window {window_ms}"));
                    return;
                }
                self.options.merge_window_ms = window_ms;
                self.options_changed();
            }
            EngineCommand::SetHoldStyle(hold) => {
                self.options.hold_style = hold;
                self.options_changed();
            }
            EngineCommand::SetLayout(layout) => {
                // held keys must be released under the layout that pressed them
                if self.scheduler.status() == PlaybackStatus::Stopped {
                    self.apply_layout(layout);
                } else {
                    self.pending_layout = Some(layout);
                }
            }
            EngineCommand::StartKeySmash(config) => {
                if let Err(e) = config.validate() {
                    self.reject("start key smash", e);
                    return;
                }
                if self.scheduler.status() != PlaybackStatus::Stopped {
                    self.halt();
                }
                if self.key_smash.is_none() {
                    self.start_session();
                }
                info!(
                    keys = config.selected_keys.len(),
                    rate = config.rate_per_second,
                    mode = %config.mode,
                    "key smash started"
                );
                self.key_smash = Some(KeySmashRun {
                    config,
                    generator: KeySmashGenerator::new(),
                    last_tick: now,
                });
                self.notify(EngineUpdate::KeySmash { running: true });
            }
            EngineCommand::UpdateKeySmash(config) => {
                if let Err(e) = config.validate() {
                    self.reject("update key smash", e);
                    return;
                }
                match self.key_smash.as_mut() {
                    Some(run) => run.config = config,
                    None => self.reject("update key smash", "key smash is not running"),
                }
            }
            EngineCommand::StopKeySmash => self.stop_key_smash(),
            EngineCommand::Shutdown => {}
        }
    }

    fn tick(&mut self, now: Instant) {
        if let Some(run) = &mut self.key_smash {
            let since = now.saturating_duration_since(run.last_tick);
            run.last_tick = now;
            let batch = run
                .generator
                .next_batch(since.as_nanos() as f64 / 1_000_000.0, &run.config);
            for action in batch {
                match self.sink.send(action.key, ActionKind::Tap) {
                    Ok(()) => self.key_smash_dispatched += 1,
                    Err(e) => {
                        self.key_smash_failed += 1;
                        warn!(key = %action.key, error = %e, "key smash tap failed");
                    }
                }
            }
            return;
        }

        let report = self.scheduler.tick(now, &mut self.sink);
        if report.finished {
            info!("playback finished");
            self.notify(EngineUpdate::Finished);
            self.notify(EngineUpdate::Status(PlaybackStatus::Stopped));
            self.apply_pending();
        }
    }

    /// Stops whatever is running and brings the scheduler back to Stopped.
    fn halt(&mut self) {
        self.stop_key_smash();
        let was = self.scheduler.status();
        self.scheduler.stop(&mut self.sink);
        if was != PlaybackStatus::Stopped {
            self.notify(EngineUpdate::Status(PlaybackStatus::Stopped));
        }
        self.apply_pending();
    }

    fn stop_key_smash(&mut self) {
        if self.key_smash.take().is_some() {
            info!("key smash stopped");
            self.notify(EngineUpdate::KeySmash { running: false });
        }
    }

    /// Checks the sink once as a run begins. A missing sink is reported but
    /// does not stop the run.
    fn start_session(&mut self) {
        match self.sink.probe() {
            Ok(()) => self.degraded = None,
            Err(e) => {
                let reason = e.to_string();
                warn!(%reason, "keys will not reach the game");
                self.degraded = Some(reason.clone());
                self.notify(EngineUpdate::Degraded { reason });
            }
        }
    }

    fn options_changed(&mut self) {
        if self.scheduler.status() == PlaybackStatus::Stopped {
            self.rebuild();
        } else {
            debug!("option change deferred until playback stops");
            self.rebuild_pending = true;
        }
    }

    fn apply_pending(&mut self) {
        if let Some(layout) = self.pending_layout.take() {
            self.apply_layout(layout);
        }
        if self.rebuild_pending {
            self.rebuild_pending = false;
            self.rebuild();
        }
    }

    fn apply_layout(&mut self, layout: Layout) {
        info!(%layout, "layout changed");
        self.layout = layout;
        self.sink.set_layout(layout);
    }

    fn rebuild(&mut self) {
        let Some(song) = &self.song else {
            return;
        };
        let timeline = timing::build(&song.notes, &self.options);
        self.load(Arc::new(timeline));
    }

    fn load(&mut self, timeline: Arc<PlaybackTimeline>) {
        let loaded = EngineUpdate::Loaded {
            name: self.song.as_ref().map(|song| song.name.clone()),
            actions: timeline.len(),
            duration_ms: timeline.duration_ms(),
            stats: timeline.stats().clone(),
        };
        match self.scheduler.load(timeline) {
            Ok(()) => self.notify(loaded),
            Err(e) => self.notify(EngineUpdate::Error {
                message: format!("could not load timeline: {e}"),
            }),
        }
    }

    fn reject(&self, command: &'static str, reason: impl ToString) {
        let reason = reason.to_string();
        debug!(command, %reason, "command rejected");
        self.notify(EngineUpdate::Rejected { command, reason });
    }

    fn notify(&self, update: EngineUpdate) {
        let _ = self.updates.send(update);
    }

    fn publish(&self, now: Instant) {
        self.snapshot.store(Arc::new(PlayerState {
            playback: self.scheduler.snapshot(now),
            song_name: self.song.as_ref().map(|song| song.name.clone()),
            options: self.options.clone(),
            stats: self.scheduler.timeline().stats().clone(),
            layout: self.layout,
            rebuild_pending: self.rebuild_pending,
            key_smash_running: self.key_smash.is_some(),
            key_smash_dispatched: self.key_smash_dispatched,
            key_smash_failed: self.key_smash_failed,
            degraded: self.degraded.clone(),
        }));
    }
}
