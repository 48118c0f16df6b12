use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use crossterm::cursor::MoveToColumn;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::style::Print;
use crossterm::terminal::{self, ClearType};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lyre::timing::{KeySmashMode, PlaybackStatus};
use lyre::{
    DryRunSender, EngineCommand, EngineUpdate, KeySender, Layout, PlayerConfig, PlayerHandle,
    TimedSender, XdotoolSender, load_song_file, spawn_player,
};

const SEEK_STEP_MS: f64 = 5000.0;
const SPEED_STEP: f64 = 0.05;
const POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "lyre")]
#[command(about = "Plays MIDI files on the in-game lyre by simulating key presses", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = "lyre.ron")]
    config: PathBuf,

    /// Log keys instead of sending them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Keyboard layout: qwerty, qwertz, azerty or dvorak
    #[arg(long, global = true)]
    layout: Option<Layout>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a MIDI file
    Play {
        file: PathBuf,

        /// Track indices to play (default: all)
        #[arg(long, value_delimiter = ',')]
        tracks: Vec<usize>,

        /// Semitones, -12 to 12
        #[arg(long, allow_hyphen_values = true)]
        transpose: Option<i32>,

        /// Playback speed, 0.25 to 2.0
        #[arg(long)]
        speed: Option<f64>,

        /// Hold keys for the length of each note
        #[arg(long)]
        hold: bool,

        /// Merge same-key notes closer together than this many milliseconds
        #[arg(long)]
        merge: Option<f64>,

        /// Shift out-of-range notes by octaves instead of dropping them
        #[arg(long)]
        fold: bool,

        /// Seconds to wait after pressing play, to switch to the game
        #[arg(long, default_value = "3")]
        countdown: u64,
    },

    /// Press keys continuously
    Smash {
        /// Physical keys to press, e.g. a,s,d
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,

        /// Keys per second
        #[arg(long)]
        rate: Option<f64>,

        /// sequential, random or chord
        #[arg(long)]
        mode: Option<KeySmashMode>,

        /// Seconds to wait before starting
        #[arg(long, default_value = "3")]
        countdown: u64,
    },

    /// List the tracks of a MIDI file
    Tracks { file: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PlayerConfig::load(&cli.config)?;
    if let Some(layout) = cli.layout {
        config.layout = layout;
    }

    match cli.command {
        Commands::Tracks { file } => list_tracks(&file),
        Commands::Play {
            file,
            tracks,
            transpose,
            speed,
            hold,
            merge,
            fold,
            countdown,
        } => {
            if let Some(transpose) = transpose {
                config.transpose = transpose;
            }
            if let Some(speed) = speed {
                config.playback_speed = speed;
            }
            if let Some(merge) = merge {
                config.merge_nearby_notes = true;
                config.merge_threshold_ms = merge;
            }
            config.hold_notes |= hold;
            config.fold_out_of_range |= fold;
            let config = config.clamped();
            play(&file, &tracks, &config, cli.dry_run, countdown)
        }
        Commands::Smash {
            keys,
            rate,
            mode,
            countdown,
        } => {
            if !keys.is_empty() {
                let mut selected = BTreeSet::new();
                for name in &keys {
                    let key = config
                        .layout
                        .logical_key(name)
                        .ok_or_else(|| format!("'{name}' is not a lyre key on {}", config.layout))?;
                    selected.insert(key);
                }
                config.keysmash_keys = selected;
            }
            if let Some(rate) = rate {
                config.keysmash_speed = rate;
            }
            if let Some(mode) = mode {
                config.keysmash_mode = mode;
            }
            smash(&config.clamped(), cli.dry_run, countdown)
        }
    }
}

fn list_tracks(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let song = load_song_file(file)?;
    println!("{} ({})", song.name, format_time(song.duration_ms));
    for track in &song.tracks {
        let program = track
            .program
            .map(|p| format!(" program {p}"))
            .unwrap_or_default();
        println!(
            "  {:>2}  {:<32} {:>5} notes{}",
            track.index, track.name, track.note_count, program
        );
    }
    Ok(())
}

fn make_sender(config: &PlayerConfig, dry_run: bool) -> Box<dyn KeySender> {
    if dry_run {
        info!("dry run, no keys will be sent");
        Box::new(DryRunSender::new(config.layout))
    } else {
        Box::new(TimedSender::spawn(
            XdotoolSender::new(config.layout),
            config.sink_timeout(),
        ))
    }
}

fn report_focus(config: &PlayerConfig, dry_run: bool) {
    if dry_run {
        return;
    }
    match XdotoolSender::new(config.layout).active_window_name() {
        Some(name) => info!(window = %name, "sending keys to the focused window"),
        None => warn!("could not tell which window has focus"),
    }
}

fn play(
    file: &Path,
    tracks: &[usize],
    config: &PlayerConfig,
    dry_run: bool,
    countdown: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let song = load_song_file(file)?;
    let all_tracks: Vec<usize> = song.track_indices().collect();
    for index in tracks {
        if !all_tracks.contains(index) {
            return Err(format!("no track {index} in {}", file.display()).into());
        }
    }

    let player = spawn_player(make_sender(config, dry_run), config);
    player.send(EngineCommand::LoadSong(song));
    if !tracks.is_empty() {
        for &index in all_tracks.iter().filter(|i| !tracks.contains(i)) {
            player.send(EngineCommand::SetTrackEnabled {
                index,
                enabled: false,
            });
        }
    }

    println!("space play/pause  s stop  \u{2190}/\u{2192} seek  +/- speed  q quit\r");
    let result = with_raw_terminal(|| interactive(&player, config, dry_run, countdown));
    player.shutdown();
    result
}

fn smash(
    config: &PlayerConfig,
    dry_run: bool,
    countdown: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let smash_config = config.keysmash_config();
    smash_config.validate()?;

    let player = spawn_player(make_sender(config, dry_run), config);
    println!("q to stop\r");
    let result = with_raw_terminal(|| {
        let mut stdout = io::stdout();
        let start_at = Instant::now() + Duration::from_secs(countdown);
        let mut started = false;
        loop {
            if quit_requested()? {
                return Ok(());
            }
            let now = Instant::now();
            if !started && now >= start_at {
                report_focus(config, dry_run);
                player.send(EngineCommand::StartKeySmash(smash_config.clone()));
                started = true;
            }
            let line = if started {
                let state = player.state();
                format!(
                    "smashing {} keys at {}/s ({})  sent {}  failed {}",
                    smash_config.selected_keys.len(),
                    smash_config.rate_per_second,
                    smash_config.mode,
                    state.key_smash_dispatched,
                    state.key_smash_failed
                )
            } else {
                format!("starting in {}s", seconds_left(start_at, now))
            };
            status_line(&mut stdout, &line)?;
        }
    });
    player.shutdown();
    result
}

fn interactive(
    player: &PlayerHandle,
    config: &PlayerConfig,
    dry_run: bool,
    countdown: u64,
) -> io::Result<()> {
    let mut stdout = io::stdout();
    let mut play_at: Option<Instant> = None;
    let mut message = String::new();

    loop {
        for update in player.update_rx.try_iter() {
            match update {
                EngineUpdate::Loaded {
                    actions, stats, ..
                } => {
                    message = format!("{actions} actions, {} notes out of range", stats.unmapped);
                }
                EngineUpdate::Finished => message = "finished".to_string(),
                EngineUpdate::Degraded { reason } => message = reason,
                EngineUpdate::Rejected { reason, .. } => message = reason,
                EngineUpdate::Error { message: error } => message = error,
                EngineUpdate::Status(_) | EngineUpdate::KeySmash { .. } => {}
            }
        }

        if event::poll(POLL)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let state = player.state();
                let status = state.playback.status;
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Ok(());
                    }
                    KeyCode::Char(' ') => match status {
                        PlaybackStatus::Playing => player.send(EngineCommand::Pause),
                        PlaybackStatus::Paused => player.send(EngineCommand::Play),
                        PlaybackStatus::Stopped if play_at.is_some() => play_at = None,
                        PlaybackStatus::Stopped => {
                            play_at = Some(Instant::now() + Duration::from_secs(countdown));
                        }
                    },
                    KeyCode::Char('s') => {
                        play_at = None;
                        player.send(EngineCommand::Stop);
                    }
                    KeyCode::Left => player.send(EngineCommand::Seek(
                        state.playback.cursor_offset_ms - SEEK_STEP_MS,
                    )),
                    KeyCode::Right => player.send(EngineCommand::Seek(
                        state.playback.cursor_offset_ms + SEEK_STEP_MS,
                    )),
                    KeyCode::Char('+') | KeyCode::Char('=') => {
                        player.send(EngineCommand::SetSpeed(state.playback.speed + SPEED_STEP));
                    }
                    KeyCode::Char('-') => {
                        player.send(EngineCommand::SetSpeed(state.playback.speed - SPEED_STEP));
                    }
                    _ => {}
                }
            }
        }

        let now = Instant::now();
        if play_at.is_some_and(|at| now >= at) {
            play_at = None;
            report_focus(config, dry_run);
            player.send(EngineCommand::Play);
        }

        let state = player.state();
        let playback = &state.playback;
        let status = match play_at {
            Some(at) => format!("starting in {}s", seconds_left(at, now)),
            None => playback.status.to_string(),
        };
        let line = format!(
            "{:<14} {} / {}  x{:.2}  {}",
            status,
            format_time(playback.cursor_offset_ms),
            format_time(playback.total_duration_ms),
            playback.speed,
            message
        );
        status_line(&mut stdout, &line)?;
    }
}

fn with_raw_terminal<T>(
    body: impl FnOnce() -> io::Result<T>,
) -> Result<T, Box<dyn std::error::Error>> {
    terminal::enable_raw_mode()?;
    let result = body();
    terminal::disable_raw_mode()?;
    println!();
    Ok(result?)
}

fn quit_requested() -> io::Result<bool> {
    if !event::poll(POLL)? {
        return Ok(false);
    }
    Ok(match event::read()? {
        Event::Key(key) if key.kind == KeyEventKind::Press => {
            matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
        }
        _ => false,
    })
}

fn status_line(stdout: &mut io::Stdout, line: &str) -> io::Result<()> {
    execute!(
        stdout,
        MoveToColumn(0),
        terminal::Clear(ClearType::CurrentLine),
        Print(line)
    )?;
    stdout.flush()
}

fn seconds_left(at: Instant, now: Instant) -> u64 {
    let left = at.saturating_duration_since(now);
    left.as_secs() + u64::from(left.subsec_nanos() > 0)
}

/// `MM:SS`, rounded down.
fn format_time(ms: f64) -> String {
    let total = (ms.max(0.0) / 1000.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}
