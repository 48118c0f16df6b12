use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use midly::num::{u4, u7, u15, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use rstest::rstest;

use lyre::timing::{self, PlaybackStatus, Scheduler, TimelineOptions};
use lyre::{ActionKind, LogicalKey, PlayerConfig, RawNoteEvent, RecordingSender, load_song};

fn note(delta: u32, pitch: u8, velocity: u8) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::from(delta),
        kind: TrackEventKind::Midi {
            channel: u4::from(0u8),
            message: MidiMessage::NoteOn {
                key: u7::from(pitch),
                vel: u7::from(velocity),
            },
        },
    }
}

fn end() -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::from(0u32),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    }
}

/// Two tracks at 120 bpm, 480 ticks per beat: a C major arpeggio in quarter
/// notes on track 0 and a low C# (no lyre key) on track 1.
fn arpeggio() -> Vec<u8> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::from(480u16)),
    ));
    smf.tracks = vec![
        vec![
            note(0, 60, 90),
            note(480, 60, 0),
            note(0, 64, 90),
            note(480, 64, 0),
            note(0, 67, 90),
            note(480, 67, 0),
            end(),
        ],
        vec![note(0, 49, 90), note(1440, 49, 0), end()],
    ];
    let mut bytes = Vec::new();
    smf.write_std(&mut bytes).unwrap();
    bytes
}

fn key(pitch: u8) -> LogicalKey {
    lyre::map_pitch_to_key(pitch, 0).unwrap()
}

#[test]
fn midi_file_plays_through_in_order() {
    let song = load_song(&arpeggio()).unwrap();
    let config = PlayerConfig::default();
    let timeline = timing::build(&song.notes, &config.timeline_options(song.track_indices()));
    assert_eq!(timeline.len(), 3);
    assert_eq!(timeline.stats().unmapped, 1);
    assert_eq!(timeline.duration_ms(), 1000.0);

    let mut sink = RecordingSender::new();
    let mut scheduler = Scheduler::new();
    scheduler.load(Arc::new(timeline)).unwrap();
    let t0 = Instant::now();
    scheduler.play(t0).unwrap();
    for step in 0..=20 {
        scheduler.tick(t0 + Duration::from_millis(step * 50), &mut sink);
    }

    let sent: Vec<_> = sink.sent().iter().map(|s| (s.key, s.kind)).collect();
    assert_eq!(
        sent,
        vec![
            (key(60), ActionKind::Tap),
            (key(64), ActionKind::Tap),
            (key(67), ActionKind::Tap),
        ]
    );
    assert_eq!(scheduler.status(), PlaybackStatus::Stopped);
}

#[test]
fn hold_style_presses_for_each_note_length() {
    let song = load_song(&arpeggio()).unwrap();
    let config = PlayerConfig {
        hold_notes: true,
        ..PlayerConfig::default()
    };
    let timeline = timing::build(&song.notes, &config.timeline_options([0]));
    let offsets: Vec<_> = timeline
        .actions()
        .iter()
        .map(|a| (a.offset_ms, a.kind))
        .collect();
    assert_eq!(
        offsets,
        vec![
            (0.0, ActionKind::Press),
            (500.0, ActionKind::Release),
            (500.0, ActionKind::Press),
            (1000.0, ActionKind::Release),
            (1000.0, ActionKind::Press),
            (1500.0, ActionKind::Release),
        ]
    );
    assert_eq!(timeline.stats().filtered_out, 1);
}

#[test]
fn double_speed_halves_wall_time() {
    let song = load_song(&arpeggio()).unwrap();
    let timeline = timing::build(&song.notes, &TimelineOptions::with_tracks([0]));
    let mut sink = RecordingSender::new();
    let mut scheduler = Scheduler::new();
    scheduler.load(Arc::new(timeline)).unwrap();
    let t0 = Instant::now();
    scheduler.set_speed(2.0, t0).unwrap();
    scheduler.play(t0).unwrap();

    scheduler.tick(t0 + Duration::from_millis(249), &mut sink);
    assert_eq!(sink.sent().len(), 1);
    scheduler.tick(t0 + Duration::from_millis(250), &mut sink);
    assert_eq!(sink.sent().len(), 2);
    let report = scheduler.tick(t0 + Duration::from_millis(500), &mut sink);
    assert!(report.finished);
}

fn scattered_notes() -> Vec<RawNoteEvent> {
    let pitches = [60, 62, 60, 61, 64, 60, 72, 48, 83, 84, 60, 62];
    pitches
        .iter()
        .enumerate()
        .map(|(i, &pitch)| {
            let on = (i as f64 * 37.0) % 220.0;
            RawNoteEvent::new(i % 3, pitch, on, 15.0 + (i as f64 * 13.0) % 90.0)
        })
        .collect()
}

#[rstest]
#[case(false, 0.0)]
#[case(false, 50.0)]
#[case(true, 0.0)]
#[case(true, 50.0)]
fn timelines_are_ordered_and_balanced(#[case] hold_style: bool, #[case] merge_window_ms: f64) {
    let options = TimelineOptions {
        hold_style,
        merge_window_ms,
        ..TimelineOptions::with_tracks([0, 1, 2])
    };
    let events = scattered_notes();
    let timeline = timing::build(&events, &options);

    assert!(
        timeline
            .actions()
            .windows(2)
            .all(|pair| pair[0].offset_ms <= pair[1].offset_ms)
    );

    // every press is released before the same key is pressed again
    let mut held = BTreeSet::new();
    for action in timeline.actions() {
        match action.kind {
            ActionKind::Press => assert!(held.insert(action.key), "double press"),
            ActionKind::Release => assert!(held.remove(&action.key), "stray release"),
            ActionKind::Tap => assert!(!hold_style),
        }
    }
    assert!(held.is_empty());

    assert_eq!(timing::build(&events, &options), timeline);
}

#[test]
fn stop_mid_song_leaves_nothing_held() {
    let events = vec![
        RawNoteEvent::new(0, 60, 0.0, 1000.0),
        RawNoteEvent::new(0, 64, 0.0, 1000.0),
        RawNoteEvent::new(0, 67, 0.0, 1000.0),
    ];
    let options = TimelineOptions {
        hold_style: true,
        ..TimelineOptions::with_tracks([0])
    };
    let mut sink = RecordingSender::new();
    let mut scheduler = Scheduler::new();
    scheduler
        .load(Arc::new(timing::build(&events, &options)))
        .unwrap();
    let t0 = Instant::now();
    scheduler.play(t0).unwrap();
    scheduler.tick(t0 + Duration::from_millis(10), &mut sink);
    assert_eq!(scheduler.held_keys().count(), 3);

    scheduler.stop(&mut sink);
    let releases = sink
        .sent()
        .iter()
        .filter(|s| s.kind == ActionKind::Release)
        .count();
    assert_eq!(releases, 3);
    assert_eq!(scheduler.snapshot(t0).held_keys, Vec::new());
}
