//! Standard MIDI File loading.
//!
//! Turns a file into per-track [`RawNoteEvent`]s in absolute milliseconds. The
//! tempo map is global: every `Tempo` meta event in any track applies to all of
//! them, the way format 1 files are meant to be read.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MidiError;
use crate::events::RawNoteEvent;

const DEFAULT_US_PER_BEAT: u64 = 500_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub index: usize,
    pub name: String,
    /// Last program change seen on the track.
    pub program: Option<u8>,
    pub note_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub name: String,
    pub tracks: Vec<TrackInfo>,
    /// Every note of every track, ordered by onset.
    pub notes: Vec<RawNoteEvent>,
    pub duration_ms: f64,
}

impl Song {
    pub fn track_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.tracks.iter().map(|t| t.index)
    }
}

#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    tick: u64,
    ms: f64,
    us_per_beat: u64,
}

#[derive(Debug, Clone)]
struct TempoMap {
    segments: Vec<TempoSegment>,
    ticks_per_beat: u64,
}

impl TempoMap {
    fn new(smf: &Smf, ticks_per_beat: u64) -> Self {
        let mut changes: Vec<(u64, u64)> = Vec::new();
        for track in &smf.tracks {
            let mut tick = 0u64;
            for event in track {
                tick += event.delta.as_int() as u64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(us_per_beat)) = event.kind {
                    changes.push((tick, us_per_beat.as_int() as u64));
                }
            }
        }
        changes.sort_by_key(|&(tick, _)| tick);

        let mut segments = vec![TempoSegment {
            tick: 0,
            ms: 0.0,
            us_per_beat: DEFAULT_US_PER_BEAT,
        }];
        for (tick, us_per_beat) in changes {
            let ms = ticks_to_ms_in(segments[segments.len() - 1], tick, ticks_per_beat);
            let last = segments.len() - 1;
            if segments[last].tick == tick {
                segments[last].us_per_beat = us_per_beat;
            } else {
                segments.push(TempoSegment {
                    tick,
                    ms,
                    us_per_beat,
                });
            }
        }

        Self {
            segments,
            ticks_per_beat,
        }
    }

    fn ticks_to_ms(&self, tick: u64) -> f64 {
        let index = self.segments.partition_point(|s| s.tick <= tick);
        let segment = self.segments[index.saturating_sub(1)];
        ticks_to_ms_in(segment, tick, self.ticks_per_beat)
    }
}

fn ticks_to_ms_in(segment: TempoSegment, tick: u64, ticks_per_beat: u64) -> f64 {
    let delta = tick.saturating_sub(segment.tick) as f64;
    segment.ms + delta * segment.us_per_beat as f64 / ticks_per_beat as f64 / 1000.0
}

pub fn load_song_file(path: &Path) -> Result<Song, MidiError> {
    let bytes = fs::read(path)?;
    let mut song = load_song(&bytes)?;
    if let Some(stem) = path.file_stem() {
        song.name = stem.to_string_lossy().into_owned();
    }
    Ok(song)
}

pub fn load_song(bytes: &[u8]) -> Result<Song, MidiError> {
    let smf = Smf::parse(bytes)?;
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int() as u64,
        Timing::Timecode(..) => return Err(MidiError::UnsupportedTiming),
    };
    let tempo = TempoMap::new(&smf, ticks_per_beat.max(1));

    let mut song = Song::default();
    let mut last_tick = 0u64;

    for (index, track) in smf.tracks.iter().enumerate() {
        let mut info = TrackInfo {
            index,
            name: format!("Track {}", index + 1),
            program: None,
            note_count: 0,
        };
        // NoteOff closes the oldest open note of that channel and pitch
        let mut open: BTreeMap<(u8, u8), VecDeque<u64>> = BTreeMap::new();
        let mut tick = 0u64;

        let close = |tick_on: u64, tick_off: u64, pitch: u8, song: &mut Song| {
            let on_ms = tempo.ticks_to_ms(tick_on);
            let off_ms = tempo.ticks_to_ms(tick_off);
            song.notes.push(RawNoteEvent::new(index, pitch, on_ms, off_ms - on_ms));
        };

        for event in track {
            tick += event.delta.as_int() as u64;
            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    let name = String::from_utf8_lossy(name).trim().to_string();
                    if !name.is_empty() {
                        info.name = name;
                    }
                }
                TrackEventKind::Midi { channel, message } => match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        open.entry((channel.as_int(), key.as_int()))
                            .or_default()
                            .push_back(tick);
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        let pitch = key.as_int();
                        if let Some(tick_on) = open
                            .get_mut(&(channel.as_int(), pitch))
                            .and_then(VecDeque::pop_front)
                        {
                            close(tick_on, tick, pitch, &mut song);
                            info.note_count += 1;
                        }
                    }
                    MidiMessage::ProgramChange { program } => {
                        info.program = Some(program.as_int());
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        // notes still sounding at the end of the track last until the end,
        // emitted in channel and pitch order
        for ((_, pitch), ticks) in open {
            for tick_on in ticks {
                close(tick_on, tick, pitch, &mut song);
                info.note_count += 1;
            }
        }

        last_tick = last_tick.max(tick);
        debug!(track = index, name = %info.name, notes = info.note_count, "parsed track");
        song.tracks.push(info);
    }

    song.notes.sort_by(|a, b| a.on_offset_ms().total_cmp(&b.on_offset_ms()));
    song.duration_ms = song
        .notes
        .iter()
        .map(RawNoteEvent::off_offset_ms)
        .fold(tempo.ticks_to_ms(last_tick), f64::max);
    Ok(song)
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u4, u7, u15, u24, u28};
    use midly::{Format, Header, TrackEvent};

    fn midi(delta: u32, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::from(delta),
            kind: TrackEventKind::Midi {
                channel: u4::from(0u8),
                message,
            },
        }
    }

    fn meta(delta: u32, message: MetaMessage<'static>) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::from(delta),
            kind: TrackEventKind::Meta(message),
        }
    }

    fn on(delta: u32, pitch: u8) -> TrackEvent<'static> {
        midi(
            delta,
            MidiMessage::NoteOn {
                key: u7::from(pitch),
                vel: u7::from(100u8),
            },
        )
    }

    fn off(delta: u32, pitch: u8) -> TrackEvent<'static> {
        midi(
            delta,
            MidiMessage::NoteOff {
                key: u7::from(pitch),
                vel: u7::from(0u8),
            },
        )
    }

    fn encode(tracks: Vec<Vec<TrackEvent<'static>>>) -> Vec<u8> {
        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::from(480u16)),
        ));
        smf.tracks = tracks;
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn notes_are_converted_through_the_tempo_map() {
        let bytes = encode(vec![
            vec![
                meta(0, MetaMessage::TrackName(b"Conductor")),
                meta(0, MetaMessage::Tempo(u24::from(500_000u32))),
                // from beat 2 on, twice as fast
                meta(960, MetaMessage::Tempo(u24::from(250_000u32))),
                meta(0, MetaMessage::EndOfTrack),
            ],
            vec![
                meta(0, MetaMessage::TrackName(b"Melody")),
                on(0, 60),
                off(480, 60),
                on(480, 62),
                // velocity zero note-on ends the note
                midi(
                    480,
                    MidiMessage::NoteOn {
                        key: u7::from(62u8),
                        vel: u7::from(0u8),
                    },
                ),
                meta(0, MetaMessage::EndOfTrack),
            ],
        ]);

        let song = load_song(&bytes).unwrap();
        assert_eq!(song.tracks.len(), 2);
        assert_eq!(song.tracks[0].name, "Conductor");
        assert_eq!(song.tracks[1].name, "Melody");
        assert_eq!(song.tracks[1].note_count, 2);
        assert_eq!(
            song.notes,
            vec![
                RawNoteEvent::new(1, 60, 0.0, 500.0),
                RawNoteEvent::new(1, 62, 1000.0, 250.0),
            ]
        );
        assert_eq!(song.duration_ms, 1250.0);
    }

    #[test]
    fn unterminated_notes_last_until_track_end() {
        let bytes = encode(vec![vec![on(0, 60), meta(960, MetaMessage::EndOfTrack)]]);
        let song = load_song(&bytes).unwrap();
        assert_eq!(song.notes, vec![RawNoteEvent::new(0, 60, 0.0, 1000.0)]);
        assert_eq!(song.tracks[0].name, "Track 1");
    }

    #[test]
    fn simultaneous_unterminated_notes_have_a_stable_order() {
        let bytes = encode(vec![vec![
            on(0, 67),
            on(0, 60),
            on(0, 64),
            meta(480, MetaMessage::EndOfTrack),
        ]]);
        for _ in 0..8 {
            let pitches: Vec<_> = load_song(&bytes)
                .unwrap()
                .notes
                .iter()
                .map(RawNoteEvent::pitch)
                .collect();
            assert_eq!(pitches, vec![60, 64, 67]);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            load_song(b"definitely not a midi file"),
            Err(MidiError::Parse(_))
        ));
    }
}
