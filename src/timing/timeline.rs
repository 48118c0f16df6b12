use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::events::{DispatchAction, RawNoteEvent};
use crate::keymap::{self, LogicalKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineOptions {
    pub enabled_tracks: BTreeSet<usize>,
    pub transpose: i32,
    /// Same-key notes starting closer together than this collapse into one.
    /// Zero disables merging.
    pub merge_window_ms: f64,
    pub hold_style: bool,
    pub fold_out_of_range: bool,
}

impl TimelineOptions {
    pub fn with_tracks(enabled_tracks: impl IntoIterator<Item = usize>) -> Self {
        Self {
            enabled_tracks: enabled_tracks.into_iter().collect(),
            transpose: 0,
            merge_window_ms: 0.0,
            hold_style: false,
            fold_out_of_range: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStats {
    pub source_events: usize,
    /// Events on disabled tracks.
    pub filtered_out: usize,
    /// Events whose pitch has no instrument key.
    pub unmapped: usize,
    /// Events absorbed into an earlier same-key note by the merge window.
    pub merged: usize,
}

/// Dispatch-ready actions in playback order. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackTimeline {
    actions: Vec<DispatchAction>,
    stats: BuildStats,
}

impl PlaybackTimeline {
    /// Wraps hand-made actions, ordering them by offset (stable for ties).
    pub fn from_actions(mut actions: Vec<DispatchAction>) -> Self {
        actions.sort_by(|a, b| a.offset_ms.total_cmp(&b.offset_ms));
        Self {
            actions,
            stats: BuildStats::default(),
        }
    }

    pub fn actions(&self) -> &[DispatchAction] {
        &self.actions
    }

    pub fn get(&self, index: usize) -> Option<&DispatchAction> {
        self.actions.get(index)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    pub fn duration_ms(&self) -> f64 {
        self.actions.last().map_or(0.0, |a| a.offset_ms)
    }

    /// Index of the first action at or after `offset_ms`.
    pub fn first_at_or_after(&self, offset_ms: f64) -> usize {
        self.actions.partition_point(|a| a.offset_ms < offset_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct MappedNote {
    key: LogicalKey,
    on_ms: f64,
    off_ms: f64,
}

/// Sort key of an emitted action: offset, then on-time rank of the source
/// note, then press before release within the same note.
#[derive(Debug, Clone, Copy)]
struct Ranked {
    action: DispatchAction,
    rank: usize,
    phase: u8,
}

impl Ranked {
    fn cmp_order(&self, other: &Self) -> Ordering {
        self.action
            .offset_ms
            .total_cmp(&other.action.offset_ms)
            .then(self.rank.cmp(&other.rank))
            .then(self.phase.cmp(&other.phase))
    }
}

pub fn build(events: &[RawNoteEvent], options: &TimelineOptions) -> PlaybackTimeline {
    let mut stats = BuildStats {
        source_events: events.len(),
        ..Default::default()
    };

    let mut notes: Vec<MappedNote> = Vec::with_capacity(events.len());
    for event in events {
        if !options.enabled_tracks.contains(&event.track_index()) {
            stats.filtered_out += 1;
            continue;
        }
        let key = if options.fold_out_of_range {
            keymap::map_pitch_to_key_folded(event.pitch(), options.transpose)
        } else {
            keymap::map_pitch_to_key(event.pitch(), options.transpose)
        };
        match key {
            Some(key) => notes.push(MappedNote {
                key,
                on_ms: event.on_offset_ms(),
                off_ms: event.off_offset_ms(),
            }),
            None => stats.unmapped += 1,
        }
    }

    // stable: equal onsets keep their input order
    notes.sort_by(|a, b| a.on_ms.total_cmp(&b.on_ms));

    let mut by_key: BTreeMap<LogicalKey, Vec<(usize, MappedNote)>> = BTreeMap::new();
    for (rank, note) in notes.into_iter().enumerate() {
        by_key.entry(note.key).or_default().push((rank, note));
    }

    let mut ranked: Vec<Ranked> = Vec::new();
    for (_key, group) in by_key {
        let group = if options.merge_window_ms > 0.0 {
            let before = group.len();
            let merged = merge_nearby(group, options.merge_window_ms);
            stats.merged += before - merged.len();
            merged
        } else {
            group
        };

        if options.hold_style {
            emit_holds(&group, &mut ranked);
        } else {
            ranked.extend(group.iter().map(|(rank, note)| Ranked {
                action: DispatchAction::tap(note.on_ms, note.key),
                rank: *rank,
                phase: 0,
            }));
        }
    }

    ranked.sort_by(Ranked::cmp_order);

    PlaybackTimeline {
        actions: ranked.into_iter().map(|r| r.action).collect(),
        stats,
    }
}

/// Collapses same-key notes whose onsets fall within `window_ms` of the first
/// note of their group. The survivor keeps the earliest onset and the latest
/// release of everything it absorbed.
fn merge_nearby(group: Vec<(usize, MappedNote)>, window_ms: f64) -> Vec<(usize, MappedNote)> {
    let mut result: Vec<(usize, MappedNote)> = Vec::with_capacity(group.len());
    for (rank, note) in group {
        match result.last_mut() {
            Some((_, current)) if note.on_ms - current.on_ms < window_ms => {
                current.off_ms = current.off_ms.max(note.off_ms);
            }
            _ => result.push((rank, note)),
        }
    }
    result
}

/// Press/Release pairs for one key. A note that starts while the previous one
/// is still down cuts that one short, so the key is lifted and struck again
/// instead of being pressed twice.
fn emit_holds(group: &[(usize, MappedNote)], out: &mut Vec<Ranked>) {
    let mut pending: Option<(usize, MappedNote)> = None;
    for &(rank, note) in group {
        if let Some((pending_rank, held)) = pending.take() {
            out.push(Ranked {
                action: DispatchAction::release(held.off_ms.min(note.on_ms), held.key),
                rank: pending_rank,
                phase: 1,
            });
        }
        out.push(Ranked {
            action: DispatchAction::press(note.on_ms, note.key),
            rank,
            phase: 0,
        });
        pending = Some((rank, note));
    }
    if let Some((rank, held)) = pending {
        out.push(Ranked {
            action: DispatchAction::release(held.off_ms, held.key),
            rank,
            phase: 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ActionKind;
    use rstest::rstest;

    fn key(pitch: u8) -> LogicalKey {
        keymap::map_pitch_to_key(pitch, 0).unwrap()
    }

    fn two_notes() -> Vec<RawNoteEvent> {
        vec![
            RawNoteEvent::new(0, 60, 0.0, 500.0),
            RawNoteEvent::new(0, 62, 500.0, 300.0),
        ]
    }

    #[test]
    fn tap_style_emits_one_tap_per_note() {
        let timeline = build(&two_notes(), &TimelineOptions::with_tracks([0]));
        assert_eq!(
            timeline.actions(),
            &[
                DispatchAction::tap(0.0, key(60)),
                DispatchAction::tap(500.0, key(62)),
            ]
        );
    }

    #[test]
    fn hold_style_emits_press_release_pairs() {
        let options = TimelineOptions {
            hold_style: true,
            ..TimelineOptions::with_tracks([0])
        };
        let timeline = build(&two_notes(), &options);
        assert_eq!(
            timeline.actions(),
            &[
                DispatchAction::press(0.0, key(60)),
                DispatchAction::release(500.0, key(60)),
                DispatchAction::press(500.0, key(62)),
                DispatchAction::release(800.0, key(62)),
            ]
        );
        assert_eq!(timeline.duration_ms(), 800.0);
    }

    #[test]
    fn disabled_tracks_and_unmapped_pitches_are_dropped() {
        let events = vec![
            RawNoteEvent::new(0, 60, 0.0, 10.0),
            RawNoteEvent::new(1, 62, 0.0, 10.0),
            RawNoteEvent::new(0, 61, 5.0, 10.0),
        ];
        let timeline = build(&events, &TimelineOptions::with_tracks([0]));
        assert_eq!(timeline.len(), 1);
        assert_eq!(
            timeline.stats(),
            &BuildStats {
                source_events: 3,
                filtered_out: 1,
                unmapped: 1,
                merged: 0,
            }
        );
    }

    #[test]
    fn no_enabled_tracks_gives_empty_timeline() {
        let timeline = build(&two_notes(), &TimelineOptions::with_tracks([]));
        assert!(timeline.is_empty());
        assert_eq!(timeline.duration_ms(), 0.0);
    }

    #[rstest]
    #[case(49.9, 1)]
    #[case(50.0, 2)]
    #[case(50.1, 2)]
    fn merge_window_boundary(#[case] second_onset: f64, #[case] expected: usize) {
        let events = vec![
            RawNoteEvent::new(0, 60, 0.0, 10.0),
            RawNoteEvent::new(0, 60, second_onset, 10.0),
        ];
        let options = TimelineOptions {
            merge_window_ms: 50.0,
            ..TimelineOptions::with_tracks([0])
        };
        assert_eq!(build(&events, &options).len(), expected);
    }

    #[test]
    fn merged_hold_covers_the_union_interval() {
        let events = vec![
            RawNoteEvent::new(0, 60, 100.0, 50.0),
            RawNoteEvent::new(0, 60, 120.0, 200.0),
            RawNoteEvent::new(0, 62, 110.0, 10.0),
        ];
        let options = TimelineOptions {
            merge_window_ms: 30.0,
            hold_style: true,
            ..TimelineOptions::with_tracks([0])
        };
        let timeline = build(&events, &options);
        assert_eq!(timeline.stats().merged, 1);
        let c4: Vec<_> = timeline
            .actions()
            .iter()
            .filter(|a| a.key == key(60))
            .copied()
            .collect();
        assert_eq!(
            c4,
            vec![
                DispatchAction::press(100.0, key(60)),
                DispatchAction::release(320.0, key(60)),
            ]
        );
    }

    #[test]
    fn overlapping_holds_release_before_repress() {
        let events = vec![
            RawNoteEvent::new(0, 60, 0.0, 500.0),
            RawNoteEvent::new(0, 60, 200.0, 100.0),
        ];
        let options = TimelineOptions {
            hold_style: true,
            ..TimelineOptions::with_tracks([0])
        };
        let kinds: Vec<_> = build(&events, &options)
            .actions()
            .iter()
            .map(|a| (a.kind, a.offset_ms))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ActionKind::Press, 0.0),
                (ActionKind::Release, 200.0),
                (ActionKind::Press, 200.0),
                (ActionKind::Release, 300.0),
            ]
        );
    }

    #[test]
    fn unsorted_input_is_ordered_by_onset() {
        let events = vec![
            RawNoteEvent::new(0, 64, 300.0, 10.0),
            RawNoteEvent::new(0, 60, 0.0, 10.0),
            RawNoteEvent::new(0, 62, 300.0, 10.0),
        ];
        let timeline = build(&events, &TimelineOptions::with_tracks([0]));
        let keys: Vec<_> = timeline.actions().iter().map(|a| a.key).collect();
        assert_eq!(keys, vec![key(60), key(64), key(62)]);
    }

    #[test]
    fn first_at_or_after_finds_the_seek_target() {
        let timeline = build(&two_notes(), &TimelineOptions::with_tracks([0]));
        assert_eq!(timeline.first_at_or_after(0.0), 0);
        assert_eq!(timeline.first_at_or_after(0.1), 1);
        assert_eq!(timeline.first_at_or_after(500.0), 1);
        assert_eq!(timeline.first_at_or_after(501.0), 2);
    }
}
