//! MIDI reading and fragment writing on top of midly.
//!
//! Reading flattens a Standard MIDI File into absolute-time note events
//! (seconds), resolving tick times through the file's tempo map.
//! Writing renders a note list back into a single-track SMF at the
//! source file's resolution and initial tempo.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;

use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};
use thiserror::Error;

/// Microseconds per quarter note when a file carries no tempo event.
const DEFAULT_TEMPO: u32 = 500_000;

/// General MIDI percussion channel (0-indexed).
const DRUM_CHANNEL: u8 = 9;

#[derive(Error, Debug)]
pub enum MidiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MIDI parse error: {0}")]
    Parse(#[from] midly::Error),
    #[error("MIDI write error: {0}")]
    Write(String),
    #[error("SMPTE timecode timing is not supported")]
    UnsupportedTiming,
}

/// One note event with absolute times in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub pitch: u8,
    pub velocity: u8,
    pub start: f64,
    pub end: f64,
    /// True for notes on the percussion channel.
    pub is_drum: bool,
}

/// A loaded MIDI file flattened to a note list.
#[derive(Debug, Clone)]
pub struct MidiPiece {
    /// Ticks per quarter note.
    pub resolution: u16,
    /// Microseconds per quarter note at tick zero.
    pub initial_tempo: u32,
    /// All notes across all tracks, sorted by onset.
    pub notes: Vec<Note>,
}

pub fn load(path: &Path) -> Result<MidiPiece, MidiError> {
    let bytes = std::fs::read(path)?;
    let smf = Smf::parse(&bytes)?;

    let resolution = match smf.header.timing {
        Timing::Metrical(ticks) => ticks.as_int(),
        Timing::Timecode(..) => return Err(MidiError::UnsupportedTiming),
    };

    let tempo_map = TempoMap::from_smf(&smf, resolution);

    let mut notes = Vec::new();
    for track in &smf.tracks {
        collect_notes(track, &tempo_map, &mut notes);
    }
    notes.sort_by(|a, b| {
        a.start
            .partial_cmp(&b.start)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pitch.cmp(&b.pitch))
    });

    Ok(MidiPiece {
        resolution,
        initial_tempo: tempo_map.initial_tempo(),
        notes,
    })
}

/// Render a fragment as SMF bytes: one piano track (program 0) at the
/// given resolution, with the tempo written as a meta event and used
/// for the seconds-to-ticks conversion.
pub fn render_fragment(
    notes: &[Note],
    resolution: u16,
    tempo: u32,
) -> Result<Vec<u8>, MidiError> {
    let ticks_per_sec = resolution as f64 * 1_000_000.0 / tempo as f64;
    let to_tick = |sec: f64| (sec.max(0.0) * ticks_per_sec).round() as u32;

    // (tick, off-before-on priority, kind) for stable ordering when a
    // pitch is restruck at the same tick.
    let mut events: Vec<(u32, u8, TrackEventKind)> = Vec::with_capacity(notes.len() * 2 + 2);
    events.push((
        0,
        0,
        TrackEventKind::Meta(MetaMessage::Tempo(tempo.into())),
    ));
    events.push((
        0,
        0,
        TrackEventKind::Midi {
            channel: 0.into(),
            message: MidiMessage::ProgramChange { program: 0.into() },
        },
    ));

    for note in notes {
        events.push((
            to_tick(note.start),
            1,
            TrackEventKind::Midi {
                channel: 0.into(),
                message: MidiMessage::NoteOn {
                    key: note.pitch.into(),
                    vel: note.velocity.into(),
                },
            },
        ));
        events.push((
            to_tick(note.end),
            0,
            TrackEventKind::Midi {
                channel: 0.into(),
                message: MidiMessage::NoteOff {
                    key: note.pitch.into(),
                    vel: 0.into(),
                },
            },
        ));
    }

    events.sort_by_key(|(tick, priority, _)| (*tick, *priority));

    let mut track = Vec::with_capacity(events.len() + 1);
    let mut last_tick = 0u32;
    for (tick, _, kind) in events {
        track.push(TrackEvent {
            delta: tick.saturating_sub(last_tick).into(),
            kind,
        });
        last_tick = tick;
    }
    track.push(TrackEvent {
        delta: 0.into(),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header {
            format: Format::SingleTrack,
            timing: Timing::Metrical(resolution.into()),
        },
        tracks: vec![track],
    };

    let mut bytes = Vec::new();
    smf.write(&mut bytes)
        .map_err(|e| MidiError::Write(e.to_string()))?;
    Ok(bytes)
}

/// Tempo changes collected across all tracks, with precomputed
/// absolute seconds at each change point.
struct TempoMap {
    /// (tick, microseconds per quarter note, seconds at tick).
    changes: Vec<(u32, u32, f64)>,
    resolution: u16,
}

impl TempoMap {
    fn from_smf(smf: &Smf, resolution: u16) -> Self {
        let mut raw: Vec<(u32, u32)> = Vec::new();
        for track in &smf.tracks {
            let mut tick = 0u32;
            for event in track {
                tick = tick.saturating_add(event.delta.as_int());
                if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                    raw.push((tick, tempo.as_int()));
                }
            }
        }
        raw.sort_by_key(|(tick, _)| *tick);

        let mut changes: Vec<(u32, u32, f64)> = Vec::with_capacity(raw.len() + 1);
        changes.push((0, DEFAULT_TEMPO, 0.0));
        for (tick, tempo) in raw {
            let (prev_tick, prev_tempo, prev_sec) = *changes.last().unwrap_or(&(0, DEFAULT_TEMPO, 0.0));
            let sec = prev_sec
                + (tick - prev_tick) as f64 * prev_tempo as f64
                    / (resolution as f64 * 1_000_000.0);
            if tick == prev_tick {
                if let Some(last) = changes.last_mut() {
                    *last = (tick, tempo, prev_sec);
                }
            } else {
                changes.push((tick, tempo, sec));
            }
        }

        Self { changes, resolution }
    }

    fn seconds(&self, tick: u32) -> f64 {
        let at = self
            .changes
            .partition_point(|(change_tick, _, _)| *change_tick <= tick)
            - 1;
        let (change_tick, tempo, sec) = self.changes[at];
        sec + (tick - change_tick) as f64 * tempo as f64
            / (self.resolution as f64 * 1_000_000.0)
    }

    fn initial_tempo(&self) -> u32 {
        self.changes[0].1
    }
}

/// Walk one track, pairing note-on/note-off per (channel, key).
/// A NoteOn with velocity zero counts as a release; unmatched
/// note-ons at end of track are dropped.
fn collect_notes(track: &[TrackEvent], tempo_map: &TempoMap, notes: &mut Vec<Note>) {
    let mut tick = 0u32;
    let mut active: HashMap<(u8, u8), VecDeque<(u32, u8)>> = HashMap::new();

    for event in track {
        tick = tick.saturating_add(event.delta.as_int());

        let TrackEventKind::Midi { channel, message } = event.kind else {
            continue;
        };
        let channel = channel.as_int();

        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                active
                    .entry((channel, key.as_int()))
                    .or_default()
                    .push_back((tick, vel.as_int()));
            }
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                if let Some(pending) = active.get_mut(&(channel, key.as_int())) {
                    if let Some((start_tick, velocity)) = pending.pop_front() {
                        notes.push(Note {
                            pitch: key.as_int(),
                            velocity,
                            start: tempo_map.seconds(start_tick),
                            end: tempo_map.seconds(tick),
                            is_drum: channel == DRUM_CHANNEL,
                        });
                    }
                }
            }
            _ => {}
        }
    }
}
