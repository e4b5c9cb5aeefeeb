pub mod midi;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use md5::{Digest, Md5};
use serde::Deserialize;
use thiserror::Error;

use crate::segment::{EmotionSegment, Label};
use midi::{MidiError, MidiPiece, Note};

#[derive(Error, Debug)]
pub enum SliceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MIDI error: {0}")]
    Midi(#[from] MidiError),
    #[error("cannot parse metadata from file name: {0}")]
    BadName(String),
    #[error("segment [{start}, {end}) of {path} contains no notes")]
    EmptyFragment {
        path: String,
        start: usize,
        end: usize,
    },
}

/// What to do with a segment that selects zero notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyFragmentPolicy {
    /// Log and skip the segment (no file, no record).
    Skip,
    /// Fail validation for the whole piece.
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct SliceOptions {
    pub empty_fragments: EmptyFragmentPolicy,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            empty_fragments: EmptyFragmentPolicy::Skip,
        }
    }
}

/// Catalog metadata carried in the MIDI file stem as
/// underscore-delimited fields: series_console_game_title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceMetadata {
    pub series: String,
    pub console: String,
    pub game: String,
    pub piece: String,
}

impl PieceMetadata {
    /// Parse a file stem. The title keeps any extra underscores.
    pub fn parse_stem(stem: &str) -> Option<PieceMetadata> {
        let fields: Vec<&str> = stem.split('_').collect();
        if fields.len() < 4 {
            return None;
        }
        Some(PieceMetadata {
            series: fields[0].to_string(),
            console: fields[1].to_string(),
            game: fields[2].to_string(),
            piece: fields[3..].join("_"),
        })
    }
}

/// One emitted fragment record, full provenance included: duplicates
/// are emitted too, with `repeat` pointing at the first occurrence.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub piece_id: u32,
    pub metadata: PieceMetadata,
    pub part: usize,
    pub path: PathBuf,
    pub label: Label,
    pub hash: String,
    pub repeat: Option<usize>,
}

#[derive(Debug, Default)]
pub struct SliceOutput {
    pub fragments: Vec<Fragment>,
    pub duplicates: usize,
    pub skipped_empty: usize,
}

/// Cut one piece's MIDI file into fragments aligned to the segment
/// tilings and write them under `out_dir`.
///
/// Fragment names are `<stem>_<part>.mid` with the part ordinal
/// increasing over emitted fragments, so re-runs produce identical
/// names, bytes, and hashes.
pub fn slice_piece(
    piece_id: u32,
    midi_path: &Path,
    tilings: &[Vec<EmotionSegment>],
    measure_length: f64,
    out_dir: &Path,
    opts: &SliceOptions,
) -> Result<SliceOutput, SliceError> {
    let stem = midi_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SliceError::BadName(midi_path.to_string_lossy().to_string()))?;
    let metadata = PieceMetadata::parse_stem(stem)
        .ok_or_else(|| SliceError::BadName(stem.to_string()))?;

    let piece = midi::load(midi_path)?;

    let mut output = SliceOutput::default();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut part = 0usize;

    for tiling in tilings {
        for segment in tiling {
            let start = segment.start as f64 * measure_length;
            let end = (segment.start + segment.len) as f64 * measure_length;

            let notes = select_notes(&piece, start, end);
            if notes.is_empty() {
                match opts.empty_fragments {
                    EmptyFragmentPolicy::Skip => {
                        log::debug!(
                            "{}: segment [{}, {}) has no notes, skipped",
                            stem,
                            segment.start,
                            segment.start + segment.len
                        );
                        output.skipped_empty += 1;
                        continue;
                    }
                    EmptyFragmentPolicy::Fail => {
                        return Err(SliceError::EmptyFragment {
                            path: stem.to_string(),
                            start: segment.start,
                            end: segment.start + segment.len,
                        });
                    }
                }
            }

            let bytes = midi::render_fragment(&notes, piece.resolution, piece.initial_tempo)?;
            let hash = md5_hex(&bytes);

            let path = out_dir.join(format!("{stem}_{part}.mid"));
            std::fs::write(&path, &bytes)?;

            let repeat = match seen.get(&hash) {
                Some(&first) => {
                    log::debug!("{}: part {} repeats part {}", stem, part, first);
                    output.duplicates += 1;
                    Some(first)
                }
                None => {
                    seen.insert(hash.clone(), part);
                    None
                }
            };

            output.fragments.push(Fragment {
                piece_id,
                metadata: metadata.clone(),
                part,
                path,
                label: segment.label,
                hash,
                repeat,
            });
            part += 1;
        }
    }

    Ok(output)
}

/// Notes from non-percussion tracks whose onset lies in [start, end),
/// re-based so the fragment starts at time zero.
fn select_notes(piece: &MidiPiece, start: f64, end: f64) -> Vec<Note> {
    piece
        .notes
        .iter()
        .filter(|n| !n.is_drum && n.start >= start && n.start < end)
        .map(|n| Note {
            start: n.start - start,
            end: n.end - start,
            ..*n
        })
        .collect()
}

fn md5_hex(bytes: &[u8]) -> String {
    let digest = Md5::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{EmotionSegment, Label};

    fn signs(valence: i8, arousal: i8) -> Label {
        Label::Signs { valence, arousal }
    }

    /// Two measures of C, two measures of E (channel 0), plus a snare
    /// hit on the percussion channel during measure 2. Hand-built so
    /// the drum note really lives on channel 9. At the default tempo
    /// and 480 ppq a quarter note is 0.5 s, so a 1 s measure spans
    /// 960 ticks.
    fn write_test_midi(dir: &Path) -> PathBuf {
        use midly::{num::u28, Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

        let on = |channel: u8, key: u8| TrackEventKind::Midi {
            channel: channel.into(),
            message: MidiMessage::NoteOn {
                key: key.into(),
                vel: 90.into(),
            },
        };
        let off = |channel: u8, key: u8| TrackEventKind::Midi {
            channel: channel.into(),
            message: MidiMessage::NoteOff {
                key: key.into(),
                vel: 0.into(),
            },
        };
        let ev = |delta: u32, kind| TrackEvent {
            delta: u28::from(delta),
            kind,
        };

        // (absolute tick, kind): melody C4 in measures 0-1, E4 in 2-3,
        // snare at 1.5 s on channel 9.
        let mut events = vec![
            (0, on(0, 60)),
            (864, off(0, 60)),
            (960, on(0, 60)),
            (1824, off(0, 60)),
            (1440, on(9, 38)),
            (1536, off(9, 38)),
            (1920, on(0, 64)),
            (2784, off(0, 64)),
            (2880, on(0, 64)),
            (3744, off(0, 64)),
        ];
        events.sort_by_key(|(tick, _)| *tick);

        let mut track = Vec::new();
        let mut last = 0u32;
        for (tick, kind) in events {
            track.push(ev(tick - last, kind));
            last = tick;
        }
        track.push(ev(0, TrackEventKind::Meta(MetaMessage::EndOfTrack)));

        let smf = Smf {
            header: Header {
                format: Format::SingleTrack,
                timing: Timing::Metrical(480.into()),
            },
            tracks: vec![track],
        };
        let mut bytes = Vec::new();
        smf.write(&mut bytes).unwrap();

        let path = dir.join("Zelda_N64_OcarinaOfTime_Overworld.mid");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn seg(start: usize, len: usize) -> EmotionSegment {
        EmotionSegment {
            start,
            len,
            label: signs(1, 1),
        }
    }

    #[test]
    fn test_parse_stem() {
        let m = PieceMetadata::parse_stem("Zelda_N64_OcarinaOfTime_Overworld").unwrap();
        assert_eq!(m.series, "Zelda");
        assert_eq!(m.console, "N64");
        assert_eq!(m.game, "OcarinaOfTime");
        assert_eq!(m.piece, "Overworld");
    }

    #[test]
    fn test_parse_stem_title_keeps_underscores() {
        let m = PieceMetadata::parse_stem("FF_SNES_FinalFantasyVI_Terras_Theme").unwrap();
        assert_eq!(m.piece, "Terras_Theme");
    }

    #[test]
    fn test_parse_stem_too_few_fields() {
        assert!(PieceMetadata::parse_stem("just_three_fields").is_none());
    }

    #[test]
    fn test_slice_emits_fragments_with_deterministic_names() {
        let tmp = tempfile::tempdir().unwrap();
        let midi_path = write_test_midi(tmp.path());
        let out = tmp.path().join("fragments");
        std::fs::create_dir(&out).unwrap();

        // 4 measures of 1 s each, split [0,2) and [2,4).
        let tilings = vec![vec![seg(0, 2), seg(2, 2)]];
        let result = slice_piece(8000, &midi_path, &tilings, 1.0, &out, &SliceOptions::default())
            .unwrap();

        assert_eq!(result.fragments.len(), 2);
        assert_eq!(result.duplicates, 0);
        assert!(result.fragments[0]
            .path
            .ends_with("Zelda_N64_OcarinaOfTime_Overworld_0.mid"));
        assert!(result.fragments[1]
            .path
            .ends_with("Zelda_N64_OcarinaOfTime_Overworld_1.mid"));
        assert!(result.fragments.iter().all(|f| f.path.exists()));

        // The snare hit at 1.5 s sits inside the first segment but is
        // percussion, so it must not survive into the fragment.
        let first = midi::load(&result.fragments[0].path).unwrap();
        assert!(first.notes.iter().all(|n| n.pitch == 60));
    }

    #[test]
    fn test_notes_rebased_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let midi_path = write_test_midi(tmp.path());
        let out = tmp.path().join("fragments");
        std::fs::create_dir(&out).unwrap();

        let tilings = vec![vec![seg(0, 2), seg(2, 2)]];
        let result = slice_piece(8000, &midi_path, &tilings, 1.0, &out, &SliceOptions::default())
            .unwrap();

        // The second fragment's first note (E at 2.0 s) starts at zero.
        let second = midi::load(&result.fragments[1].path).unwrap();
        assert!(second.notes[0].start.abs() < 1e-3);
        assert_eq!(second.notes[0].pitch, 64);
    }

    #[test]
    fn test_identical_segments_get_repeat_pointer() {
        let tmp = tempfile::tempdir().unwrap();
        let midi_path = write_test_midi(tmp.path());
        let out = tmp.path().join("fragments");
        std::fs::create_dir(&out).unwrap();

        // Measure 1 and measure 3 hold different pitches; measures
        // [0,1) and [0,1) again via two tilings are byte-identical.
        let tilings = vec![vec![seg(0, 4)], vec![seg(0, 4)]];
        let result = slice_piece(8000, &midi_path, &tilings, 1.0, &out, &SliceOptions::default())
            .unwrap();

        assert_eq!(result.fragments.len(), 2);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.fragments[0].repeat, None);
        assert_eq!(result.fragments[1].repeat, Some(0));
        assert_eq!(result.fragments[0].hash, result.fragments[1].hash);
    }

    #[test]
    fn test_rerun_hashes_are_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let midi_path = write_test_midi(tmp.path());
        let out = tmp.path().join("fragments");
        std::fs::create_dir(&out).unwrap();

        let tilings = vec![vec![seg(0, 2), seg(2, 2)]];
        let first = slice_piece(8000, &midi_path, &tilings, 1.0, &out, &SliceOptions::default())
            .unwrap();
        let second = slice_piece(8000, &midi_path, &tilings, 1.0, &out, &SliceOptions::default())
            .unwrap();

        let first_hashes: Vec<&str> = first.fragments.iter().map(|f| f.hash.as_str()).collect();
        let second_hashes: Vec<&str> = second.fragments.iter().map(|f| f.hash.as_str()).collect();
        assert_eq!(first_hashes, second_hashes);
    }

    #[test]
    fn test_empty_segment_skip_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let midi_path = write_test_midi(tmp.path());
        let out = tmp.path().join("fragments");
        std::fs::create_dir(&out).unwrap();

        // Measures [4, 6) are past every note.
        let tilings = vec![vec![seg(0, 4), seg(4, 2)]];
        let result = slice_piece(8000, &midi_path, &tilings, 1.0, &out, &SliceOptions::default())
            .unwrap();

        assert_eq!(result.fragments.len(), 1);
        assert_eq!(result.skipped_empty, 1);
    }

    #[test]
    fn test_empty_segment_fail_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let midi_path = write_test_midi(tmp.path());
        let out = tmp.path().join("fragments");
        std::fs::create_dir(&out).unwrap();

        let tilings = vec![vec![seg(0, 4), seg(4, 2)]];
        let opts = SliceOptions {
            empty_fragments: EmptyFragmentPolicy::Fail,
        };
        assert!(matches!(
            slice_piece(8000, &midi_path, &tilings, 1.0, &out, &opts),
            Err(SliceError::EmptyFragment { .. })
        ));
    }

    #[test]
    fn test_md5_hex_known_value() {
        // RFC 1321 test vector.
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
