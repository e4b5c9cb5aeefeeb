use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use walkdir::WalkDir;

use crate::consensus::tsmath;
use crate::ANNOTATION_EXT;

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no annotation files found in {0}")]
    EmptyDirectory(String),
}

/// One collection round as stored on disk: a piece table plus per-rater
/// records keyed by `<piece_id>_<rater_id>`.
#[derive(Debug, Deserialize)]
struct AnnotationFile {
    pieces: HashMap<String, PieceMeta>,
    annotations: HashMap<String, RaterRecord>,
}

#[derive(Debug, Deserialize)]
struct PieceMeta {
    name: String,
    midi: String,
    measures: usize,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct RaterRecord {
    valence: Vec<f64>,
    arousal: Vec<f64>,
    #[serde(default)]
    age: Option<serde_json::Value>,
    #[serde(default)]
    gender: Option<serde_json::Value>,
    #[serde(default)]
    musicianship: Option<serde_json::Value>,
}

/// All rater curves collected for one piece, both dimensions.
#[derive(Debug, Clone)]
pub struct PieceAnnotations {
    pub name: String,
    /// MIDI path as recorded in the annotation file.
    pub midi: String,
    pub measures: usize,
    pub duration: f64,
    pub valence: Vec<Vec<f64>>,
    pub arousal: Vec<Vec<f64>>,
}

impl PieceAnnotations {
    /// Seconds per measure. Annotation files with a non-positive
    /// duration or zero measures never make it past loading.
    pub fn measure_length(&self) -> f64 {
        self.duration / self.measures as f64
    }
}

/// Load every annotation round under `dir` and merge them into one
/// piece list. Pieces are re-numbered by position in the returned Vec,
/// so ids never collide across rounds. Unparseable files are skipped
/// with a warning; records pointing at a piece missing from their
/// file's piece table are discarded.
pub fn load_annotations(dir: &Path) -> Result<Vec<PieceAnnotations>, AnnotationError> {
    let files = annotation_files(dir)?;
    let mut joint = Vec::new();

    for path in &files {
        let data = match read_round(path) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        // Accumulate rater curves onto pieces in first-seen order.
        // Record keys are sorted so re-runs see the same order.
        let mut round: Vec<PieceAnnotations> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();

        let mut record_ids: Vec<&String> = data.annotations.keys().collect();
        record_ids.sort();

        for record_id in record_ids {
            let Some(piece_id) = record_id.split('_').next() else {
                continue;
            };
            let Some(meta) = data.pieces.get(piece_id) else {
                log::debug!(
                    "Record {} references unknown piece {}, discarded",
                    record_id,
                    piece_id
                );
                continue;
            };
            if meta.measures == 0 || meta.duration <= 0.0 {
                log::warn!("Piece {} has invalid measures/duration, discarded", piece_id);
                continue;
            }

            let at = *index.entry(piece_id).or_insert_with(|| {
                round.push(PieceAnnotations {
                    name: meta.name.clone(),
                    midi: meta.midi.clone(),
                    measures: meta.measures,
                    duration: meta.duration,
                    valence: Vec::new(),
                    arousal: Vec::new(),
                });
                round.len() - 1
            });

            let record = &data.annotations[record_id];
            round[at].valence.push(record.valence.clone());
            round[at].arousal.push(record.arousal.clone());
        }

        joint.extend(round);
    }

    Ok(joint)
}

/// Drop series that disagree on length or look like annotation noise.
///
/// Keeps only series matching the majority length among raters; if that
/// majority length disagrees with the piece's nominal measure count the
/// whole dimension is dropped (the consensus curve must match the
/// measure count). Series with population variance above
/// `noise_variance` are dropped as noise.
pub fn filter_series(
    series: &[Vec<f64>],
    measures: usize,
    noise_variance: f64,
) -> Vec<Vec<f64>> {
    if series.is_empty() {
        return Vec::new();
    }

    let mut counts: HashMap<usize, usize> = HashMap::new();
    for s in series {
        *counts.entry(s.len()).or_insert(0) += 1;
    }
    // Most frequent length; equal counts prefer the longer series.
    let majority_len = counts
        .iter()
        .max_by_key(|(len, count)| (**count, **len))
        .map(|(len, _)| *len)
        .unwrap_or(0);

    if majority_len != measures {
        return Vec::new();
    }

    series
        .iter()
        .filter(|s| s.len() == majority_len)
        .filter(|s| tsmath::variance(s) <= noise_variance)
        .cloned()
        .collect()
}

/// Rater demographic distributions across every annotation record,
/// as fractions of the total record count.
#[derive(Debug, Default)]
pub struct Demographics {
    pub total: usize,
    pub age: Vec<(String, f64)>,
    pub gender: Vec<(String, f64)>,
    pub musicianship: Vec<(String, f64)>,
}

/// Tally age/gender/musicianship over all annotation rounds in `dir`.
pub fn demographics(dir: &Path) -> Result<Demographics, AnnotationError> {
    let files = annotation_files(dir)?;

    let mut total = 0usize;
    let mut age: HashMap<String, usize> = HashMap::new();
    let mut gender: HashMap<String, usize> = HashMap::new();
    let mut musicianship: HashMap<String, usize> = HashMap::new();

    for path in &files {
        let data = match read_round(path) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        for record in data.annotations.values() {
            tally(&mut age, record.age.as_ref());
            tally(&mut gender, record.gender.as_ref());
            tally(&mut musicianship, record.musicianship.as_ref());
            total += 1;
        }
    }

    Ok(Demographics {
        total,
        age: to_fractions(age, total),
        gender: to_fractions(gender, total),
        musicianship: to_fractions(musicianship, total),
    })
}

fn tally(counts: &mut HashMap<String, usize>, value: Option<&serde_json::Value>) {
    let key = match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    };
    *counts.entry(key).or_insert(0) += 1;
}

fn to_fractions(counts: HashMap<String, usize>, total: usize) -> Vec<(String, f64)> {
    let mut out: Vec<(String, f64)> = counts
        .into_iter()
        .map(|(k, v)| (k, if total > 0 { v as f64 / total as f64 } else { 0.0 }))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Sorted list of `.json` files directly under `dir`.
fn annotation_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, AnnotationError> {
    let mut files: Vec<std::path::PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| x.eq_ignore_ascii_case(ANNOTATION_EXT))
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(AnnotationError::EmptyDirectory(
            dir.to_string_lossy().to_string(),
        ));
    }
    Ok(files)
}

fn read_round(path: &Path) -> Result<AnnotationFile, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| e.to_string())
}
