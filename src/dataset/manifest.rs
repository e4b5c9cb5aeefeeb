//! CSV manifests: one row per fragment, re-readable so the train/test
//! partition can be re-run without re-slicing.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::segment::{Label, Mood};
use crate::slice::Fragment;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One manifest row. The signs scheme fills `valence`/`arousal`, the
/// mood scheme fills `label`; the unused columns stay empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub id: u32,
    pub series: String,
    pub console: String,
    pub game: String,
    pub piece: String,
    pub midi: String,
    pub valence: Option<i8>,
    pub arousal: Option<i8>,
    pub label: Option<Mood>,
    pub part: usize,
    pub repeat: Option<usize>,
}

impl ManifestRow {
    pub fn from_fragment(f: &Fragment) -> Self {
        let (valence, arousal, label) = match f.label {
            Label::Signs { valence, arousal } => (Some(valence), Some(arousal), None),
            Label::Mood(m) => (None, None, Some(m)),
        };
        Self {
            id: f.piece_id,
            series: f.metadata.series.clone(),
            console: f.metadata.console.clone(),
            game: f.metadata.game.clone(),
            piece: f.metadata.piece.clone(),
            midi: f.path.to_string_lossy().to_string(),
            valence,
            arousal,
            label,
            part: f.part,
            repeat: f.repeat,
        }
    }

    /// Reconstruct the label from whichever columns are present.
    pub fn emotion_label(&self) -> Label {
        match self.label {
            Some(m) => Label::Mood(m),
            None => Label::Signs {
                valence: self.valence.unwrap_or(0),
                arousal: self.arousal.unwrap_or(0),
            },
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.repeat.is_some()
    }
}

/// Write the combined manifest, sorted by output path for stable diffs.
pub fn write_combined(path: &Path, rows: &[ManifestRow]) -> Result<(), ManifestError> {
    let mut sorted: Vec<&ManifestRow> = rows.iter().collect();
    sorted.sort_by(|a, b| a.midi.cmp(&b.midi));
    write_rows(path, &sorted)
}

/// Write a train or test manifest, sorted by (piece id, part).
pub fn write_split(path: &Path, rows: &[ManifestRow]) -> Result<(), ManifestError> {
    let mut sorted: Vec<&ManifestRow> = rows.iter().collect();
    sorted.sort_by_key(|r| (r.id, r.part));
    write_rows(path, &sorted)
}

fn write_rows(path: &Path, rows: &[&ManifestRow]) -> Result<(), ManifestError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<ManifestRow>, ManifestError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}
