//! The per-piece pipeline: filter raters, build consensus curves,
//! segment, slice, then hand everything to the dataset splitter.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::annotation::{self, PieceAnnotations};
use crate::config::AppConfig;
use crate::consensus::{self, ConsensusError, ConsensusOptions};
use crate::dataset::manifest::{self, ManifestError, ManifestRow};
use crate::dataset::{self, SplitOptions};
use crate::segment::{self, SegmentOptions, SegmentOutcome};
use crate::slice::{self, SliceError, SliceOptions};
use crate::BASE_PIECE_ID;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Annotation error: {0}")]
    Annotation(#[from] annotation::AnnotationError),
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single piece produced no fragments. Failures are isolated
/// per piece and never fatal to the batch.
#[derive(Error, Debug)]
enum PieceError {
    #[error("consensus failed: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("slicing failed: {0}")]
    Slice(#[from] SliceError),
}

/// Input and output locations for one build run.
pub struct BuildPaths {
    pub annotations: PathBuf,
    pub midi: PathBuf,
    pub fragments: PathBuf,
    pub manifest: Option<PathBuf>,
    pub train: Option<PathBuf>,
    pub test: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct BuildResult {
    pub pieces_processed: u64,
    /// Pieces rejected because too many measures were near-neutral.
    pub pieces_ambiguous: u64,
    /// Pieces with no surviving rater series after filtering.
    pub pieces_unrated: u64,
    /// Pieces that failed on consensus or a corrupt MIDI file.
    pub pieces_failed: u64,
    pub fragments: u64,
    pub duplicates: u64,
    pub skipped_empty: u64,
    pub train_fragments: u64,
    pub test_fragments: u64,
}

enum PieceOutcome {
    Built(slice::SliceOutput),
    Ambiguous,
    Unrated,
}

/// Run the full pipeline over every annotated piece.
///
/// Pieces are processed in parallel chunks; results are collected
/// serially after each chunk, so the shared fragment list never needs
/// a lock. The dataset split runs strictly after the last piece.
pub fn build_dataset(
    paths: &BuildPaths,
    config: &AppConfig,
    workers: usize,
) -> Result<BuildResult, BuildError> {
    let pieces = annotation::load_annotations(&paths.annotations)?;
    if pieces.is_empty() {
        log::info!("No annotated pieces to process");
        return Ok(BuildResult::default());
    }

    std::fs::create_dir_all(&paths.fragments)?;

    log::info!("Processing {} pieces with {} workers", pieces.len(), workers);

    let pb = ProgressBar::new(pieces.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .unwrap();

    let mut result = BuildResult::default();
    let mut rows: Vec<ManifestRow> = Vec::new();

    // Process in chunks: slice a chunk in parallel, collect its
    // results, move on. Keeps memory bounded and the accumulator
    // single-threaded.
    let indexed: Vec<(usize, &PieceAnnotations)> = pieces.iter().enumerate().collect();
    let chunk_size = (workers * 2).max(1);

    for chunk in indexed.chunks(chunk_size) {
        let outcomes: Vec<_> = pool.install(|| {
            use rayon::prelude::*;
            chunk
                .par_iter()
                .map(|(index, piece)| {
                    let outcome = process_piece(*index, piece, paths, config);
                    pb.inc(1);
                    (*index, piece.name.clone(), outcome)
                })
                .collect()
        });

        for (_, name, outcome) in outcomes {
            match outcome {
                Ok(PieceOutcome::Built(output)) => {
                    result.pieces_processed += 1;
                    result.fragments += output.fragments.len() as u64;
                    result.duplicates += output.duplicates as u64;
                    result.skipped_empty += output.skipped_empty as u64;
                    rows.extend(output.fragments.iter().map(ManifestRow::from_fragment));
                }
                Ok(PieceOutcome::Ambiguous) => {
                    result.pieces_ambiguous += 1;
                }
                Ok(PieceOutcome::Unrated) => {
                    result.pieces_unrated += 1;
                }
                Err(e) => {
                    log::warn!("Piece {} failed: {}", name, e);
                    result.pieces_failed += 1;
                }
            }
        }

        pb.set_message(format!(
            "{} fragments, {} duplicates",
            result.fragments, result.duplicates
        ));
    }

    pb.finish_with_message(format!(
        "Done: {} pieces, {} fragments",
        result.pieces_processed, result.fragments
    ));

    if let Some(ref manifest_path) = paths.manifest {
        manifest::write_combined(manifest_path, &rows)?;
        log::info!("Wrote manifest to {}", manifest_path.display());
    }

    if paths.train.is_some() || paths.test.is_some() {
        let split = dataset::split(
            &rows,
            &SplitOptions {
                test_fraction: config.test_fraction,
                remove_duplicates: config.remove_duplicates,
            },
        );
        result.train_fragments = split.train.len() as u64;
        result.test_fragments = split.test.len() as u64;

        if let Some(ref train_path) = paths.train {
            manifest::write_split(train_path, &split.train)?;
        }
        if let Some(ref test_path) = paths.test {
            manifest::write_split(test_path, &split.test)?;
        }
    }

    Ok(result)
}

/// One piece end to end: filter raters, consensus per dimension,
/// segment, slice.
fn process_piece(
    index: usize,
    piece: &PieceAnnotations,
    paths: &BuildPaths,
    config: &AppConfig,
) -> Result<PieceOutcome, PieceError> {
    let valence = annotation::filter_series(&piece.valence, piece.measures, config.noise_variance);
    let arousal = annotation::filter_series(&piece.arousal, piece.measures, config.noise_variance);

    if valence.is_empty() || arousal.is_empty() {
        log::info!("{}: no usable rater series after filtering", piece.name);
        return Ok(PieceOutcome::Unrated);
    }

    let consensus_opts = ConsensusOptions {
        strategy: config.strategy,
        distance: config.distance,
        extraction: config.extraction,
        clusters: config.clusters,
        smoothing: config.smoothing,
        ..ConsensusOptions::default()
    };

    let (valence_curve, valence_sel) = consensus::consensus_curve(&valence, &consensus_opts)?;
    let (arousal_curve, arousal_sel) = consensus::consensus_curve(&arousal, &consensus_opts)?;
    if valence_sel.tie {
        log::info!(
            "{}: valence cluster size tie, candidates {:?}, selected {}",
            piece.name,
            valence_sel.candidates,
            valence_sel.index
        );
    }
    if arousal_sel.tie {
        log::info!(
            "{}: arousal cluster size tie, candidates {:?}, selected {}",
            piece.name,
            arousal_sel.candidates,
            arousal_sel.index
        );
    }

    let segment_opts = SegmentOptions {
        scheme: config.labels,
        ambiguity_threshold: config.ambiguity_threshold,
        ambiguity_allowed: config.ambiguity_allowed,
        history: config.history,
    };
    let segmentation = match segment::segment_curves(&valence_curve, &arousal_curve, &segment_opts)
    {
        SegmentOutcome::Segments(s) => s,
        SegmentOutcome::TooAmbiguous {
            valence_ratio,
            arousal_ratio,
        } => {
            log::info!(
                "{}: discarded as ambiguous (valence {:.2}, arousal {:.2})",
                piece.name,
                valence_ratio,
                arousal_ratio
            );
            return Ok(PieceOutcome::Ambiguous);
        }
    };

    let tilings = segment::granularity_tilings(&segmentation, config.max_granularity);

    let midi_path = resolve_midi_path(&paths.midi, &piece.midi);
    let slice_opts = SliceOptions {
        empty_fragments: config.empty_fragments,
    };
    let output = slice::slice_piece(
        BASE_PIECE_ID + index as u32,
        &midi_path,
        &tilings,
        piece.measure_length(),
        &paths.fragments,
        &slice_opts,
    )?;

    Ok(PieceOutcome::Built(output))
}

/// Annotation files may record the MIDI path from another machine;
/// only its file name matters here.
fn resolve_midi_path(midi_dir: &Path, recorded: &str) -> PathBuf {
    let name = Path::new(recorded)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(recorded));
    midi_dir.join(name)
}
