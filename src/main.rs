use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use moodcut::build::{BuildPaths, BuildResult};
use moodcut::consensus::{Distance, Extraction, Strategy};
use moodcut::dataset::manifest::ManifestRow;
use moodcut::dataset::SplitOptions;
use moodcut::segment::{Label, LabelScheme};
use moodcut::slice::EmptyFragmentPolicy;

#[derive(Parser)]
#[command(name = "moodcut", version, about = "Emotion-labeled MIDI phrase dataset builder")]
struct Cli {
    /// Path to a TOML config file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the labeled fragment corpus from annotations and MIDI files
    Build {
        /// Directory with annotation JSON files (one per collection round)
        #[arg(long)]
        annotations: PathBuf,

        /// Directory with the annotated MIDI files
        #[arg(long)]
        midi: PathBuf,

        /// Output directory for fragment MIDI files
        #[arg(long)]
        fragments: PathBuf,

        /// Combined manifest output path
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Train manifest output path
        #[arg(long)]
        train: Option<PathBuf>,

        /// Test manifest output path
        #[arg(long)]
        test: Option<PathBuf>,

        /// Values with magnitude below this are ambiguous
        #[arg(long)]
        ambiguity_threshold: Option<f64>,

        /// Maximum tolerated fraction of ambiguous measures per dimension
        #[arg(long)]
        ambiguity_allowed: Option<f64>,

        /// Share of fragments assigned to the test set
        #[arg(long)]
        test_fraction: Option<f64>,

        /// Highest power-of-two re-tiling granularity (1 = no augmentation)
        #[arg(long)]
        max_granularity: Option<usize>,

        /// Keep repeat-marked fragments in the train/test split
        #[arg(long)]
        keep_duplicates: bool,

        /// Consensus strategy
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,

        /// Curve distance for clustering and nearest-centroid extraction
        #[arg(long, value_enum)]
        distance: Option<Distance>,

        /// Representative-curve extraction method
        #[arg(long, value_enum)]
        extraction: Option<Extraction>,

        /// Label scheme
        #[arg(long, value_enum)]
        labels: Option<LabelScheme>,

        /// Policy for segments that select zero notes
        #[arg(long, value_enum)]
        empty_fragments: Option<EmptyFragmentPolicy>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },

    /// Re-partition an existing manifest into train/test manifests
    Split {
        /// Combined manifest to read
        #[arg(long)]
        manifest: PathBuf,

        /// Train manifest output path
        #[arg(long)]
        train: PathBuf,

        /// Test manifest output path
        #[arg(long)]
        test: PathBuf,

        /// Share of fragments assigned to the test set
        #[arg(long)]
        test_fraction: Option<f64>,

        /// Keep repeat-marked fragments
        #[arg(long)]
        keep_duplicates: bool,
    },

    /// Show fragment counts and label distribution for a manifest
    Stats {
        /// Manifest to read
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Show rater demographic distributions across annotation rounds
    Demographics {
        /// Directory with annotation JSON files
        #[arg(long)]
        annotations: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let mut config = moodcut::config::AppConfig::load(cli.config.as_deref());

    match cli.command {
        Commands::Build {
            annotations,
            midi,
            fragments,
            manifest,
            train,
            test,
            ambiguity_threshold,
            ambiguity_allowed,
            test_fraction,
            max_granularity,
            keep_duplicates,
            strategy,
            distance,
            extraction,
            labels,
            empty_fragments,
            jobs,
        } => {
            // CLI overrides config overrides defaults.
            if let Some(v) = ambiguity_threshold {
                config.ambiguity_threshold = v;
            }
            if let Some(v) = ambiguity_allowed {
                config.ambiguity_allowed = v;
            }
            if let Some(v) = test_fraction {
                config.test_fraction = v;
            }
            if let Some(v) = max_granularity {
                config.max_granularity = v;
            }
            if keep_duplicates {
                config.remove_duplicates = false;
            }
            if let Some(v) = strategy {
                config.strategy = v;
            }
            if let Some(v) = distance {
                config.distance = v;
            }
            if let Some(v) = extraction {
                config.extraction = v;
            }
            if let Some(v) = labels {
                config.labels = v;
            }
            if let Some(v) = empty_fragments {
                config.empty_fragments = v;
            }

            // Fatal before any processing begins.
            config.validate().context("Invalid configuration")?;

            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let paths = BuildPaths {
                annotations,
                midi,
                fragments,
                manifest,
                train,
                test,
            };

            let result = moodcut::build::build_dataset(&paths, &config, workers)
                .context("Build failed")?;
            print_build_summary(&result);
        }

        Commands::Split {
            manifest,
            train,
            test,
            test_fraction,
            keep_duplicates,
        } => {
            if let Some(v) = test_fraction {
                config.test_fraction = v;
            }
            if keep_duplicates {
                config.remove_duplicates = false;
            }
            config.validate().context("Invalid configuration")?;

            let rows = moodcut::dataset::manifest::read(&manifest)
                .with_context(|| format!("Failed to read {}", manifest.display()))?;
            let split = moodcut::dataset::split(
                &rows,
                &SplitOptions {
                    test_fraction: config.test_fraction,
                    remove_duplicates: config.remove_duplicates,
                },
            );
            moodcut::dataset::manifest::write_split(&train, &split.train)
                .context("Failed to write train manifest")?;
            moodcut::dataset::manifest::write_split(&test, &split.test)
                .context("Failed to write test manifest")?;

            println!(
                "Split complete: {} train fragments, {} test fragments",
                split.train.len(),
                split.test.len()
            );
        }

        Commands::Stats { manifest } => {
            let rows = moodcut::dataset::manifest::read(&manifest)
                .with_context(|| format!("Failed to read {}", manifest.display()))?;
            print_stats(&rows);
        }

        Commands::Demographics { annotations } => {
            let demo = moodcut::annotation::demographics(&annotations)
                .context("Demographics failed")?;

            println!("Rater Demographics ({} annotations)", demo.total);
            println!("==================");
            print_distribution("Age", &demo.age);
            print_distribution("Gender", &demo.gender);
            print_distribution("Musicianship", &demo.musicianship);
        }
    }

    Ok(())
}

fn print_build_summary(result: &BuildResult) {
    println!(
        "Build complete: {} pieces processed, {} discarded (ambiguity), {} unrated, {} failed",
        result.pieces_processed,
        result.pieces_ambiguous,
        result.pieces_unrated,
        result.pieces_failed
    );
    println!(
        "Fragments: {} emitted, {} duplicates, {} empty segments skipped",
        result.fragments, result.duplicates, result.skipped_empty
    );
    if result.train_fragments + result.test_fragments > 0 {
        println!(
            "Dataset: {} train, {} test",
            result.train_fragments, result.test_fragments
        );
    }
}

fn print_stats(rows: &[ManifestRow]) {
    let pieces: std::collections::BTreeSet<u32> = rows.iter().map(|r| r.id).collect();
    let duplicates = rows.iter().filter(|r| r.is_duplicate()).count();

    let mut labels: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        let key = match row.emotion_label() {
            Label::Signs { valence, arousal } => format!("valence {valence:+}, arousal {arousal:+}"),
            Label::Mood(m) => m.name().to_string(),
        };
        *labels.entry(key).or_insert(0) += 1;
    }

    println!("Manifest Statistics");
    println!("===================");
    println!("Fragments:   {}", rows.len());
    println!("Pieces:      {}", pieces.len());
    println!("Duplicates:  {}", duplicates);
    println!();

    if !labels.is_empty() {
        println!("Labels:");
        for (label, count) in &labels {
            println!("  {:<28} {}", label, count);
        }
    }
}

fn print_distribution(title: &str, entries: &[(String, f64)]) {
    if entries.is_empty() {
        return;
    }
    println!();
    println!("{title}:");
    for (key, fraction) in entries {
        println!("  {:<16} {:>5.1}%", key, fraction * 100.0);
    }
}
