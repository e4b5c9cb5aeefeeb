use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::consensus::{Distance, Extraction, Strategy};
use crate::segment::LabelScheme;
use crate::slice::EmptyFragmentPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ambiguity_threshold must be in [0, 1], got {0}")]
    AmbiguityThreshold(f64),
    #[error("ambiguity_allowed must be in [0, 1], got {0}")]
    AmbiguityAllowed(f64),
    #[error("test_fraction must be in [0, 1), got {0}")]
    TestFraction(f64),
    #[error("noise_variance must be non-negative, got {0}")]
    NoiseVariance(f64),
    #[error("max_granularity must be a power of two, got {0}")]
    MaxGranularity(usize),
    #[error("clusters must be at least 1, got {0}")]
    Clusters(usize),
    #[error("history must be at least 1, got {0}")]
    History(usize),
}

/// Application configuration loaded from a TOML config file.
/// All fields have defaults, so the config file is optional, and
/// each value can still be overridden on the command line.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Values with magnitude below this are ambiguous (arousal uses
    /// half of it).
    pub ambiguity_threshold: f64,
    /// Maximum tolerated fraction of ambiguous measures per dimension.
    pub ambiguity_allowed: f64,
    /// Rater curves with variance above this are dropped as noise.
    pub noise_variance: f64,
    /// Share of fragments assigned to the test set.
    pub test_fraction: f64,
    /// Highest power-of-two re-tiling granularity (1 = no augmentation).
    pub max_granularity: usize,
    /// Context buffer size for ambiguity resolution.
    pub history: usize,
    /// Cluster count for the k-means strategy.
    pub clusters: usize,
    /// Moving-average window applied before k-means assignment.
    pub smoothing: usize,
    /// Drop repeat-marked fragments before the train/test split.
    pub remove_duplicates: bool,
    pub strategy: Strategy,
    pub distance: Distance,
    pub extraction: Extraction,
    pub labels: LabelScheme,
    pub empty_fragments: EmptyFragmentPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            ambiguity_threshold: 0.0,
            ambiguity_allowed: 1.0,
            noise_variance: 0.1,
            test_fraction: 0.1,
            max_granularity: 1,
            history: 8,
            clusters: 2,
            smoothing: 2,
            remove_duplicates: true,
            strategy: Strategy::SignPartition,
            distance: Distance::Euclidean,
            extraction: Extraction::Mean,
            labels: LabelScheme::Signs,
            empty_fragments: EmptyFragmentPolicy::Skip,
        }
    }
}

impl AppConfig {
    /// Load config from an explicit path, or from
    /// `~/.config/moodcut/config.toml`. Returns defaults if the file
    /// doesn't exist; logs a warning if it exists but can't be parsed.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = path.map(PathBuf::from).or_else(Self::default_config_path);
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Check numeric ranges. Called once at startup; any violation is
    /// fatal before processing begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.ambiguity_threshold) {
            return Err(ConfigError::AmbiguityThreshold(self.ambiguity_threshold));
        }
        if !(0.0..=1.0).contains(&self.ambiguity_allowed) {
            return Err(ConfigError::AmbiguityAllowed(self.ambiguity_allowed));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(ConfigError::TestFraction(self.test_fraction));
        }
        if self.noise_variance < 0.0 || !self.noise_variance.is_finite() {
            return Err(ConfigError::NoiseVariance(self.noise_variance));
        }
        if self.max_granularity == 0 || !self.max_granularity.is_power_of_two() {
            return Err(ConfigError::MaxGranularity(self.max_granularity));
        }
        if self.clusters == 0 {
            return Err(ConfigError::Clusters(self.clusters));
        }
        if self.history == 0 {
            return Err(ConfigError::History(self.history));
        }
        Ok(())
    }

    /// Resolve worker count: 0 means auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
