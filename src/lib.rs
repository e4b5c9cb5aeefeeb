pub mod annotation;
pub mod build;
pub mod config;
pub mod consensus;
pub mod dataset;
pub mod segment;
pub mod slice;

/// Application name for XDG paths
pub const APP_NAME: &str = "moodcut";

/// Annotation files are one JSON document per collection round
pub const ANNOTATION_EXT: &str = "json";

/// Numeric piece ids in emitted manifests start here, so fragment ids
/// never collide with ids from the unlabeled side of the catalog.
pub const BASE_PIECE_ID: u32 = 8000;
