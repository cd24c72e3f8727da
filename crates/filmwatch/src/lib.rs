pub mod cycle;
pub mod source;
pub mod tracker;
pub mod types;
pub mod utils;

pub use cycle::{CycleReport, ScrapeCycle};
pub use source::{JsonSource, ObservationSource, SourceError};
pub use tracker::{NoveltyTracker, TrackerError};

/// Database file used when none is configured.
pub const DEFAULT_DB_PATH: &str = "movies.db";
