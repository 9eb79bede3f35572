//! Partitioner error types.

use thiserror::Error;

/// Invalid [`RegionizerConfig`](crate::RegionizerConfig).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Empty sections must be created at least one section around an occupied one.
    #[error("empty section create radius must be > 0, got {0}")]
    CreateRadius(i32),

    /// Sections further apart than this never merge.
    #[error("region section merge radius must be > 0, got {0}")]
    MergeRadius(i32),

    /// Sections wider than 2^15 cells would overflow the cell bitset.
    #[error("section shift must be in 0..=15, got {0}")]
    SectionShift(u32),

    /// Dead fraction is a ratio.
    #[error("max dead section percent must be within [0, 1], got {0}")]
    DeadSectionPercent(f64),
}

/// Result type for config validation.
pub type ConfigResult<T> = Result<T, ConfigError>;
