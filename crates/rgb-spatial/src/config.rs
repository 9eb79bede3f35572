//! Partitioner tuning.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Tuning knobs for a [`Regionizer`](crate::Regionizer).
///
/// `min_section_recalc_count` and `max_dead_section_percent` trade GC frequency
/// against split-check cost: dead sections are only collected at release time,
/// and only once a region has at least `min_section_recalc_count` sections of
/// which at least `max_dead_section_percent` are dead (or it has none alive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionizerConfig {
    /// log2 of a section's side length in cells.
    pub section_shift: u32,
    /// Empty sections kept around every occupied section (square radius).
    pub empty_section_create_radius: i32,
    /// Sections within this square radius belong to the same region.
    pub region_section_merge_radius: i32,
    /// Minimum section count before dead-fraction GC is considered (clamped to ≥ 2).
    pub min_section_recalc_count: usize,
    /// Dead-section fraction that triggers GC and a split check.
    pub max_dead_section_percent: f64,
}

impl Default for RegionizerConfig {
    fn default() -> Self {
        Self {
            section_shift: 4,
            empty_section_create_radius: 2,
            region_section_merge_radius: 1,
            min_section_recalc_count: 6,
            max_dead_section_percent: 1.0 / 6.0,
        }
    }
}

impl RegionizerConfig {
    /// Set the section shift.
    #[must_use]
    pub const fn with_section_shift(mut self, shift: u32) -> Self {
        self.section_shift = shift;
        self
    }

    /// Set the empty section create radius.
    #[must_use]
    pub const fn with_create_radius(mut self, radius: i32) -> Self {
        self.empty_section_create_radius = radius;
        self
    }

    /// Set the merge radius.
    #[must_use]
    pub const fn with_merge_radius(mut self, radius: i32) -> Self {
        self.region_section_merge_radius = radius;
        self
    }

    /// Set the GC thresholds.
    #[must_use]
    pub const fn with_gc(mut self, min_section_recalc_count: usize, max_dead_section_percent: f64) -> Self {
        self.min_section_recalc_count = min_section_recalc_count;
        self.max_dead_section_percent = max_dead_section_percent;
        self
    }

    /// Check every field is usable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.empty_section_create_radius <= 0 {
            return Err(ConfigError::CreateRadius(self.empty_section_create_radius));
        }
        if self.region_section_merge_radius <= 0 {
            return Err(ConfigError::MergeRadius(self.region_section_merge_radius));
        }
        if self.section_shift > 15 {
            return Err(ConfigError::SectionShift(self.section_shift));
        }
        if !(0.0..=1.0).contains(&self.max_dead_section_percent) {
            return Err(ConfigError::DeadSectionPercent(self.max_dead_section_percent));
        }
        Ok(())
    }

    /// Side length of a section in cells.
    #[must_use]
    pub const fn section_size(&self) -> i32 {
        1 << self.section_shift
    }

    /// Radius used when recomputing connectivity at split time.
    #[must_use]
    pub fn split_radius(&self) -> i32 {
        self.region_section_merge_radius
            .max(self.empty_section_create_radius)
    }

    pub(crate) fn effective_min_recalc_count(&self) -> usize {
        self.min_section_recalc_count.max(2)
    }
}
