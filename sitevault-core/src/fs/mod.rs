//! File system walking and exclusion rules.

pub mod exclude;
pub mod walker;

pub use exclude::{ExcludeRule, ExcludeSet};
pub use walker::{scan_totals, walk_directory, walk_directory_with_callback, FileInfo, WalkOptions, WalkTotals};
