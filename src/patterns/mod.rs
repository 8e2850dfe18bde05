//! Recurring-pattern mining over entity summaries.

pub mod detector;
pub mod similarity;

pub use detector::{BatchReport, PatternDetector};
pub use similarity::{cosine_similarity, day_bucket, week_bucket};
