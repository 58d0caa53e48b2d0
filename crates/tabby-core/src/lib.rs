//! Observation model plus the dedup and snapshot-diff engines for tabby-watch.

pub mod dedup;
pub mod diff;
pub mod observation;

pub use dedup::{dedup, first_unsorted_index, is_sorted_for_diff};
pub use diff::{diff, DiffError, DiffSide};
pub use observation::{
    Observation, ObservationField, ParseError, DELIMITER, FIELD_COUNT, UNKNOWN_UNCERTAINTY,
};

pub const CRATE_NAME: &str = "tabby-core";
