//! Forward-only merge of a previous master snapshot against a fresh one.

use serde::Serialize;
use thiserror::Error;

use crate::dedup::first_unsorted_index;
use crate::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffSide {
    Previous,
    Current,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("{side:?} snapshot is not newest-first: timestamp increases at index {index}")]
    Unsorted { side: DiffSide, index: usize },
}

/// Records of `current` not accounted for by `previous`, in `current` order.
///
/// Both inputs must be ordered by non-increasing timestamp; this is checked
/// up front. A single cursor walks `previous`:
///
/// - once `previous` is exhausted every remaining record is new;
/// - a record newer than the cursor, or at the same timestamp from another
///   observer, is new and the cursor stays put;
/// - anything else is taken as the cursor's record and consumes it.
///
/// Records that share both timestamp and observer collapse into one even when
/// their magnitudes differ.
pub fn diff(previous: &[Observation], current: &[Observation]) -> Result<Vec<Observation>, DiffError> {
    if let Some(index) = first_unsorted_index(previous) {
        return Err(DiffError::Unsorted {
            side: DiffSide::Previous,
            index,
        });
    }
    if let Some(index) = first_unsorted_index(current) {
        return Err(DiffError::Unsorted {
            side: DiffSide::Current,
            index,
        });
    }

    let mut cursor = 0usize;
    let mut added = Vec::new();

    for obs in current {
        let Some(prev) = previous.get(cursor) else {
            added.push(obs.clone());
            continue;
        };

        let newer = prev.timestamp() < obs.timestamp()
            || (prev.timestamp() == obs.timestamp() && prev.observer_id() != obs.observer_id());

        if newer {
            added.push(obs.clone());
        } else {
            cursor += 1;
        }
    }

    Ok(added)
}
