//! Collapse overlapping page fetches into one sorted, unique sequence.

use crate::Observation;

/// Sort `observations` newest first and drop repeated records.
///
/// Copies of one logical record always sort next to each other because the
/// ordering keys are exactly the identity keys, so one linear pass is enough.
/// The first copy in sorted order is kept; the sort is stable, so that is the
/// copy that appeared first in the input.
pub fn dedup(mut observations: Vec<Observation>) -> Vec<Observation> {
    observations.sort();

    let mut unique: Vec<Observation> = Vec::with_capacity(observations.len());
    for obs in observations {
        match unique.last() {
            Some(standard) if *standard == obs => {}
            _ => unique.push(obs),
        }
    }
    unique
}

/// Index of the first element whose timestamp is newer than its
/// predecessor's, i.e. where the newest-first order the diff relies on breaks.
pub fn first_unsorted_index(observations: &[Observation]) -> Option<usize> {
    observations
        .windows(2)
        .position(|pair| pair[0].timestamp() < pair[1].timestamp())
        .map(|i| i + 1)
}

pub fn is_sorted_for_diff(observations: &[Observation]) -> bool {
    first_unsorted_index(observations).is_none()
}
