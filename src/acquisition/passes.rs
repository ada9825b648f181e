//! Pass planning.
//!
//! A pass is a run of consecutive scan points that the sequencer executes
//! without stopping. Passes end where a waiting axis changes value and at
//! `n_collect`.

use crate::scan::ScanExpansion;
use std::ops::RangeInclusive;

/// Passes covering `[first, n_collect)`.
pub fn plan_passes(scan: &ScanExpansion, first: usize, n_collect: usize) -> Vec<RangeInclusive<usize>> {
    let mut passes = Vec::new();
    let mut current = first;
    while current < n_collect.min(scan.n()) {
        let last = scan.range_last(current, n_collect);
        passes.push(current..=last);
        current = last + 1;
    }
    passes
}

/// Waiting axes whose value changes when point `i` starts.
pub fn wait_axes_changing_at(scan: &ScanExpansion, i: usize) -> Vec<usize> {
    scan.axes()
        .iter()
        .enumerate()
        .filter(|(_, axis)| axis.wait && (i == 0 || axis.index_at(i) != axis.index_at(i - 1)))
        .map(|(j, _)| j)
        .collect()
}
