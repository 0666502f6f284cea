use std::collections::BTreeSet;

/// Lowest port at or above `base` that no registered instance holds.
pub(crate) fn next_free_port(base: u16, taken: &BTreeSet<u16>) -> Option<u16> {
    (base..=u16::MAX).find(|p| !taken.contains(p))
}
