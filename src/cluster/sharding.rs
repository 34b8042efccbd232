//! Deterministic index-based partitioning of the mirror catalog
//!
//! The partition domain is the sorted sequence of tracked mirror IDs. Each
//! peer owns a contiguous slice of positions sized `round(M/N)`, with the
//! last peer absorbing the remainder. The catalog is small and churns
//! rarely, so exact balance matters more than the minimal-reshuffle
//! property consistent hashing would buy.

/// Insert `id` into the sorted index, keeping it unique. Idempotent.
pub(crate) fn insert_sorted(index: &mut Vec<String>, id: &str) {
    if let Err(pos) = index.binary_search_by(|entry| entry.as_str().cmp(id)) {
        index.insert(pos, id.to_string());
    }
}

/// Remove `id` from the sorted index. Removing an absent ID is a no-op.
pub(crate) fn remove_sorted(index: &mut Vec<String>, id: &str) {
    if let Ok(pos) = index.binary_search_by(|entry| entry.as_str().cmp(id)) {
        index.remove(pos);
    }
}

/// Whether the peer at `node_index` owns the given sorted position.
///
/// `range = round(M/N)` with ties rounding to even, `start = range *
/// node_index`; the last peer also owns everything past its slice.
pub(crate) fn owns_position(
    position: usize,
    total_mirrors: usize,
    node_index: usize,
    node_total: usize,
) -> bool {
    if node_total == 0 {
        return false;
    }
    let range = (total_mirrors as f32 / node_total as f32).round_ties_even() as usize;
    let start = range * node_index;
    position >= start && (position < start + range || node_index == node_total - 1)
}
