/// Returns `values` without the entries at the `removed` positions,
/// keeping the order of the rest. Out of range positions are ignored.
pub fn compact<T: Clone>(values: &[T], removed: &[usize]) -> Vec<T> {
    if removed.is_empty() {
        return values.to_vec();
    }
    let mut keep = vec![true; values.len()];
    for &i in removed {
        if i < keep.len() {
            keep[i] = false;
        }
    }
    values
        .iter()
        .zip(keep)
        .filter(|(_, k)| *k)
        .map(|(v, _)| v.clone())
        .collect()
}

/// Compacts `values` in place.
pub fn compact_in_place<T: Clone>(values: &mut Vec<T>, removed: &[usize]) {
    if !removed.is_empty() {
        *values = compact(values, removed);
    }
}

/// Positions in the full (uncompacted) numbering of the entries that
/// remain after removing `removed` from `len` entries.
pub fn remaining(len: usize, removed: &[usize]) -> Vec<usize> {
    (0..len).filter(|i| !removed.contains(i)).collect()
}
