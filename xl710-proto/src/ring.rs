//! Modulo descriptor-index arithmetic (§4.5).

/// Advances index `i` by `k` slots in a ring of `n` slots.
///
/// # Panics
/// Panics if `i >= n` or `k == 0`.
#[must_use]
pub fn next(i: usize, k: usize, n: usize) -> usize {
    assert!(i < n, "base index {i} out of range for ring of size {n}");
    assert!(k > 0, "advance count must be positive");
    (i + (k % n)) % n
}

/// Retreats index `i` by `k` slots in a ring of `n` slots.
///
/// # Panics
/// Panics if `i >= n` or `k == 0`.
#[must_use]
pub fn prev(i: usize, k: usize, n: usize) -> usize {
    assert!(i < n, "base index {i} out of range for ring of size {n}");
    assert!(k > 0, "retreat count must be positive");
    let k = k % n;
    (i + n - k) % n
}
