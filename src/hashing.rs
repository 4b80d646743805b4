//! Deterministic percentage hashing used for percentage splits and multivariate selection.

/// Maps an ordered list of identifiers to a pseudo-random percentage in `[0, 100)`.
///
/// The engine is generic over this trait so tests can substitute a fixed value.
pub trait PercentageHasher {
    fn hashed_percentage(&self, object_ids: &[&str]) -> f64;
}

/// The default (and only) production hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5PercentageHasher;

impl PercentageHasher for Md5PercentageHasher {
    fn hashed_percentage(&self, object_ids: &[&str]) -> f64 {
        hashed_percentage_for_object_ids(object_ids, 1)
    }
}

/// Hash `object_ids` into a percentage in `[0, 100)`.
///
/// The ids are repeated `iterations` times and joined with commas before hashing. A result of
/// exactly 100 is rehashed with one more iteration so the upper bound stays exclusive.
///
/// ```
/// # use flag_engine::hashed_percentage_for_object_ids;
/// let value = hashed_percentage_for_object_ids(&["foo", "bar"], 3);
/// assert!((value - 85.377075).abs() < 1e-6);
/// ```
pub fn hashed_percentage_for_object_ids(object_ids: &[&str], iterations: usize) -> f64 {
    let to_hash = std::iter::repeat(object_ids)
        .take(iterations)
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(",");

    let digest = md5::compute(to_hash.as_bytes());
    let hashed = u128::from_be_bytes(digest.0);
    let value = (hashed % 9999) as f64 / 9998.0 * 100.0;

    if value == 100.0 {
        return hashed_percentage_for_object_ids(object_ids, iterations + 1);
    }
    value
}
