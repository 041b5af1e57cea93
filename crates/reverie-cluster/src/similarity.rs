//! Vector helpers shared by assignment and merging.

/// Cosine similarity between two vectors.  Returns `0.0` when either vector
/// has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Recover a mean vector from a running `(sum, count)` pair.
pub fn mean_of(sum: &[f64], count: usize) -> Vec<f32> {
    if count == 0 {
        return vec![0.0; sum.len()];
    }
    sum.iter().map(|s| (s / count as f64) as f32).collect()
}

/// Add `v` into the running sum in place.
pub fn accumulate(sum: &mut [f64], v: &[f32]) {
    for (s, x) in sum.iter_mut().zip(v) {
        *s += *x as f64;
    }
}

/// Subtract `v` from the running sum in place.
pub fn withdraw(sum: &mut [f64], v: &[f32]) {
    for (s, x) in sum.iter_mut().zip(v) {
        *s -= *x as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn zero_or_mismatched_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn running_mean_matches_direct_mean() {
        let mut sum = vec![0.0f64; 2];
        accumulate(&mut sum, &[1.0, 3.0]);
        accumulate(&mut sum, &[3.0, 5.0]);
        assert_eq!(mean_of(&sum, 2), vec![2.0, 4.0]);
        withdraw(&mut sum, &[3.0, 5.0]);
        assert_eq!(mean_of(&sum, 1), vec![1.0, 3.0]);
        assert_eq!(mean_of(&sum, 0), vec![0.0, 0.0]);
    }
}
