//! Vector normalization and similarity functions.
//!
//! Similarity is accumulated in `f64` so `sim(a, b)` and `sim(b, a)` are
//! bit-identical and self-similarity of a unit vector stays within 1e-5 of 1.

/// Compute the L2 (Euclidean) norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt() as f32
}

/// L2-normalize a vector in-place. Zero vectors remain zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Whether `v` has unit length within `tolerance`.
pub fn is_unit(v: &[f32], tolerance: f32) -> bool {
    (l2_norm(v) - 1.0).abs() <= tolerance
}

/// Dot product, `None` on dimension mismatch.
pub fn dot(a: &[f32], b: &[f32]) -> Option<f64> {
    (a.len() == b.len()).then(|| {
        a.iter()
            .zip(b)
            .map(|(x, y)| f64::from(*x) * f64::from(*y))
            .sum()
    })
}

/// Cosine similarity `dot(a,b) / (|a| * |b|)`.
///
/// Returns exactly `0.0` when either vector is empty or has zero norm, when
/// dimensions differ, or when any component is NaN or infinite. The result
/// is clamped to `[-1, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let Some(dot) = dot(a, b) else {
        return 0.0;
    };
    let norm_a = a.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>();
    let norm_b = b.iter().map(|x| f64::from(*x) * f64::from(*x)).sum::<f64>();
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn unit_check() {
        let mut v = vec![3.0, 4.0];
        assert!(!is_unit(&v, EPSILON));
        l2_normalize(&mut v);
        assert!(is_unit(&v, EPSILON));
        assert!(!is_unit(&[0.0, 0.0], EPSILON));
    }

    #[test]
    fn norm_of_unit_axes() {
        assert!((l2_norm(&[1.0, 0.0, 0.0]) - 1.0).abs() < EPSILON);
        assert!((l2_norm(&[3.0, 4.0]) - 5.0).abs() < EPSILON);
    }

    #[test]
    fn normalize_zero_stays_zero() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn identical_and_antipodal() {
        let a = [0.6, 0.8];
        let b = [-0.6, -0.8];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < EPSILON);
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < EPSILON);
    }

    #[test]
    fn orthogonal_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < EPSILON);
    }

    #[test]
    fn zero_norm_is_exactly_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).to_bits(), 0.0f32.to_bits());
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]).to_bits(), 0.0f32.to_bits());
    }

    #[test]
    fn mismatch_and_empty_are_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn non_finite_components_score_zero() {
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[f32::INFINITY, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn does_not_need_unit_inputs() {
        let sim = cosine_similarity(&[10.0, 0.0], &[3.0, 3.0]);
        assert!((sim - std::f32::consts::FRAC_1_SQRT_2).abs() < EPSILON);
    }

    fn vec_strategy(dim: usize) -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-100.0f32..100.0, dim)
    }

    proptest! {
        #[test]
        fn self_similarity_is_one(v in vec_strategy(16)) {
            prop_assume!(l2_norm(&v) > 1e-3);
            let sim = cosine_similarity(&v, &v);
            prop_assert!((sim - 1.0).abs() <= EPSILON, "sim = {}", sim);
        }

        #[test]
        fn symmetric(a in vec_strategy(8), b in vec_strategy(8)) {
            let ab = cosine_similarity(&a, &b);
            let ba = cosine_similarity(&b, &a);
            prop_assert!((f64::from(ab) - f64::from(ba)).abs() <= 1e-10);
        }

        #[test]
        fn bounded(a in vec_strategy(8), b in vec_strategy(8)) {
            let sim = cosine_similarity(&a, &b);
            prop_assert!((-1.0..=1.0).contains(&sim));
        }

        #[test]
        fn normalized_has_unit_norm(mut v in vec_strategy(32)) {
            prop_assume!(l2_norm(&v) > 1e-3);
            l2_normalize(&mut v);
            prop_assert!((l2_norm(&v) - 1.0).abs() < EPSILON);
        }
    }
}
