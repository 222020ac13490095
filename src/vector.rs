//! Small dense-vector helpers shared by the indexer, router and knowledge tree.
//!
//! Every stored embedding is unit-normalised, so cosine similarity reduces to
//! a dot product. An empty vector stands for "no embedding" and scores 0
//! against anything.

/// Dot product of two vectors. Mismatched lengths score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Element-wise sum of `vectors` and how many were added.
///
/// Empty inputs are skipped. Returns `None` when nothing usable remains or
/// when the remaining vectors disagree on dimension.
pub fn sum_vectors<'a, I>(vectors: I) -> Option<(Vec<f32>, usize)>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Vec<f32> = Vec::new();
    let mut count = 0usize;

    for v in vectors {
        if v.is_empty() {
            continue;
        }
        if sum.is_empty() {
            sum = vec![0.0; v.len()];
        } else if sum.len() != v.len() {
            return None;
        }
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += x;
        }
        count += 1;
    }

    (count > 0).then_some((sum, count))
}

/// Element-wise mean of `vectors`, re-normalised to unit length.
///
/// Empty inputs are skipped. Returns `None` when nothing usable remains or
/// when the remaining vectors disagree on dimension.
///
/// # Examples
///
/// ```
/// use deskindex::vector::mean_pool;
///
/// let a = [1.0, 0.0];
/// let b = [0.0, 1.0];
/// let pooled = mean_pool([&a[..], &b[..]]).unwrap();
/// assert!((pooled[0] - pooled[1]).abs() < 1e-6);
/// assert!((pooled[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
/// ```
pub fn mean_pool<'a, I>(vectors: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let (mut sum, count) = sum_vectors(vectors)?;
    for x in sum.iter_mut() {
        *x /= count as f32;
    }
    normalize(&mut sum);
    Some(sum)
}
