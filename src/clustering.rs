//! Seeded spherical k-means over unit vectors.

use rand::{Rng, rngs::StdRng};

use crate::vector::{cosine, mean_pool};

#[derive(Debug, Clone, Default)]
pub struct Clustering {
    /// Cluster of each input vector, compacted to `0..centroids.len()`.
    pub labels: Vec<usize>,
    /// Unit-length centroid per cluster.
    pub centroids: Vec<Vec<f32>>,
}

impl Clustering {
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Input indexes grouped by cluster.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.centroids.len()];
        for (i, &label) in self.labels.iter().enumerate() {
            members[label].push(i);
        }
        members
    }
}

fn nearest(v: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let score = cosine(v, centroid);
        if score > best_score {
            best = c;
            best_score = score;
        }
    }
    best
}

/// Farthest-point seeding: a random first centroid, then repeatedly the
/// vector farthest (by cosine distance) from every centroid chosen so far.
fn seed_centroids(vectors: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let first = rng.random_range(0..vectors.len());
    let mut centroids = vec![vectors[first].to_vec()];
    let mut min_distance: Vec<f32> =
        vectors.iter().map(|v| 1.0 - cosine(v, vectors[first])).collect();

    while centroids.len() < k {
        let mut pick = 0;
        for i in 1..vectors.len() {
            if min_distance[i] > min_distance[pick] {
                pick = i;
            }
        }
        centroids.push(vectors[pick].to_vec());
        for (i, v) in vectors.iter().enumerate() {
            min_distance[i] = min_distance[i].min(1.0 - cosine(v, vectors[pick]));
        }
    }
    centroids
}

/// Partition `vectors` into at most `k` clusters.
///
/// With `k >= vectors.len()` every vector becomes its own cluster. Clusters
/// that end up empty are dropped, so the result may hold fewer than `k`.
/// The outcome depends only on the inputs and the state of `rng`.
///
/// # Examples
///
/// ```
/// use deskindex::clustering::kmeans;
/// use rand::{SeedableRng, rngs::StdRng};
///
/// let points: Vec<&[f32]> = vec![&[1.0, 0.0], &[0.99, 0.14], &[0.0, 1.0], &[0.14, 0.99]];
/// let mut rng = StdRng::seed_from_u64(7);
/// let result = kmeans(&points, 2, 20, &mut rng);
/// assert_eq!(result.cluster_count(), 2);
/// assert_eq!(result.labels[0], result.labels[1]);
/// assert_ne!(result.labels[0], result.labels[2]);
/// ```
pub fn kmeans(
    vectors: &[&[f32]],
    k: usize,
    max_iterations: usize,
    rng: &mut StdRng,
) -> Clustering {
    let n = vectors.len();
    if n == 0 || k == 0 {
        return Clustering::default();
    }
    if k >= n {
        return Clustering {
            labels: (0..n).collect(),
            centroids: vectors
                .iter()
                .map(|v| mean_pool([*v]).unwrap_or_default())
                .collect(),
        };
    }

    let mut centroids = seed_centroids(vectors, k, rng);
    let mut labels = vec![usize::MAX; n];

    for _ in 0..max_iterations.max(1) {
        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let label = nearest(v, &centroids);
            if labels[i] != label {
                labels[i] = label;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members = vectors
                .iter()
                .zip(&labels)
                .filter(|&(_, &l)| l == c)
                .map(|(v, _)| *v);
            if let Some(mean) = mean_pool(members) {
                *centroid = mean;
            }
        }
    }

    // Compact away empty clusters.
    let mut used = vec![false; k];
    for &label in &labels {
        used[label] = true;
    }
    let mut remap = vec![0; k];
    let mut compacted = Vec::new();
    for c in 0..k {
        if used[c] {
            remap[c] = compacted.len();
            compacted.push(std::mem::take(&mut centroids[c]));
        }
    }

    Clustering {
        labels: labels.into_iter().map(|l| remap[l]).collect(),
        centroids: compacted,
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    fn blobs() -> Vec<Vec<f32>> {
        let mut points = Vec::new();
        for i in 0..6 {
            points.push(unit(0.05 * i as f32));
            points.push(unit(1.5 + 0.05 * i as f32));
            points.push(unit(3.0 + 0.05 * i as f32));
        }
        points
    }

    #[test]
    fn separates_well_spread_groups() {
        let points = blobs();
        let refs: Vec<&[f32]> = points.iter().map(Vec::as_slice).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let result = kmeans(&refs, 3, 20, &mut rng);

        assert_eq!(result.cluster_count(), 3);
        for group in 0..3 {
            let labels: Vec<usize> =
                (0..6).map(|i| result.labels[i * 3 + group]).collect();
            assert!(labels.iter().all(|&l| l == labels[0]), "group {group} split");
        }
        for members in result.members() {
            assert_eq!(members.len(), 6);
        }
    }

    #[test]
    fn same_seed_same_result() {
        let points = blobs();
        let refs: Vec<&[f32]> = points.iter().map(Vec::as_slice).collect();
        let a = kmeans(&refs, 4, 20, &mut StdRng::seed_from_u64(1));
        let b = kmeans(&refs, 4, 20, &mut StdRng::seed_from_u64(1));
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn fewer_items_than_clusters_become_singletons() {
        let points = [unit(0.0), unit(1.0)];
        let refs: Vec<&[f32]> = points.iter().map(Vec::as_slice).collect();
        let result = kmeans(&refs, 8, 20, &mut StdRng::seed_from_u64(0));
        assert_eq!(result.labels, vec![0, 1]);
        assert_eq!(result.cluster_count(), 2);
    }

    #[test]
    fn identical_points_collapse_empty_clusters() {
        let points = vec![unit(0.3); 5];
        let refs: Vec<&[f32]> = points.iter().map(Vec::as_slice).collect();
        let result = kmeans(&refs, 3, 20, &mut StdRng::seed_from_u64(0));
        assert_eq!(result.cluster_count(), 1);
        assert!(result.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn empty_input() {
        let result = kmeans(&[], 3, 20, &mut StdRng::seed_from_u64(0));
        assert_eq!(result.cluster_count(), 0);
    }
}
