//! Lloyd's k-means used to learn per-chunk codebooks.

use rand::{distr::weighted::WeightedIndex, prelude::*};
use rayon::prelude::*;
use tracing::debug;

use crate::{
    distance::l2sq_f32,
    input::{VecVectorStore, VectorStore},
};

/// Parameters for k-means clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    /// Maximum number of Lloyd iterations per run.
    pub iters: usize,
    /// Number of independently initialized runs; the run with the lowest inertia is kept.
    pub reps: usize,
    /// Convergence epsilon. A run terminates once an iteration reduces inertia by less than this
    /// fraction of the previous inertia.
    pub epsilon: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            iters: 12,
            reps: 1,
            epsilon: 1e-4,
        }
    }
}

/// Output of a k-means run.
#[derive(Debug, Clone)]
pub struct Clustering {
    pub centroids: VecVectorStore<f32>,
    /// Index of the assigned centroid for each input vector.
    pub assignments: Vec<usize>,
    /// Sum of squared distances between each vector and its assigned centroid.
    pub inertia: f64,
}

/// Cluster `dataset` into `k` centroids.
///
/// Runs `params.reps` k-means++ initializations each followed by Lloyd iterations and returns the
/// lowest inertia result.
///
/// *Panics* if `dataset` is empty or `k` is zero.
pub fn kmeans(
    dataset: &VecVectorStore<f32>,
    k: usize,
    params: &Params,
    rng: &mut impl Rng,
) -> Clustering {
    assert!(!dataset.is_empty());
    assert!(k > 0);
    (0..params.reps.max(1))
        .map(|_| {
            let mut centroids = kmeans_pp_centroids(dataset, k, rng);
            let (assignments, inertia) =
                run_lloyds(dataset, &mut centroids, params.iters, params.epsilon);
            Clustering {
                centroids,
                assignments,
                inertia,
            }
        })
        .min_by(|a, b| a.inertia.total_cmp(&b.inertia))
        .expect("at least one rep")
}

/// Choose `k` initial centroids from `dataset`, each sampled with probability proportional to its
/// squared distance from the closest centroid already chosen.
///
/// If there are fewer than `k` distinct vectors the remaining centroids are chosen uniformly and
/// will duplicate existing centroids.
pub fn kmeans_pp_centroids(
    dataset: &VecVectorStore<f32>,
    k: usize,
    rng: &mut impl Rng,
) -> VecVectorStore<f32> {
    let mut centroids = VecVectorStore::with_capacity(dataset.elem_stride(), k);
    centroids.push(&dataset[rng.random_range(0..dataset.len())]);
    let mut min_distances = dataset
        .as_slice()
        .par_chunks(dataset.elem_stride())
        .map(|v| l2sq_f32(v, &centroids[0]) as f64)
        .collect::<Vec<_>>();
    while centroids.len() < k {
        let index = match WeightedIndex::new(min_distances.iter().copied()) {
            Ok(w) => w.sample(rng),
            // All remaining weight is zero: every vector coincides with a chosen centroid.
            Err(_) => rng.random_range(0..dataset.len()),
        };
        centroids.push(&dataset[index]);
        let centroid = &centroids[centroids.len() - 1];
        min_distances
            .par_iter_mut()
            .zip(dataset.as_slice().par_chunks(dataset.elem_stride()))
            .for_each(|(d, v)| *d = d.min(l2sq_f32(v, centroid) as f64));
    }
    centroids
}

/// Run Lloyd iterations starting from `centroids`, updating them in place.
///
/// Clusters left empty by an iteration are reseeded from the vector farthest from its assigned
/// centroid. Returns the final assignment of each vector and the total inertia.
pub fn run_lloyds(
    dataset: &VecVectorStore<f32>,
    centroids: &mut VecVectorStore<f32>,
    max_iters: usize,
    epsilon: f64,
) -> (Vec<usize>, f64) {
    let mut assignments = compute_assignments(dataset, centroids);
    let mut inertia = total_inertia(&assignments);
    for iter in 0..max_iters {
        update_centroids(dataset, &assignments, centroids);
        assignments = compute_assignments(dataset, centroids);
        let next_inertia = total_inertia(&assignments);
        let converged = inertia - next_inertia <= epsilon * inertia;
        inertia = next_inertia;
        if converged {
            debug!("lloyds converged after {} iterations", iter + 1);
            break;
        }
    }
    (assignments.into_iter().map(|(c, _)| c).collect(), inertia)
}

/// For each input vector compute the closest centroid and the squared distance to that centroid.
///
/// Ties are broken in favor of the lowest centroid index.
pub fn compute_assignments(
    dataset: &VecVectorStore<f32>,
    centroids: &VecVectorStore<f32>,
) -> Vec<(usize, f32)> {
    dataset
        .as_slice()
        .par_chunks(dataset.elem_stride())
        .map(|v| nearest_centroid(v, centroids.as_slice(), centroids.elem_stride()))
        .collect()
}

/// Find the centroid in row-major `centroids` closest to `vector`.
///
/// Returns the lowest index among equidistant centroids along with the squared distance.
#[inline]
pub fn nearest_centroid(vector: &[f32], centroids: &[f32], stride: usize) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centroids.chunks_exact(stride).enumerate() {
        let d = l2sq_f32(vector, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

fn total_inertia(assignments: &[(usize, f32)]) -> f64 {
    assignments.iter().map(|(_, d)| *d as f64).sum()
}

fn update_centroids(
    dataset: &VecVectorStore<f32>,
    assignments: &[(usize, f32)],
    centroids: &mut VecVectorStore<f32>,
) {
    let stride = dataset.elem_stride();
    let mut sums = vec![0.0f64; centroids.len() * stride];
    let mut counts = vec![0usize; centroids.len()];
    for (v, (c, _)) in dataset.iter().zip(assignments.iter()) {
        counts[*c] += 1;
        for (s, d) in sums[c * stride..(c + 1) * stride].iter_mut().zip(v) {
            *s += *d as f64;
        }
    }

    let mut residuals = assignments.iter().map(|(_, d)| *d).collect::<Vec<_>>();
    for (c, (centroid, count)) in centroids.iter_mut().zip(counts.iter()).enumerate() {
        if *count > 0 {
            for (o, s) in centroid.iter_mut().zip(&sums[c * stride..(c + 1) * stride]) {
                *o = (*s / *count as f64) as f32;
            }
        } else {
            let (farthest, _) = residuals
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(&a.0)))
                .expect("non-empty dataset");
            debug!("reseeding empty cluster {c} from vector {farthest}");
            centroid.copy_from_slice(&dataset[farthest]);
            residuals[farthest] = 0.0;
        }
    }
}
