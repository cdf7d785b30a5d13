//! Offline training of product quantization pivots.
//!
//! Training partitions the dimensions into chunks, optionally centers the data, and learns a
//! 256 entry codebook for every chunk with k-means. OPQ training additionally learns an
//! orthogonal rotation by alternating codebook training with a Procrustes solve.

use std::{ops::Range, path::Path, time::Instant};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    input::{VecVectorStore, VectorStore},
    kmeans::{self, run_lloyds},
    pivots::{chunk_offsets, PivotHeader, PqPivots},
    rotation::{identity, procrustes, rotate_rows},
    Error, Result, MAX_OPQ_ITERS, MAX_PQ_CHUNKS, NUM_KMEANS_REPS_PQ, NUM_PQ_CENTROIDS,
};

/// OPQ stops once an iteration reduces the residual by less than this fraction.
pub const OPQ_CONVERGENCE_THRESHOLD: f64 = 1e-4;

/// Parameters for pivot training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotParams {
    /// Number of centroids per chunk. Must be [NUM_PQ_CENTROIDS].
    pub num_centers: usize,
    /// Number of chunks to divide each vector into; one byte per chunk.
    pub num_pq_chunks: usize,
    /// Number of independently seeded k-means runs per chunk.
    pub max_k_means_reps: usize,
    /// Maximum Lloyd iterations per k-means run.
    pub kmeans_iters: usize,
    /// Subtract the per-dimension mean before training.
    pub make_zero_mean: bool,
}

impl PivotParams {
    pub fn new(num_pq_chunks: usize) -> Self {
        Self {
            num_pq_chunks,
            ..Self::default()
        }
    }

    fn kmeans_params(&self) -> kmeans::Params {
        kmeans::Params {
            iters: self.kmeans_iters,
            reps: self.max_k_means_reps,
            ..kmeans::Params::default()
        }
    }

    fn validate(&self, train: &[f32], dim: usize) -> Result<()> {
        if self.num_centers != NUM_PQ_CENTROIDS {
            return Err(Error::invalid_config(format!(
                "num_centers must be {NUM_PQ_CENTROIDS}, got {}",
                self.num_centers
            )));
        }
        if dim == 0 {
            return Err(Error::invalid_config("dimension must be non-zero"));
        }
        if self.num_pq_chunks == 0 || self.num_pq_chunks > MAX_PQ_CHUNKS.min(dim) {
            return Err(Error::invalid_config(format!(
                "num_pq_chunks must be in [1, {}] for dim {dim}, got {}",
                MAX_PQ_CHUNKS.min(dim),
                self.num_pq_chunks
            )));
        }
        if train.is_empty() {
            return Err(Error::invalid_config("training set is empty"));
        }
        if train.len() % dim != 0 {
            return Err(Error::invalid_config(format!(
                "training buffer of {} values is not a multiple of dim {dim}",
                train.len()
            )));
        }
        Ok(())
    }
}

impl Default for PivotParams {
    fn default() -> Self {
        Self {
            num_centers: NUM_PQ_CENTROIDS,
            num_pq_chunks: 32,
            max_k_means_reps: NUM_KMEANS_REPS_PQ,
            kmeans_iters: 12,
            make_zero_mean: true,
        }
    }
}

/// Train PQ pivots over row-major `train` vectors of `dim` dimensions and write them to
/// `output_path`.
///
/// Parameters are validated before touching the file system. If `output_path` already holds
/// pivots with the same shape training is skipped and the file is kept.
pub fn generate_pq_pivots(
    train: &[f32],
    dim: usize,
    params: &PivotParams,
    output_path: impl AsRef<Path>,
    rng: &mut impl Rng,
) -> Result<()> {
    params.validate(train, dim)?;
    let output_path = output_path.as_ref();
    if has_compatible_pivots(output_path, dim, params.num_pq_chunks, false) {
        info!(
            "reusing existing pq pivots at {} (dim {dim}, {} chunks)",
            output_path.display(),
            params.num_pq_chunks
        );
        return Ok(());
    }
    train_pq_pivots(train, dim, params, rng)?.write(output_path)
}

/// Train PQ pivots over row-major `train` vectors of `dim` dimensions.
pub fn train_pq_pivots(
    train: &[f32],
    dim: usize,
    params: &PivotParams,
    rng: &mut impl Rng,
) -> Result<PqPivots> {
    params.validate(train, dim)?;
    let start = Instant::now();
    let offsets = chunk_offsets(dim, params.num_pq_chunks);
    let (data, centroid) = center(train, dim, params.make_zero_mean);
    let chunks = cluster_chunks(&data, dim, &offsets, &params.kmeans_params(), rng);
    info!(
        "trained {} pq chunks over {} vectors in {:.2}s; residual {:.6}",
        params.num_pq_chunks,
        data.len() / dim,
        start.elapsed().as_secs_f64(),
        residual(&chunks, data.len() / dim)
    );
    PqPivots::new(assemble_tables(&chunks, &offsets, dim), offsets, centroid, None)
}

/// Train OPQ pivots (codebooks plus an orthogonal rotation) and write them to `output_path`.
///
/// As with [generate_pq_pivots], compatible pivots already at `output_path` are kept.
pub fn generate_opq_pivots(
    train: &[f32],
    dim: usize,
    params: &PivotParams,
    output_path: impl AsRef<Path>,
    rng: &mut impl Rng,
) -> Result<()> {
    params.validate(train, dim)?;
    let output_path = output_path.as_ref();
    if has_compatible_pivots(output_path, dim, params.num_pq_chunks, true) {
        info!(
            "reusing existing opq pivots at {} (dim {dim}, {} chunks)",
            output_path.display(),
            params.num_pq_chunks
        );
        return Ok(());
    }
    train_opq_pivots(train, dim, params, rng)?.write(output_path)
}

/// Train OPQ pivots over row-major `train` vectors of `dim` dimensions.
///
/// Alternates between training codebooks on rotated data and re-solving the rotation against the
/// quantized data for up to [MAX_OPQ_ITERS] iterations. The rotation and codebook pair with the
/// lowest residual is returned whether or not the iteration converged.
pub fn train_opq_pivots(
    train: &[f32],
    dim: usize,
    params: &PivotParams,
    rng: &mut impl Rng,
) -> Result<PqPivots> {
    train_opq(
        train,
        dim,
        params,
        MAX_OPQ_ITERS,
        OPQ_CONVERGENCE_THRESHOLD,
        rng,
    )
}

fn train_opq(
    train: &[f32],
    dim: usize,
    params: &PivotParams,
    max_iters: usize,
    threshold: f64,
    rng: &mut impl Rng,
) -> Result<PqPivots> {
    params.validate(train, dim)?;
    let start = Instant::now();
    let offsets = chunk_offsets(dim, params.num_pq_chunks);
    let (data, centroid) = center(train, dim, params.make_zero_mean);
    let num_vectors = data.len() / dim;

    let mut rotation = identity(dim);
    let mut rotated = vec![0.0f32; data.len()];
    let mut chunks: Option<Vec<ChunkCodebook>> = None;
    let mut best: Option<(f64, Vec<f32>, Vec<f32>)> = None;
    let mut prev_residual = f64::INFINITY;
    let mut converged = false;
    for iter in 0..max_iters.max(1) {
        rotate_rows(&data, &rotation, dim, &mut rotated);
        let next = match chunks.take() {
            None => cluster_chunks(&rotated, dim, &offsets, &params.kmeans_params(), rng),
            Some(prev) => refine_chunks(&rotated, dim, &offsets, params.kmeans_iters, prev),
        };
        let r = residual(&next, num_vectors);
        debug!("opq iteration {iter} residual {r:.6}");
        if best.as_ref().map_or(true, |(b, _, _)| r < *b) {
            best = Some((r, rotation.clone(), assemble_tables(&next, &offsets, dim)));
        }
        if iter > 0 && prev_residual - r <= threshold * prev_residual {
            converged = true;
            break;
        }
        prev_residual = r;

        let quantized = reconstruct(&next, &offsets, dim, num_vectors);
        match procrustes(&data, &quantized, dim) {
            Some(next_rotation) => rotation = next_rotation,
            None => {
                warn!("opq rotation svd did not converge at iteration {iter}");
                break;
            }
        }
        chunks = Some(next);
    }

    let (r, rotation, tables) = best.expect("at least one opq iteration");
    if !converged {
        info!("opq did not converge within {max_iters} iterations; keeping best residual {r:.6}");
    }
    info!(
        "trained {} opq chunks over {num_vectors} vectors in {:.2}s; residual {r:.6}",
        params.num_pq_chunks,
        start.elapsed().as_secs_f64(),
    );
    PqPivots::new(tables, offsets, centroid, Some(rotation))
}

fn has_compatible_pivots(path: &Path, dim: usize, num_chunks: usize, has_rotation: bool) -> bool {
    path.exists()
        && PivotHeader::read(path).is_ok_and(|h| {
            h == PivotHeader {
                dim,
                num_chunks,
                has_rotation,
            }
        })
}

/// Copy `train`, subtracting the per-dimension mean if `make_zero_mean`. Returns the data and the
/// subtracted centroid, which is all zero when not centering.
fn center(train: &[f32], dim: usize, make_zero_mean: bool) -> (Vec<f32>, Vec<f32>) {
    let mut data = train.to_vec();
    if !make_zero_mean {
        return (data, vec![0.0; dim]);
    }
    let mut sums = vec![0.0f64; dim];
    for v in train.chunks_exact(dim) {
        for (s, x) in sums.iter_mut().zip(v) {
            *s += *x as f64;
        }
    }
    let n = (train.len() / dim) as f64;
    let centroid = sums.into_iter().map(|s| (s / n) as f32).collect::<Vec<_>>();
    data.par_chunks_mut(dim).for_each(|v| {
        for (x, c) in v.iter_mut().zip(centroid.iter()) {
            *x -= c;
        }
    });
    (data, centroid)
}

/// Codebook learned for a single chunk.
struct ChunkCodebook {
    /// [NUM_PQ_CENTROIDS] centroids of the chunk width.
    centroids: VecVectorStore<f32>,
    /// Assigned centroid of each training vector.
    assignments: Vec<usize>,
    inertia: f64,
}

fn chunk_data(data: &[f32], dim: usize, range: Range<usize>) -> VecVectorStore<f32> {
    let width = range.len();
    VecVectorStore::new(
        data.chunks_exact(dim)
            .flat_map(|v| v[range.clone()].iter().copied())
            .collect(),
        width,
    )
}

fn cluster_chunks(
    data: &[f32],
    dim: usize,
    offsets: &[usize],
    params: &kmeans::Params,
    rng: &mut impl Rng,
) -> Vec<ChunkCodebook> {
    let seeds = (1..offsets.len())
        .map(|_| rng.random::<u64>())
        .collect::<Vec<_>>();
    offsets
        .par_windows(2)
        .zip(seeds.into_par_iter())
        .enumerate()
        .map(|(c, (w, seed))| {
            let dataset = chunk_data(data, dim, w[0]..w[1]);
            let mut rng = StdRng::seed_from_u64(seed);
            let clustering = kmeans::kmeans(&dataset, NUM_PQ_CENTROIDS, params, &mut rng);
            debug!("chunk {c} dims {}..{} inertia {:.6}", w[0], w[1], clustering.inertia);
            ChunkCodebook {
                centroids: clustering.centroids,
                assignments: clustering.assignments,
                inertia: clustering.inertia,
            }
        })
        .collect()
}

fn refine_chunks(
    data: &[f32],
    dim: usize,
    offsets: &[usize],
    iters: usize,
    prev: Vec<ChunkCodebook>,
) -> Vec<ChunkCodebook> {
    prev.into_par_iter()
        .zip(offsets.par_windows(2))
        .map(|(chunk, w)| {
            let mut centroids = chunk.centroids;
            let dataset = chunk_data(data, dim, w[0]..w[1]);
            let (assignments, inertia) = run_lloyds(
                &dataset,
                &mut centroids,
                iters,
                kmeans::Params::default().epsilon,
            );
            ChunkCodebook {
                centroids,
                assignments,
                inertia,
            }
        })
        .collect()
}

/// Mean squared quantization error per vector.
fn residual(chunks: &[ChunkCodebook], num_vectors: usize) -> f64 {
    chunks.iter().map(|c| c.inertia).sum::<f64>() / num_vectors as f64
}

/// Lay out per-chunk codebooks as full-width rows, one per centroid.
fn assemble_tables(chunks: &[ChunkCodebook], offsets: &[usize], dim: usize) -> Vec<f32> {
    let mut tables = vec![0.0f32; NUM_PQ_CENTROIDS * dim];
    for (chunk, start) in chunks.iter().zip(offsets.iter()) {
        let width = chunk.centroids.elem_stride();
        for (i, c) in chunk.centroids.iter().enumerate() {
            tables[i * dim + start..i * dim + start + width].copy_from_slice(c);
        }
    }
    tables
}

/// Replace every vector by the concatenation of its assigned chunk centroids.
fn reconstruct(
    chunks: &[ChunkCodebook],
    offsets: &[usize],
    dim: usize,
    num_vectors: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; num_vectors * dim];
    out.par_chunks_mut(dim).enumerate().for_each(|(i, v)| {
        for (chunk, w) in chunks.iter().zip(offsets.windows(2)) {
            v[w[0]..w[1]].copy_from_slice(&chunk.centroids[chunk.assignments[i]]);
        }
    });
    out
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    use super::{
        generate_opq_pivots, generate_pq_pivots, train_opq, train_opq_pivots, train_pq_pivots,
        PivotParams,
    };
    use crate::{
        distance::l2sq_f32, encoder::PqEncoder, pivots::PqPivots, rotation::orthogonality_error,
        table::FixedChunkPqTable, Error, NUM_PQ_CENTROIDS,
    };

    fn random_unit_vectors(n: usize, dim: usize, rng: &mut impl Rng) -> Vec<f32> {
        let mut data = Vec::with_capacity(n * dim);
        for _ in 0..n {
            let v = (0..dim)
                .map(|_| rng.random_range(-1.0f32..1.0))
                .collect::<Vec<_>>();
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            data.extend(v.into_iter().map(|x| x / norm));
        }
        data
    }

    /// Vectors whose dimensions come in correlated pairs, so a rotation is worth learning.
    fn correlated_vectors(n: usize, dim: usize, rng: &mut impl Rng) -> Vec<f32> {
        (0..n)
            .flat_map(|_| {
                let a = rng.random_range(-1.0f32..1.0);
                let b = rng.random_range(-1.0f32..1.0);
                (0..dim)
                    .map(|d| if d % 2 == 0 { a + 0.1 * b } else { b - 0.1 * a })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Mean squared distance between each preprocessed vector and the reconstruction of its code.
    fn quantization_mse(pivots: &PqPivots, data: &[f32]) -> f64 {
        let dim = pivots.dim();
        let table = FixedChunkPqTable::from_pivots(pivots.clone());
        let encoder = PqEncoder::new(pivots.clone(), pivots.rotation().is_some()).unwrap();
        let mut code = vec![0u8; pivots.num_chunks()];
        let mut total = 0.0f64;
        for v in data.chunks_exact(dim) {
            encoder.encode(v, &mut code).unwrap();
            let mut query = v.to_vec();
            table.preprocess_query(&mut query);
            total += table.l2_distance(&query, &code) as f64;
        }
        total / (data.len() / dim) as f64
    }

    #[test]
    fn scenario_128d_16_chunks() {
        let dim = 128;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x455A_5469676572);
        let data = random_unit_vectors(10_000, dim, &mut rng);
        let params = PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 4,
            ..PivotParams::new(16)
        };
        let pivots = train_pq_pivots(&data, dim, &params, &mut rng).unwrap();
        assert_eq!(pivots.chunk_offsets().len(), 17);
        assert!(pivots.chunk_offsets().windows(2).all(|w| w[1] - w[0] == 8));
        assert!(pivots.rotation().is_none());

        let table = FixedChunkPqTable::from_pivots(pivots.clone());
        let mut codes = vec![0u8; 10_000 * 16];
        PqEncoder::new(pivots, false)
            .unwrap()
            .encode_block(&data, &mut codes);
        assert_eq!(codes.len(), 160_000);
        // Codes span more than a handful of centroids in every chunk.
        for c in 0..16 {
            let distinct = codes
                .iter()
                .skip(c)
                .step_by(16)
                .collect::<HashSet<_>>()
                .len();
            assert!(distinct > 128, "chunk {c} uses {distinct} codes");
        }

        let mut inflated = vec![0.0f32; dim];
        let mut squared_error = 0.0f64;
        for (v, code) in data.chunks_exact(dim).zip(codes.chunks_exact(16)) {
            table.inflate_vector(code, &mut inflated);
            squared_error += l2sq_f32(v, &inflated) as f64;
        }
        let chunk_mse = squared_error / 160_000.0;

        // Raw variance of the data summed over the dimensions of a chunk.
        let n = 10_000f64;
        let mut variance = 0.0f64;
        for d in 0..dim {
            let column = data.iter().skip(d).step_by(dim).map(|x| *x as f64);
            let mean = column.clone().sum::<f64>() / n;
            variance += column.map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        }
        let chunk_variance = variance / 16.0;
        assert!(
            chunk_mse < chunk_variance,
            "mse {chunk_mse} variance {chunk_variance}"
        );
    }

    #[test]
    fn zero_mean_centroid() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let data = (0..400)
            .flat_map(|i| [10.0 + (i % 7) as f32, -5.0 + (i % 3) as f32])
            .collect::<Vec<_>>();
        let params = PivotParams {
            max_k_means_reps: 1,
            ..PivotParams::new(2)
        };
        let centered = train_pq_pivots(&data, 2, &params, &mut rng).unwrap();
        assert!((centered.centroid()[0] - 13.0).abs() < 0.1);
        assert!((centered.centroid()[1] + 4.0).abs() < 0.1);

        let raw = train_pq_pivots(
            &data,
            2,
            &PivotParams {
                make_zero_mean: false,
                ..params
            },
            &mut rng,
        )
        .unwrap();
        assert_eq!(raw.centroid(), &[0.0, 0.0]);
    }

    #[test]
    fn uneven_partition_has_no_empty_chunks() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let data = random_unit_vectors(300, 10, &mut rng);
        let params = PivotParams {
            max_k_means_reps: 1,
            ..PivotParams::new(6)
        };
        let pivots = train_pq_pivots(&data, 10, &params, &mut rng).unwrap();
        assert_eq!(pivots.chunk_offsets(), &[0, 2, 4, 6, 8, 9, 10]);
        // Every chunk carries a trained codebook: with 300 distinct vectors no chunk collapses to
        // a single centroid.
        for c in 0..6 {
            let range = pivots.chunk_range(c);
            let distinct = (0..NUM_PQ_CENTROIDS)
                .map(|i| {
                    pivots.centroid_row(i)[range.clone()]
                        .iter()
                        .map(|x| x.to_bits())
                        .collect::<Vec<_>>()
                })
                .collect::<HashSet<_>>()
                .len();
            assert!(distinct > 1, "chunk {c} has {distinct} distinct centroids");
        }
    }

    #[test]
    fn invalid_config_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pivots.bin");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let data = vec![0.5f32; 64];

        let cases = [
            (data.as_slice(), 8, PivotParams::new(0)),
            (data.as_slice(), 8, PivotParams::new(9)),
            (data.as_slice(), 0, PivotParams::new(1)),
            (&data[..0], 8, PivotParams::new(2)),
            (&data[..7], 8, PivotParams::new(2)),
            (
                data.as_slice(),
                8,
                PivotParams {
                    num_centers: 16,
                    ..PivotParams::new(2)
                },
            ),
        ];
        for (train, dim, params) in cases {
            assert!(matches!(
                generate_pq_pivots(train, dim, &params, &path, &mut rng),
                Err(Error::InvalidConfig(_))
            ));
            assert!(matches!(
                generate_opq_pivots(train, dim, &params, &path, &mut rng),
                Err(Error::InvalidConfig(_))
            ));
            assert!(!path.exists());
        }
        assert!(matches!(
            generate_pq_pivots(&vec![0.5f32; 400 * 400], 400, &PivotParams::new(385), &path, &mut rng),
            Err(Error::InvalidConfig(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn existing_compatible_pivots_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pivots.bin");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let params = PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 2,
            ..PivotParams::new(2)
        };
        let data = random_unit_vectors(300, 4, &mut rng);
        generate_pq_pivots(&data, 4, &params, &path, &mut rng).unwrap();
        let first = std::fs::read(&path).unwrap();

        let other = random_unit_vectors(300, 4, &mut rng);
        generate_pq_pivots(&other, 4, &params, &path, &mut rng).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);

        generate_pq_pivots(&other, 4, &PivotParams::new(4), &path, &mut rng).unwrap();
        assert_eq!(PqPivots::read(&path).unwrap().num_chunks(), 4);
    }

    #[test]
    fn opq_rotation_is_orthogonal() {
        let dim = 8;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x0bad_cafe);
        let data = correlated_vectors(1000, dim, &mut rng);
        let params = PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 4,
            ..PivotParams::new(4)
        };
        let pivots = train_opq_pivots(&data, dim, &params, &mut rng).unwrap();
        let rotation = pivots.rotation().expect("opq pivots carry a rotation");
        assert!(orthogonality_error(rotation, dim) < 1e-3);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opq.bin");
        generate_opq_pivots(&data, dim, &params, &path, &mut rng).unwrap();
        assert!(PqPivots::read(&path).unwrap().rotation().is_some());
    }

    #[test]
    fn opq_no_worse_than_identity_rotation() {
        let dim = 8;
        let data = correlated_vectors(1000, dim, &mut Xoshiro256PlusPlus::seed_from_u64(41));
        let params = PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 4,
            ..PivotParams::new(4)
        };
        // The first OPQ iteration trains on identity-rotated data with the same rng stream, so it
        // reproduces plain PQ exactly.
        let pq = train_pq_pivots(&data, dim, &params, &mut Xoshiro256PlusPlus::seed_from_u64(7))
            .unwrap();
        let opq = train_opq_pivots(&data, dim, &params, &mut Xoshiro256PlusPlus::seed_from_u64(7))
            .unwrap();
        let (pq_mse, opq_mse) = (quantization_mse(&pq, &data), quantization_mse(&opq, &data));
        assert!(opq_mse <= pq_mse * 1.001, "opq {opq_mse} pq {pq_mse}");
    }

    #[test]
    fn opq_without_convergence_keeps_best() {
        let dim = 8;
        let data = correlated_vectors(600, dim, &mut Xoshiro256PlusPlus::seed_from_u64(43));
        let params = PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 2,
            ..PivotParams::new(4)
        };
        let pq = train_pq_pivots(&data, dim, &params, &mut Xoshiro256PlusPlus::seed_from_u64(9))
            .unwrap();
        // A threshold no reduction can meet runs every iteration.
        let opq = train_opq(
            &data,
            dim,
            &params,
            3,
            f64::NEG_INFINITY,
            &mut Xoshiro256PlusPlus::seed_from_u64(9),
        )
        .unwrap();
        let rotation = opq.rotation().expect("opq pivots carry a rotation");
        assert!(orthogonality_error(rotation, dim) < 1e-3);
        assert!(quantization_mse(&opq, &data) <= quantization_mse(&pq, &data) * 1.001);
    }
}
