//! Query time view of trained pivots used to build per-query lookup tables.

use std::path::Path;

use crate::{
    distance::{dot_f32, Metric},
    pivots::PqPivots,
    rotation::transpose,
    Error, Result, NUM_PQ_CENTROIDS,
};

/// Immutable PQ codebook prepared for query time distance computation.
///
/// The codebook is held both centroid-major (`[256][dim]`) for scoring individual codes and
/// dimension-major (`[dim][256]`) so that building a lookup table streams through all 256
/// centroids of a dimension at once. A table may be shared freely between query threads.
#[derive(Debug, Clone)]
pub struct FixedChunkPqTable {
    dim: usize,
    tables: Vec<f32>,
    tables_tr: Vec<f32>,
    chunk_offsets: Vec<usize>,
    centroid: Vec<f32>,
    rotation_tr: Option<Vec<f32>>,
}

impl FixedChunkPqTable {
    /// Load the pivot file at `pivots_path`, which must have been trained with `num_chunks` chunks.
    pub fn load(pivots_path: impl AsRef<Path>, num_chunks: usize) -> Result<Self> {
        let pivots = PqPivots::read(pivots_path)?;
        if pivots.num_chunks() != num_chunks {
            return Err(Error::ChunkCountMismatch {
                expected: pivots.num_chunks(),
                actual: num_chunks,
            });
        }
        Ok(Self::from_pivots(pivots))
    }

    pub fn from_pivots(pivots: PqPivots) -> Self {
        let dim = pivots.dim();
        let mut tables_tr = vec![0.0f32; NUM_PQ_CENTROIDS * dim];
        for (i, row) in pivots.tables().chunks_exact(dim).enumerate() {
            for (j, v) in row.iter().enumerate() {
                tables_tr[j * NUM_PQ_CENTROIDS + i] = *v;
            }
        }
        Self {
            dim,
            tables: pivots.tables().to_vec(),
            tables_tr,
            chunk_offsets: pivots.chunk_offsets().to_vec(),
            centroid: pivots.centroid().to_vec(),
            rotation_tr: pivots.rotation().map(|r| transpose(r, dim)),
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_offsets.len() - 1
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn has_rotation(&self) -> bool {
        self.rotation_tr.is_some()
    }

    pub fn chunk_offsets(&self) -> &[usize] {
        &self.chunk_offsets
    }

    /// Center `query` and rotate it if the pivots carry a rotation.
    ///
    /// This must be called exactly once on a query before building lookup tables or scoring
    /// codes. Rotation allocates a temporary; use [Self::preprocess_query_with_scratch] on hot
    /// paths.
    pub fn preprocess_query(&self, query: &mut [f32]) {
        let mut scratch = if self.has_rotation() {
            vec![0.0; self.dim]
        } else {
            vec![]
        };
        self.preprocess_query_with_scratch(query, &mut scratch);
    }

    /// Like [Self::preprocess_query] using `scratch` of at least `dim()` values as temporary space.
    pub fn preprocess_query_with_scratch(&self, query: &mut [f32], scratch: &mut [f32]) {
        let query = &mut query[..self.dim];
        for (q, c) in query.iter_mut().zip(self.centroid.iter()) {
            *q -= c;
        }
        if let Some(rotation_tr) = self.rotation_tr.as_ref() {
            let centered = &mut scratch[..self.dim];
            centered.copy_from_slice(query);
            for (q, column) in query.iter_mut().zip(rotation_tr.chunks_exact(self.dim)) {
                *q = dot_f32(centered, column);
            }
        }
    }

    /// Fill the first `num_chunks() * 256` entries of `dist_vec` with the squared l2 distance
    /// between each chunk of the preprocessed `query` and each centroid of that chunk.
    pub fn populate_chunk_distances(&self, query: &[f32], dist_vec: &mut [f32]) {
        let dist_vec = &mut dist_vec[..self.num_chunks() * NUM_PQ_CENTROIDS];
        dist_vec.fill(0.0);
        for (chunk_dists, w) in dist_vec
            .chunks_exact_mut(NUM_PQ_CENTROIDS)
            .zip(self.chunk_offsets.windows(2))
        {
            for j in w[0]..w[1] {
                let centers = &self.tables_tr[j * NUM_PQ_CENTROIDS..(j + 1) * NUM_PQ_CENTROIDS];
                for (d, c) in chunk_dists.iter_mut().zip(centers) {
                    let delta = c - query[j];
                    *d += delta * delta;
                }
            }
        }
    }

    /// Fill the first `num_chunks() * 256` entries of `dist_vec` with the negated inner product
    /// between each chunk of the preprocessed `query` and each centroid of that chunk.
    pub fn populate_chunk_inner_products(&self, query: &[f32], dist_vec: &mut [f32]) {
        let dist_vec = &mut dist_vec[..self.num_chunks() * NUM_PQ_CENTROIDS];
        dist_vec.fill(0.0);
        for (chunk_dists, w) in dist_vec
            .chunks_exact_mut(NUM_PQ_CENTROIDS)
            .zip(self.chunk_offsets.windows(2))
        {
            for j in w[0]..w[1] {
                let centers = &self.tables_tr[j * NUM_PQ_CENTROIDS..(j + 1) * NUM_PQ_CENTROIDS];
                for (d, c) in chunk_dists.iter_mut().zip(centers) {
                    *d -= c * query[j];
                }
            }
        }
    }

    /// Populate the lookup table for `metric`.
    pub fn populate_chunk_table(&self, metric: Metric, query: &[f32], dist_vec: &mut [f32]) {
        match metric {
            Metric::Euclidean => self.populate_chunk_distances(query, dist_vec),
            Metric::InnerProduct => self.populate_chunk_inner_products(query, dist_vec),
        }
    }

    /// Squared l2 distance between the preprocessed `query` and the vector encoded by `code`.
    pub fn l2_distance(&self, query: &[f32], code: &[u8]) -> f32 {
        let mut total = 0.0;
        for (c, w) in code.iter().zip(self.chunk_offsets.windows(2)) {
            let row = &self.tables[*c as usize * self.dim..];
            let mut chunk = 0.0;
            for j in w[0]..w[1] {
                let delta = row[j] - query[j];
                chunk += delta * delta;
            }
            total += chunk;
        }
        total
    }

    /// Negated inner product between the preprocessed `query` and the vector encoded by `code`.
    pub fn inner_product(&self, query: &[f32], code: &[u8]) -> f32 {
        let mut total = 0.0;
        for (c, w) in code.iter().zip(self.chunk_offsets.windows(2)) {
            let row = &self.tables[*c as usize * self.dim..];
            let mut chunk = 0.0;
            for j in w[0]..w[1] {
                chunk -= row[j] * query[j];
            }
            total += chunk;
        }
        total
    }

    /// Score a single code under `metric`.
    pub fn distance(&self, metric: Metric, query: &[f32], code: &[u8]) -> f32 {
        match metric {
            Metric::Euclidean => self.l2_distance(query, code),
            Metric::InnerProduct => self.inner_product(query, code),
        }
    }

    /// Reconstruct the vector encoded by `code` into `out`.
    ///
    /// The global centroid is added back but the rotation is not undone, so for OPQ pivots the
    /// result lives in the rotated space.
    pub fn inflate_vector(&self, code: &[u8], out: &mut [f32]) {
        for (c, w) in code.iter().zip(self.chunk_offsets.windows(2)) {
            let row = &self.tables[*c as usize * self.dim..(*c as usize + 1) * self.dim];
            for j in w[0]..w[1] {
                out[j] = row[j] + self.centroid[j];
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    use super::FixedChunkPqTable;
    use crate::{
        distance::{l2sq_f32, Metric},
        encoder::encode_vector,
        kmeans::nearest_centroid,
        pivots::{chunk_offsets, PqPivots},
        rotation::rotate_into,
        trainer::{train_opq_pivots, PivotParams},
        Error, NUM_PQ_CENTROIDS,
    };

    fn random_pivots(dim: usize, num_chunks: usize, rng: &mut impl Rng) -> PqPivots {
        PqPivots::new(
            (0..NUM_PQ_CENTROIDS * dim)
                .map(|_| rng.random_range(-1.0..1.0))
                .collect(),
            chunk_offsets(dim, num_chunks),
            (0..dim).map(|_| rng.random_range(-0.1..0.1)).collect(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn table_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FixedChunkPqTable>();
    }

    #[test]
    fn lookup_matches_direct_scoring() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(31);
        let table = FixedChunkPqTable::from_pivots(random_pivots(10, 4, &mut rng));
        let mut query = (0..10).map(|_| rng.random_range(-1.0..1.0)).collect::<Vec<f32>>();
        table.preprocess_query(&mut query);
        let mut dists = vec![0.0f32; 4 * NUM_PQ_CENTROIDS];
        for metric in Metric::all() {
            table.populate_chunk_table(metric, &query, &mut dists);
            for _ in 0..50 {
                let code = (0..4).map(|_| rng.random::<u8>()).collect::<Vec<_>>();
                let lookup = code
                    .iter()
                    .enumerate()
                    .map(|(c, i)| dists[c * NUM_PQ_CENTROIDS + *i as usize])
                    .sum::<f32>();
                let direct = table.distance(metric, &query, &code);
                assert!((lookup - direct).abs() < 1e-4, "{metric} {lookup} {direct}");
            }
        }
    }

    #[test]
    fn inner_product_is_negated() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(32);
        let pivots = random_pivots(6, 3, &mut rng);
        let table = FixedChunkPqTable::from_pivots(pivots.clone());
        let code = [1u8, 200, 7];
        let mut inflated = vec![0.0f32; 6];
        table.inflate_vector(&code, &mut inflated);
        let query = [0.5f32, -1.0, 0.25, 2.0, 0.0, 1.0];
        let mut centered = query;
        table.preprocess_query(&mut centered);
        // Centroids are offset by the global centroid so compare against the centered vectors.
        let raw = inflated
            .iter()
            .zip(pivots.centroid())
            .zip(centered.iter())
            .map(|((x, c), q)| (x - c) * q)
            .sum::<f32>();
        assert!((table.inner_product(&centered, &code) + raw).abs() < 1e-5);
    }

    #[test]
    fn preprocess_centers_and_rotates() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(33);
        let data = (0..400 * 6)
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect::<Vec<_>>();
        let params = PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 2,
            ..PivotParams::new(3)
        };
        let pivots = train_opq_pivots(&data, 6, &params, &mut rng).unwrap();
        let table = FixedChunkPqTable::from_pivots(pivots.clone());
        assert!(table.has_rotation());

        let query = data[..6].to_vec();
        let mut preprocessed = query.clone();
        table.preprocess_query(&mut preprocessed);
        let centered = query
            .iter()
            .zip(pivots.centroid())
            .map(|(q, c)| q - c)
            .collect::<Vec<_>>();
        let mut expected = vec![0.0f32; 6];
        rotate_into(&centered, pivots.rotation().unwrap(), &mut expected);
        assert!(l2sq_f32(&preprocessed, &expected) < 1e-8);

        // Scratch variant leaves padding beyond dim alone.
        let mut padded = query.clone();
        padded.extend_from_slice(&[7.0, 7.0]);
        let mut scratch = vec![0.0f32; 8];
        table.preprocess_query_with_scratch(&mut padded, &mut scratch);
        assert_eq!(&padded[..6], preprocessed.as_slice());
        assert_eq!(&padded[6..], &[7.0, 7.0]);
    }

    #[test]
    fn inflate_reproduces_nearest_centroid() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(34);
        let pivots = random_pivots(9, 3, &mut rng);
        let table = FixedChunkPqTable::from_pivots(pivots.clone());
        for _ in 0..20 {
            let v = (0..9)
                .map(|_| rng.random_range(-1.0f32..1.0))
                .collect::<Vec<_>>();
            let mut code = [0u8; 3];
            encode_vector(&pivots, &v, &mut code).unwrap();
            let mut inflated = vec![0.0f32; 9];
            table.inflate_vector(&code, &mut inflated);
            for c in 0..3 {
                let range = pivots.chunk_range(c);
                let centered = v[range.clone()]
                    .iter()
                    .zip(&pivots.centroid()[range.clone()])
                    .map(|(x, m)| x - m)
                    .collect::<Vec<_>>();
                let codebook = (0..NUM_PQ_CENTROIDS)
                    .flat_map(|i| pivots.centroid_row(i)[range.clone()].iter().copied())
                    .collect::<Vec<_>>();
                let (nearest, _) = nearest_centroid(&centered, &codebook, range.len());
                for (j, x) in range.clone().zip(&inflated[range.clone()]) {
                    let expected = pivots.centroid_row(nearest)[j] + pivots.centroid()[j];
                    assert_eq!(*x, expected);
                }
            }
        }
    }

    #[test]
    fn load_checks_chunk_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pivots.bin");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(35);
        random_pivots(8, 4, &mut rng).write(&path).unwrap();

        let table = FixedChunkPqTable::load(&path, 4).unwrap();
        assert_eq!(table.num_chunks(), 4);
        assert_eq!(table.dim(), 8);
        assert!(!table.has_rotation());
        assert_eq!(table.chunk_offsets(), &[0, 2, 4, 6, 8]);
        assert!(matches!(
            FixedChunkPqTable::load(&path, 8),
            Err(Error::ChunkCountMismatch {
                expected: 4,
                actual: 8
            })
        ));

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            FixedChunkPqTable::load(&path, 4),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            FixedChunkPqTable::load(dir.path().join("missing.bin"), 4),
            Err(Error::Io(_))
        ));
    }
}
