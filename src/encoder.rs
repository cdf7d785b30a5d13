//! Offline encoding of raw vectors into PQ codes using trained pivots.

use std::{path::Path, time::Instant};

use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    codes::CodesWriter,
    distance::{l2sq_f32, Metric},
    input::{sample_training_set, BinVectorReader, VectorElement, VectorStore},
    kmeans::nearest_centroid,
    pivots::PqPivots,
    rotation::rotate_into,
    trainer::{generate_opq_pivots, generate_pq_pivots, PivotParams},
    Error, Result, MAX_PQ_CHUNKS, NUM_PQ_CENTROIDS,
};

/// Number of vectors read, encoded and written at a time when encoding a file.
pub const ENCODE_BLOCK_SIZE: usize = 10_000;

/// Encode a single `vector` against `pivots` into `out`, one code per chunk.
///
/// The vector is centered and, if the pivots carry one, rotated before each chunk is assigned to
/// its nearest centroid. Equidistant centroids resolve to the lowest code.
pub fn encode_vector(pivots: &PqPivots, vector: &[f32], out: &mut [u8]) -> Result<()> {
    if vector.len() != pivots.dim() {
        return Err(Error::DimensionMismatch {
            expected: pivots.dim(),
            actual: vector.len(),
        });
    }
    if out.len() != pivots.num_chunks() {
        return Err(Error::ChunkCountMismatch {
            expected: pivots.num_chunks(),
            actual: out.len(),
        });
    }
    let mut x = vector
        .iter()
        .zip(pivots.centroid())
        .map(|(v, c)| v - c)
        .collect::<Vec<_>>();
    if let Some(rotation) = pivots.rotation() {
        let mut rotated = vec![0.0; x.len()];
        rotate_into(&x, rotation, &mut rotated);
        x = rotated;
    }
    for (c, code) in out.iter_mut().enumerate() {
        let range = pivots.chunk_range(c);
        let mut best = (0, f32::INFINITY);
        for i in 0..NUM_PQ_CENTROIDS {
            let d = l2sq_f32(&x[range.clone()], &pivots.centroid_row(i)[range.clone()]);
            if d < best.1 {
                best = (i, d);
            }
        }
        *code = best.0 as u8;
    }
    Ok(())
}

/// Pivots prepared for encoding many vectors.
///
/// Each chunk codebook is laid out contiguously so that nearest centroid search streams through
/// memory.
#[derive(Debug, Clone)]
pub struct PqEncoder {
    pivots: PqPivots,
    codebooks: Vec<Vec<f32>>,
}

impl PqEncoder {
    /// Create an encoder. `use_opq` must agree with the pivots: OPQ pivots carry a rotation that
    /// is applied before encoding, and queries against them are rotated the same way.
    pub fn new(pivots: PqPivots, use_opq: bool) -> Result<Self> {
        match (use_opq, pivots.rotation().is_some()) {
            (true, false) => {
                return Err(Error::invalid_config(
                    "opq encoding requested but pivots have no rotation",
                ))
            }
            (false, true) => {
                return Err(Error::invalid_config(
                    "pivots carry an opq rotation but opq encoding was not requested",
                ))
            }
            _ => {}
        }
        let codebooks = (0..pivots.num_chunks())
            .map(|c| {
                let range = pivots.chunk_range(c);
                (0..NUM_PQ_CENTROIDS)
                    .flat_map(|i| pivots.centroid_row(i)[range.clone()].iter().copied())
                    .collect()
            })
            .collect();
        Ok(Self { pivots, codebooks })
    }

    pub fn pivots(&self) -> &PqPivots {
        &self.pivots
    }

    pub fn dim(&self) -> usize {
        self.pivots.dim()
    }

    pub fn num_chunks(&self) -> usize {
        self.pivots.num_chunks()
    }

    /// Encode `vector` into `out`.
    pub fn encode(&self, vector: &[f32], out: &mut [u8]) -> Result<()> {
        if vector.len() != self.dim() {
            return Err(Error::DimensionMismatch {
                expected: self.dim(),
                actual: vector.len(),
            });
        }
        if out.len() != self.num_chunks() {
            return Err(Error::ChunkCountMismatch {
                expected: self.num_chunks(),
                actual: out.len(),
            });
        }
        let mut scratch = vec![0.0; self.dim() * 2];
        self.encode_into(vector, &mut scratch, out);
        Ok(())
    }

    /// Encode row-major `vectors` into row-major `out` in parallel.
    ///
    /// *Panics* if `vectors` and `out` do not hold the same number of rows.
    pub fn encode_block(&self, vectors: &[f32], out: &mut [u8]) {
        assert_eq!(
            vectors.len() / self.dim(),
            out.len() / self.num_chunks(),
            "vector and code row counts differ"
        );
        out.par_chunks_mut(self.num_chunks())
            .zip(vectors.par_chunks(self.dim()))
            .for_each_init(
                || vec![0.0f32; self.dim() * 2],
                |scratch, (codes, v)| self.encode_into(v, scratch, codes),
            );
    }

    fn encode_into(&self, vector: &[f32], scratch: &mut [f32], out: &mut [u8]) {
        let (centered, rotated) = scratch.split_at_mut(self.dim());
        for ((o, v), c) in centered
            .iter_mut()
            .zip(vector)
            .zip(self.pivots.centroid())
        {
            *o = v - c;
        }
        let x = match self.pivots.rotation() {
            Some(rotation) => {
                rotate_into(centered, rotation, rotated);
                &*rotated
            }
            None => &*centered,
        };
        for ((code, codebook), w) in out
            .iter_mut()
            .zip(self.codebooks.iter())
            .zip(self.pivots.chunk_offsets().windows(2))
        {
            *code = nearest_centroid(&x[w[0]..w[1]], codebook, w[1] - w[0]).0 as u8;
        }
    }

    /// Encode every vector in the raw vector file `data_file` and write the codes to
    /// `output_codes_path`, calling `progress` with the number of vectors in each completed block.
    ///
    /// Vectors are streamed [ENCODE_BLOCK_SIZE] at a time. Returns the number of vectors encoded.
    pub fn encode_file<T: VectorElement>(
        &self,
        data_file: impl AsRef<Path>,
        output_codes_path: impl AsRef<Path>,
        progress: impl Fn(u64),
    ) -> Result<usize> {
        let mut reader = BinVectorReader::<T, _>::open(data_file)?;
        if reader.dim() != self.dim() {
            return Err(Error::DimensionMismatch {
                expected: self.dim(),
                actual: reader.dim(),
            });
        }
        let start = Instant::now();
        let mut writer =
            CodesWriter::create(output_codes_path, reader.num_points(), self.num_chunks())?;
        let mut block = vec![];
        let mut codes = vec![];
        loop {
            let n = reader.read_block(ENCODE_BLOCK_SIZE, &mut block)?;
            if n == 0 {
                break;
            }
            codes.resize(n * self.num_chunks(), 0);
            self.encode_block(&block, &mut codes);
            writer.write_block(&codes)?;
            debug!("encoded block of {n} {} vectors", T::NAME);
            progress(n as u64);
        }
        writer.finish()?;
        info!(
            "encoded {} vectors into {} chunks in {:.2}s",
            reader.num_points(),
            self.num_chunks(),
            start.elapsed().as_secs_f64()
        );
        Ok(reader.num_points())
    }
}

/// Encode the raw vector file `data_file` with the pivots at `pivots_path`, writing codes to
/// `output_codes_path`.
///
/// `num_pq_chunks` must match the chunk count of the pivots and the file must have the pivots'
/// dimensionality. If `use_opq` vectors are rotated, which requires pivots with a rotation.
pub fn generate_pq_data_from_pivots<T: VectorElement>(
    data_file: impl AsRef<Path>,
    num_centers: usize,
    num_pq_chunks: usize,
    pivots_path: impl AsRef<Path>,
    output_codes_path: impl AsRef<Path>,
    use_opq: bool,
) -> Result<()> {
    if num_centers != NUM_PQ_CENTROIDS {
        return Err(Error::invalid_config(format!(
            "num_centers must be {NUM_PQ_CENTROIDS}, got {num_centers}"
        )));
    }
    let pivots = PqPivots::read(pivots_path)?;
    if pivots.num_chunks() != num_pq_chunks {
        return Err(Error::ChunkCountMismatch {
            expected: pivots.num_chunks(),
            actual: num_pq_chunks,
        });
    }
    PqEncoder::new(pivots, use_opq)?.encode_file::<T>(data_file, output_codes_path, |_| {})?;
    Ok(())
}

/// Train pivots from a sample of `data_file` (or reuse `codebook_path`) and encode the whole
/// file.
///
/// Each vector is sampled for training with probability `p_val`. Data is centered before training
/// for [Metric::Euclidean] but not for [Metric::InnerProduct]. When `codebook_path` is given those
/// pivots are copied to `pivots_path` instead of training.
#[allow(clippy::too_many_arguments)]
pub fn generate_quantized_data<T: VectorElement>(
    data_file: impl AsRef<Path>,
    pivots_path: impl AsRef<Path>,
    codes_path: impl AsRef<Path>,
    metric: Metric,
    p_val: f64,
    num_pq_chunks: usize,
    use_opq: bool,
    codebook_path: Option<&Path>,
    rng: &mut impl Rng,
) -> Result<()> {
    if num_pq_chunks == 0 || num_pq_chunks > MAX_PQ_CHUNKS {
        return Err(Error::invalid_config(format!(
            "num_pq_chunks must be in [1, {MAX_PQ_CHUNKS}], got {num_pq_chunks}"
        )));
    }
    let (data_file, pivots_path) = (data_file.as_ref(), pivots_path.as_ref());
    match codebook_path {
        Some(codebook_path) => {
            info!("using codebook {}", codebook_path.display());
            if codebook_path != pivots_path {
                PqPivots::read(codebook_path)?.write(pivots_path)?;
            }
        }
        None => {
            let params = PivotParams {
                make_zero_mean: metric.zero_mean(),
                ..PivotParams::new(num_pq_chunks)
            };
            train_from_file::<T>(data_file, pivots_path, &params, p_val, use_opq, rng)?;
        }
    }
    generate_pq_data_from_pivots::<T>(
        data_file,
        NUM_PQ_CENTROIDS,
        num_pq_chunks,
        pivots_path,
        codes_path,
        use_opq,
    )
}

/// Train uncentered PQ pivots for a disk layout and encode `data_file`.
///
/// The chunk count is chosen independently of any in-memory codes: `disk_pq_dims` of zero or more
/// than the data dimension means one chunk per dimension. Returns the chunk count actually used.
pub fn generate_disk_quantized_data<T: VectorElement>(
    data_file: impl AsRef<Path>,
    disk_pivots_path: impl AsRef<Path>,
    disk_codes_path: impl AsRef<Path>,
    p_val: f64,
    disk_pq_dims: usize,
    rng: &mut impl Rng,
) -> Result<usize> {
    let data_file = data_file.as_ref();
    let dim = BinVectorReader::<T, _>::open(data_file)?.dim();
    let mut num_chunks = if disk_pq_dims == 0 || disk_pq_dims > dim {
        dim
    } else {
        disk_pq_dims
    };
    if num_chunks > MAX_PQ_CHUNKS {
        warn!("disk pq chunk count {num_chunks} exceeds {MAX_PQ_CHUNKS}; clamping");
        num_chunks = MAX_PQ_CHUNKS;
    }
    info!("compressing {dim} dimensional data into {num_chunks} disk pq chunks");
    let params = PivotParams {
        make_zero_mean: false,
        ..PivotParams::new(num_chunks)
    };
    train_from_file::<T>(data_file, disk_pivots_path.as_ref(), &params, p_val, false, rng)?;
    generate_pq_data_from_pivots::<T>(
        data_file,
        NUM_PQ_CENTROIDS,
        num_chunks,
        disk_pivots_path,
        disk_codes_path,
        false,
    )?;
    Ok(num_chunks)
}

fn train_from_file<T: VectorElement>(
    data_file: &Path,
    pivots_path: &Path,
    params: &PivotParams,
    p_val: f64,
    use_opq: bool,
    rng: &mut impl Rng,
) -> Result<()> {
    if !(p_val > 0.0 && p_val <= 1.0) {
        return Err(Error::invalid_config(format!(
            "sample rate must be in (0, 1], got {p_val}"
        )));
    }
    let train = sample_training_set::<T>(data_file, p_val, rng)?;
    info!(
        "sampled {} training vectors from {}",
        train.len(),
        data_file.display()
    );
    if use_opq {
        generate_opq_pivots(train.as_slice(), train.elem_stride(), params, pivots_path, rng)
    } else {
        generate_pq_pivots(train.as_slice(), train.elem_stride(), params, pivots_path, rng)
    }
}

#[cfg(test)]
mod test {
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    use super::{
        encode_vector, generate_disk_quantized_data, generate_pq_data_from_pivots,
        generate_quantized_data, PqEncoder,
    };
    use crate::{
        codes::CompressedVectors,
        distance::Metric,
        input::{write_bin_vectors, VectorStore},
        pivots::PqPivots,
        table::FixedChunkPqTable,
        trainer::{train_opq_pivots, train_pq_pivots, PivotParams},
        Error, NUM_PQ_CENTROIDS,
    };

    fn random_vectors(n: usize, dim: usize, rng: &mut impl Rng) -> Vec<f32> {
        (0..n * dim).map(|_| rng.random_range(-1.0f32..1.0)).collect()
    }

    fn fast_params(num_pq_chunks: usize) -> PivotParams {
        PivotParams {
            max_k_means_reps: 1,
            kmeans_iters: 4,
            ..PivotParams::new(num_pq_chunks)
        }
    }

    #[test]
    fn encode_inflate_is_stable() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(21);
        let data = random_vectors(1000, 12, &mut rng);
        let params = PivotParams {
            make_zero_mean: false,
            ..fast_params(4)
        };
        let pivots = train_pq_pivots(&data, 12, &params, &mut rng).unwrap();
        let table = FixedChunkPqTable::from_pivots(pivots.clone());
        let encoder = PqEncoder::new(pivots, false).unwrap();

        let mut code = [0u8; 4];
        let mut again = [0u8; 4];
        let mut inflated = vec![0.0f32; 12];
        for v in data.chunks_exact(12).take(100) {
            encoder.encode(v, &mut code).unwrap();
            table.inflate_vector(&code, &mut inflated);
            encoder.encode(&inflated, &mut again).unwrap();
            assert_eq!(code, again);
        }
    }

    #[test]
    fn block_and_single_encoding_agree() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(22);
        let data = random_vectors(500, 8, &mut rng);
        let pivots = train_opq_pivots(&data, 8, &fast_params(4), &mut rng).unwrap();
        let encoder = PqEncoder::new(pivots.clone(), true).unwrap();
        let mut block = vec![0u8; 500 * 4];
        encoder.encode_block(&data, &mut block);
        let mut single = [0u8; 4];
        for (v, codes) in data.chunks_exact(8).zip(block.chunks_exact(4)) {
            encode_vector(&pivots, v, &mut single).unwrap();
            assert_eq!(&single, codes);
        }
    }

    #[test]
    fn ties_resolve_to_lowest_code() {
        let dim = 2;
        // Every centroid is identical so every vector ties.
        let tables = vec![0.5f32; NUM_PQ_CENTROIDS * dim];
        let pivots = PqPivots::new(tables, vec![0, 1, 2], vec![0.0; dim], None).unwrap();
        let mut code = [9u8; 2];
        encode_vector(&pivots, &[3.0, -3.0], &mut code).unwrap();
        assert_eq!(code, [0, 0]);
        PqEncoder::new(pivots, false)
            .unwrap()
            .encode(&[3.0, -3.0], &mut code)
            .unwrap();
        assert_eq!(code, [0, 0]);
    }

    #[test]
    fn opq_flag_must_match_rotation() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(23);
        let data = random_vectors(300, 4, &mut rng);
        let pivots = train_pq_pivots(&data, 4, &fast_params(2), &mut rng).unwrap();
        assert!(matches!(
            PqEncoder::new(pivots, true),
            Err(Error::InvalidConfig(_))
        ));

        let opq_pivots = train_opq_pivots(&data, 4, &fast_params(2), &mut rng).unwrap();
        assert!(matches!(
            PqEncoder::new(opq_pivots.clone(), false),
            Err(Error::InvalidConfig(_))
        ));

        // Codes from the encoder and from encode_vector both live in the rotated space the table
        // scores queries in.
        let table = FixedChunkPqTable::from_pivots(opq_pivots.clone());
        let encoder = PqEncoder::new(opq_pivots.clone(), true).unwrap();
        let (mut code, mut single) = ([0u8; 2], [0u8; 2]);
        for v in data.chunks_exact(4).take(50) {
            encoder.encode(v, &mut code).unwrap();
            encode_vector(&opq_pivots, v, &mut single).unwrap();
            assert_eq!(code, single);
            let mut query = v.to_vec();
            table.preprocess_query(&mut query);
            let nearest = (0..=u8::MAX)
                .map(|c| {
                    let mut candidate = code;
                    candidate[0] = c;
                    table.l2_distance(&query, &candidate)
                })
                .fold(f32::INFINITY, f32::min);
            assert!(table.l2_distance(&query, &code) <= nearest + 1e-5);
        }
    }

    #[test]
    fn encode_file_and_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        let pivots_path = dir.path().join("pivots.bin");
        let codes_path = dir.path().join("codes.bin");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(24);
        let data = (0..25_000 * 4)
            .map(|_| rng.random_range(0..=255u8))
            .collect::<Vec<_>>();
        write_bin_vectors(&data_path, &data, 4).unwrap();
        let train = data.iter().take(2000 * 4).map(|x| *x as f32).collect::<Vec<_>>();
        train_pq_pivots(&train, 4, &fast_params(2), &mut rng)
            .unwrap()
            .write(&pivots_path)
            .unwrap();

        generate_pq_data_from_pivots::<u8>(
            &data_path,
            NUM_PQ_CENTROIDS,
            2,
            &pivots_path,
            &codes_path,
            false,
        )
        .unwrap();
        let codes = CompressedVectors::open(&codes_path).unwrap();
        assert_eq!(codes.len(), 25_000);
        assert_eq!(codes.num_chunks(), 2);
        let pivots = PqPivots::read(&pivots_path).unwrap();
        let mut expected = [0u8; 2];
        let v = data[24_999 * 4..].iter().map(|x| *x as f32).collect::<Vec<_>>();
        encode_vector(&pivots, &v, &mut expected).unwrap();
        assert_eq!(codes.row(24_999), &expected);

        assert!(matches!(
            generate_pq_data_from_pivots::<u8>(
                &data_path,
                NUM_PQ_CENTROIDS,
                3,
                &pivots_path,
                &codes_path,
                false
            ),
            Err(Error::ChunkCountMismatch {
                expected: 2,
                actual: 3
            })
        ));

        let wide_path = dir.path().join("wide.bin");
        write_bin_vectors(&wide_path, &[1u8; 30], 5).unwrap();
        let wide_codes = dir.path().join("wide_codes.bin");
        assert!(matches!(
            generate_pq_data_from_pivots::<u8>(
                &wide_path,
                NUM_PQ_CENTROIDS,
                2,
                &pivots_path,
                &wide_codes,
                false
            ),
            Err(Error::DimensionMismatch {
                expected: 4,
                actual: 5
            })
        ));
        assert!(!wide_codes.exists());

        assert!(matches!(
            generate_pq_data_from_pivots::<u8>(&data_path, 16, 2, &pivots_path, &codes_path, false),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn quantize_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(25);
        let data = random_vectors(800, 6, &mut rng);
        write_bin_vectors(&data_path, &data, 6).unwrap();

        let pivots_path = dir.path().join("pivots.bin");
        let codes_path = dir.path().join("codes.bin");
        generate_quantized_data::<f32>(
            &data_path,
            &pivots_path,
            &codes_path,
            Metric::InnerProduct,
            1.0,
            3,
            false,
            None,
            &mut rng,
        )
        .unwrap();
        let pivots = PqPivots::read(&pivots_path).unwrap();
        assert_eq!(pivots.centroid(), &[0.0; 6]);
        assert_eq!(CompressedVectors::read(&codes_path).unwrap().len(), 800);

        // Reusing a codebook copies it and produces identical codes.
        let copied_path = dir.path().join("copied.bin");
        let copied_codes = dir.path().join("copied_codes.bin");
        generate_quantized_data::<f32>(
            &data_path,
            &copied_path,
            &copied_codes,
            Metric::Euclidean,
            1.0,
            3,
            false,
            Some(&pivots_path),
            &mut rng,
        )
        .unwrap();
        assert_eq!(PqPivots::read(&copied_path).unwrap(), pivots);
        assert_eq!(
            std::fs::read(&copied_codes).unwrap(),
            std::fs::read(&codes_path).unwrap()
        );

        assert!(matches!(
            generate_quantized_data::<f32>(
                &data_path,
                &pivots_path,
                &codes_path,
                Metric::Euclidean,
                0.0,
                3,
                true,
                None,
                &mut rng,
            ),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn disk_quantized_width() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.bin");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(26);
        write_bin_vectors(&data_path, &random_vectors(300, 6, &mut rng), 6).unwrap();

        for (requested, expected) in [(0, 6), (9, 6), (3, 3)] {
            let pivots_path = dir.path().join(format!("disk_pivots_{requested}.bin"));
            let codes_path = dir.path().join(format!("disk_codes_{requested}.bin"));
            let used = generate_disk_quantized_data::<f32>(
                &data_path,
                &pivots_path,
                &codes_path,
                1.0,
                requested,
                &mut rng,
            )
            .unwrap();
            assert_eq!(used, expected);
            assert_eq!(
                CompressedVectors::read(&codes_path).unwrap().num_chunks(),
                expected
            );
            assert!(PqPivots::read(&pivots_path)
                .unwrap()
                .centroid()
                .iter()
                .all(|c| *c == 0.0));
        }
    }
}
