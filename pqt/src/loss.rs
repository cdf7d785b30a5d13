use std::{
    fs::File,
    io,
    num::NonZero,
    path::{Path, PathBuf},
};

use clap::Args;
use indicatif::{ParallelProgressIterator, ProgressIterator};
use memmap2::Mmap;
use rayon::prelude::*;
use tiger_pq::{
    codes::CompressedVectors,
    distance::Metric,
    input::{BinVectorStore, VectorStore},
    scratch::{aligned_dim, ScratchPool},
    table::FixedChunkPqTable,
    Error,
};

use crate::ui::progress_bar;

#[derive(Args)]
pub struct LossArgs {
    /// Raw f32 vector file that was encoded.
    #[arg(short = 'v', long)]
    input_vectors: PathBuf,
    /// Pivot file used for encoding.
    #[arg(short, long)]
    pivots: PathBuf,
    /// Codes for --input-vectors.
    #[arg(long)]
    codes: PathBuf,

    /// Raw f32 query vectors. If set, compare PQ distances to exact distances.
    #[arg(short, long)]
    query_vectors: Option<PathBuf>,
    /// Distance metric used when comparing query distances.
    #[arg(short, long, default_value_t = Metric::Euclidean)]
    metric: Metric,
    /// Maximum number of documents scored per query.
    #[arg(long, default_value_t = 10_000)]
    doc_limit: usize,
    /// Number of candidates scored per batch.
    #[arg(long, default_value_t = NonZero::new(256).unwrap())]
    batch_size: NonZero<usize>,
}

pub fn loss(args: LossArgs) -> io::Result<()> {
    let vectors = BinVectorStore::<f32, _>::new(unsafe {
        Mmap::map(&File::open(&args.input_vectors)?)?
    })?;
    let codes = CompressedVectors::open(&args.codes)?;
    if codes.len() != vectors.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "{} codes for {} vectors",
                codes.len(),
                vectors.len()
            ),
        ));
    }
    let table = FixedChunkPqTable::load(&args.pivots, codes.num_chunks())?;
    if table.dim() != vectors.elem_stride() {
        return Err(Error::DimensionMismatch {
            expected: table.dim(),
            actual: vectors.elem_stride(),
        }
        .into());
    }

    // Quantization error is the distance between each preprocessed vector and its code.
    let mut total_error = 0.0f64;
    let mut query = vec![0.0f32; table.dim()];
    for (v, code) in vectors
        .iter()
        .zip(codes.iter())
        .progress_with(progress_bar(vectors.len(), "loss"))
    {
        query.copy_from_slice(v);
        table.preprocess_query(&mut query);
        total_error += table.l2_distance(&query, code) as f64;
    }
    println!(
        "vectors {:9} chunks {:3} mean squared error {:.6}",
        vectors.len(),
        table.num_chunks(),
        total_error / vectors.len() as f64
    );

    if let Some(query_vectors) = args.query_vectors.as_ref() {
        distance_loss(&args, query_vectors, &vectors, &codes, &table)?;
    }
    Ok(())
}

fn distance_loss(
    args: &LossArgs,
    query_path: &Path,
    vectors: &(impl VectorStore<Elem = f32> + Sync),
    codes: &(impl VectorStore<Elem = u8> + Sync),
    table: &FixedChunkPqTable,
) -> io::Result<()> {
    let queries = BinVectorStore::<f32, _>::new(unsafe { Mmap::map(&File::open(query_path)?)? })?;
    if queries.elem_stride() != table.dim() {
        return Err(Error::DimensionMismatch {
            expected: table.dim(),
            actual: queries.elem_stride(),
        }
        .into());
    }
    let doc_limit = args.doc_limit.min(vectors.len());
    let all_codes = (0..doc_limit)
        .flat_map(|i| codes.get(i).iter().copied())
        .collect::<Vec<_>>();
    let ids = (0..doc_limit as u32).collect::<Vec<_>>();

    let batch_size = args.batch_size.get();
    let pool = ScratchPool::<f32>::new(batch_size, aligned_dim(table.dim()));
    let (abs_error, rel_error) = (0..queries.len())
        .into_par_iter()
        .progress_with(progress_bar(queries.len(), "queries"))
        .map(|i| {
            let query = &queries[i];
            pool.with(|scratch| {
                scratch.set(query.len(), query, 1.0);
                scratch.prepare_query(table, args.metric);
                let mut abs_error = 0.0f64;
                let mut rel_error = 0.0f64;
                for batch in ids.chunks(batch_size) {
                    let dists = scratch.score_candidates(table, &all_codes, batch);
                    for (pq, id) in dists.iter().zip(batch) {
                        let exact = args.metric.distance(query, vectors.get(*id as usize));
                        let delta = (*pq as f64 - exact as f64).abs();
                        abs_error += delta;
                        rel_error += delta / (exact as f64).abs().max(f64::EPSILON);
                    }
                }
                (abs_error, rel_error)
            })
        })
        .reduce(|| (0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

    let n = (queries.len() * doc_limit) as f64;
    println!(
        "queries {:6} docs {:9} metric {} mean abs error {:.6} mean relative error {:.6}",
        queries.len(),
        doc_limit,
        args.metric,
        abs_error / n,
        rel_error / n
    );
    Ok(())
}
