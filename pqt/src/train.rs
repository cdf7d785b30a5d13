use std::{io, num::NonZero, path::PathBuf};

use clap::Args;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tiger_pq::{
    input::{sample_training_set, training_sample_rate, BinVectorReader, VectorElement, VectorStore},
    trainer::{generate_opq_pivots, generate_pq_pivots, PivotParams},
    NUM_KMEANS_REPS_PQ,
};
use tracing::info;

use crate::{dispatch_element, ElementType};

#[derive(Args)]
pub struct TrainArgs {
    /// Raw vector file to sample training vectors from.
    #[arg(short = 'v', long)]
    input_vectors: PathBuf,
    /// Element type of --input-vectors.
    #[arg(long, value_enum, default_value_t = ElementType::F32)]
    element_type: ElementType,
    /// Path to write pivots to.
    #[arg(short, long)]
    pivots: PathBuf,

    /// Number of chunks (bytes) per encoded vector.
    #[arg(short, long)]
    chunks: NonZero<usize>,
    /// Learn a rotation along with the codebooks.
    #[arg(long, default_value_t = false)]
    opq: bool,
    /// Do not subtract the mean before training; use for inner product.
    #[arg(long, default_value_t = false)]
    no_center: bool,

    /// Probability of sampling each vector. Defaults to a rate yielding at most 256k vectors.
    #[arg(long)]
    sample_rate: Option<f64>,
    /// Number of k-means restarts per chunk.
    #[arg(long, default_value_t = NonZero::new(NUM_KMEANS_REPS_PQ).unwrap())]
    reps: NonZero<usize>,
    /// Maximum Lloyd iterations per k-means run.
    #[arg(long, default_value_t = NonZero::new(12).unwrap())]
    iters: NonZero<usize>,
    /// RNG seed.
    #[arg(long, default_value_t = 0x5051)]
    seed: u64,
}

pub fn train(args: TrainArgs) -> io::Result<()> {
    dispatch_element!(args.element_type, train_typed(&args))
}

fn train_typed<E: VectorElement>(args: &TrainArgs) -> io::Result<()> {
    let num_points = BinVectorReader::<E, _>::open(&args.input_vectors)?.num_points();
    let p_val = args
        .sample_rate
        .unwrap_or_else(|| training_sample_rate(num_points));
    if !(p_val > 0.0 && p_val <= 1.0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("--sample-rate must be in (0, 1], got {p_val}"),
        ));
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed);
    let sample = sample_training_set::<E>(&args.input_vectors, p_val, &mut rng)?;
    info!(
        "sampled {} of {num_points} {} vectors at rate {p_val:.4}",
        sample.len(),
        E::NAME
    );

    let params = PivotParams {
        max_k_means_reps: args.reps.get(),
        kmeans_iters: args.iters.get(),
        make_zero_mean: !args.no_center,
        ..PivotParams::new(args.chunks.get())
    };
    if args.opq {
        generate_opq_pivots(
            sample.as_slice(),
            sample.elem_stride(),
            &params,
            &args.pivots,
            &mut rng,
        )?;
    } else {
        generate_pq_pivots(
            sample.as_slice(),
            sample.elem_stride(),
            &params,
            &args.pivots,
            &mut rng,
        )?;
    }
    Ok(())
}
