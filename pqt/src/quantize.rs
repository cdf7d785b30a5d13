use std::{io, path::PathBuf};

use clap::Args;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tiger_pq::{
    distance::Metric,
    encoder::{generate_disk_quantized_data, generate_quantized_data},
    input::{training_sample_rate, BinVectorReader, VectorElement},
};

use crate::{dispatch_element, ElementType};

#[derive(Args)]
pub struct QuantizeArgs {
    /// Raw vector file to train on and encode.
    #[arg(short = 'v', long)]
    input_vectors: PathBuf,
    /// Element type of --input-vectors.
    #[arg(long, value_enum, default_value_t = ElementType::F32)]
    element_type: ElementType,
    /// Path to write pivots to.
    #[arg(short, long)]
    pivots: PathBuf,
    /// Path to write codes to.
    #[arg(long)]
    codes: PathBuf,

    /// Distance metric; inner product pivots are trained without centering.
    #[arg(short, long, default_value_t = Metric::Euclidean)]
    metric: Metric,
    /// Number of chunks (bytes) per encoded vector.
    #[arg(short, long, default_value_t = 32)]
    chunks: usize,
    /// Learn a rotation along with the codebooks.
    #[arg(long, default_value_t = false)]
    opq: bool,
    /// Reuse this pivot file instead of training.
    #[arg(long)]
    codebook: Option<PathBuf>,
    /// Build uncentered disk codes with this many chunks instead; 0 means one per dimension.
    #[arg(long, conflicts_with_all = ["opq", "codebook"])]
    disk_pq_dims: Option<usize>,

    /// Probability of sampling each vector for training.
    #[arg(long)]
    sample_rate: Option<f64>,
    /// RNG seed.
    #[arg(long, default_value_t = 0x5051)]
    seed: u64,
}

pub fn quantize(args: QuantizeArgs) -> io::Result<()> {
    dispatch_element!(args.element_type, quantize_typed(&args))
}

fn quantize_typed<E: VectorElement>(args: &QuantizeArgs) -> io::Result<()> {
    let p_val = match args.sample_rate {
        Some(p) => p,
        None => training_sample_rate(BinVectorReader::<E, _>::open(&args.input_vectors)?.num_points()),
    };
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed);
    if let Some(disk_pq_dims) = args.disk_pq_dims {
        let used = generate_disk_quantized_data::<E>(
            &args.input_vectors,
            &args.pivots,
            &args.codes,
            p_val,
            disk_pq_dims,
            &mut rng,
        )?;
        println!("disk pq chunks: {used}");
    } else {
        generate_quantized_data::<E>(
            &args.input_vectors,
            &args.pivots,
            &args.codes,
            args.metric,
            p_val,
            args.chunks,
            args.opq,
            args.codebook.as_deref(),
            &mut rng,
        )?;
    }
    Ok(())
}
