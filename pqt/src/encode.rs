use std::{io, num::NonZero, path::PathBuf};

use clap::Args;
use tiger_pq::{
    encoder::PqEncoder,
    input::{BinVectorReader, VectorElement},
    pivots::PqPivots,
    Error,
};

use crate::{dispatch_element, ui::progress_bar, ElementType};

#[derive(Args)]
pub struct EncodeArgs {
    /// Raw vector file to encode.
    #[arg(short = 'v', long)]
    input_vectors: PathBuf,
    /// Element type of --input-vectors.
    #[arg(long, value_enum, default_value_t = ElementType::F32)]
    element_type: ElementType,
    /// Pivot file produced by `train`.
    #[arg(short, long)]
    pivots: PathBuf,
    /// Path to write codes to.
    #[arg(long)]
    codes: PathBuf,

    /// Expected number of chunks in --pivots.
    #[arg(short, long)]
    chunks: NonZero<usize>,
    /// Rotate vectors before encoding. Requires OPQ pivots.
    #[arg(long, default_value_t = false)]
    opq: bool,
}

pub fn encode(args: EncodeArgs) -> io::Result<()> {
    dispatch_element!(args.element_type, encode_typed(&args))
}

fn encode_typed<E: VectorElement>(args: &EncodeArgs) -> io::Result<()> {
    let pivots = PqPivots::read(&args.pivots)?;
    if pivots.num_chunks() != args.chunks.get() {
        return Err(Error::ChunkCountMismatch {
            expected: pivots.num_chunks(),
            actual: args.chunks.get(),
        }
        .into());
    }
    let encoder = PqEncoder::new(pivots, args.opq)?;
    let num_points = BinVectorReader::<E, _>::open(&args.input_vectors)?.num_points();
    let progress = progress_bar(num_points, "encode");
    encoder.encode_file::<E>(&args.input_vectors, &args.codes, |n| progress.inc(n))?;
    Ok(())
}
