mod encode;
mod loss;
mod quantize;
mod train;
mod ui;

use std::io;

use clap::{Parser, Subcommand, ValueEnum};
use encode::{encode, EncodeArgs};
use loss::{loss, LossArgs};
use quantize::{quantize, QuantizeArgs};
use train::{train, TrainArgs};

#[derive(Parser)]
#[command(version, about = "Product quantization training and encoding tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train PQ or OPQ pivots from a sample of a vector file.
    Train(TrainArgs),
    /// Encode a vector file with existing pivots.
    Encode(EncodeArgs),
    /// Train (or reuse) pivots and encode a vector file in one step.
    Quantize(QuantizeArgs),
    /// Measure reconstruction and distance error of encoded vectors.
    Loss(LossArgs),
}

/// Element type of a raw vector file.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum ElementType {
    #[default]
    F32,
    U8,
    I8,
}

/// Invoke a function generic over [tiger_pq::input::VectorElement] for the selected element type.
#[macro_export]
macro_rules! dispatch_element {
    ($elem:expr, $f:ident ( $($arg:expr),* $(,)? )) => {
        match $elem {
            $crate::ElementType::F32 => $f::<f32>($($arg),*),
            $crate::ElementType::U8 => $f::<u8>($($arg),*),
            $crate::ElementType::I8 => $f::<i8>($($arg),*),
        }
    };
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Encode(args) => encode(args),
        Commands::Quantize(args) => quantize(args),
        Commands::Loss(args) => loss(args),
    }
}
