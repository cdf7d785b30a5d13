//! Product quantization (PQ) and optimized product quantization (OPQ) for approximate nearest
//! neighbor search.
//!
//! Vectors are split into contiguous groups of dimensions ("chunks") and each chunk is replaced by
//! the index of its nearest centroid in a per-chunk codebook of 256 entries, so every vector is
//! stored as one byte per chunk. At query time a [table::FixedChunkPqTable] builds a per-query
//! lookup table of chunk/centroid distances and candidates are scored by summing table entries.
//!
//! Offline, [trainer] learns codebooks (and optionally a rotation) and [encoder] turns a full
//! data set into codes. Online, each query worker owns a [scratch::PqScratch] and uses the
//! [lookup] kernels against an immutable, shared table.

pub mod codes;
pub mod distance;
pub mod encoder;
pub mod input;
pub mod kmeans;
pub mod lookup;
pub mod pivots;
pub mod rotation;
pub mod scratch;
pub mod table;
pub mod trainer;

use std::io;

/// Bits per code. Each chunk of a compressed vector occupies exactly one byte.
pub const NUM_PQ_BITS: usize = 8;
/// Number of centroids in each chunk codebook.
pub const NUM_PQ_CENTROIDS: usize = 1 << NUM_PQ_BITS;
/// Maximum number of chunks a vector may be divided into.
pub const MAX_PQ_CHUNKS: usize = 384;
/// Maximum number of vectors sampled for training.
pub const MAX_PQ_TRAINING_SET_SIZE: usize = 256_000;
/// Default number of k-means restarts per chunk.
pub const NUM_KMEANS_REPS_PQ: usize = 12;
/// Maximum number of alternating rotation/codebook iterations during OPQ training.
pub const MAX_OPQ_ITERS: usize = 20;

/// Errors produced while training, encoding or loading product quantization data.
#[derive(Debug)]
pub enum Error {
    /// Parameters are invalid; detected before any I/O is performed.
    InvalidConfig(String),
    /// Underlying file system error.
    Io(io::Error),
    /// A pivot or code file is malformed or truncated.
    Corrupt(String),
    /// The requested chunk count does not match the persisted chunk count.
    ChunkCountMismatch { expected: usize, actual: usize },
    /// Input vector dimensionality does not match the persisted pivots.
    DimensionMismatch { expected: usize, actual: usize },
}

impl Error {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt pq file: {msg}"),
            Self::ChunkCountMismatch { expected, actual } => write!(
                f,
                "chunk count mismatch: pivots have {expected} chunks, requested {actual}"
            ),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "dimension mismatch: pivots have {expected} dimensions, input has {actual}"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::InvalidConfig(_)
            | Error::ChunkCountMismatch { .. }
            | Error::DimensionMismatch { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, value)
            }
            Error::Corrupt(_) => io::Error::new(io::ErrorKind::InvalidData, value),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
