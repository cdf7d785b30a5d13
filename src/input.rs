//! Raw vector input: in-memory stores, memory mapped files and block-streaming readers.
//!
//! Raw vector files begin with a little-endian `u32` point count and `u32` dimension count
//! followed by row-major vector elements.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    ops::{Index, IndexMut},
    path::Path,
};

use rand::Rng;
use stable_deref_trait::StableDeref;
use tracing::warn;

use crate::MAX_PQ_TRAINING_SET_SIZE;

/// Length of the raw vector file header in bytes.
pub const BIN_HEADER_LEN: usize = 2 * std::mem::size_of::<u32>();

/// Numeric element type of raw input vectors.
pub trait VectorElement: bytemuck::Pod + Send + Sync + 'static {
    /// Name used on the command line.
    const NAME: &'static str;

    fn to_f32(self) -> f32;
}

impl VectorElement for f32 {
    const NAME: &'static str = "f32";

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
}

impl VectorElement for u8 {
    const NAME: &'static str = "u8";

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl VectorElement for i8 {
    const NAME: &'static str = "i8";

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

/// A store of vector data indexed by a densely assigned range of values.
pub trait VectorStore {
    type Elem;

    /// Number of elements in each vector.
    fn elem_stride(&self) -> usize;

    /// Return the number of vectors in the store.
    fn len(&self) -> usize;

    /// Return true if this store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the vector at `index`.
    ///
    /// *Panics* if `index >= self.len()`.
    fn get(&self, index: usize) -> &[Self::Elem];

    /// Return an iterator over all the vectors in the store.
    fn iter(&self) -> impl ExactSizeIterator<Item = &[Self::Elem]> {
        (0..self.len()).map(|i| self.get(i))
    }
}

/// An owned, row-major vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct VecVectorStore<E> {
    data: Vec<E>,
    stride: usize,
}

impl<E: Clone> VecVectorStore<E> {
    /// Create a store over `data` where each vector is `stride` elements.
    ///
    /// *Panics* if `stride` is zero or does not evenly divide `data`.
    pub fn new(data: Vec<E>, stride: usize) -> Self {
        assert!(stride > 0);
        assert_eq!(data.len() % stride, 0);
        Self { data, stride }
    }

    pub fn with_capacity(stride: usize, capacity: usize) -> Self {
        assert!(stride > 0);
        Self {
            data: Vec::with_capacity(stride * capacity),
            stride,
        }
    }

    /// Append `vector` to the store.
    ///
    /// *Panics* if `vector.len() != self.elem_stride()`.
    pub fn push(&mut self, vector: &[E]) {
        assert_eq!(vector.len(), self.stride);
        self.data.extend_from_slice(vector);
    }

    pub fn as_slice(&self) -> &[E] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [E] {
        &mut self.data
    }

    pub fn iter_mut(&mut self) -> impl ExactSizeIterator<Item = &mut [E]> {
        self.data.chunks_exact_mut(self.stride)
    }

    pub fn into_inner(self) -> Vec<E> {
        self.data
    }
}

impl<E> VectorStore for VecVectorStore<E> {
    type Elem = E;

    fn elem_stride(&self) -> usize {
        self.stride
    }

    fn len(&self) -> usize {
        self.data.len() / self.stride
    }

    fn get(&self, index: usize) -> &[E] {
        &self.data[index * self.stride..(index + 1) * self.stride]
    }
}

impl<E> Index<usize> for VecVectorStore<E> {
    type Output = [E];

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index * self.stride..(index + 1) * self.stride]
    }
}

impl<E> IndexMut<usize> for VecVectorStore<E> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.data[index * self.stride..(index + 1) * self.stride]
    }
}

fn read_header(reader: &mut impl Read) -> io::Result<(usize, usize)> {
    let mut header = [0u8; BIN_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let (num_points, dim) = header.split_at(4);
    Ok((
        u32::from_le_bytes(num_points.try_into().expect("4 bytes")) as usize,
        u32::from_le_bytes(dim.try_into().expect("4 bytes")) as usize,
    ))
}

/// Immutable view of a raw vector file held in memory or memory mapped.
pub struct BinVectorStore<E: 'static, D> {
    // NB: the contents of data is referenced by vectors.
    #[allow(dead_code)]
    data: D,
    vectors: &'static [E],
    dim: usize,
}

impl<E: VectorElement, D> BinVectorStore<E, D>
where
    D: StableDeref<Target = [u8]>,
{
    /// Create a new store over a raw vector file image, typically a memory map.
    pub fn new(data: D) -> io::Result<Self> {
        let (num_points, dim) = read_header(&mut &data[..])?;
        let elem_width = std::mem::size_of::<E>();
        let payload = &data[BIN_HEADER_LEN..];
        if payload.len() != num_points * dim * elem_width {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "vector file has {} payload bytes, header declares {num_points}x{dim} {}",
                    payload.len(),
                    E::NAME
                ),
            ));
        }
        let vectorp = payload.as_ptr() as *const E;
        if !vectorp.is_aligned() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("input vector data not aligned to element width {elem_width}"),
            ));
        }
        // Safety: StableDeref guarantees the pointer is stable even after a move.
        let vectors: &'static [E] =
            unsafe { std::slice::from_raw_parts(vectorp, num_points * dim) };
        Ok(Self { data, vectors, dim })
    }
}

impl<E, D> VectorStore for BinVectorStore<E, D> {
    type Elem = E;

    fn elem_stride(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.vectors.len() / self.dim
        }
    }

    fn get(&self, index: usize) -> &[E] {
        &self.vectors[index * self.dim..(index + 1) * self.dim]
    }
}

impl<E, D> Index<usize> for BinVectorStore<E, D> {
    type Output = [E];

    fn index(&self, index: usize) -> &Self::Output {
        self.get(index)
    }
}

/// Reads a raw vector file a block at a time, converting elements to f32.
///
/// This allows encoding data sets that do not fit in memory.
pub struct BinVectorReader<E, R> {
    reader: R,
    num_points: usize,
    dim: usize,
    remaining: usize,
    buf: Vec<E>,
}

impl<E: VectorElement> BinVectorReader<E, BufReader<File>> {
    /// Open the raw vector file at `path`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<E: VectorElement, R: Read> BinVectorReader<E, R> {
    /// Create a new reader, consuming the header from `reader`.
    pub fn new(mut reader: R) -> io::Result<Self> {
        let (num_points, dim) = read_header(&mut reader)?;
        Ok(Self {
            reader,
            num_points,
            dim,
            remaining: num_points,
            buf: vec![],
        })
    }

    /// Total number of vectors in the file.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    /// Dimensions of each vector.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Read up to `max_vectors` into `out` as f32 values, replacing its contents.
    ///
    /// Returns the number of vectors read; zero once the file is exhausted.
    pub fn read_block(&mut self, max_vectors: usize, out: &mut Vec<f32>) -> io::Result<usize> {
        let n = max_vectors.min(self.remaining);
        self.buf.clear();
        self.buf.resize(n * self.dim, E::zeroed());
        self.reader
            .read_exact(bytemuck::cast_slice_mut(&mut self.buf))?;
        out.clear();
        out.extend(self.buf.iter().map(|e| e.to_f32()));
        self.remaining -= n;
        Ok(n)
    }
}

/// Write `vectors` as a raw vector file at `path`.
pub fn write_bin_vectors<E: VectorElement>(
    path: impl AsRef<Path>,
    vectors: &[E],
    dim: usize,
) -> io::Result<()> {
    if dim == 0 || vectors.len() % dim != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} elements do not divide into dimension {dim}", vectors.len()),
        ));
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&((vectors.len() / dim) as u32).to_le_bytes())?;
    writer.write_all(&(dim as u32).to_le_bytes())?;
    writer.write_all(bytemuck::cast_slice(vectors))?;
    writer.flush()
}

/// Compute the fraction of a data set of `num_points` to sample for training.
pub fn training_sample_rate(num_points: usize) -> f64 {
    if num_points == 0 {
        1.0
    } else {
        (MAX_PQ_TRAINING_SET_SIZE as f64 / num_points as f64).min(1.0)
    }
}

/// Sample a training set from the raw vector file at `path`.
///
/// Each vector is retained with probability `p_val`, clamped to `[0, 1]`. No more than [MAX_PQ_TRAINING_SET_SIZE]
/// vectors are returned; once that many have been kept later vectors replace earlier ones
/// uniformly at random.
pub fn sample_training_set<E: VectorElement>(
    path: impl AsRef<Path>,
    p_val: f64,
    rng: &mut impl Rng,
) -> io::Result<VecVectorStore<f32>> {
    let mut reader = BinVectorReader::<E, _>::open(path)?;
    if reader.dim() == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "vector file has zero dimensions",
        ));
    }
    if p_val.is_nan() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sample rate is not a number",
        ));
    }
    let p_val = p_val.clamp(0.0, 1.0);
    let mut sample = VecVectorStore::with_capacity(
        reader.dim(),
        ((reader.num_points() as f64 * p_val) as usize).min(MAX_PQ_TRAINING_SET_SIZE),
    );
    let mut kept = 0usize;
    let mut block = vec![];
    while reader.read_block(crate::encoder::ENCODE_BLOCK_SIZE, &mut block)? > 0 {
        for v in block.chunks_exact(reader.dim()) {
            if !rng.random_bool(p_val) {
                continue;
            }
            kept += 1;
            if sample.len() < MAX_PQ_TRAINING_SET_SIZE {
                sample.push(v);
            } else {
                let slot = rng.random_range(0..kept);
                if slot < MAX_PQ_TRAINING_SET_SIZE {
                    sample[slot].copy_from_slice(v);
                }
            }
        }
    }
    if kept > MAX_PQ_TRAINING_SET_SIZE {
        warn!(
            "sampled {kept} training vectors; retaining {}",
            MAX_PQ_TRAINING_SET_SIZE
        );
    }
    Ok(sample)
}
