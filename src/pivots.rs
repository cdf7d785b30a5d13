//! Trained product quantization pivots and their on-disk format.
//!
//! A pivot file holds the chunk partition, the codebook for every chunk, the global centroid that
//! was subtracted before training and, for OPQ, the learned rotation:
//!
//! ```text
//! b"PQPV" | u32 version | u32 num_centers | u32 dim | u32 num_chunks | u32 flags
//! f32[num_centers * dim]   codebook, one full-width row per centroid
//! u32[num_chunks + 1]      chunk offsets
//! f32[dim]                 global centroid
//! f32[dim * dim]           row-major rotation, present iff flags & 1
//! ```
//!
//! All values are little endian.

use std::{
    fs::File,
    io::{self, BufWriter, Read, Write},
    ops::Range,
    path::Path,
};

use crate::{Error, Result, MAX_PQ_CHUNKS, NUM_PQ_CENTROIDS};

const MAGIC: &[u8; 4] = b"PQPV";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 24;
const FLAG_ROTATION: u32 = 1;

/// Partition `dim` dimensions into `num_chunks` contiguous chunks of near-equal width.
///
/// The first `dim % num_chunks` chunks are `ceil(dim / num_chunks)` wide and the rest are
/// `floor(dim / num_chunks)` wide, so 8 dimensions in 3 chunks yields `[0, 3, 6, 8]`. The returned
/// offsets have `num_chunks + 1` entries starting at 0 and ending at `dim`.
///
/// *Panics* if `num_chunks` is zero or greater than `dim`.
pub fn chunk_offsets(dim: usize, num_chunks: usize) -> Vec<usize> {
    assert!(num_chunks > 0 && num_chunks <= dim);
    let (width, remainder) = (dim / num_chunks, dim % num_chunks);
    let mut offsets = Vec::with_capacity(num_chunks + 1);
    offsets.push(0);
    for i in 0..num_chunks {
        let extra = usize::from(i < remainder);
        offsets.push(offsets[i] + width + extra);
    }
    offsets
}

fn validate_chunk_offsets(offsets: &[usize], dim: usize) -> Result<()> {
    if offsets.len() < 2 || offsets.len() - 1 > MAX_PQ_CHUNKS {
        return Err(Error::corrupt(format!(
            "invalid chunk offset count {}",
            offsets.len()
        )));
    }
    if offsets[0] != 0 || offsets[offsets.len() - 1] != dim {
        return Err(Error::corrupt(format!(
            "chunk offsets must span [0, {dim}]; got [{}, {}]",
            offsets[0],
            offsets[offsets.len() - 1]
        )));
    }
    if offsets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(Error::corrupt("chunk offsets are not strictly increasing"));
    }
    Ok(())
}

/// Codebooks, chunk partition, global centroid and optional rotation produced by training.
#[derive(Debug, Clone, PartialEq)]
pub struct PqPivots {
    dim: usize,
    tables: Vec<f32>,
    chunk_offsets: Vec<usize>,
    centroid: Vec<f32>,
    rotation: Option<Vec<f32>>,
}

impl PqPivots {
    /// Assemble pivots from their parts.
    ///
    /// `tables` holds [NUM_PQ_CENTROIDS] rows of `dim` values; the centroid for chunk `c` and
    /// code `i` is `tables[i * dim + offsets[c]..i * dim + offsets[c + 1]]`.
    pub fn new(
        tables: Vec<f32>,
        chunk_offsets: Vec<usize>,
        centroid: Vec<f32>,
        rotation: Option<Vec<f32>>,
    ) -> Result<Self> {
        let dim = centroid.len();
        if dim == 0 {
            return Err(Error::invalid_config("pivots must have non-zero dimension"));
        }
        validate_chunk_offsets(&chunk_offsets, dim)?;
        if tables.len() != NUM_PQ_CENTROIDS * dim {
            return Err(Error::corrupt(format!(
                "codebook has {} values, expected {}",
                tables.len(),
                NUM_PQ_CENTROIDS * dim
            )));
        }
        if rotation.as_ref().is_some_and(|r| r.len() != dim * dim) {
            return Err(Error::corrupt("rotation matrix is not dim x dim"));
        }
        Ok(Self {
            dim,
            tables,
            chunk_offsets,
            centroid,
            rotation,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_offsets.len() - 1
    }

    /// Dimension range covered by `chunk`.
    pub fn chunk_range(&self, chunk: usize) -> Range<usize> {
        self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1]
    }

    pub fn chunk_offsets(&self) -> &[usize] {
        &self.chunk_offsets
    }

    /// Row-major codebook with [NUM_PQ_CENTROIDS] rows of `dim` values.
    pub fn tables(&self) -> &[f32] {
        &self.tables
    }

    /// Return the full-width row for centroid `code`.
    pub fn centroid_row(&self, code: usize) -> &[f32] {
        &self.tables[code * self.dim..(code + 1) * self.dim]
    }

    /// Global centroid subtracted from vectors before encoding.
    pub fn centroid(&self) -> &[f32] {
        &self.centroid
    }

    /// Row-major rotation applied as `x * R`, if trained with OPQ.
    pub fn rotation(&self) -> Option<&[f32]> {
        self.rotation.as_deref()
    }

    /// Write the pivots to `path`.
    ///
    /// Data is written to a temporary file in the same directory and renamed into place so a
    /// failure never leaves a partial file at `path`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            self.write_to(&mut writer)?;
            writer.flush()?;
        }
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Serialize the pivots to `writer`.
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        for v in [
            VERSION,
            NUM_PQ_CENTROIDS as u32,
            self.dim as u32,
            self.num_chunks() as u32,
            if self.rotation.is_some() {
                FLAG_ROTATION
            } else {
                0
            },
        ] {
            writer.write_all(&v.to_le_bytes())?;
        }
        write_f32s(writer, &self.tables)?;
        for o in self.chunk_offsets.iter() {
            writer.write_all(&(*o as u32).to_le_bytes())?;
        }
        write_f32s(writer, &self.centroid)?;
        if let Some(r) = self.rotation.as_ref() {
            write_f32s(writer, r)?;
        }
        Ok(())
    }

    /// Read pivots from the file at `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let mut bytes = vec![];
        File::open(path)?.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }

    /// Parse pivots from a complete pivot file image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = PivotHeader::parse(bytes)?;
        let expected_len = header
            .file_len()
            .ok_or_else(|| Error::corrupt(format!("pivot dim {} is too large", header.dim)))?;
        if bytes.len() != expected_len {
            return Err(Error::corrupt(format!(
                "pivot file is {} bytes, expected {expected_len}",
                bytes.len(),
            )));
        }
        let dim = header.dim;
        let mut rest = &bytes[HEADER_LEN..];
        let tables = take_f32s(&mut rest, NUM_PQ_CENTROIDS * dim);
        let chunk_offsets = take_u32s(&mut rest, header.num_chunks + 1);
        let centroid = take_f32s(&mut rest, dim);
        let rotation = header.has_rotation.then(|| take_f32s(&mut rest, dim * dim));
        Self::new(tables, chunk_offsets, centroid, rotation)
    }
}

/// Fixed-size header of a pivot file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PivotHeader {
    pub dim: usize,
    pub num_chunks: usize,
    pub has_rotation: bool,
}

impl PivotHeader {
    /// Read only the header of the pivot file at `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let mut bytes = [0u8; HEADER_LEN];
        File::open(path)?
            .read_exact(&mut bytes)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::corrupt("truncated pivot header"),
                _ => Error::Io(e),
            })?;
        Self::parse(&bytes)
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::corrupt("truncated pivot header"));
        }
        if &bytes[..4] != MAGIC {
            return Err(Error::corrupt("bad pivot file magic"));
        }
        let mut fields = bytes[4..HEADER_LEN]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().expect("4 bytes")) as usize);
        let mut next = || fields.next().expect("5 header fields");
        let (version, num_centers, dim, num_chunks, flags) =
            (next(), next(), next(), next(), next());
        if version != VERSION as usize {
            return Err(Error::corrupt(format!("unsupported pivot version {version}")));
        }
        if num_centers != NUM_PQ_CENTROIDS {
            return Err(Error::corrupt(format!(
                "pivot file has {num_centers} centers, expected {NUM_PQ_CENTROIDS}"
            )));
        }
        if dim == 0 || num_chunks == 0 || num_chunks > MAX_PQ_CHUNKS || num_chunks > dim {
            return Err(Error::corrupt(format!(
                "invalid pivot shape dim={dim} chunks={num_chunks}"
            )));
        }
        Ok(Self {
            dim,
            num_chunks,
            has_rotation: flags as u32 & FLAG_ROTATION != 0,
        })
    }

    /// Expected size of the complete file, or `None` if the header describes an impossible size.
    fn file_len(&self) -> Option<usize> {
        let table = NUM_PQ_CENTROIDS.checked_mul(self.dim)?;
        let rotation = if self.has_rotation {
            self.dim.checked_mul(self.dim)?
        } else {
            0
        };
        let values = table
            .checked_add(self.num_chunks + 1)?
            .checked_add(self.dim)?
            .checked_add(rotation)?;
        values.checked_mul(4)?.checked_add(HEADER_LEN)
    }
}

fn write_f32s(writer: &mut impl Write, values: &[f32]) -> io::Result<()> {
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn take_f32s(bytes: &mut &[u8], n: usize) -> Vec<f32> {
    let (head, tail) = bytes.split_at(n * 4);
    *bytes = tail;
    head.chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().expect("4 bytes")))
        .collect()
}

fn take_u32s(bytes: &mut &[u8], n: usize) -> Vec<usize> {
    let (head, tail) = bytes.split_at(n * 4);
    *bytes = tail;
    head.chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().expect("4 bytes")) as usize)
        .collect()
}
