//! Persisted compressed vectors: one byte per chunk per vector.
//!
//! A codes file is a little-endian `u32` vector count and `u32` chunk count followed by the
//! row-major codes.

use std::{
    fs::File,
    io::{BufWriter, Write},
    ops::Deref,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use tempfile::NamedTempFile;

use crate::{input::VectorStore, Error, Result, MAX_PQ_CHUNKS};

/// Length of the codes file header in bytes.
pub const CODES_HEADER_LEN: usize = 8;

/// An immutable matrix of PQ codes over an owned buffer or a memory map of a codes file.
#[derive(Debug)]
pub struct CompressedVectors<D> {
    data: D,
    num_points: usize,
    num_chunks: usize,
}

impl<D: Deref<Target = [u8]>> CompressedVectors<D> {
    /// Create from a complete codes file image.
    pub fn new(data: D) -> Result<Self> {
        if data.len() < CODES_HEADER_LEN {
            return Err(Error::corrupt("truncated codes header"));
        }
        let num_points = u32::from_le_bytes(data[0..4].try_into().expect("4 bytes")) as usize;
        let num_chunks = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes")) as usize;
        if num_chunks == 0 || num_chunks > MAX_PQ_CHUNKS {
            return Err(Error::corrupt(format!(
                "codes file has invalid chunk count {num_chunks}"
            )));
        }
        if data.len() - CODES_HEADER_LEN != num_points * num_chunks {
            return Err(Error::corrupt(format!(
                "codes file has {} code bytes, header declares {num_points}x{num_chunks}",
                data.len() - CODES_HEADER_LEN
            )));
        }
        Ok(Self {
            data,
            num_points,
            num_chunks,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// All codes, row-major with `num_chunks()` bytes per vector.
    pub fn codes(&self) -> &[u8] {
        &self.data[CODES_HEADER_LEN..]
    }

    /// Codes for the vector at `index`.
    pub fn row(&self, index: usize) -> &[u8] {
        &self.codes()[index * self.num_chunks..(index + 1) * self.num_chunks]
    }
}

impl CompressedVectors<Vec<u8>> {
    /// Wrap in-memory `codes` of `num_chunks` bytes per vector.
    pub fn from_codes(codes: &[u8], num_chunks: usize) -> Result<Self> {
        if num_chunks == 0 || codes.len() % num_chunks != 0 {
            return Err(Error::invalid_config(format!(
                "{} code bytes do not divide into {num_chunks} chunks",
                codes.len()
            )));
        }
        let mut data = Vec::with_capacity(CODES_HEADER_LEN + codes.len());
        data.extend_from_slice(&((codes.len() / num_chunks) as u32).to_le_bytes());
        data.extend_from_slice(&(num_chunks as u32).to_le_bytes());
        data.extend_from_slice(codes);
        Self::new(data)
    }

    /// Read the codes file at `path` into memory.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(std::fs::read(path)?)
    }
}

impl CompressedVectors<Mmap> {
    /// Memory map the codes file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: codes files are written once by rename and never modified in place.
        let map = unsafe { Mmap::map(&file)? };
        Self::new(map)
    }
}

impl<D: Deref<Target = [u8]>> VectorStore for CompressedVectors<D> {
    type Elem = u8;

    fn elem_stride(&self) -> usize {
        self.num_chunks
    }

    fn len(&self) -> usize {
        self.num_points
    }

    fn get(&self, index: usize) -> &[u8] {
        self.row(index)
    }
}

/// Writes a codes file block by block.
///
/// Codes are staged in a temporary file next to the destination and renamed into place by
/// [CodesWriter::finish]; dropping the writer before then leaves nothing behind.
pub struct CodesWriter {
    writer: BufWriter<NamedTempFile>,
    path: PathBuf,
    num_points: usize,
    num_chunks: usize,
    written: usize,
}

impl CodesWriter {
    /// Begin writing `num_points` vectors of `num_chunks` codes to `path`.
    pub fn create(path: impl AsRef<Path>, num_points: usize, num_chunks: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut writer = BufWriter::new(NamedTempFile::new_in(dir)?);
        writer.write_all(&(num_points as u32).to_le_bytes())?;
        writer.write_all(&(num_chunks as u32).to_le_bytes())?;
        Ok(Self {
            writer,
            path,
            num_points,
            num_chunks,
            written: 0,
        })
    }

    /// Append the row-major codes of one or more vectors.
    pub fn write_block(&mut self, codes: &[u8]) -> Result<()> {
        if codes.len() % self.num_chunks != 0 {
            return Err(Error::invalid_config(format!(
                "block of {} codes is not a multiple of {} chunks",
                codes.len(),
                self.num_chunks
            )));
        }
        self.writer.write_all(codes)?;
        self.written += codes.len() / self.num_chunks;
        Ok(())
    }

    /// Flush all codes and move the file into place.
    pub fn finish(self) -> Result<()> {
        if self.written != self.num_points {
            return Err(Error::corrupt(format!(
                "wrote {} of {} code rows",
                self.written, self.num_points
            )));
        }
        let tmp = self
            .writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// Write `codes` of `num_chunks` bytes per vector to `path`.
pub fn write_codes(path: impl AsRef<Path>, codes: &[u8], num_chunks: usize) -> Result<()> {
    if num_chunks == 0 || codes.len() % num_chunks != 0 {
        return Err(Error::invalid_config(format!(
            "{} code bytes do not divide into {num_chunks} chunks",
            codes.len()
        )));
    }
    let mut writer = CodesWriter::create(path, codes.len() / num_chunks, num_chunks)?;
    writer.write_block(codes)?;
    writer.finish()
}
