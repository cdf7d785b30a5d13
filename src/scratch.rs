//! Per-worker scratch space for scoring compressed vectors.
//!
//! A [PqScratch] is allocated once per query worker and reused for every query that worker runs;
//! nothing in the steady state query path allocates. [ScratchPool] hands out one arena per thread.

use std::{
    alloc::{self, Layout},
    cell::RefCell,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use thread_local::ThreadLocal;

use crate::{
    distance::Metric,
    input::VectorElement,
    lookup::{aggregate_coords, pq_dist_lookup},
    table::FixedChunkPqTable,
    MAX_PQ_CHUNKS, NUM_PQ_CENTROIDS,
};

/// Alignment of the lookup table, code and distance scratch.
pub const SCRATCH_ALIGNMENT: usize = 256;
/// Alignment of query buffers.
pub const QUERY_ALIGNMENT: usize = 32;

/// Round `dim` up to a multiple of 8 floats.
pub fn aligned_dim(dim: usize) -> usize {
    dim.next_multiple_of(8)
}

/// A fixed length, zero initialized heap buffer with a caller chosen alignment.
pub struct AlignedBuffer<T> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
}

impl<T: bytemuck::Zeroable> AlignedBuffer<T> {
    /// Allocate `len` zeroed values aligned to at least `align` bytes.
    ///
    /// *Panics* if `align` is not a power of two or the allocation size overflows.
    pub fn zeroed(len: usize, align: usize) -> Self {
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .expect("aligned buffer size overflow");
        let layout = Layout::from_size_align(size.max(1), align.max(std::mem::align_of::<T>()))
            .expect("valid aligned buffer layout");
        // Safety: layout has non-zero size. T is Zeroable so all zero bytes are a valid T.
        let ptr = unsafe { alloc::alloc_zeroed(layout) } as *mut T;
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, len, layout }
    }
}

impl<T> AlignedBuffer<T> {
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl<T> Deref for AlignedBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Safety: ptr holds len initialized values for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for AlignedBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // Safety: ptr holds len initialized values and self is borrowed exclusively.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        // Safety: ptr was allocated with layout in zeroed().
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) }
    }
}

// Safety: AlignedBuffer owns its allocation exclusively, like a Box<[T]>.
unsafe impl<T: Send> Send for AlignedBuffer<T> {}
unsafe impl<T: Sync> Sync for AlignedBuffer<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for AlignedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Reusable buffers for scoring one query at a time against compressed vectors.
///
/// Per query the expected sequence is [Self::set], [Self::prepare_query], then any number of
/// [Self::score_candidates] calls.
pub struct PqScratch<T: VectorElement> {
    max_degree: usize,
    dim: usize,
    aligned_query_t: AlignedBuffer<T>,
    aligned_query_float: AlignedBuffer<f32>,
    rotated_query: AlignedBuffer<f32>,
    rotation_scratch: AlignedBuffer<f32>,
    aligned_pqtable_dist_scratch: AlignedBuffer<f32>,
    aligned_pq_coord_scratch: AlignedBuffer<u8>,
    aligned_dist_scratch: AlignedBuffer<f32>,
}

impl<T: VectorElement> PqScratch<T> {
    /// Allocate scratch for scoring up to `max_degree` candidates at once with queries of at most
    /// `aligned_dim` dimensions.
    pub fn new(max_degree: usize, aligned_dim: usize) -> Self {
        Self {
            max_degree,
            dim: 0,
            aligned_query_t: AlignedBuffer::zeroed(aligned_dim, QUERY_ALIGNMENT),
            aligned_query_float: AlignedBuffer::zeroed(aligned_dim, QUERY_ALIGNMENT),
            rotated_query: AlignedBuffer::zeroed(aligned_dim, QUERY_ALIGNMENT),
            rotation_scratch: AlignedBuffer::zeroed(aligned_dim, QUERY_ALIGNMENT),
            aligned_pqtable_dist_scratch: AlignedBuffer::zeroed(
                NUM_PQ_CENTROIDS * MAX_PQ_CHUNKS,
                SCRATCH_ALIGNMENT,
            ),
            aligned_pq_coord_scratch: AlignedBuffer::zeroed(
                max_degree * MAX_PQ_CHUNKS,
                SCRATCH_ALIGNMENT,
            ),
            aligned_dist_scratch: AlignedBuffer::zeroed(max_degree, SCRATCH_ALIGNMENT),
        }
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Copy the first `dim` values of `query` into the query buffers, dividing the float copies
    /// by `norm` unless it is 1.
    ///
    /// *Panics* if `dim` exceeds the aligned dimension this scratch was created with.
    pub fn set(&mut self, dim: usize, query: &[T], norm: f32) {
        self.dim = dim;
        self.aligned_query_t[..dim].copy_from_slice(&query[..dim]);
        for ((f, r), q) in self.aligned_query_float[..dim]
            .iter_mut()
            .zip(self.rotated_query[..dim].iter_mut())
            .zip(query)
        {
            let v = if norm != 1.0 {
                q.to_f32() / norm
            } else {
                q.to_f32()
            };
            *f = v;
            *r = v;
        }
    }

    /// The raw query passed to [Self::set].
    pub fn aligned_query_t(&self) -> &[T] {
        &self.aligned_query_t[..self.dim]
    }

    /// The query as floats, normalized if requested.
    pub fn aligned_query_float(&self) -> &[f32] {
        &self.aligned_query_float[..self.dim]
    }

    /// The query as consumed by the distance table. After [Self::prepare_query] this is centered
    /// and rotated.
    pub fn rotated_query(&self) -> &[f32] {
        &self.rotated_query[..self.dim]
    }

    /// The full `[384][256]` chunk distance table.
    pub fn chunk_dists(&self) -> &[f32] {
        &self.aligned_pqtable_dist_scratch
    }

    /// Preprocess the query for `table` and fill the chunk distance table for `metric`.
    pub fn prepare_query(&mut self, table: &FixedChunkPqTable, metric: Metric) {
        table.preprocess_query_with_scratch(&mut self.rotated_query, &mut self.rotation_scratch);
        table.populate_chunk_table(
            metric,
            &self.rotated_query,
            &mut self.aligned_pqtable_dist_scratch,
        );
    }

    /// Gather the codes for `ids` from `all_codes` and score them against the prepared query.
    ///
    /// Returns one distance per id, in `ids` order.
    ///
    /// *Panics* if `ids` holds more than `max_degree()` entries.
    pub fn score_candidates(
        &mut self,
        table: &FixedChunkPqTable,
        all_codes: &[u8],
        ids: &[u32],
    ) -> &[f32] {
        assert!(
            ids.len() <= self.max_degree,
            "{} candidates exceeds max degree {}",
            ids.len(),
            self.max_degree
        );
        let n_chunks = table.num_chunks();
        let coords = &mut self.aligned_pq_coord_scratch[..ids.len() * n_chunks];
        aggregate_coords(ids, all_codes, n_chunks, coords);
        pq_dist_lookup(
            coords,
            ids.len(),
            n_chunks,
            &self.aligned_pqtable_dist_scratch,
            &mut self.aligned_dist_scratch,
        );
        &self.aligned_dist_scratch[..ids.len()]
    }
}

/// Lazily allocated per-thread [PqScratch] instances.
pub struct ScratchPool<T: VectorElement> {
    max_degree: usize,
    aligned_dim: usize,
    scratch: ThreadLocal<RefCell<PqScratch<T>>>,
}

impl<T: VectorElement> ScratchPool<T> {
    pub fn new(max_degree: usize, aligned_dim: usize) -> Self {
        Self {
            max_degree,
            aligned_dim,
            scratch: ThreadLocal::new(),
        }
    }

    /// Run `f` with this thread's scratch, allocating it on first use.
    ///
    /// *Panics* if called re-entrantly from within `f` on the same thread.
    pub fn with<R>(&self, f: impl FnOnce(&mut PqScratch<T>) -> R) -> R {
        let scratch = self
            .scratch
            .get_or(|| RefCell::new(PqScratch::new(self.max_degree, self.aligned_dim)));
        f(&mut scratch.borrow_mut())
    }
}
