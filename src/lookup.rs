//! Kernels for scoring batches of compressed vectors against a per-query lookup table.

use crate::NUM_PQ_CENTROIDS;

/// Gather the `ndims` wide rows of `all_coords` named by `ids` into `out`, in `ids` order.
///
/// Repeated ids produce repeated rows.
pub fn aggregate_coords(ids: &[u32], all_coords: &[u8], ndims: usize, out: &mut [u8]) {
    for (id, row) in ids.iter().zip(out.chunks_exact_mut(ndims)) {
        let start = *id as usize * ndims;
        row.copy_from_slice(&all_coords[start..start + ndims]);
    }
}

/// Sum per-chunk lookup table entries for `n_pts` gathered codes into `dists_out`.
///
/// `pq_ids` holds `n_pts` rows of `n_chunks` codes and `table` holds `n_chunks` rows of 256
/// entries. The first `n_pts` entries of `dists_out` are overwritten.
pub fn pq_dist_lookup(
    pq_ids: &[u8],
    n_pts: usize,
    n_chunks: usize,
    table: &[f32],
    dists_out: &mut [f32],
) {
    let dists_out = &mut dists_out[..n_pts];
    dists_out.fill(0.0);
    let pq_ids = &pq_ids[..n_pts * n_chunks];
    // Chunk-outer, point-inner: one table row is live at a time.
    for (chunk, chunk_dists) in table.chunks_exact(NUM_PQ_CENTROIDS).take(n_chunks).enumerate() {
        for (d, codes) in dists_out.iter_mut().zip(pq_ids.chunks_exact(n_chunks)) {
            *d += chunk_dists[codes[chunk] as usize];
        }
    }
}

/// Like [pq_dist_lookup] but returns a new vector of distances.
pub fn pq_dist_lookup_vec(pq_ids: &[u8], n_pts: usize, n_chunks: usize, table: &[f32]) -> Vec<f32> {
    let mut dists = vec![0.0; n_pts];
    pq_dist_lookup(pq_ids, n_pts, n_chunks, table, &mut dists);
    dists
}
