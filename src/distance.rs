//! Distance metrics and the dense f32 kernels used to build lookup tables and assign centroids.

use std::{io, str::FromStr};

use serde::{Deserialize, Serialize};

/// Metric used to compare a query against compressed vectors.
///
/// Both metrics produce values where _lower_ is a better match: inner product scores are negated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Squared euclidean distance.
    #[default]
    Euclidean,
    /// Negated inner product. Translating vectors does not preserve inner products so pivots for
    /// this metric are trained without zero-centering.
    InnerProduct,
}

impl Metric {
    /// Compute the distance between `a` and `b` under this metric.
    ///
    /// Input vectors must be the same length or this function may panic.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Euclidean => l2sq_f32(a, b),
            Self::InnerProduct => -dot_f32(a, b),
        }
    }

    /// Return true if training data should be translated to have zero mean for this metric.
    pub fn zero_mean(self) -> bool {
        self == Self::Euclidean
    }

    /// Return an iterator over all metrics.
    pub fn all() -> impl ExactSizeIterator<Item = Metric> {
        [Metric::Euclidean, Metric::InnerProduct].into_iter()
    }
}

impl FromStr for Metric {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "inner_product" | "mips" | "dot" => Ok(Metric::InnerProduct),
            x => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown metric {x}"),
            )),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Euclidean => write!(f, "l2"),
            Self::InnerProduct => write!(f, "mips"),
        }
    }
}

/// Squared l2 distance between `q` and `d`.
#[cfg(feature = "simsimd")]
#[inline(always)]
pub fn l2sq_f32(q: &[f32], d: &[f32]) -> f32 {
    assert_eq!(q.len(), d.len());
    if q.is_empty() {
        return 0.0;
    }
    simsimd::SpatialSimilarity::l2sq(q, d).expect("same dimensions") as f32
}

/// Squared l2 distance between `q` and `d`.
#[cfg(not(feature = "simsimd"))]
#[inline(always)]
pub fn l2sq_f32(q: &[f32], d: &[f32]) -> f32 {
    assert_eq!(q.len(), d.len());
    q.iter()
        .zip(d.iter())
        .map(|(q, d)| {
            let delta = q - d;
            delta * delta
        })
        .sum()
}

/// Dot product of `q` and `d`.
#[cfg(feature = "simsimd")]
#[inline(always)]
pub fn dot_f32(q: &[f32], d: &[f32]) -> f32 {
    assert_eq!(q.len(), d.len());
    if q.is_empty() {
        return 0.0;
    }
    simsimd::SpatialSimilarity::dot(q, d).expect("same dimensions") as f32
}

/// Dot product of `q` and `d`.
#[cfg(not(feature = "simsimd"))]
#[inline(always)]
pub fn dot_f32(q: &[f32], d: &[f32]) -> f32 {
    assert_eq!(q.len(), d.len());
    q.iter().zip(d.iter()).map(|(q, d)| q * d).sum()
}
