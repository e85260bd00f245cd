//! Visual clustering behind a swappable capability
//!
//! The event segmenter only needs "split these vectors into dense groups and
//! leave the outliers alone". [`Clusterer`] is that contract; the concrete
//! algorithm is [`DensityClusterer`], a DBSCAN pass over cosine distance.
//!
//! Density clustering takes a minimum cluster size instead of a cluster count,
//! since the number of sub-events inside one segment is not known up front.
//! Points that are not density-reachable from a core point go to the noise
//! bucket rather than to their nearest cluster.
//!
//! When no neighbourhood radius is configured, it is estimated from the data:
//! the median distance from each point to its `min_size - 1`-th nearest
//! neighbour.
//!
//! Pairwise distances are never stored; neighbourhoods are recomputed on
//! demand across the rayon pool, which keeps memory linear in the segment
//! size.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Smallest radius ever used, so identical vectors still count as neighbours
const MIN_EPSILON: f32 = 1e-6;

/// Result of a clustering pass: indices into the input slice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Clusters in discovery order, each with ascending indices
    pub clusters: Vec<Vec<usize>>,
    /// Points assigned to no cluster, ascending
    pub noise: Vec<usize>,
}

impl Partition {
    /// Everything in the noise bucket
    pub fn all_noise(n: usize) -> Self {
        Self {
            clusters: Vec::new(),
            noise: (0..n).collect(),
        }
    }

    /// Total number of points covered
    pub fn len(&self) -> usize {
        self.clusters.iter().map(Vec::len).sum::<usize>() + self.noise.len()
    }

    /// Whether the partition covers no points
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits feature vectors into dense clusters plus a noise bucket
///
/// Implementations must return every input index exactly once and must not
/// return a cluster smaller than `min_size`. All vectors passed in share one
/// dimension.
pub trait Clusterer: Send + Sync + std::fmt::Debug {
    /// Partition `vectors`
    fn cluster(&self, vectors: &[&[f32]], min_size: usize) -> Partition;
}

/// DBSCAN over cosine distance
#[derive(Debug, Clone, Default)]
pub struct DensityClusterer {
    epsilon: Option<f32>,
}

impl DensityClusterer {
    /// Clusterer with an estimated radius
    pub fn new() -> Self {
        Self::default()
    }

    /// Clusterer with a fixed neighbourhood radius in cosine distance
    pub fn with_epsilon(epsilon: f32) -> Self {
        Self {
            epsilon: Some(epsilon),
        }
    }

    /// Clusterer with an optional radius (estimated when `None`)
    pub fn from_option(epsilon: Option<f32>) -> Self {
        Self { epsilon }
    }
}

impl Clusterer for DensityClusterer {
    fn cluster(&self, vectors: &[&[f32]], min_size: usize) -> Partition {
        let n = vectors.len();
        let min_size = min_size.max(2);
        if n < min_size {
            return Partition::all_noise(n);
        }

        let unit: Vec<Vec<f32>> = vectors.iter().map(|v| normalize(v)).collect();
        let epsilon = self
            .epsilon
            .unwrap_or_else(|| estimate_epsilon(&unit, min_size))
            .max(MIN_EPSILON);
        trace!("Density clustering {} vectors with epsilon {:.4}", n, epsilon);

        let is_core: Vec<bool> = (0..n)
            .into_par_iter()
            .map(|i| {
                (0..n)
                    .filter(|&j| cosine_distance(&unit[i], &unit[j]) <= epsilon)
                    .take(min_size)
                    .count()
                    >= min_size
            })
            .collect();

        let mut labels: Vec<Option<usize>> = vec![None; n];
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for seed in 0..n {
            if labels[seed].is_some() || !is_core[seed] {
                continue;
            }
            let id = clusters.len();
            let mut members = Vec::new();
            let mut frontier = vec![seed];
            labels[seed] = Some(id);
            while let Some(point) = frontier.pop() {
                members.push(point);
                if !is_core[point] {
                    continue;
                }
                for next in region_query(&unit, point, epsilon) {
                    if labels[next].is_none() {
                        labels[next] = Some(id);
                        frontier.push(next);
                    }
                }
            }
            members.sort_unstable();
            clusters.push(members);
        }

        let mut partition = Partition::default();
        for members in clusters {
            if members.len() >= min_size {
                partition.clusters.push(members);
            } else {
                partition.noise.extend(members);
            }
        }
        partition
            .noise
            .extend((0..n).filter(|&i| labels[i].is_none()));
        partition.noise.sort_unstable();

        debug!(
            "Density clustering produced {} clusters and {} outliers",
            partition.clusters.len(),
            partition.noise.len()
        );
        partition
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        vec![0.0; v.len()]
    }
}

/// Cosine distance between two unit vectors, in `[0, 2]`
///
/// A zero vector is at distance 1 from everything, itself included.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let zero = |v: &[f32]| v.iter().all(|x| *x == 0.0);
    if zero(a) || zero(b) {
        return 1.0;
    }
    (1.0 - dot).clamp(0.0, 2.0)
}

/// Indices within `epsilon` of `point`, ascending
///
/// Distances are computed on demand so memory stays linear in the number of
/// vectors.
fn region_query(unit: &[Vec<f32>], point: usize, epsilon: f32) -> Vec<usize> {
    (0..unit.len())
        .into_par_iter()
        .filter(|&j| cosine_distance(&unit[point], &unit[j]) <= epsilon)
        .collect()
}

/// Median distance to the `(min_size - 1)`-th nearest other point
fn estimate_epsilon(unit: &[Vec<f32>], min_size: usize) -> f32 {
    let k = min_size - 1;
    let mut kth: Vec<f32> = (0..unit.len())
        .into_par_iter()
        .map(|i| {
            let mut others: Vec<f32> = (0..unit.len())
                .filter(|&j| j != i)
                .map(|j| cosine_distance(&unit[i], &unit[j]))
                .collect();
            if others.len() < k {
                return f32::MAX;
            }
            *others.select_nth_unstable_by(k - 1, f32::total_cmp).1
        })
        .collect();
    kth.sort_unstable_by(f32::total_cmp);
    kth[kth.len() / 2]
}
