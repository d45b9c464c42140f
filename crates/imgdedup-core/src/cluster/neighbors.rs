//! Neighbor discovery backends for the cluster builder.
//!
//! A backend only answers "which pairs of vectors are at or above the
//! threshold". Connected components are computed the same way regardless of
//! which backend found the links.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use instant_distance::{Builder, HnswMap, Point, Search};
use serde::{Deserialize, Serialize};

use crate::embedding::links_at;

/// Finds similarity links between unit vectors.
pub trait NeighborBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every pair `(i, j)` with `i < j` for which [`links_at`] holds at
    /// `threshold`, in ascending order. `vectors` are unit length or zero.
    fn linked_pairs(&self, vectors: &[Vec<f32>], threshold: f32) -> Vec<(usize, usize)>;
}

/// Selectable backend, as named in config files and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Exact,
    Hnsw,
}

impl BackendKind {
    /// Instantiate the backend. `candidates` is only used by HNSW.
    pub fn build(self, candidates: usize) -> Box<dyn NeighborBackend> {
        match self {
            BackendKind::Exact => Box::new(ExactBackend),
            BackendKind::Hnsw => Box::new(HnswBackend::new(candidates)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Exact => "exact",
            BackendKind::Hnsw => "hnsw",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(BackendKind::Exact),
            "hnsw" => Ok(BackendKind::Hnsw),
            other => Err(format!(
                "unknown backend: '{}'. Must be exact or hnsw.",
                other
            )),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Brute force over all pairs. O(n²), exact.
pub struct ExactBackend;

impl NeighborBackend for ExactBackend {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn linked_pairs(&self, vectors: &[Vec<f32>], threshold: f32) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for i in 0..vectors.len() {
            for j in (i + 1)..vectors.len() {
                if links_at(&vectors[i], &vectors[j], threshold) {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }
}

#[derive(Clone)]
struct UnitVector(Vec<f32>);

impl Point for UnitVector {
    fn distance(&self, other: &Self) -> f32 {
        1.0 - dot(&self.0, &other.0)
    }
}

/// Approximate backend over an HNSW graph.
///
/// Each vector is queried for its `candidates` nearest points; a candidate
/// becomes a link only if its exact similarity clears the threshold. The
/// graph is built with a fixed seed so repeated runs find the same links.
pub struct HnswBackend {
    candidates: usize,
    seed: u64,
}

impl HnswBackend {
    pub fn new(candidates: usize) -> Self {
        Self {
            candidates: candidates.max(1),
            seed: 0x5eed_d3d0,
        }
    }
}

impl NeighborBackend for HnswBackend {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn linked_pairs(&self, vectors: &[Vec<f32>], threshold: f32) -> Vec<(usize, usize)> {
        if vectors.len() < 2 {
            return Vec::new();
        }
        let points: Vec<UnitVector> = vectors.iter().cloned().map(UnitVector).collect();
        let values: Vec<usize> = (0..vectors.len()).collect();
        let map: HnswMap<UnitVector, usize> = Builder::default()
            .seed(self.seed)
            .ef_search(self.candidates.max(100))
            .build(points, values);

        let mut pairs = BTreeSet::new();
        let mut search = Search::default();
        for (i, v) in vectors.iter().enumerate() {
            let query = UnitVector(v.clone());
            for item in map.search(&query, &mut search).take(self.candidates + 1) {
                let j = *item.value;
                if j == i {
                    continue;
                }
                if links_at(v, &vectors[j], threshold) {
                    pairs.insert((i.min(j), i.max(j)));
                }
            }
        }
        pairs.into_iter().collect()
    }
}
