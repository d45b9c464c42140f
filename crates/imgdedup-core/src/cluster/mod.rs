//! Cluster Builder: partitions embeddings into duplicate groups.
//!
//! # Algorithm
//!
//! ```text
//! snapshot ──► drop bad dimensions ──► normalize
//!          ──► NeighborBackend::linked_pairs(threshold)
//!          ──► union-find ──► components of size ≥ 2
//!          ──► representative = earliest registered, then lowest id
//! ```
//!
//! Linkage is transitive: if A~B and B~C then A, B, and C share a group even
//! when A≁C. The output is a pure function of the input vectors and
//! [`ClusterParams`]; points are sorted by asset id before linking so input
//! order never matters.

mod neighbors;
mod union_find;

pub use neighbors::{BackendKind, ExactBackend, HnswBackend, NeighborBackend};
pub use union_find::UnionFind;

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::embedding::{normalize, EmbeddingStore};
use crate::error::{DedupError, Result};
use crate::models::ClusterGroup;
use crate::store::Store;

/// Explicit inputs of one clustering pass.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Link two assets when cosine similarity is at least this value.
    pub threshold: f32,
    pub model_version: String,
    /// Expected vector length. `None` accepts the most common length in
    /// the snapshot.
    pub dims: Option<usize>,
    /// Stamped on every produced group.
    pub built_at: i64,
}

impl ClusterParams {
    pub fn new(threshold: f32, model_version: impl Into<String>) -> Self {
        Self {
            threshold,
            model_version: model_version.into(),
            dims: None,
            built_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_dims(mut self, dims: usize) -> Self {
        self.dims = Some(dims);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(DedupError::InvalidParams(format!(
                "similarity threshold must be within (0.0, 1.0], got {}",
                self.threshold
            )));
        }
        if self.model_version.is_empty() {
            return Err(DedupError::InvalidParams(
                "model version must not be empty".to_string(),
            ));
        }
        if self.dims == Some(0) {
            return Err(DedupError::InvalidParams(
                "dims must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One vector taking part in clustering.
#[derive(Debug, Clone)]
pub struct ClusterPoint {
    pub asset_id: String,
    /// Registration time of the asset, used to pick representatives.
    pub registered_at: i64,
    pub vector: Vec<f32>,
}

/// An embedding excluded from clustering because of its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedVector {
    pub asset_id: String,
    pub expected: usize,
    pub actual: usize,
}

/// A consistent snapshot of vectors to cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterInput {
    pub points: Vec<ClusterPoint>,
    /// Entries already rejected while reading the snapshot.
    pub rejected: Vec<RejectedVector>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterReport {
    pub considered: usize,
    pub rejected: usize,
    pub linked_pairs: usize,
    pub groups: usize,
    pub grouped_assets: usize,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    /// Ordered by representative (registration time, then asset id).
    pub groups: Vec<ClusterGroup>,
    pub rejected: Vec<RejectedVector>,
    pub report: ClusterReport,
}

/// Compute duplicate groups for `input`. Pure: nothing is written.
pub fn build_clusters(
    input: ClusterInput,
    params: &ClusterParams,
    backend: &dyn NeighborBackend,
) -> Result<ClusterOutcome> {
    params.validate()?;
    let started = Instant::now();

    let ClusterInput {
        mut points,
        mut rejected,
    } = input;
    points.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
    points.dedup_by(|a, b| a.asset_id == b.asset_id);

    let expected = params.dims.or_else(|| majority_dims(&points));
    if let Some(expected) = expected {
        points.retain(|p| {
            if p.vector.len() == expected {
                return true;
            }
            warn!(
                asset_id = %p.asset_id,
                expected,
                actual = p.vector.len(),
                "excluding embedding from clustering"
            );
            rejected.push(RejectedVector {
                asset_id: p.asset_id.clone(),
                expected,
                actual: p.vector.len(),
            });
            false
        });
    }

    let vectors: Vec<Vec<f32>> = points
        .iter()
        .map(|p| {
            let mut v = p.vector.clone();
            normalize(&mut v);
            v
        })
        .collect();

    let pairs = backend.linked_pairs(&vectors, params.threshold);
    let mut uf = UnionFind::new(points.len());
    for &(i, j) in &pairs {
        uf.union(i, j);
    }

    let mut groups: Vec<ClusterGroup> = uf
        .components(2)
        .into_iter()
        .map(|members| {
            let representative = members
                .iter()
                .map(|&i| &points[i])
                .min_by(|a, b| {
                    a.registered_at
                        .cmp(&b.registered_at)
                        .then_with(|| a.asset_id.cmp(&b.asset_id))
                })
                .map(|p| p.asset_id.clone())
                .unwrap_or_default();
            // Indices follow asset id order, so this is already sorted.
            let member_asset_ids: Vec<String> =
                members.iter().map(|&i| points[i].asset_id.clone()).collect();
            ClusterGroup {
                group_id: ClusterGroup::id_for_members(&member_asset_ids),
                model_version: params.model_version.clone(),
                threshold: params.threshold,
                member_asset_ids,
                representative_asset_id: representative,
                created_at: params.built_at,
            }
        })
        .collect();

    let registered: HashMap<&str, i64> = points
        .iter()
        .map(|p| (p.asset_id.as_str(), p.registered_at))
        .collect();
    groups.sort_by(|a, b| {
        let ra = registered.get(a.representative_asset_id.as_str());
        let rb = registered.get(b.representative_asset_id.as_str());
        ra.cmp(&rb)
            .then_with(|| a.representative_asset_id.cmp(&b.representative_asset_id))
    });

    let report = ClusterReport {
        considered: points.len(),
        rejected: rejected.len(),
        linked_pairs: pairs.len(),
        groups: groups.len(),
        grouped_assets: groups.iter().map(|g| g.member_asset_ids.len()).sum(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    debug!(
        backend = backend.name(),
        considered = report.considered,
        pairs = report.linked_pairs,
        groups = report.groups,
        "clusters built"
    );

    Ok(ClusterOutcome {
        groups,
        rejected,
        report,
    })
}

/// Snapshot `embeddings`, build groups, and replace the stored group set.
///
/// The declared dimension of `embeddings` overrides `params.dims`.
pub async fn rebuild<S: Store + ?Sized>(
    embeddings: &EmbeddingStore<'_, S>,
    params: &ClusterParams,
    backend: &dyn NeighborBackend,
    page_size: usize,
) -> Result<ClusterOutcome> {
    let params = ClusterParams {
        dims: Some(embeddings.dims()),
        model_version: embeddings.model_version().to_string(),
        ..params.clone()
    };
    params.validate()?;
    let input = embeddings.snapshot(page_size).await?;
    let outcome = build_clusters(input, &params, backend)?;
    embeddings.store().replace_groups(&outcome.groups).await?;
    Ok(outcome)
}

fn majority_dims(points: &[ClusterPoint]) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for p in points {
        *counts.entry(p.vector.len()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(da, ca), (db, cb)| ca.cmp(cb).then_with(|| db.cmp(da)))
        .map(|(d, _)| d)
}
