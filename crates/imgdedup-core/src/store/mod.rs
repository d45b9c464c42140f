//! Storage abstraction for imgdedup.
//!
//! The [`Store`] trait covers every persistence operation the core needs:
//! keyed upsert/lookup for assets, embeddings, groups, and decisions, a
//! paged bulk read of embeddings, and two atomic multi-record writes
//! ([`Store::replace_groups`] and [`Store::write_decisions`]). Those two are
//! the lock boundary between cluster rebuilds and review passes.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Asset, AssetStatus, ClusterGroup, Decision, Embedding, ReviewDecision};

/// Outcome of [`Store::write_decisions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionWrite {
    Written,
    /// The group no longer exists. Nothing was written.
    GroupGone,
    /// The group's stored decisions differ from the expected set.
    /// Nothing was written.
    Conflict,
}

/// An embedding together with its asset's registration time.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry {
    pub embedding: Embedding,
    pub registered_at: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_asset`](Store::upsert_asset) | Insert an asset, or update the one already on that path |
/// | [`set_asset_status`](Store::set_asset_status) | Update status + last error of one asset |
/// | [`put_embedding`](Store::put_embedding) | Replace the vector for (asset, model) |
/// | [`embedding_page`](Store::embedding_page) | Keyset-paged bulk read ordered by asset id |
/// | [`active_embeddings`](Store::active_embeddings) | Consistent read of every active asset's vector |
/// | [`replace_groups`](Store::replace_groups) | Swap the whole group set atomically |
/// | [`write_decisions`](Store::write_decisions) | Compare-and-set decisions for one live group |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert an asset, keyed by `path`.
    ///
    /// If an asset already occupies the path, its signature, status,
    /// `updated_at`, and `last_error` are overwritten in one step while its
    /// `id` and `created_at` are preserved.
    async fn upsert_asset(&self, asset: &Asset) -> Result<()>;

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>>;

    async fn get_asset_by_path(&self, path: &str) -> Result<Option<Asset>>;

    /// All assets ordered by registration time, then id.
    async fn list_assets(&self) -> Result<Vec<Asset>>;

    /// Returns `false` if no asset has this id.
    async fn set_asset_status(
        &self,
        id: &str,
        status: AssetStatus,
        last_error: Option<&str>,
        updated_at: i64,
    ) -> Result<bool>;

    /// Insert or overwrite the embedding for `(asset_id, model_version)`.
    async fn put_embedding(&self, embedding: &Embedding) -> Result<()>;

    async fn get_embedding(&self, asset_id: &str, model_version: &str)
        -> Result<Option<Embedding>>;

    /// Up to `limit` embeddings of `model_version` with asset id strictly
    /// greater than `after_asset_id`, ordered by asset id.
    async fn embedding_page(
        &self,
        model_version: &str,
        after_asset_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Embedding>>;

    /// Embeddings of `model_version` for every active asset, ordered by
    /// asset id, all read from one point-in-time view of the store.
    ///
    /// `page_size` bounds how many rows a backend fetches per round trip;
    /// paging never splits the view.
    async fn active_embeddings(
        &self,
        model_version: &str,
        page_size: usize,
    ) -> Result<Vec<SnapshotEntry>>;

    /// Count embeddings, optionally restricted to one model version.
    async fn count_embeddings(&self, model_version: Option<&str>) -> Result<usize>;

    /// Replace the entire group set in one atomic step.
    ///
    /// Decisions whose group id is absent from `groups` are dropped in the
    /// same step; decisions for a group id that survives are kept.
    async fn replace_groups(&self, groups: &[ClusterGroup]) -> Result<()>;

    /// All groups ordered by group id.
    async fn list_groups(&self) -> Result<Vec<ClusterGroup>>;

    async fn get_group(&self, group_id: &str) -> Result<Option<ClusterGroup>>;

    async fn group_for_asset(&self, asset_id: &str) -> Result<Option<ClusterGroup>>;

    /// Stored decisions for a group. Members without a row are pending.
    async fn get_decisions(&self, group_id: &str) -> Result<Vec<ReviewDecision>>;

    /// Upsert decisions for one group atomically, provided the group's
    /// stored decisions still equal `expected` (in any order).
    ///
    /// The existence check, the comparison, and the write happen as one
    /// step, so two callers that read the same state cannot both commit.
    async fn write_decisions(
        &self,
        group_id: &str,
        expected: &[ReviewDecision],
        decisions: &[ReviewDecision],
    ) -> Result<DecisionWrite>;

    /// Remove decisions for one group, or for every group when `None`.
    /// Returns the number of rows removed.
    async fn clear_decisions(&self, group_id: Option<&str>) -> Result<usize>;

    /// Remove any decision recorded for one asset.
    async fn clear_asset_decision(&self, asset_id: &str) -> Result<()>;

    /// Decisions across all groups, optionally filtered by value,
    /// ordered by group id then asset id.
    async fn list_decisions(&self, decision: Option<Decision>) -> Result<Vec<ReviewDecision>>;
}
