//! In-memory [`Store`] implementation for tests and embedding in other tools.
//!
//! All tables live in a single `RwLock`, so each trait call observes and
//! mutates one consistent state. That makes `replace_groups` and
//! `write_decisions` atomic with respect to each other.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Asset, AssetStatus, ClusterGroup, Decision, Embedding, ReviewDecision};

use super::{DecisionWrite, SnapshotEntry, Store};

#[derive(Default)]
struct State {
    assets: HashMap<String, Asset>,
    path_index: HashMap<String, String>,
    /// model_version -> asset_id -> embedding
    embeddings: HashMap<String, BTreeMap<String, Embedding>>,
    groups: BTreeMap<String, ClusterGroup>,
    asset_group: HashMap<String, String>,
    /// asset_id -> decision
    decisions: HashMap<String, ReviewDecision>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_asset(&self, asset: &Asset) -> Result<()> {
        let mut state = self.write()?;
        let existing_id = state.path_index.get(&asset.path).cloned();
        if let Some(existing) = existing_id.and_then(|id| state.assets.get_mut(&id)) {
            existing.signature = asset.signature.clone();
            existing.status = asset.status;
            existing.updated_at = asset.updated_at;
            existing.last_error = asset.last_error.clone();
            return Ok(());
        }
        state
            .path_index
            .insert(asset.path.clone(), asset.id.clone());
        state.assets.insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>> {
        Ok(self.read()?.assets.get(id).cloned())
    }

    async fn get_asset_by_path(&self, path: &str) -> Result<Option<Asset>> {
        let state = self.read()?;
        Ok(state
            .path_index
            .get(path)
            .and_then(|id| state.assets.get(id))
            .cloned())
    }

    async fn list_assets(&self) -> Result<Vec<Asset>> {
        let mut assets: Vec<Asset> = self.read()?.assets.values().cloned().collect();
        assets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    async fn set_asset_status(
        &self,
        id: &str,
        status: AssetStatus,
        last_error: Option<&str>,
        updated_at: i64,
    ) -> Result<bool> {
        let mut state = self.write()?;
        match state.assets.get_mut(id) {
            Some(asset) => {
                asset.status = status;
                asset.last_error = last_error.map(str::to_string);
                asset.updated_at = updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_embedding(&self, embedding: &Embedding) -> Result<()> {
        let mut state = self.write()?;
        state
            .embeddings
            .entry(embedding.model_version.clone())
            .or_default()
            .insert(embedding.asset_id.clone(), embedding.clone());
        Ok(())
    }

    async fn get_embedding(
        &self,
        asset_id: &str,
        model_version: &str,
    ) -> Result<Option<Embedding>> {
        Ok(self
            .read()?
            .embeddings
            .get(model_version)
            .and_then(|m| m.get(asset_id))
            .cloned())
    }

    async fn embedding_page(
        &self,
        model_version: &str,
        after_asset_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Embedding>> {
        let state = self.read()?;
        let Some(by_asset) = state.embeddings.get(model_version) else {
            return Ok(Vec::new());
        };
        let lower = match after_asset_id {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        Ok(by_asset
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn active_embeddings(
        &self,
        model_version: &str,
        _page_size: usize,
    ) -> Result<Vec<SnapshotEntry>> {
        let state = self.read()?;
        let Some(by_asset) = state.embeddings.get(model_version) else {
            return Ok(Vec::new());
        };
        Ok(by_asset
            .values()
            .filter_map(|e| {
                let asset = state.assets.get(&e.asset_id)?;
                (asset.status == AssetStatus::Active).then(|| SnapshotEntry {
                    embedding: e.clone(),
                    registered_at: asset.created_at,
                })
            })
            .collect())
    }

    async fn count_embeddings(&self, model_version: Option<&str>) -> Result<usize> {
        let state = self.read()?;
        Ok(match model_version {
            Some(m) => state.embeddings.get(m).map(|e| e.len()).unwrap_or(0),
            None => state.embeddings.values().map(|e| e.len()).sum(),
        })
    }

    async fn replace_groups(&self, groups: &[ClusterGroup]) -> Result<()> {
        let mut state = self.write()?;
        state.groups = groups
            .iter()
            .map(|g| (g.group_id.clone(), g.clone()))
            .collect();
        state.asset_group = groups
            .iter()
            .flat_map(|g| {
                g.member_asset_ids
                    .iter()
                    .map(move |m| (m.clone(), g.group_id.clone()))
            })
            .collect();
        let State {
            groups, decisions, ..
        } = &mut *state;
        decisions.retain(|_, d| groups.contains_key(&d.group_id));
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<ClusterGroup>> {
        Ok(self.read()?.groups.values().cloned().collect())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<ClusterGroup>> {
        Ok(self.read()?.groups.get(group_id).cloned())
    }

    async fn group_for_asset(&self, asset_id: &str) -> Result<Option<ClusterGroup>> {
        let state = self.read()?;
        Ok(state
            .asset_group
            .get(asset_id)
            .and_then(|gid| state.groups.get(gid))
            .cloned())
    }

    async fn get_decisions(&self, group_id: &str) -> Result<Vec<ReviewDecision>> {
        let state = self.read()?;
        let mut out: Vec<ReviewDecision> = state
            .decisions
            .values()
            .filter(|d| d.group_id == group_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        Ok(out)
    }

    async fn write_decisions(
        &self,
        group_id: &str,
        expected: &[ReviewDecision],
        decisions: &[ReviewDecision],
    ) -> Result<DecisionWrite> {
        let mut state = self.write()?;
        let Some(group) = state.groups.get(group_id) else {
            return Ok(DecisionWrite::GroupGone);
        };
        if let Some(stray) = decisions
            .iter()
            .find(|d| d.group_id != group_id || !group.contains(&d.asset_id))
        {
            return Err(anyhow!(
                "decision for asset {} does not belong to group {}",
                stray.asset_id,
                group_id
            ));
        }
        let mut current: Vec<&ReviewDecision> = state
            .decisions
            .values()
            .filter(|d| d.group_id == group_id)
            .collect();
        current.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        let mut wanted: Vec<&ReviewDecision> = expected.iter().collect();
        wanted.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        if current != wanted {
            return Ok(DecisionWrite::Conflict);
        }
        for d in decisions {
            state.decisions.insert(d.asset_id.clone(), d.clone());
        }
        Ok(DecisionWrite::Written)
    }

    async fn clear_decisions(&self, group_id: Option<&str>) -> Result<usize> {
        let mut state = self.write()?;
        let before = state.decisions.len();
        match group_id {
            Some(gid) => state.decisions.retain(|_, d| d.group_id != gid),
            None => state.decisions.clear(),
        }
        Ok(before - state.decisions.len())
    }

    async fn clear_asset_decision(&self, asset_id: &str) -> Result<()> {
        self.write()?.decisions.remove(asset_id);
        Ok(())
    }

    async fn list_decisions(&self, decision: Option<Decision>) -> Result<Vec<ReviewDecision>> {
        let state = self.read()?;
        let mut out: Vec<ReviewDecision> = state
            .decisions
            .values()
            .filter(|d| decision.map_or(true, |want| d.decision == want))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.group_id
                .cmp(&b.group_id)
                .then_with(|| a.asset_id.cmp(&b.asset_id))
        });
        Ok(out)
    }
}
