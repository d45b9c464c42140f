//! Review State Machine: turns duplicate groups into keep/delete decisions.
//!
//! Every member of a group moves `pending → keep` or `pending → delete`.
//! A group is *resolved* once no member is pending, and *flagged* when it
//! is resolved with a keep count other than one (an operator exception).
//!
//! All writes for one operation go through a single
//! [`Store::write_decisions`] call, which refuses to write if a cluster
//! rebuild has replaced the group in the meantime ([`DedupError::StaleGroup`])
//! or if another review changed the group's decisions since they were read
//! ([`DedupError::Conflict`]). The keep rule is therefore checked against
//! exactly the state the write lands on.
//! Operations that would break the one-keep rule without an explicit
//! override fail with [`DedupError::InvalidResolution`] before anything is
//! written.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DedupError, Result};
use crate::models::{ClusterGroup, Decision, DeletionCandidate, ReviewDecision};
use crate::store::{DecisionWrite, Store};

/// Which member survives [`ReviewMachine::resolve_keep_one`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Representative,
    Asset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Unresolved,
    Resolved,
    Flagged,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Unresolved => "unresolved",
            ReviewState::Resolved => "resolved",
            ReviewState::Flagged => "flagged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberDecision {
    pub asset_id: String,
    pub decision: Decision,
    pub exception: bool,
}

/// A group together with the current decision of every member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReview {
    pub group: ClusterGroup,
    /// One entry per member, in member order.
    pub members: Vec<MemberDecision>,
    pub state: ReviewState,
    pub keeps: usize,
    pub deletes: usize,
    pub pending: usize,
}

impl GroupReview {
    fn new(group: ClusterGroup, stored: &HashMap<String, ReviewDecision>) -> Self {
        let members: Vec<MemberDecision> = group
            .member_asset_ids
            .iter()
            .map(|id| match stored.get(id) {
                Some(d) => MemberDecision {
                    asset_id: id.clone(),
                    decision: d.decision,
                    exception: d.exception,
                },
                None => MemberDecision {
                    asset_id: id.clone(),
                    decision: Decision::Pending,
                    exception: false,
                },
            })
            .collect();
        let (keeps, deletes, pending) = tally(members.iter().map(|m| m.decision));
        let state = if pending > 0 {
            ReviewState::Unresolved
        } else if keeps == 1 {
            ReviewState::Resolved
        } else {
            ReviewState::Flagged
        };
        Self {
            group,
            members,
            state,
            keeps,
            deletes,
            pending,
        }
    }
}

fn tally(decisions: impl Iterator<Item = Decision>) -> (usize, usize, usize) {
    decisions.fold((0, 0, 0), |(k, d, p), dec| match dec {
        Decision::Keep => (k + 1, d, p),
        Decision::Delete => (k, d + 1, p),
        Decision::Pending => (k, d, p + 1),
    })
}

/// Keep count is valid when at most one member is kept, and a fully
/// decided group keeps exactly one.
fn breaks_keep_rule(decisions: impl Iterator<Item = Decision>) -> Option<String> {
    let (keeps, _, pending) = tally(decisions);
    if keeps > 1 {
        return Some(format!("{} members would be kept", keeps));
    }
    if keeps == 0 && pending == 0 {
        return Some("every member would be deleted".to_string());
    }
    None
}

pub struct ReviewMachine<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> ReviewMachine<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    async fn load(&self, group_id: &str) -> Result<(ClusterGroup, HashMap<String, ReviewDecision>)> {
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or_else(|| DedupError::UnknownGroup(group_id.to_string()))?;
        let stored = self
            .store
            .get_decisions(group_id)
            .await?
            .into_iter()
            .map(|d| (d.asset_id.clone(), d))
            .collect();
        Ok((group, stored))
    }

    /// Write `writes`, provided the group still holds the `stored`
    /// decisions returned by [`load`](Self::load).
    async fn commit(
        &self,
        group_id: &str,
        stored: &HashMap<String, ReviewDecision>,
        writes: &[ReviewDecision],
    ) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let expected: Vec<ReviewDecision> = stored.values().cloned().collect();
        match self
            .store
            .write_decisions(group_id, &expected, writes)
            .await?
        {
            DecisionWrite::Written => {
                debug!(group_id, written = writes.len(), "decisions written");
                Ok(())
            }
            DecisionWrite::GroupGone => Err(DedupError::StaleGroup(group_id.to_string())),
            DecisionWrite::Conflict => {
                warn!(group_id, "decisions changed concurrently; nothing written");
                Err(DedupError::Conflict(group_id.to_string()))
            }
        }
    }

    pub async fn status(&self, group_id: &str) -> Result<GroupReview> {
        let (group, stored) = self.load(group_id).await?;
        Ok(GroupReview::new(group, &stored))
    }

    /// Every group with its review state, ordered by group id.
    pub async fn list(&self) -> Result<Vec<GroupReview>> {
        let mut out = Vec::new();
        for group in self.store.list_groups().await? {
            let stored = self
                .store
                .get_decisions(&group.group_id)
                .await?
                .into_iter()
                .map(|d| (d.asset_id.clone(), d))
                .collect();
            out.push(GroupReview::new(group, &stored));
        }
        Ok(out)
    }

    /// Groups with at least one pending member.
    pub async fn unresolved_groups(&self) -> Result<Vec<GroupReview>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|g| g.state == ReviewState::Unresolved)
            .collect())
    }

    /// Keep one member and delete the rest.
    ///
    /// Members that already carry a decision keep it unless
    /// `override_existing` is set. Decisions that already match are not
    /// rewritten, so repeating a call changes nothing.
    pub async fn resolve_keep_one(
        &self,
        group_id: &str,
        selection: Selection,
        override_existing: bool,
    ) -> Result<GroupReview> {
        let (group, mut stored) = self.load(group_id).await?;
        let keep_id = match selection {
            Selection::Representative => group.representative_asset_id.clone(),
            Selection::Asset(id) => {
                if !group.contains(&id) {
                    return Err(DedupError::InvalidResolution(format!(
                        "asset {} is not a member of group {}",
                        id, group_id
                    )));
                }
                id
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut writes = Vec::new();
        for member in &group.member_asset_ids {
            let target = if *member == keep_id {
                Decision::Keep
            } else {
                Decision::Delete
            };
            if let Some(existing) = stored.get(member) {
                let decided = existing.decision != Decision::Pending;
                if decided && !override_existing {
                    if target == Decision::Keep && existing.decision != Decision::Keep {
                        return Err(DedupError::InvalidResolution(format!(
                            "asset {} is already marked {}; pass override to keep it",
                            member, existing.decision
                        )));
                    }
                    continue;
                }
                if existing.decision == target && !existing.exception {
                    continue;
                }
            }
            writes.push(ReviewDecision {
                asset_id: member.clone(),
                group_id: group_id.to_string(),
                decision: target,
                exception: false,
                decided_at: now,
            });
        }

        let result = group.member_asset_ids.iter().map(|m| {
            writes
                .iter()
                .find(|w| w.asset_id == *m)
                .or_else(|| stored.get(m))
                .map_or(Decision::Pending, |d| d.decision)
        });
        if let Some(problem) = breaks_keep_rule(result) {
            return Err(DedupError::InvalidResolution(format!(
                "group {}: {}; pass override to replace existing decisions",
                group_id, problem
            )));
        }

        self.commit(group_id, &stored, &writes).await?;
        for w in writes {
            stored.insert(w.asset_id.clone(), w);
        }
        Ok(GroupReview::new(group, &stored))
    }

    /// Set one asset's decision by hand.
    ///
    /// A result with several keeps, or with every member decided and none
    /// kept, is refused unless `allow_exception` is set; the decision is then
    /// stored as an acknowledged exception.
    pub async fn override_decision(
        &self,
        asset_id: &str,
        decision: Decision,
        allow_exception: bool,
    ) -> Result<GroupReview> {
        let group = self
            .store
            .group_for_asset(asset_id)
            .await?
            .ok_or_else(|| DedupError::UnknownAsset(asset_id.to_string()))?;
        let group_id = group.group_id.clone();
        let (group, mut stored) = self.load(&group_id).await?;

        let result = group.member_asset_ids.iter().map(|m| {
            if m == asset_id {
                decision
            } else {
                stored.get(m).map_or(Decision::Pending, |d| d.decision)
            }
        });
        let exception = match breaks_keep_rule(result) {
            Some(_) if allow_exception => true,
            Some(problem) => {
                return Err(DedupError::InvalidResolution(format!(
                    "group {}: {}; pass allow-exception to record it anyway",
                    group_id, problem
                )))
            }
            None => false,
        };

        let now = chrono::Utc::now().timestamp();
        let mut writes = vec![ReviewDecision {
            asset_id: asset_id.to_string(),
            group_id: group_id.clone(),
            decision,
            exception,
            decided_at: now,
        }];
        if !exception {
            // The group is valid again, so earlier exception flags no
            // longer describe it.
            writes.extend(
                group
                    .member_asset_ids
                    .iter()
                    .filter(|m| m.as_str() != asset_id)
                    .filter_map(|m| stored.get(m))
                    .filter(|d| d.exception)
                    .map(|d| ReviewDecision {
                        exception: false,
                        decided_at: now,
                        ..d.clone()
                    }),
            );
        }
        self.commit(&group_id, &stored, &writes).await?;
        for w in writes {
            stored.insert(w.asset_id.clone(), w);
        }
        Ok(GroupReview::new(group, &stored))
    }

    /// Mark the group reviewed without deleting anything.
    pub async fn ignore_group(&self, group_id: &str) -> Result<GroupReview> {
        self.decide_all(group_id, Decision::Keep).await
    }

    /// Mark every member for deletion.
    pub async fn delete_all(&self, group_id: &str) -> Result<GroupReview> {
        self.decide_all(group_id, Decision::Delete).await
    }

    async fn decide_all(&self, group_id: &str, decision: Decision) -> Result<GroupReview> {
        let (group, mut stored) = self.load(group_id).await?;
        let now = chrono::Utc::now().timestamp();
        let writes: Vec<ReviewDecision> = group
            .member_asset_ids
            .iter()
            .filter(|m| {
                stored
                    .get(*m)
                    .map_or(true, |d| d.decision != decision || !d.exception)
            })
            .map(|m| ReviewDecision {
                asset_id: m.clone(),
                group_id: group_id.to_string(),
                decision,
                exception: true,
                decided_at: now,
            })
            .collect();
        self.commit(group_id, &stored, &writes).await?;
        for w in writes {
            stored.insert(w.asset_id.clone(), w);
        }
        Ok(GroupReview::new(group, &stored))
    }

    /// Return every member of one group to pending.
    pub async fn reset_group(&self, group_id: &str) -> Result<usize> {
        if self.store.get_group(group_id).await?.is_none() {
            return Err(DedupError::UnknownGroup(group_id.to_string()));
        }
        Ok(self.store.clear_decisions(Some(group_id)).await?)
    }

    /// Return every member of every group to pending.
    pub async fn reset_all(&self) -> Result<usize> {
        Ok(self.store.clear_decisions(None).await?)
    }

    /// All `delete` decisions joined with the asset path.
    pub async fn deletion_plan(&self) -> Result<Vec<DeletionCandidate>> {
        let mut plan = Vec::new();
        for d in self.store.list_decisions(Some(Decision::Delete)).await? {
            match self.store.get_asset(&d.asset_id).await? {
                Some(asset) => plan.push(DeletionCandidate {
                    asset_id: d.asset_id,
                    group_id: d.group_id,
                    path: asset.path,
                    exception: d.exception,
                }),
                None => warn!(asset_id = %d.asset_id, "delete decision for unknown asset"),
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Asset, AssetStatus, ContentSignature};
    use crate::store::memory::InMemoryStore;

    async fn setup(members: &[&str]) -> (InMemoryStore, String) {
        let store = InMemoryStore::new();
        for (i, id) in members.iter().enumerate() {
            store
                .upsert_asset(&Asset {
                    id: id.to_string(),
                    path: format!("/img/{}.jpg", id),
                    signature: ContentSignature {
                        size_bytes: 1,
                        mtime_ns: 1,
                        sha256: "00".to_string(),
                    },
                    status: AssetStatus::Active,
                    created_at: i as i64,
                    updated_at: i as i64,
                    last_error: None,
                })
                .await
                .unwrap();
        }
        let ids: Vec<String> = members.iter().map(|s| s.to_string()).collect();
        let group = ClusterGroup {
            group_id: ClusterGroup::id_for_members(&ids),
            model_version: "m1".to_string(),
            threshold: 0.92,
            member_asset_ids: ids,
            representative_asset_id: members[0].to_string(),
            created_at: 0,
        };
        let gid = group.group_id.clone();
        store.replace_groups(&[group]).await.unwrap();
        (store, gid)
    }

    fn decisions(review: &GroupReview) -> Vec<(&str, Decision)> {
        review
            .members
            .iter()
            .map(|m| (m.asset_id.as_str(), m.decision))
            .collect()
    }

    #[tokio::test]
    async fn keep_representative_deletes_the_rest() {
        let (store, gid) = setup(&["A", "B", "C"]).await;
        let review = ReviewMachine::new(&store);
        assert_eq!(review.status(&gid).await.unwrap().state, ReviewState::Unresolved);

        let out = review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap();
        assert_eq!(
            decisions(&out),
            vec![
                ("A", Decision::Keep),
                ("B", Decision::Delete),
                ("C", Decision::Delete)
            ]
        );
        assert_eq!(out.state, ReviewState::Resolved);
        assert!(review.unresolved_groups().await.unwrap().is_empty());

        let plan = review.deletion_plan().await.unwrap();
        let paths: Vec<_> = plan.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["/img/B.jpg", "/img/C.jpg"]);
    }

    #[tokio::test]
    async fn repeated_resolution_is_idempotent() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap();
        let before = store.get_decisions(&gid).await.unwrap();
        let again = review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap();
        assert_eq!(store.get_decisions(&gid).await.unwrap(), before);
        assert_eq!(again.state, ReviewState::Resolved);
    }

    #[tokio::test]
    async fn conflicting_resolution_needs_override_and_leaves_state() {
        let (store, gid) = setup(&["A", "B", "C"]).await;
        let review = ReviewMachine::new(&store);
        review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap();
        let before = store.get_decisions(&gid).await.unwrap();

        // B is already decided; without override it cannot be flipped.
        let err = review
            .resolve_keep_one(&gid, Selection::Asset("B".to_string()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::InvalidResolution(_)));
        assert_eq!(store.get_decisions(&gid).await.unwrap(), before);

        let out = review
            .resolve_keep_one(&gid, Selection::Asset("B".to_string()), true)
            .await
            .unwrap();
        assert_eq!(
            decisions(&out),
            vec![
                ("A", Decision::Delete),
                ("B", Decision::Keep),
                ("C", Decision::Delete)
            ]
        );
    }

    #[tokio::test]
    async fn existing_keep_blocks_a_second_keep() {
        let (store, gid) = setup(&["A", "B", "C"]).await;
        let review = ReviewMachine::new(&store);
        review
            .override_decision("B", Decision::Keep, false)
            .await
            .unwrap();

        let err = review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::InvalidResolution(_)));
        assert_eq!(review.status(&gid).await.unwrap().pending, 2);

        let out = review
            .resolve_keep_one(&gid, Selection::Representative, true)
            .await
            .unwrap();
        assert_eq!(out.keeps, 1);
        assert_eq!(out.state, ReviewState::Resolved);
    }

    #[tokio::test]
    async fn selection_must_be_a_member() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        let err = review
            .resolve_keep_one(&gid, Selection::Asset("Z".to_string()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::InvalidResolution(_)));
        assert!(matches!(
            review.status("g-nope").await.unwrap_err(),
            DedupError::UnknownGroup(_)
        ));
    }

    #[tokio::test]
    async fn second_keep_requires_exception() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap();

        let err = review
            .override_decision("B", Decision::Keep, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::InvalidResolution(_)));

        let out = review
            .override_decision("B", Decision::Keep, true)
            .await
            .unwrap();
        assert_eq!(out.state, ReviewState::Flagged);
        assert!(out.members.iter().any(|m| m.asset_id == "B" && m.exception));
    }

    #[tokio::test]
    async fn manual_decisions_fill_a_group() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        let out = review
            .override_decision("B", Decision::Delete, false)
            .await
            .unwrap();
        assert_eq!(out.state, ReviewState::Unresolved);
        // Last member deleted too: zero keeps.
        assert!(review
            .override_decision("A", Decision::Delete, false)
            .await
            .is_err());
        let out = review
            .override_decision("A", Decision::Keep, false)
            .await
            .unwrap();
        assert_eq!(out.state, ReviewState::Resolved);
        assert!(matches!(
            review
                .override_decision("nobody", Decision::Keep, false)
                .await
                .unwrap_err(),
            DedupError::UnknownAsset(_)
        ));
    }

    #[tokio::test]
    async fn ignore_and_delete_all_are_flagged_exceptions() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);

        let out = review.ignore_group(&gid).await.unwrap();
        assert_eq!(out.keeps, 2);
        assert_eq!(out.state, ReviewState::Flagged);
        assert!(review.deletion_plan().await.unwrap().is_empty());

        let out = review.delete_all(&gid).await.unwrap();
        assert_eq!(out.deletes, 2);
        assert_eq!(out.state, ReviewState::Flagged);
        assert!(review.deletion_plan().await.unwrap().iter().all(|c| c.exception));
    }

    #[tokio::test]
    async fn reset_returns_members_to_pending() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        review
            .resolve_keep_one(&gid, Selection::Representative, false)
            .await
            .unwrap();
        assert_eq!(review.reset_group(&gid).await.unwrap(), 2);
        let status = review.status(&gid).await.unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(review.reset_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writes_to_a_replaced_group_are_stale() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        let (group, stored) = review.load(&gid).await.unwrap();
        assert!(stored.is_empty());

        store.replace_groups(&[]).await.unwrap();
        let write = ReviewDecision {
            asset_id: group.member_asset_ids[0].clone(),
            group_id: gid.clone(),
            decision: Decision::Keep,
            exception: false,
            decided_at: 0,
        };
        let err = review.commit(&gid, &stored, &[write]).await.unwrap_err();
        assert!(matches!(err, DedupError::StaleGroup(_)));
    }

    #[tokio::test]
    async fn concurrent_keep_overrides_cannot_both_land() {
        let (store, gid) = setup(&["A", "B"]).await;
        let first = ReviewMachine::new(&store);
        let second = ReviewMachine::new(&store);

        // One operator reads the pending group and plans to keep A.
        let (_, stored) = first.load(&gid).await.unwrap();
        let keep_a = ReviewDecision {
            asset_id: "A".to_string(),
            group_id: gid.clone(),
            decision: Decision::Keep,
            exception: false,
            decided_at: 1,
        };

        // Meanwhile a second operator keeps B, which is valid on its own.
        let out = second
            .override_decision("B", Decision::Keep, false)
            .await
            .unwrap();
        assert_eq!(out.keeps, 1);

        let err = first.commit(&gid, &stored, &[keep_a]).await.unwrap_err();
        assert!(matches!(err, DedupError::Conflict(_)), "{err}");
        let status = first.status(&gid).await.unwrap();
        assert_eq!(status.keeps, 1);
        assert_eq!(
            decisions(&status),
            vec![("A", Decision::Pending), ("B", Decision::Keep)]
        );

        // Re-running against fresh state applies the keep rule again.
        let err = first
            .override_decision("A", Decision::Keep, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::InvalidResolution(_)));
    }

    #[tokio::test]
    async fn valid_override_clears_earlier_exception_flags() {
        let (store, gid) = setup(&["A", "B"]).await;
        let review = ReviewMachine::new(&store);
        review.ignore_group(&gid).await.unwrap();

        let out = review
            .override_decision("B", Decision::Delete, false)
            .await
            .unwrap();
        assert_eq!(out.state, ReviewState::Resolved);
        assert_eq!(
            decisions(&out),
            vec![("A", Decision::Keep), ("B", Decision::Delete)]
        );
        assert!(out.members.iter().all(|m| !m.exception));

        let stored = store.get_decisions(&gid).await.unwrap();
        assert!(stored.iter().all(|d| !d.exception));
        let plan = review.deletion_plan().await.unwrap();
        assert_eq!(plan.len(), 1);
        assert!(!plan[0].exception);
    }
}
