//! Core data models shared by the registry, clustering, and review layers.
//!
//! Timestamps are Unix seconds (UTC). Identifiers are strings: asset ids are
//! UUID v4, group ids are derived from group membership (see
//! [`ClusterGroup::id_for_members`]).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a tracked asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Active,
    Missing,
    Error,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Active => "active",
            AssetStatus::Missing => "missing",
            AssetStatus::Error => "error",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssetStatus::Active),
            "missing" => Ok(AssetStatus::Missing),
            "error" => Ok(AssetStatus::Error),
            other => Err(format!("unknown asset status: {}", other)),
        }
    }
}

/// Fingerprint of an asset's file content.
///
/// Two signatures are equal only if size, modification time, and content
/// hash all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSignature {
    pub size_bytes: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    /// Lowercase hex SHA-256 of the file bytes.
    pub sha256: String,
}

/// One tracked image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub path: String,
    pub signature: ContentSignature,
    pub status: AssetStatus,
    /// Registration time. Set once on first sighting.
    pub created_at: i64,
    pub updated_at: i64,
    /// Message of the most recent per-asset failure, cleared on success.
    pub last_error: Option<String>,
}

/// The current vector for one asset under one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub asset_id: String,
    pub model_version: String,
    pub vector: Vec<f32>,
    /// SHA-256 of the file content the vector was computed from.
    pub content_hash: String,
    pub created_at: i64,
}

/// A connected component of the similarity graph with at least two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterGroup {
    pub group_id: String,
    pub model_version: String,
    pub threshold: f32,
    /// Sorted ascending, no duplicates, length >= 2.
    pub member_asset_ids: Vec<String>,
    pub representative_asset_id: String,
    pub created_at: i64,
}

impl ClusterGroup {
    /// Derive a stable group id from a sorted member list.
    ///
    /// The same membership always yields the same id, so decisions recorded
    /// against an unchanged component survive a rebuild.
    pub fn id_for_members(sorted_members: &[String]) -> String {
        let mut hasher = Sha256::new();
        for id in sorted_members {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        let digest = format!("{:x}", hasher.finalize());
        format!("g-{}", &digest[..16])
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.member_asset_ids
            .binary_search_by(|m| m.as_str().cmp(asset_id))
            .is_ok()
    }
}

/// Review decision for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pending,
    Keep,
    Delete,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pending => "pending",
            Decision::Keep => "keep",
            Decision::Delete => "delete",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Decision::Pending),
            "keep" => Ok(Decision::Keep),
            "delete" => Ok(Decision::Delete),
            other => Err(format!(
                "unknown decision: '{}'. Must be pending, keep, or delete.",
                other
            )),
        }
    }
}

/// A recorded decision for an asset within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub asset_id: String,
    pub group_id: String,
    pub decision: Decision,
    /// Set when the operator acknowledged a zero- or multi-keep group.
    pub exception: bool,
    pub decided_at: i64,
}

/// A `delete` decision joined with the asset path, handed to the external
/// deletion executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionCandidate {
    pub asset_id: String,
    pub group_id: String,
    pub path: String,
    pub exception: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_decision_parse() {
        for s in [AssetStatus::Active, AssetStatus::Missing, AssetStatus::Error] {
            assert_eq!(s.as_str().parse::<AssetStatus>().unwrap(), s);
        }
        assert_eq!("keep".parse::<Decision>().unwrap(), Decision::Keep);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn group_id_depends_only_on_membership() {
        let a = vec!["a".to_string(), "b".to_string()];
        let b = vec!["a".to_string(), "b".to_string()];
        let c = vec!["a".to_string(), "c".to_string()];
        assert_eq!(ClusterGroup::id_for_members(&a), ClusterGroup::id_for_members(&b));
        assert_ne!(ClusterGroup::id_for_members(&a), ClusterGroup::id_for_members(&c));
        assert!(ClusterGroup::id_for_members(&a).starts_with("g-"));
    }

    #[test]
    fn group_id_is_not_fooled_by_concatenation() {
        let a = vec!["ab".to_string(), "c".to_string()];
        let b = vec!["a".to_string(), "bc".to_string()];
        assert_ne!(ClusterGroup::id_for_members(&a), ClusterGroup::id_for_members(&b));
    }
}
