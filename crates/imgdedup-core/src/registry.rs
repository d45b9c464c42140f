//! Asset Registry: decides whether an asset needs (re)embedding.
//!
//! The registry never embeds anything itself. It compares the caller's
//! freshly computed [`ContentSignature`] with the stored one, upserts the
//! asset record, and reports [`RegistrationStatus`]. The indexing pipeline
//! acts on that status.
//!
//! | Stored record | Signature | Result |
//! |---------------|-----------|--------|
//! | none | any | `New` |
//! | active | equal | `Unchanged` (nothing written) |
//! | missing | equal | `Unchanged` (status restored to active) |
//! | error | equal | `Changed` (failed assets are retried) |
//! | unreadable on first sighting | any | `Changed` (see [`AssetRegistry::mark_unreadable`]) |
//! | any | different | `Changed` |
//! | any, `force` | any | `Changed` |

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Asset, AssetStatus, ContentSignature};
use crate::store::Store;

/// Outcome of [`AssetRegistry::register_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    New,
    Unchanged,
    Changed,
}

impl RegistrationStatus {
    /// `New` and `Changed` assets must be sent to the embedding provider.
    pub fn needs_embedding(&self) -> bool {
        !matches!(self, RegistrationStatus::Unchanged)
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub status: RegistrationStatus,
    pub asset: Asset,
}

/// Tracks known assets in a [`Store`].
pub struct AssetRegistry<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> AssetRegistry<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Classify a sighting of `path` without writing anything.
    pub async fn peek(
        &self,
        path: &str,
        signature: &ContentSignature,
        force: bool,
    ) -> Result<RegistrationStatus> {
        let existing = self.store.get_asset_by_path(path).await?;
        Ok(classify(existing.as_ref(), signature, force))
    }

    /// Register a sighting of `path` with its current content signature.
    ///
    /// With `force`, every previously known asset is reported as
    /// [`RegistrationStatus::Changed`] regardless of its signature.
    pub async fn register_or_update(
        &self,
        path: &str,
        signature: ContentSignature,
        force: bool,
    ) -> Result<Registration> {
        let now = chrono::Utc::now().timestamp();

        let Some(existing) = self.store.get_asset_by_path(path).await? else {
            let asset = Asset {
                id: Uuid::new_v4().to_string(),
                path: path.to_string(),
                signature,
                status: AssetStatus::Active,
                created_at: now,
                updated_at: now,
                last_error: None,
            };
            self.store.upsert_asset(&asset).await?;
            // A concurrent run may have registered the same path first; the
            // store keeps that record's identity, so read back what won.
            let stored = self.store.get_asset_by_path(path).await?.unwrap_or(asset);
            debug!(path, asset_id = %stored.id, "registered new asset");
            return Ok(Registration {
                status: RegistrationStatus::New,
                asset: stored,
            });
        };

        let status = classify(Some(&existing), &signature, force);
        if status == RegistrationStatus::Unchanged && existing.status == AssetStatus::Active {
            return Ok(Registration {
                status,
                asset: existing,
            });
        }

        let asset = Asset {
            signature,
            status: AssetStatus::Active,
            updated_at: now,
            last_error: if status == RegistrationStatus::Changed {
                existing.last_error.clone()
            } else {
                None
            },
            ..existing
        };
        self.store.upsert_asset(&asset).await?;
        debug!(path, asset_id = %asset.id, ?status, "updated asset");
        Ok(Registration { status, asset })
    }

    /// Record a per-asset failure. The asset is retried on the next run.
    pub async fn mark_error(&self, asset_id: &str, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .set_asset_status(asset_id, AssetStatus::Error, Some(message), now)
            .await?;
        Ok(())
    }

    /// Record that `path` could not be read at all.
    ///
    /// A known asset is marked `error`. A path seen for the first time is
    /// registered in `error` state with an empty signature, so the failure
    /// is visible and the next successful read reports it as changed.
    pub async fn mark_unreadable(&self, path: &str, message: &str) -> Result<()> {
        if let Some(existing) = self.store.get_asset_by_path(path).await? {
            return self.mark_error(&existing.id, message).await;
        }
        let now = chrono::Utc::now().timestamp();
        let asset = Asset {
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
            signature: ContentSignature {
                size_bytes: 0,
                mtime_ns: 0,
                sha256: String::new(),
            },
            status: AssetStatus::Error,
            created_at: now,
            updated_at: now,
            last_error: Some(message.to_string()),
        };
        self.store.upsert_asset(&asset).await?;
        debug!(path, asset_id = %asset.id, "registered unreadable asset");
        Ok(())
    }

    /// Clear a previous failure after a successful embed.
    pub async fn mark_active(&self, asset_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .set_asset_status(asset_id, AssetStatus::Active, None, now)
            .await?;
        Ok(())
    }

    /// Mark every asset under `root` that was not seen in the current scan as
    /// missing. Returns how many records changed.
    pub async fn mark_missing(&self, root: &Path, seen: &HashSet<String>) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut marked = 0;
        for asset in self.store.list_assets().await? {
            if asset.status == AssetStatus::Missing
                || seen.contains(&asset.path)
                || !Path::new(&asset.path).starts_with(root)
            {
                continue;
            }
            self.store
                .set_asset_status(&asset.id, AssetStatus::Missing, None, now)
                .await?;
            marked += 1;
        }
        if marked > 0 {
            debug!(root = %root.display(), marked, "marked assets missing");
        }
        Ok(marked)
    }
}

fn classify(
    existing: Option<&Asset>,
    signature: &ContentSignature,
    force: bool,
) -> RegistrationStatus {
    let Some(existing) = existing else {
        return RegistrationStatus::New;
    };
    if force || existing.signature != *signature {
        return RegistrationStatus::Changed;
    }
    match existing.status {
        AssetStatus::Active | AssetStatus::Missing => RegistrationStatus::Unchanged,
        AssetStatus::Error => RegistrationStatus::Changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn sig(hash: &str) -> ContentSignature {
        ContentSignature {
            size_bytes: 10,
            mtime_ns: 1_000,
            sha256: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn new_then_unchanged_then_changed() {
        let store = InMemoryStore::new();
        let registry = AssetRegistry::new(&store);

        let first = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        assert_eq!(first.status, RegistrationStatus::New);

        let second = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        assert_eq!(second.status, RegistrationStatus::Unchanged);
        assert_eq!(second.asset.id, first.asset.id);

        let third = registry
            .register_or_update("/p/a.jpg", sig("bb"), false)
            .await
            .unwrap();
        assert_eq!(third.status, RegistrationStatus::Changed);
        assert_eq!(third.asset.id, first.asset.id);
        assert_eq!(third.asset.created_at, first.asset.created_at);

        let stored = store.get_asset(&first.asset.id).await.unwrap().unwrap();
        assert_eq!(stored.signature.sha256, "bb");
    }

    #[tokio::test]
    async fn peek_writes_nothing() {
        let store = InMemoryStore::new();
        let registry = AssetRegistry::new(&store);
        let status = registry.peek("/p/a.jpg", &sig("aa"), false).await.unwrap();
        assert_eq!(status, RegistrationStatus::New);
        assert!(store.list_assets().await.unwrap().is_empty());

        registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        assert_eq!(
            registry.peek("/p/a.jpg", &sig("bb"), false).await.unwrap(),
            RegistrationStatus::Changed
        );
        assert_eq!(
            registry.peek("/p/a.jpg", &sig("aa"), false).await.unwrap(),
            RegistrationStatus::Unchanged
        );
    }

    #[tokio::test]
    async fn force_reports_changed_for_identical_content() {
        let store = InMemoryStore::new();
        let registry = AssetRegistry::new(&store);
        registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        let forced = registry
            .register_or_update("/p/a.jpg", sig("aa"), true)
            .await
            .unwrap();
        assert_eq!(forced.status, RegistrationStatus::Changed);
        assert!(forced.status.needs_embedding());
    }

    #[tokio::test]
    async fn error_assets_are_retried() {
        let store = InMemoryStore::new();
        let registry = AssetRegistry::new(&store);
        let reg = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        registry.mark_error(&reg.asset.id, "decode failed").await.unwrap();

        let retry = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        assert_eq!(retry.status, RegistrationStatus::Changed);
        assert_eq!(retry.asset.status, AssetStatus::Active);

        registry.mark_active(&reg.asset.id).await.unwrap();
        let stored = store.get_asset(&reg.asset.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AssetStatus::Active);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn unreadable_first_sighting_is_recorded() {
        let store = InMemoryStore::new();
        let registry = AssetRegistry::new(&store);
        registry
            .mark_unreadable("/p/a.jpg", "permission denied")
            .await
            .unwrap();

        let stored = store.get_asset_by_path("/p/a.jpg").await.unwrap().unwrap();
        assert_eq!(stored.status, AssetStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("permission denied"));

        // Same path again: still one record.
        registry.mark_unreadable("/p/a.jpg", "still denied").await.unwrap();
        assert_eq!(store.list_assets().await.unwrap().len(), 1);
        let again = store.get_asset(&stored.id).await.unwrap().unwrap();
        assert_eq!(again.last_error.as_deref(), Some("still denied"));

        let readable = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        assert_eq!(readable.status, RegistrationStatus::Changed);
        assert_eq!(readable.asset.id, stored.id);
        assert_eq!(readable.asset.status, AssetStatus::Active);
    }

    #[tokio::test]
    async fn unseen_assets_under_root_become_missing_and_can_return() {
        let store = InMemoryStore::new();
        let registry = AssetRegistry::new(&store);
        let a = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        registry
            .register_or_update("/p/b.jpg", sig("bb"), false)
            .await
            .unwrap();
        registry
            .register_or_update("/other/c.jpg", sig("cc"), false)
            .await
            .unwrap();

        let seen: HashSet<String> = ["/p/b.jpg".to_string()].into_iter().collect();
        let marked = registry.mark_missing(Path::new("/p"), &seen).await.unwrap();
        assert_eq!(marked, 1);
        let stored = store.get_asset(&a.asset.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AssetStatus::Missing);

        // Second pass is a no-op.
        assert_eq!(registry.mark_missing(Path::new("/p"), &seen).await.unwrap(), 0);

        let back = registry
            .register_or_update("/p/a.jpg", sig("aa"), false)
            .await
            .unwrap();
        assert_eq!(back.status, RegistrationStatus::Unchanged);
        assert_eq!(back.asset.status, AssetStatus::Active);
    }
}
