//! `dedup index`: scan a directory, register assets, embed what changed.
//!
//! Work is done in batches of `batch_size` files. Within a batch the
//! content signatures are computed in parallel on the blocking pool, then
//! every asset that needs a vector goes to the provider in one call. Each
//! asset's registry row and embedding are committed as its batch completes,
//! so an interrupted run resumes where it stopped.
//!
//! Per-asset failures never abort the run: the asset is marked `error`
//! with the message and retried next time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use imgdedup_core::embedding::{EmbeddingStore, ImageEmbedder, ImageInput};
use imgdedup_core::models::{Asset, ContentSignature};
use imgdedup_core::registry::{AssetRegistry, RegistrationStatus};
use imgdedup_core::store::Store;
use imgdedup_core::DedupError;

use crate::config::{Config, IndexConfig};
use crate::db;
use crate::embedding;
use crate::scan;
use crate::sqlite_store::SqliteStore;

/// Explicit per-run indexing options.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Process at most this many files.
    pub limit: Option<usize>,
    /// Re-embed every file regardless of its signature.
    pub force: bool,
    pub batch_size: usize,
    /// Classify files without writing or embedding.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub scanned: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub embedded: usize,
    pub failed: usize,
    pub missing: usize,
}

/// An asset waiting for a vector.
struct Pending {
    asset: Asset,
    sha256: String,
}

/// Index `root` into `store` using `embedder`.
pub async fn index_path<S: Store + ?Sized>(
    store: &S,
    embedder: &dyn ImageEmbedder,
    root: &Path,
    index_config: &IndexConfig,
    opts: &IndexOptions,
) -> Result<IndexReport> {
    if opts.batch_size == 0 {
        bail!("batch size must be > 0");
    }

    let root = root
        .canonicalize()
        .with_context(|| format!("Index root does not exist: {}", root.display()))?;
    let scan_root = root.clone();
    let scan_config = index_config.clone();
    let files = tokio::task::spawn_blocking(move || scan::scan_images(&scan_root, &scan_config))
        .await??;

    let registry = AssetRegistry::new(store);
    let embeddings = EmbeddingStore::new(store, embedder.model_version(), embedder.dims());
    let mut report = IndexReport {
        scanned: files.len(),
        ..IndexReport::default()
    };
    info!(root = %root.display(), files = files.len(), "scan complete");

    let seen: HashSet<String> = files
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    let selected: Vec<PathBuf> = files
        .into_iter()
        .take(opts.limit.unwrap_or(usize::MAX))
        .collect();

    for (batch_no, batch) in selected.chunks(opts.batch_size).enumerate() {
        let signatures = compute_signatures(batch).await?;
        let mut pending = Vec::new();

        for (path, signature) in batch.iter().zip(signatures) {
            let path_str = path.to_string_lossy().to_string();
            let signature = match signature {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path_str, error = %e, "failed to read file");
                    report.failed += 1;
                    if !opts.dry_run {
                        registry
                            .mark_unreadable(&path_str, &format!("{:#}", e))
                            .await?;
                    }
                    continue;
                }
            };

            if opts.dry_run {
                match registry.peek(&path_str, &signature, opts.force).await? {
                    RegistrationStatus::New => report.new += 1,
                    RegistrationStatus::Changed => report.changed += 1,
                    RegistrationStatus::Unchanged => report.unchanged += 1,
                }
                continue;
            }

            let sha256 = signature.sha256.clone();
            let registration = registry
                .register_or_update(&path_str, signature, opts.force)
                .await?;
            match registration.status {
                RegistrationStatus::New => report.new += 1,
                RegistrationStatus::Changed => {
                    report.changed += 1;
                    // Content moved on; a prior keep/delete no longer applies.
                    store.clear_asset_decision(&registration.asset.id).await?;
                }
                RegistrationStatus::Unchanged => report.unchanged += 1,
            }

            // Unchanged assets still need a vector if an earlier run was
            // interrupted between registering and embedding them.
            let needs_vector = registration.status.needs_embedding()
                || !has_fresh_vector(&embeddings, &registration.asset.id, &sha256).await?;
            if needs_vector {
                pending.push(Pending {
                    asset: registration.asset,
                    sha256,
                });
            }
        }

        if pending.is_empty() {
            continue;
        }
        debug!(batch = batch_no, pending = pending.len(), "embedding batch");
        let (ok, failed) = embed_pending(&registry, &embeddings, embedder, pending).await?;
        report.embedded += ok;
        report.failed += failed;
    }

    if !opts.dry_run {
        report.missing = registry.mark_missing(&root, &seen).await?;
    }

    info!(
        new = report.new,
        changed = report.changed,
        embedded = report.embedded,
        failed = report.failed,
        "index complete"
    );
    Ok(report)
}

/// Whether the stored vector was computed from content with `sha256`.
async fn has_fresh_vector<S: Store + ?Sized>(
    embeddings: &EmbeddingStore<'_, S>,
    asset_id: &str,
    sha256: &str,
) -> Result<bool> {
    match embeddings.get(asset_id).await {
        Ok(Some(e)) => Ok(e.content_hash == sha256),
        Ok(None) | Err(DedupError::DimensionMismatch { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Signatures for `paths`, in input order, hashed in parallel on the
/// blocking pool.
async fn compute_signatures(paths: &[PathBuf]) -> Result<Vec<Result<ContentSignature>>> {
    let paths = paths.to_vec();
    let signatures = tokio::task::spawn_blocking(move || {
        paths
            .par_iter()
            .map(|path| scan::compute_signature(path))
            .collect::<Vec<_>>()
    })
    .await?;
    Ok(signatures)
}

/// Read, embed, and store one batch. Returns `(embedded, failed)`.
async fn embed_pending<S: Store + ?Sized>(
    registry: &AssetRegistry<'_, S>,
    embeddings: &EmbeddingStore<'_, S>,
    embedder: &dyn ImageEmbedder,
    pending: Vec<Pending>,
) -> Result<(usize, usize)> {
    let mut failed = 0;
    let mut inputs = Vec::with_capacity(pending.len());
    let mut ready = Vec::with_capacity(pending.len());
    for item in pending {
        match tokio::fs::read(&item.asset.path).await {
            Ok(bytes) => {
                inputs.push(ImageInput {
                    asset_id: item.asset.id.clone(),
                    path: item.asset.path.clone(),
                    bytes,
                });
                ready.push(item);
            }
            Err(e) => {
                warn!(path = %item.asset.path, error = %e, "failed to read image");
                registry
                    .mark_error(&item.asset.id, &format!("read failed: {}", e))
                    .await?;
                failed += 1;
            }
        }
    }
    if ready.is_empty() {
        return Ok((0, failed));
    }

    let results = match embedder.embed_batch(&inputs).await {
        Ok(results) => results,
        Err(e) => {
            warn!(error = %e, assets = ready.len(), "embedding batch failed");
            let message = format!("embedding failed: {:#}", e);
            for item in &ready {
                registry.mark_error(&item.asset.id, &message).await?;
            }
            return Ok((0, failed + ready.len()));
        }
    };

    let mut embedded = 0;
    for (item, result) in ready.into_iter().zip(results) {
        let stored = match result {
            Ok(vector) => embeddings
                .put(&item.asset.id, vector, &item.sha256)
                .await
                .map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => {
                if item.asset.last_error.is_some() {
                    registry.mark_active(&item.asset.id).await?;
                }
                embedded += 1;
            }
            Err(e) => {
                warn!(path = %item.asset.path, error = %e, "failed to embed image");
                registry
                    .mark_error(&item.asset.id, &format!("{:#}", e))
                    .await?;
                failed += 1;
            }
        }
    }
    Ok((embedded, failed))
}

/// CLI entry point for `dedup index`.
pub async fn run_index(
    config: &Config,
    path: &Path,
    limit: Option<usize>,
    force: bool,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let opts = IndexOptions {
        limit,
        force,
        batch_size: batch_size_override.unwrap_or(config.embedding.batch_size),
        dry_run,
    };

    let report = index_path(&store, provider.as_ref(), path, &config.index, &opts).await?;

    if dry_run {
        println!("index (dry-run)");
        println!("  scanned: {}", report.scanned);
        println!("  new: {}", report.new);
        println!("  changed: {}", report.changed);
        println!("  unchanged: {}", report.unchanged);
        println!("  unreadable: {}", report.failed);
    } else {
        println!("index");
        println!("  model: {}", provider.model_version());
        println!("  scanned: {}", report.scanned);
        println!("  new: {}", report.new);
        println!("  changed: {}", report.changed);
        println!("  unchanged: {}", report.unchanged);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
        println!("  marked missing: {}", report.missing);
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use imgdedup_core::models::AssetStatus;
    use imgdedup_core::store::memory::InMemoryStore;
    use std::fs;
    use tempfile::TempDir;

    /// Four-dimensional vectors, except for files named `short.jpg`.
    struct FixedEmbedder;

    #[async_trait]
    impl ImageEmbedder for FixedEmbedder {
        fn model_version(&self) -> &str {
            "fixed-v1"
        }

        fn dims(&self) -> usize {
            4
        }

        async fn embed_batch(
            &self,
            images: &[ImageInput],
        ) -> anyhow::Result<Vec<anyhow::Result<Vec<f32>>>> {
            Ok(images
                .iter()
                .map(|img| {
                    if img.path.ends_with("short.jpg") {
                        Ok(vec![1.0, 0.0, 0.0])
                    } else {
                        Ok(vec![1.0, 0.0, 0.0, 0.0])
                    }
                })
                .collect())
        }
    }

    fn opts() -> IndexOptions {
        IndexOptions {
            limit: None,
            force: false,
            batch_size: 8,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn wrong_length_vector_marks_only_that_asset() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("ok.jpg"), b"ok").unwrap();
        fs::write(tmp.path().join("short.jpg"), b"short").unwrap();
        let store = InMemoryStore::new();

        let report = index_path(
            &store,
            &FixedEmbedder,
            tmp.path(),
            &IndexConfig::default(),
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(report.new, 2);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.failed, 1);

        let assets = store.list_assets().await.unwrap();
        let short = assets
            .iter()
            .find(|a| a.path.ends_with("short.jpg"))
            .unwrap();
        assert_eq!(short.status, AssetStatus::Error);
        let message = short.last_error.as_deref().unwrap();
        assert!(message.contains("3 dimensions"), "{}", message);
        assert!(store
            .get_embedding(&short.id, "fixed-v1")
            .await
            .unwrap()
            .is_none());

        let ok = assets.iter().find(|a| a.path.ends_with("ok.jpg")).unwrap();
        assert_eq!(ok.status, AssetStatus::Active);
        assert_eq!(store.count_embeddings(Some("fixed-v1")).await.unwrap(), 1);

        // The failed asset is retried on the next run; the good one is not.
        let again = index_path(
            &store,
            &FixedEmbedder,
            tmp.path(),
            &IndexConfig::default(),
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(again.changed, 1);
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.failed, 1);
    }
}
