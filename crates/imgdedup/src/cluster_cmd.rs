//! `dedup cluster`: rebuild duplicate groups from the stored embeddings.

use anyhow::{bail, Result};
use tracing::info;

use imgdedup_core::cluster::{self, BackendKind, ClusterParams};
use imgdedup_core::embedding::EmbeddingStore;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::SqliteStore;

pub async fn run_cluster(
    config: &Config,
    threshold_override: Option<f32>,
    backend_override: Option<BackendKind>,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let provider = embedding::create_provider(&config.embedding)?;
    let threshold = threshold_override.unwrap_or(config.clustering.similarity_threshold);
    let backend_kind = backend_override.unwrap_or(config.clustering.backend);
    let backend = backend_kind.build(config.clustering.ann_candidates);

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let embeddings = EmbeddingStore::new(&store, provider.model_version(), provider.dims());
    let params = ClusterParams::new(threshold, provider.model_version());

    info!(threshold, backend = %backend_kind, "rebuilding clusters");
    let outcome = cluster::rebuild(
        &embeddings,
        &params,
        backend.as_ref(),
        config.clustering.page_size,
    )
    .await?;
    let without_vector = embeddings.missing_count().await?;

    let report = &outcome.report;
    println!("cluster");
    println!("  model: {}", provider.model_version());
    println!("  threshold: {}", threshold);
    println!("  backend: {}", backend_kind);
    println!("  vectors: {}", report.considered);
    println!("  rejected: {}", report.rejected);
    println!("  linked pairs: {}", report.linked_pairs);
    println!("  groups: {}", report.groups);
    println!("  grouped assets: {}", report.grouped_assets);
    println!("  assets without vector: {}", without_vector);
    println!("  elapsed: {} ms", report.elapsed_ms);
    for r in &outcome.rejected {
        println!(
            "  rejected {}: expected {} dims, got {}",
            r.asset_id, r.expected, r.actual
        );
    }

    store.pool().close().await;
    Ok(())
}
