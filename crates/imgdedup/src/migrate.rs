use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Assets
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assets (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            size_bytes INTEGER NOT NULL,
            mtime_ns INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One current vector per (asset, model version)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            asset_id TEXT NOT NULL,
            model_version TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (asset_id, model_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_groups (
            group_id TEXT PRIMARY KEY,
            model_version TEXT NOT NULL,
            threshold REAL NOT NULL,
            representative_asset_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_members (
            group_id TEXT NOT NULL,
            asset_id TEXT NOT NULL UNIQUE,
            PRIMARY KEY (group_id, asset_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Decisions outlive a rebuild when their group id survives, so no
    // foreign key to cluster_groups.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS review_decisions (
            asset_id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            decision TEXT NOT NULL,
            exception INTEGER NOT NULL DEFAULT 0,
            decided_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assets_status ON assets(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_version, asset_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_review_decisions_group ON review_decisions(group_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
