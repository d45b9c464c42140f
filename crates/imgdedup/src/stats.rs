//! Database statistics: asset, embedding, group, and decision counts.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let status_rows = sqlx::query("SELECT status, COUNT(*) AS n FROM assets GROUP BY status")
        .fetch_all(&pool)
        .await?;
    let mut active = 0i64;
    let mut missing = 0i64;
    let mut error = 0i64;
    for row in &status_rows {
        let status: String = row.get("status");
        let n: i64 = row.get("n");
        match status.as_str() {
            "active" => active = n,
            "missing" => missing = n,
            "error" => error = n,
            _ => {}
        }
    }
    let total_assets = active + missing + error;

    let model_rows = sqlx::query(
        "SELECT model_version, dims, COUNT(*) AS n FROM embeddings GROUP BY model_version, dims ORDER BY model_version",
    )
    .fetch_all(&pool)
    .await?;

    let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cluster_groups")
        .fetch_one(&pool)
        .await?;
    let grouped: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cluster_members")
        .fetch_one(&pool)
        .await?;

    let decision_rows =
        sqlx::query("SELECT decision, COUNT(*) AS n FROM review_decisions GROUP BY decision")
            .fetch_all(&pool)
            .await?;
    let mut keeps = 0i64;
    let mut deletes = 0i64;
    for row in &decision_rows {
        let decision: String = row.get("decision");
        let n: i64 = row.get("n");
        match decision.as_str() {
            "keep" => keeps = n,
            "delete" => deletes = n,
            _ => {}
        }
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("imgdedup stats");
    println!("  database: {}", config.db.path.display());
    println!("  size: {}", format_bytes(db_size));
    println!("  assets: {}", total_assets);
    println!("    active: {}", active);
    println!("    missing: {}", missing);
    println!("    error: {}", error);
    println!("  embeddings:");
    if model_rows.is_empty() {
        println!("    none");
    }
    for row in &model_rows {
        let model: String = row.get("model_version");
        let dims: i64 = row.get("dims");
        let n: i64 = row.get("n");
        println!("    {} ({} dims): {}", model, dims, n);
    }
    println!("  groups: {}", groups);
    println!("  grouped assets: {}", grouped);
    println!("  decisions: keep {}, delete {}", keeps, deletes);

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
