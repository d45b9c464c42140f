//! SQLite-backed [`Store`] implementation.
//!
//! Every multi-row write ([`Store::replace_groups`],
//! [`Store::write_decisions`]) runs inside one transaction, so a review
//! write either sees the group it was computed against or nothing at all.
//! [`Store::active_embeddings`] pages inside one read transaction, which
//! WAL mode pins to a single snapshot.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use imgdedup_core::embedding::{blob_to_vec, vec_to_blob};
use imgdedup_core::models::{
    Asset, AssetStatus, ClusterGroup, ContentSignature, Decision, Embedding, ReviewDecision,
};
use imgdedup_core::store::{DecisionWrite, SnapshotEntry, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_members(&self, group_id: &str) -> Result<Vec<String>> {
        let members: Vec<String> = sqlx::query_scalar(
            "SELECT asset_id FROM cluster_members WHERE group_id = ? ORDER BY asset_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }
}

const ASSET_COLUMNS: &str =
    "id, path, size_bytes, mtime_ns, sha256, status, created_at, updated_at, last_error";

fn row_to_asset(row: &SqliteRow) -> Result<Asset> {
    let status: String = row.get("status");
    Ok(Asset {
        id: row.get("id"),
        path: row.get("path"),
        signature: ContentSignature {
            size_bytes: row.get::<i64, _>("size_bytes") as u64,
            mtime_ns: row.get("mtime_ns"),
            sha256: row.get("sha256"),
        },
        status: status.parse::<AssetStatus>().map_err(|e| anyhow!(e))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_error: row.get("last_error"),
    })
}

fn row_to_embedding(row: &SqliteRow) -> Embedding {
    let blob: Vec<u8> = row.get("vector");
    Embedding {
        asset_id: row.get("asset_id"),
        model_version: row.get("model_version"),
        vector: blob_to_vec(&blob),
        content_hash: row.get("content_hash"),
        created_at: row.get("created_at"),
    }
}

fn row_to_group(row: &SqliteRow, members: Vec<String>) -> ClusterGroup {
    ClusterGroup {
        group_id: row.get("group_id"),
        model_version: row.get("model_version"),
        threshold: row.get::<f64, _>("threshold") as f32,
        member_asset_ids: members,
        representative_asset_id: row.get("representative_asset_id"),
        created_at: row.get("created_at"),
    }
}

fn row_to_decision(row: &SqliteRow) -> Result<ReviewDecision> {
    let decision: String = row.get("decision");
    Ok(ReviewDecision {
        asset_id: row.get("asset_id"),
        group_id: row.get("group_id"),
        decision: decision.parse::<Decision>().map_err(|e| anyhow!(e))?,
        exception: row.get("exception"),
        decided_at: row.get("decided_at"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_asset(&self, asset: &Asset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assets (id, path, size_bytes, mtime_ns, sha256, status,
                                created_at, updated_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                mtime_ns = excluded.mtime_ns,
                sha256 = excluded.sha256,
                status = excluded.status,
                updated_at = excluded.updated_at,
                last_error = excluded.last_error
            "#,
        )
        .bind(&asset.id)
        .bind(&asset.path)
        .bind(asset.signature.size_bytes as i64)
        .bind(asset.signature.mtime_ns)
        .bind(&asset.signature.sha256)
        .bind(asset.status.as_str())
        .bind(asset.created_at)
        .bind(asset.updated_at)
        .bind(&asset.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>> {
        let row = sqlx::query(&format!("SELECT {} FROM assets WHERE id = ?", ASSET_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_asset).transpose()
    }

    async fn get_asset_by_path(&self, path: &str) -> Result<Option<Asset>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM assets WHERE path = ?",
            ASSET_COLUMNS
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_asset).transpose()
    }

    async fn list_assets(&self) -> Result<Vec<Asset>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM assets ORDER BY created_at, id",
            ASSET_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_asset).collect()
    }

    async fn set_asset_status(
        &self,
        id: &str,
        status: AssetStatus,
        last_error: Option<&str>,
        updated_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE assets SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_embedding(&self, embedding: &Embedding) -> Result<()> {
        let blob = vec_to_blob(&embedding.vector);
        sqlx::query(
            r#"
            INSERT INTO embeddings (asset_id, model_version, dims, vector, content_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(asset_id, model_version) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector,
                content_hash = excluded.content_hash,
                created_at = excluded.created_at
            "#,
        )
        .bind(&embedding.asset_id)
        .bind(&embedding.model_version)
        .bind(embedding.vector.len() as i64)
        .bind(&blob)
        .bind(&embedding.content_hash)
        .bind(embedding.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_embedding(
        &self,
        asset_id: &str,
        model_version: &str,
    ) -> Result<Option<Embedding>> {
        let row = sqlx::query(
            r#"
            SELECT asset_id, model_version, vector, content_hash, created_at
            FROM embeddings
            WHERE asset_id = ? AND model_version = ?
            "#,
        )
        .bind(asset_id)
        .bind(model_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_embedding))
    }

    async fn embedding_page(
        &self,
        model_version: &str,
        after_asset_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Embedding>> {
        let rows = sqlx::query(
            r#"
            SELECT asset_id, model_version, vector, content_hash, created_at
            FROM embeddings
            WHERE model_version = ? AND asset_id > ?
            ORDER BY asset_id
            LIMIT ?
            "#,
        )
        .bind(model_version)
        .bind(after_asset_id.unwrap_or(""))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_embedding).collect())
    }

    async fn active_embeddings(
        &self,
        model_version: &str,
        page_size: usize,
    ) -> Result<Vec<SnapshotEntry>> {
        let limit = page_size.clamp(1, i64::MAX as usize) as i64;
        let mut tx = self.pool.begin().await?;
        let mut entries = Vec::new();
        let mut after = String::new();
        loop {
            let rows = sqlx::query(
                r#"
                SELECT e.asset_id, e.model_version, e.vector, e.content_hash, e.created_at,
                       a.created_at AS registered_at
                FROM embeddings e
                JOIN assets a ON a.id = e.asset_id
                WHERE e.model_version = ? AND a.status = 'active' AND e.asset_id > ?
                ORDER BY e.asset_id
                LIMIT ?
                "#,
            )
            .bind(model_version)
            .bind(&after)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

            let full = rows.len() as i64 == limit;
            for row in &rows {
                entries.push(SnapshotEntry {
                    embedding: row_to_embedding(row),
                    registered_at: row.get("registered_at"),
                });
            }
            match entries.last() {
                Some(last) if full => after = last.embedding.asset_id.clone(),
                _ => break,
            }
        }
        tx.commit().await?;
        Ok(entries)
    }

    async fn count_embeddings(&self, model_version: Option<&str>) -> Result<usize> {
        let count: i64 = match model_version {
            Some(m) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE model_version = ?")
                    .bind(m)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as usize)
    }

    async fn replace_groups(&self, groups: &[ClusterGroup]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM cluster_members")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cluster_groups")
            .execute(&mut *tx)
            .await?;

        for group in groups {
            sqlx::query(
                r#"
                INSERT INTO cluster_groups (group_id, model_version, threshold,
                                            representative_asset_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&group.group_id)
            .bind(&group.model_version)
            .bind(group.threshold as f64)
            .bind(&group.representative_asset_id)
            .bind(group.created_at)
            .execute(&mut *tx)
            .await?;

            for member in &group.member_asset_ids {
                sqlx::query("INSERT INTO cluster_members (group_id, asset_id) VALUES (?, ?)")
                    .bind(&group.group_id)
                    .bind(member)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            "DELETE FROM review_decisions WHERE group_id NOT IN (SELECT group_id FROM cluster_groups)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<ClusterGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT group_id, model_version, threshold, representative_asset_id, created_at
            FROM cluster_groups
            ORDER BY group_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let member_rows =
            sqlx::query("SELECT group_id, asset_id FROM cluster_members ORDER BY group_id, asset_id")
                .fetch_all(&self.pool)
                .await?;
        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        for row in &member_rows {
            members
                .entry(row.get("group_id"))
                .or_default()
                .push(row.get("asset_id"));
        }

        Ok(rows
            .iter()
            .map(|row| {
                let gid: String = row.get("group_id");
                row_to_group(row, members.remove(&gid).unwrap_or_default())
            })
            .collect())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<ClusterGroup>> {
        let row = sqlx::query(
            r#"
            SELECT group_id, model_version, threshold, representative_asset_id, created_at
            FROM cluster_groups
            WHERE group_id = ?
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let members = self.load_members(group_id).await?;
                Ok(Some(row_to_group(&row, members)))
            }
            None => Ok(None),
        }
    }

    async fn group_for_asset(&self, asset_id: &str) -> Result<Option<ClusterGroup>> {
        let group_id: Option<String> =
            sqlx::query_scalar("SELECT group_id FROM cluster_members WHERE asset_id = ?")
                .bind(asset_id)
                .fetch_optional(&self.pool)
                .await?;
        match group_id {
            Some(gid) => self.get_group(&gid).await,
            None => Ok(None),
        }
    }

    async fn get_decisions(&self, group_id: &str) -> Result<Vec<ReviewDecision>> {
        let rows = sqlx::query(
            r#"
            SELECT asset_id, group_id, decision, exception, decided_at
            FROM review_decisions
            WHERE group_id = ?
            ORDER BY asset_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_decision).collect()
    }

    async fn write_decisions(
        &self,
        group_id: &str,
        expected: &[ReviewDecision],
        decisions: &[ReviewDecision],
    ) -> Result<DecisionWrite> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock before anything is
        // read, so the comparison below cannot race another writer.
        let touched = sqlx::query(
            "UPDATE cluster_groups SET created_at = created_at WHERE group_id = ?",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if touched == 0 {
            tx.rollback().await?;
            return Ok(DecisionWrite::GroupGone);
        }

        let rows = sqlx::query(
            r#"
            SELECT asset_id, group_id, decision, exception, decided_at
            FROM review_decisions
            WHERE group_id = ?
            ORDER BY asset_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&mut *tx)
        .await?;
        let current = rows
            .iter()
            .map(row_to_decision)
            .collect::<Result<Vec<_>>>()?;
        let mut wanted = expected.to_vec();
        wanted.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        if current != wanted {
            tx.rollback().await?;
            return Ok(DecisionWrite::Conflict);
        }

        for d in decisions {
            let member: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM cluster_members WHERE group_id = ? AND asset_id = ?",
            )
            .bind(group_id)
            .bind(&d.asset_id)
            .fetch_one(&mut *tx)
            .await?;
            if d.group_id != group_id || !member {
                tx.rollback().await?;
                return Err(anyhow!(
                    "decision for asset {} does not belong to group {}",
                    d.asset_id,
                    group_id
                ));
            }

            sqlx::query(
                r#"
                INSERT INTO review_decisions (asset_id, group_id, decision, exception, decided_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(asset_id) DO UPDATE SET
                    group_id = excluded.group_id,
                    decision = excluded.decision,
                    exception = excluded.exception,
                    decided_at = excluded.decided_at
                "#,
            )
            .bind(&d.asset_id)
            .bind(group_id)
            .bind(d.decision.as_str())
            .bind(d.exception)
            .bind(d.decided_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(DecisionWrite::Written)
    }

    async fn clear_decisions(&self, group_id: Option<&str>) -> Result<usize> {
        let result = match group_id {
            Some(gid) => {
                sqlx::query("DELETE FROM review_decisions WHERE group_id = ?")
                    .bind(gid)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM review_decisions")
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() as usize)
    }

    async fn clear_asset_decision(&self, asset_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM review_decisions WHERE asset_id = ?")
            .bind(asset_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_decisions(&self, decision: Option<Decision>) -> Result<Vec<ReviewDecision>> {
        let rows = match decision {
            Some(d) => {
                sqlx::query(
                    r#"
                    SELECT asset_id, group_id, decision, exception, decided_at
                    FROM review_decisions
                    WHERE decision = ?
                    ORDER BY group_id, asset_id
                    "#,
                )
                .bind(d.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT asset_id, group_id, decision, exception, decided_at
                    FROM review_decisions
                    ORDER BY group_id, asset_id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_decision).collect()
    }
}
