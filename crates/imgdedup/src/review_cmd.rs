//! `dedup review`: operator commands over the review state machine.
//!
//! Each subcommand is a thin adapter: open the store, call one
//! [`ReviewMachine`] operation, print the result.

use anyhow::Result;

use imgdedup_core::models::Decision;
use imgdedup_core::review::{GroupReview, ReviewMachine, Selection};
use imgdedup_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    Ok(SqliteStore::new(pool))
}

async fn print_group(store: &SqliteStore, review: &GroupReview) -> Result<()> {
    println!("group {} ({})", review.group.group_id, review.state.as_str());
    println!("  model: {}", review.group.model_version);
    println!("  threshold: {}", review.group.threshold);
    println!("  representative: {}", review.group.representative_asset_id);
    println!(
        "  keep: {}  delete: {}  pending: {}",
        review.keeps, review.deletes, review.pending
    );
    for member in &review.members {
        let path = store
            .get_asset(&member.asset_id)
            .await?
            .map(|a| a.path)
            .unwrap_or_else(|| "<unknown>".to_string());
        let marker = if member.exception { "  [exception]" } else { "" };
        println!(
            "    {:<7} {}  {}{}",
            member.decision.as_str(),
            member.asset_id,
            path,
            marker
        );
    }
    Ok(())
}

pub async fn run_list(config: &Config, all: bool) -> Result<()> {
    let store = open_store(config).await?;
    let review = ReviewMachine::new(&store);
    let groups = if all {
        review.list().await?
    } else {
        review.unresolved_groups().await?
    };

    println!("review list{}", if all { "" } else { " (unresolved)" });
    println!("  groups: {}", groups.len());
    for g in &groups {
        println!(
            "  {}  {:<10} members: {}  pending: {}",
            g.group.group_id,
            g.state.as_str(),
            g.members.len(),
            g.pending
        );
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_show(config: &Config, group_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let status = ReviewMachine::new(&store).status(group_id).await?;
    print_group(&store, &status).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_resolve(
    config: &Config,
    group_id: &str,
    keep: Option<String>,
    override_existing: bool,
) -> Result<()> {
    let store = open_store(config).await?;
    let selection = keep.map(Selection::Asset).unwrap_or_default();
    let result = ReviewMachine::new(&store)
        .resolve_keep_one(group_id, selection, override_existing)
        .await?;
    print_group(&store, &result).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_set(
    config: &Config,
    asset_id: &str,
    decision: Decision,
    allow_exception: bool,
) -> Result<()> {
    let store = open_store(config).await?;
    let result = ReviewMachine::new(&store)
        .override_decision(asset_id, decision, allow_exception)
        .await?;
    print_group(&store, &result).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_ignore(config: &Config, group_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let result = ReviewMachine::new(&store).ignore_group(group_id).await?;
    print_group(&store, &result).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_delete_all(config: &Config, group_id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let result = ReviewMachine::new(&store).delete_all(group_id).await?;
    print_group(&store, &result).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_reset(config: &Config, group_id: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let review = ReviewMachine::new(&store);
    let cleared = match group_id {
        Some(gid) => review.reset_group(gid).await?,
        None => review.reset_all().await?,
    };
    println!("review reset");
    println!("  group: {}", group_id.unwrap_or("all"));
    println!("  decisions cleared: {}", cleared);
    store.pool().close().await;
    Ok(())
}

/// Print the deletion plan for the external executor.
pub async fn run_plan(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let plan = ReviewMachine::new(&store).deletion_plan().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("review plan");
        println!("  deletions: {}", plan.len());
        for c in &plan {
            let marker = if c.exception { "  [exception]" } else { "" };
            println!("  {}  {}  {}{}", c.group_id, c.asset_id, c.path, marker);
        }
    }

    store.pool().close().await;
    Ok(())
}
