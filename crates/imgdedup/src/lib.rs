//! # imgdedup
//!
//! **Near-duplicate image detection with an operator review workflow.**
//!
//! imgdedup registers the images under a directory, embeds each one with a
//! configured provider, groups images whose embeddings are within a cosine
//! similarity threshold, and tracks the operator's keep/delete decisions per
//! group. Deleting files is left to an external executor that consumes the
//! deletion plan.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌───────────┐
//! │  Scan +  │──▶│  Provider  │──▶│  SQLite  │──▶│ Clusters  │
//! │ Registry │   │  (embed)   │   │  store   │   │ + Review  │
//! └──────────┘   └────────────┘   └──────────┘   └─────┬─────┘
//!                                                      ▼
//!                                               deletion plan
//! ```
//!
//! The domain logic (registry, embedding store, cluster builder, review
//! state machine) lives in `imgdedup-core` and runs against any
//! [`Store`](imgdedup_core::store::Store). This crate supplies the SQLite
//! store, the embedding providers, and the `dedup` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! dedup init
//! dedup index ./photos
//! dedup cluster --threshold 0.92
//! dedup review list
//! dedup review resolve g-3f2a9c0d1b7e4a65
//! dedup review plan --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | `Store` implementation over SQLite |
//! | [`scan`] | Directory walk and content signatures |
//! | [`embedding`] | Embedding providers: `thumbnail`, `http`, `disabled` |
//! | [`index_cmd`] | `dedup index`: register and embed |
//! | [`cluster_cmd`] | `dedup cluster`: rebuild groups |
//! | [`review_cmd`] | `dedup review`: operator decisions and deletion plan |
//! | [`stats`] | `dedup stats`: database counts |
//! | [`logging`] | tracing subscriber setup |

pub mod cluster_cmd;
pub mod config;
pub mod db;
pub mod embedding;
pub mod index_cmd;
pub mod logging;
pub mod migrate;
pub mod review_cmd;
pub mod scan;
pub mod sqlite_store;
pub mod stats;
