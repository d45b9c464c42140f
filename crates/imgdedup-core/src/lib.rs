//! # imgdedup core
//!
//! Pure logic for near-duplicate image detection: asset bookkeeping,
//! per-model embedding storage, similarity clustering, and the review
//! state machine that turns duplicate groups into keep/delete decisions.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Persistence is
//! reached only through the [`store::Store`] trait and embedding models only
//! through the [`embedding::ImageEmbedder`] trait; the `imgdedup` app crate
//! supplies the concrete implementations.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Asset, embedding, group, and decision records |
//! | [`error`] | [`DedupError`] |
//! | [`store`] | Storage trait and in-memory backend |
//! | [`registry`] | Asset Registry: new / changed / unchanged detection |
//! | [`embedding`] | Embedder trait, Embedding Store, vector utilities |
//! | [`cluster`] | Cluster Builder: neighbor backends + union-find |
//! | [`review`] | Review State Machine |

pub mod cluster;
pub mod embedding;
pub mod error;
pub mod models;
pub mod registry;
pub mod review;
pub mod store;

pub use error::DedupError;
