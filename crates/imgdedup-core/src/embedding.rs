//! Embedding provider trait, the Embedding Store, and vector utilities.
//!
//! The [`ImageEmbedder`] trait is the injected model capability; concrete
//! providers (HTTP, built-in thumbnail) live in the `imgdedup` app crate.
//! [`EmbeddingStore`] wraps a [`Store`] with a declared
//! `(model_version, dims)` pair and enforces the dimension on every read
//! and write.

use async_trait::async_trait;
use tracing::warn;

use crate::cluster::{ClusterInput, ClusterPoint, RejectedVector};
use crate::error::{DedupError, Result};
use crate::models::{AssetStatus, Embedding};
use crate::store::{SnapshotEntry, Store};

/// One image handed to an [`ImageEmbedder`].
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub asset_id: String,
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Trait for image embedding providers.
///
/// `embed_batch` returns one result per input, in input order. The outer
/// error is reserved for failures that affect the whole batch (transport,
/// malformed response); a single undecodable image is reported in its own
/// slot so the rest of the batch still lands.
#[async_trait]
pub trait ImageEmbedder: Send + Sync {
    /// Model identifier, used as the embedding key (e.g. `"clip-vit-b32"`).
    fn model_version(&self) -> &str;

    /// Dimensionality of every vector this provider returns.
    fn dims(&self) -> usize;

    async fn embed_batch(&self, images: &[ImageInput])
        -> anyhow::Result<Vec<anyhow::Result<Vec<f32>>>>;
}

/// Vectors for one model version, with a fixed dimension.
pub struct EmbeddingStore<'a, S: Store + ?Sized> {
    store: &'a S,
    model_version: String,
    dims: usize,
}

impl<'a, S: Store + ?Sized> EmbeddingStore<'a, S> {
    pub fn new(store: &'a S, model_version: impl Into<String>, dims: usize) -> Self {
        Self {
            store,
            model_version: model_version.into(),
            dims,
        }
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Store `vector` as the current embedding of `asset_id`, replacing any
    /// prior vector under this model version.
    pub async fn put(&self, asset_id: &str, vector: Vec<f32>, content_hash: &str) -> Result<()> {
        self.check_dims(asset_id, vector.len())?;
        let embedding = Embedding {
            asset_id: asset_id.to_string(),
            model_version: self.model_version.clone(),
            vector,
            content_hash: content_hash.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.put_embedding(&embedding).await?;
        Ok(())
    }

    pub async fn get(&self, asset_id: &str) -> Result<Option<Embedding>> {
        match self
            .store
            .get_embedding(asset_id, &self.model_version)
            .await?
        {
            Some(e) => {
                self.check_dims(asset_id, e.vector.len())?;
                Ok(Some(e))
            }
            None => Ok(None),
        }
    }

    /// Lazily page through every embedding of this model version.
    pub fn all(&self, page_size: usize) -> EmbeddingCursor<'_, 'a, S> {
        EmbeddingCursor {
            owner: self,
            page_size: page_size.max(1),
            after: None,
            done: false,
        }
    }

    /// Read every active asset's vector as clustering input.
    ///
    /// The read is a single point-in-time view of the store (see
    /// [`Store::active_embeddings`]), so concurrent indexing never mixes
    /// old and new vectors into one pass. Entries with the wrong dimension
    /// are returned in [`ClusterInput::rejected`].
    pub async fn snapshot(&self, page_size: usize) -> Result<ClusterInput> {
        let entries = self
            .store
            .active_embeddings(&self.model_version, page_size.max(1))
            .await?;

        let mut input = ClusterInput::default();
        for SnapshotEntry {
            embedding,
            registered_at,
        } in entries
        {
            match self.check_dims(&embedding.asset_id, embedding.vector.len()) {
                Ok(()) => input.points.push(ClusterPoint {
                    asset_id: embedding.asset_id,
                    registered_at,
                    vector: embedding.vector,
                }),
                Err(DedupError::DimensionMismatch {
                    asset_id,
                    expected,
                    actual,
                }) => {
                    warn!(asset_id = %asset_id, expected, actual, "skipping embedding");
                    input.rejected.push(RejectedVector {
                        asset_id,
                        expected,
                        actual,
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(input)
    }

    /// Active assets with no embedding under this model version.
    pub async fn missing_count(&self) -> Result<usize> {
        let mut missing = 0;
        for asset in self.store.list_assets().await? {
            if asset.status != AssetStatus::Active {
                continue;
            }
            if self
                .store
                .get_embedding(&asset.id, &self.model_version)
                .await?
                .is_none()
            {
                missing += 1;
            }
        }
        Ok(missing)
    }

    fn check_dims(&self, asset_id: &str, actual: usize) -> Result<()> {
        if actual != self.dims {
            return Err(DedupError::DimensionMismatch {
                asset_id: asset_id.to_string(),
                expected: self.dims,
                actual,
            });
        }
        Ok(())
    }
}

/// Keyset cursor returned by [`EmbeddingStore::all`].
///
/// Each page yields per-entry results: a stored vector with the wrong
/// length comes back as [`DedupError::DimensionMismatch`] in its own slot
/// and does not end the sequence.
pub struct EmbeddingCursor<'c, 'a, S: Store + ?Sized> {
    owner: &'c EmbeddingStore<'a, S>,
    page_size: usize,
    after: Option<String>,
    done: bool,
}

impl<S: Store + ?Sized> EmbeddingCursor<'_, '_, S> {
    /// Fetch the next page, or `None` once the store is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Result<Embedding>>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .owner
            .store
            .embedding_page(
                &self.owner.model_version,
                self.after.as_deref(),
                self.page_size,
            )
            .await?;
        if page.len() < self.page_size {
            self.done = true;
        }
        let Some(last) = page.last() else {
            return Ok(None);
        };
        self.after = Some(last.asset_id.clone());

        let owner = self.owner;
        Ok(Some(
            page.into_iter()
                .map(|e| {
                    owner.check_dims(&e.asset_id, e.vector.len())?;
                    Ok(e)
                })
                .collect(),
        ))
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing bytes that do not
/// form a whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Slack allowed below the threshold when deciding a link. Absorbs float
/// rounding so that identical vectors link even at a threshold of `1.0`.
pub const SIMILARITY_TOLERANCE: f64 = 1e-6;

fn similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0))
}

/// Cosine similarity in `[-1.0, 1.0]`, accumulated in `f64`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, and
/// zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    similarity(a, b).unwrap_or(0.0)
}

/// Whether `a` and `b` link at `threshold`.
///
/// Degenerate pairs (see [`cosine_similarity`]) never link, whatever the
/// threshold.
pub fn links_at(a: &[f32], b: &[f32], threshold: f32) -> bool {
    similarity(a, b)
        .is_some_and(|s| s >= f64::from(threshold) - SIMILARITY_TOLERANCE)
}

/// Scale `v` to unit length in place. Zero-norm vectors are left as zeros.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        v.iter_mut().for_each(|x| *x = 0.0);
        return;
    }
    v.iter_mut().for_each(|x| *x /= norm);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Asset, ContentSignature};
    use crate::store::memory::InMemoryStore;

    async fn add_asset(store: &InMemoryStore, id: &str, created_at: i64, status: AssetStatus) {
        store
            .upsert_asset(&Asset {
                id: id.to_string(),
                path: format!("/img/{}.jpg", id),
                signature: ContentSignature {
                    size_bytes: 1,
                    mtime_ns: 1,
                    sha256: "00".to_string(),
                },
                status,
                created_at,
                updated_at: created_at,
                last_error: None,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_identical_vectors_link_at_full_threshold() {
        // Deterministic spread of magnitudes and signs across 64 dims.
        let mut state = 0x9e37_79b9_u32;
        for _ in 0..200 {
            let v: Vec<f32> = (0..64)
                .map(|_| {
                    state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                    (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
                })
                .collect();
            let mut unit = v.clone();
            normalize(&mut unit);
            assert!(links_at(&v, &v, 1.0));
            assert!(links_at(&unit, &unit, 1.0));
        }
    }

    #[test]
    fn test_links_reject_degenerate_pairs() {
        assert!(!links_at(&[0.0, 0.0], &[0.0, 0.0], 0.000_000_1));
        assert!(!links_at(&[1.0, 0.0], &[1.0], 0.5));
        assert!(!links_at(&[1.0, 0.0], &[0.0, 1.0], 0.5));
        assert!(links_at(&[1.0, 0.0], &[0.9, 0.1], 0.9));
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut z = vec![0.0, 0.0];
        normalize(&mut z);
        assert_eq!(z, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn put_rejects_wrong_dimension() {
        let store = InMemoryStore::new();
        let emb = EmbeddingStore::new(&store, "m1", 3);
        let err = emb.put("a", vec![1.0, 2.0], "h").await.unwrap_err();
        assert!(matches!(
            err,
            DedupError::DimensionMismatch {
                expected: 3,
                actual: 2,
                ..
            }
        ));
        assert!(emb.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_previous_vector() {
        let store = InMemoryStore::new();
        let emb = EmbeddingStore::new(&store, "m1", 2);
        emb.put("a", vec![1.0, 0.0], "h1").await.unwrap();
        emb.put("a", vec![0.0, 1.0], "h2").await.unwrap();
        let got = emb.get("a").await.unwrap().unwrap();
        assert_eq!(got.vector, vec![0.0, 1.0]);
        assert_eq!(got.content_hash, "h2");
        assert_eq!(store.count_embeddings(Some("m1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cursor_reports_bad_entries_without_stopping() {
        let store = InMemoryStore::new();
        for (id, v) in [("a", vec![1.0, 0.0]), ("b", vec![1.0]), ("c", vec![0.0, 1.0])] {
            store
                .put_embedding(&Embedding {
                    asset_id: id.to_string(),
                    model_version: "m1".to_string(),
                    vector: v,
                    content_hash: "h".to_string(),
                    created_at: 0,
                })
                .await
                .unwrap();
        }
        let emb = EmbeddingStore::new(&store, "m1", 2);
        assert!(emb.get("b").await.is_err());

        let mut cursor = emb.all(2);
        let mut ok = Vec::new();
        let mut bad = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            for entry in page {
                match entry {
                    Ok(e) => ok.push(e.asset_id),
                    Err(DedupError::DimensionMismatch { asset_id, .. }) => bad.push(asset_id),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }
        assert_eq!(ok, vec!["a", "c"]);
        assert_eq!(bad, vec!["b"]);
    }

    #[tokio::test]
    async fn snapshot_keeps_only_active_assets() {
        let store = InMemoryStore::new();
        add_asset(&store, "a", 10, AssetStatus::Active).await;
        add_asset(&store, "b", 20, AssetStatus::Missing).await;
        add_asset(&store, "c", 30, AssetStatus::Active).await;
        let emb = EmbeddingStore::new(&store, "m1", 2);
        emb.put("a", vec![1.0, 0.0], "h").await.unwrap();
        emb.put("b", vec![1.0, 0.0], "h").await.unwrap();

        let input = emb.snapshot(1).await.unwrap();
        assert_eq!(input.points.len(), 1);
        assert_eq!(input.points[0].asset_id, "a");
        assert_eq!(input.points[0].registered_at, 10);
        assert!(input.rejected.is_empty());
        assert_eq!(emb.missing_count().await.unwrap(), 1);
    }
}
