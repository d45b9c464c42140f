//! Embedding provider implementations.
//!
//! - **[`DisabledProvider`]**: always errors; used when embeddings are not configured.
//! - **[`HttpProvider`]**: POSTs base64-encoded images to an external model server.
//! - **[`ThumbnailProvider`]**: offline 8×8 grayscale thumbnail vectors.
//!
//! Use [`create_provider`] to instantiate the provider named in the config.
//!
//! # HTTP protocol
//!
//! ```text
//! POST <url>
//! {"model": "...", "images": [{"id": "<asset id>", "data": "<base64>"}, ...]}
//!
//! 200 OK
//! {"embeddings": [[0.12, ...], ...]}   // one vector per image, same order
//! ```
//!
//! A single attempt is made per batch, bounded by `embedding.timeout_secs`.
//! Failed assets are retried on the next `dedup index` run.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use image::imageops::FilterType;
use serde::Deserialize;
use std::time::Duration;

use imgdedup_core::embedding::{ImageEmbedder, ImageInput};

use crate::config::EmbeddingConfig;

/// Edge length of the thumbnail used by [`ThumbnailProvider`].
const THUMB_SIZE: u32 = 8;
const THUMB_MODEL: &str = "thumb-8x8-v1";

/// Instantiate the provider selected by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn ImageEmbedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "http" => Ok(Box::new(HttpProvider::new(config)?)),
        "thumbnail" => Ok(Box::new(ThumbnailProvider::new(config))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl ImageEmbedder for DisabledProvider {
    fn model_version(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed_batch(&self, _images: &[ImageInput]) -> Result<Vec<Result<Vec<f32>>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ HTTP Provider ============

/// Client for an external image-embedding server.
pub struct HttpProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for http provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for http provider"))?;
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("embedding.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

fn parse_response(body: &str, expected: usize) -> Result<Vec<Result<Vec<f32>>>> {
    let parsed: EmbedResponse =
        serde_json::from_str(body).context("Malformed embedding response")?;
    if parsed.embeddings.len() != expected {
        bail!(
            "Embedding server returned {} vectors for {} images",
            parsed.embeddings.len(),
            expected
        );
    }
    Ok(parsed.embeddings.into_iter().map(Ok).collect())
}

#[async_trait]
impl ImageEmbedder for HttpProvider {
    fn model_version(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, images: &[ImageInput]) -> Result<Vec<Result<Vec<f32>>>> {
        let engine = base64::engine::general_purpose::STANDARD;
        let payload: Vec<serde_json::Value> = images
            .iter()
            .map(|img| {
                serde_json::json!({
                    "id": img.asset_id,
                    "data": engine.encode(&img.bytes),
                })
            })
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "images": payload,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Embedding request to {} failed", self.url))?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("Embedding server error ({}): {}", status, text);
        }
        parse_response(&text, images.len())
    }
}

// ============ Thumbnail Provider ============

/// Built-in provider: each image becomes its 8×8 grayscale thumbnail,
/// flattened and mean-centred into a 64-dim vector.
///
/// Visually identical images (re-encodes, small brightness shifts) land
/// close together under cosine similarity. Useful for smoke runs without a
/// model server.
pub struct ThumbnailProvider {
    model: String,
}

impl ThumbnailProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| THUMB_MODEL.to_string()),
        }
    }
}

/// Decode `bytes` and compute its thumbnail vector.
pub fn thumbnail_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    let img = image::load_from_memory(bytes).context("Failed to decode image")?;
    let thumb = img
        .resize_exact(THUMB_SIZE, THUMB_SIZE, FilterType::Triangle)
        .to_luma8();
    let mut v: Vec<f32> = thumb.pixels().map(|p| p.0[0] as f32).collect();
    let mean = v.iter().sum::<f32>() / v.len() as f32;
    v.iter_mut().for_each(|x| *x -= mean);
    Ok(v)
}

#[async_trait]
impl ImageEmbedder for ThumbnailProvider {
    fn model_version(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        (THUMB_SIZE * THUMB_SIZE) as usize
    }

    async fn embed_batch(&self, images: &[ImageInput]) -> Result<Vec<Result<Vec<f32>>>> {
        let blobs: Vec<Vec<u8>> = images.iter().map(|i| i.bytes.clone()).collect();
        let results = tokio::task::spawn_blocking(move || {
            blobs
                .iter()
                .map(|b| thumbnail_vector(b))
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use imgdedup_core::embedding::cosine_similarity;
    use std::io::Cursor;

    fn png(f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let img = RgbImage::from_fn(32, 32, |x, y| {
            let v = f(x, y);
            image::Rgb([v, v, v])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn input(id: &str, bytes: Vec<u8>) -> ImageInput {
        ImageInput {
            asset_id: id.to_string(),
            path: format!("/{}.png", id),
            bytes,
        }
    }

    #[tokio::test]
    async fn thumbnail_separates_near_duplicates_from_others() {
        let provider = ThumbnailProvider::new(&EmbeddingConfig::default());
        assert_eq!(provider.dims(), 64);
        assert_eq!(provider.model_version(), "thumb-8x8-v1");

        let original = png(|x, _| (x * 8) as u8);
        let brighter = png(|x, _| (x * 8 + 6) as u8);
        let other = png(|_, y| (y * 8) as u8);
        let results = provider
            .embed_batch(&[
                input("a", original),
                input("b", brighter),
                input("c", other),
                input("d", b"not an image".to_vec()),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert!(results[3].is_err());

        let a = results[0].as_ref().unwrap();
        let b = results[1].as_ref().unwrap();
        let c = results[2].as_ref().unwrap();
        assert_eq!(a.len(), 64);
        assert!(cosine_similarity(a, b) > 0.99);
        assert!(cosine_similarity(a, c) < 0.5);
    }

    #[tokio::test]
    async fn disabled_provider_refuses() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_version(), "disabled");
        assert!(provider.embed_batch(&[]).await.is_err());
    }

    #[test]
    fn http_response_must_match_batch() {
        let ok = parse_response(r#"{"embeddings": [[1.0, 0.0], [0.0, 1.0]]}"#, 2).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(parse_response(r#"{"embeddings": [[1.0, 0.0]]}"#, 2).is_err());
        assert!(parse_response("not json", 1).is_err());
    }

    #[test]
    fn http_provider_needs_url() {
        let cfg = EmbeddingConfig {
            provider: "http".to_string(),
            model: Some("clip".to_string()),
            dims: Some(512),
            ..EmbeddingConfig::default()
        };
        assert!(HttpProvider::new(&cfg).is_err());
    }
}
