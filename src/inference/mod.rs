pub mod clip;
pub mod clip_model;
pub mod device;
pub mod dinov2;
pub mod fetch;
pub mod hub;
pub mod interpolate;
pub mod transform;
pub mod vector;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

pub use clip::ClipService;
pub use dinov2::Dinov2Service;
pub use fetch::ImageFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Clip,
    Dinov2,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Clip => "clip",
            ModelFamily::Dinov2 => "dinov2",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded embedding model. Handles are immutable once built and are shared
/// across requests behind an `Arc`.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn family(&self) -> ModelFamily;

    /// Identifier of the loaded weights (hub repo or snapshot path).
    fn model_id(&self) -> &str;

    /// Fetch the image at `url` and embed it.
    async fn embed_image(&self, url: &str) -> Result<Vec<f32>>;

    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Err(anyhow!("{} does not support text embeddings", self.family()))
    }
}
