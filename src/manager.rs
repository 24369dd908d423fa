use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::ServiceConfig;
use crate::inference::device::build_device;
use crate::inference::{ClipService, Dinov2Service, Embedder, ImageFetcher, ModelFamily};

/// Loaded model handles, one per enabled family. Built once at startup and
/// shared read-only with every request.
#[derive(Clone, Default)]
pub struct ModelManager {
    pub clip: Option<Arc<dyn Embedder>>,
    pub dinov2: Option<Arc<dyn Embedder>>,
}

impl ModelManager {
    pub fn new(clip: Option<Arc<dyn Embedder>>, dinov2: Option<Arc<dyn Embedder>>) -> Self {
        Self { clip, dinov2 }
    }

    /// Load every family listed in the config. Any failure aborts startup.
    pub async fn load(config: &ServiceConfig) -> Result<Self> {
        let device = build_device(config.device)?;
        let fetcher = ImageFetcher::new(config.fetch_timeout)?;
        let mut models = Self::default();

        for &family in &config.families {
            let source = config.source_for(family).clone();
            let device = device.clone();
            let fetcher = fetcher.clone();
            info!(%family, %source, "loading model");

            let embedder: Arc<dyn Embedder> = tokio::task::spawn_blocking(move || {
                let loaded: Arc<dyn Embedder> = match family {
                    ModelFamily::Clip => Arc::new(ClipService::load(&source, device, fetcher)?),
                    ModelFamily::Dinov2 => {
                        Arc::new(Dinov2Service::load(&source, device, fetcher)?)
                    }
                };
                anyhow::Ok(loaded)
            })
            .await
            .context("model loader panicked")?
            .with_context(|| format!("failed to load {family}"))?;

            match family {
                ModelFamily::Clip => models.clip = Some(embedder),
                ModelFamily::Dinov2 => models.dinov2 = Some(embedder),
            }
        }

        Ok(models)
    }

    pub fn loaded(&self) -> Vec<Arc<dyn Embedder>> {
        self.clip.iter().chain(self.dinov2.iter()).cloned().collect()
    }
}
