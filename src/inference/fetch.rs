use anyhow::{Context, Result};
use image::DynamicImage;
use std::time::Duration;

/// HTTP client for pulling source images by URL.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().user_agent(concat!("embedserve/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("failed to build image HTTP client")?;
        Ok(Self { client })
    }

    /// Download the raw bytes at `url`. Non-2xx responses are errors.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("image host rejected {url}"))?;

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("failed to decode image")
}
