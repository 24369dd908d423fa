use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::info;

use super::clip_model::{load_config, ClipModel};
use super::fetch::{decode_image, ImageFetcher};
use super::hub::ModelSource;
use super::transform::CLIP_TRANSFORM;
use super::vector::l2_normalize;
use super::{Embedder, ModelFamily};

/// CLIP text context length; every prompt is padded or cut to this.
pub const CONTEXT_LENGTH: usize = 77;
const END_OF_TEXT: &str = "<|endoftext|>";

/// CLIP image and text towers sharing one embedding space.
pub struct ClipService {
    inner: Arc<ClipModelHandle>,
    fetcher: ImageFetcher,
    model_id: String,
}

struct ClipModelHandle {
    model: ClipModel,
    tokenizer: Tokenizer,
    device: Device,
    eot_id: u32,
}

impl ClipService {
    /// Blocking: resolves files (possibly downloading) and maps weights.
    pub fn load(source: &ModelSource, device: Device, fetcher: ImageFetcher) -> Result<Self> {
        let files = source.resolve(&["config.json", "model.safetensors", "tokenizer.json"])?;
        let config = load_config(&files[0])?;
        let (weights, tokenizer_path) = (files[1].clone(), &files[2]);

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", tokenizer_path.display()))?;
        tokenizer.with_padding(None);
        let _ = tokenizer.with_truncation(None);
        let eot_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| anyhow!("{END_OF_TEXT} missing from {}", tokenizer_path.display()))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.clone()], DType::F32, &device)
                .map_err(|e| anyhow!("failed to load {}: {e}", weights.display()))?
        };
        let model = ClipModel::load(vb, &config).context("failed to build CLIP")?;

        let model_id = source.to_string();
        info!(
            model = %model_id,
            device = ?device,
            text_act = %config.text().hidden_act,
            vision_act = %config.vision().hidden_act,
            "CLIP loaded"
        );

        Ok(Self {
            inner: Arc::new(ClipModelHandle {
                model,
                tokenizer,
                device,
                eot_id,
            }),
            fetcher,
            model_id,
        })
    }

    /// Embed an already decoded image on the calling thread.
    pub fn embed_decoded_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.inner.embed_image(image)
    }

    /// Embed `text` on the calling thread.
    pub fn embed_text_blocking(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed_text(text)
    }
}

impl ClipModelHandle {
    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let pixels = CLIP_TRANSFORM.to_tensor(image, &self.device)?;
        let features = self
            .model
            .image_features(&pixels)
            .context("CLIP image forward pass failed")?;
        unit_vector(features)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let enc = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("CLIP tokenizer encode error: {e}"))?;
        let ids = fit_context(enc.get_ids().to_vec(), self.eot_id);
        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let features = self
            .model
            .text_features(&input, end_of_text_position(&ids))
            .context("CLIP text forward pass failed")?;
        unit_vector(features)
    }
}

fn unit_vector(features: Tensor) -> Result<Vec<f32>> {
    let values = features
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    l2_normalize(values)
}

/// Pad with zeros (or cut) to the context length. A cut sequence keeps
/// end-of-text as its final token since pooling reads the position of the
/// largest id.
fn fit_context(mut ids: Vec<u32>, eot_id: u32) -> Vec<u32> {
    if ids.len() > CONTEXT_LENGTH {
        ids.truncate(CONTEXT_LENGTH);
        ids[CONTEXT_LENGTH - 1] = eot_id;
    } else {
        ids.resize(CONTEXT_LENGTH, 0);
    }
    ids
}

/// Index of the largest id, which is end-of-text in the CLIP vocabulary.
fn end_of_text_position(ids: &[u32]) -> usize {
    ids.iter()
        .enumerate()
        .max_by_key(|&(index, &id)| (id, std::cmp::Reverse(index)))
        .map_or(0, |(index, _)| index)
}

#[async_trait]
impl Embedder for ClipService {
    fn family(&self) -> ModelFamily {
        ModelFamily::Clip
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_image(&self, url: &str) -> Result<Vec<f32>> {
        let bytes = self.fetcher.fetch(url).await?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let image = decode_image(&bytes)?;
            inner.embed_image(&image)
        })
        .await
        .context("CLIP image worker panicked")?
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let inner = self.inner.clone();
        let text = text.to_owned();
        tokio::task::spawn_blocking(move || inner.embed_text(&text))
            .await
            .context("CLIP text worker panicked")?
    }
}
