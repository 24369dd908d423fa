use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use candle::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};
use image::DynamicImage;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::fetch::{decode_image, ImageFetcher};
use super::hub::ModelSource;
use super::interpolate::bicubic_resize_grid;
use super::transform::DINOV2_TRANSFORM;
use super::{Embedder, ModelFamily};

/// The subset of a Hugging Face `Dinov2Config` the backbone needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Dinov2Config {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_true")]
    pub qkv_bias: bool,
    #[serde(default)]
    pub use_swiglu_ffn: bool,
}

fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_patch_size() -> usize {
    14
}
fn default_image_size() -> usize {
    518
}
fn default_layer_norm_eps() -> f64 {
    1e-6
}
fn default_num_channels() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Dinov2Config {
    fn validate(&self) -> Result<()> {
        if self.use_swiglu_ffn {
            bail!("SwiGLU feed-forward checkpoints are not supported");
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by {} heads",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        if self.image_size % self.patch_size != 0 {
            bail!(
                "image_size {} is not a multiple of patch_size {}",
                self.image_size,
                self.patch_size
            );
        }
        if DINOV2_TRANSFORM.crop as usize % self.patch_size != 0 {
            bail!(
                "crop size {} is not a multiple of patch_size {}",
                DINOV2_TRANSFORM.crop,
                self.patch_size
            );
        }
        Ok(())
    }
}

fn load_config(path: &Path) -> Result<Dinov2Config> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config: Dinov2Config = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

struct Embeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    projection: Conv2d,
}

impl Embeddings {
    /// Position embeddings are resampled once from the pretraining grid to
    /// the fixed crop grid so the forward pass is a plain add.
    fn load(vb: VarBuilder, cfg: &Dinov2Config, crop_grid: usize) -> Result<Self> {
        let dim = cfg.hidden_size;
        let cls_token = vb.get((1, 1, dim), "cls_token")?;

        let pretrain_grid = cfg.image_size / cfg.patch_size;
        let stored = vb.get((1, pretrain_grid * pretrain_grid + 1, dim), "position_embeddings")?;
        let flat = stored
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let (cls_pos, grid_pos) = flat.split_at(dim);
        let mut resampled = cls_pos.to_vec();
        resampled.extend(bicubic_resize_grid(grid_pos, dim, pretrain_grid, crop_grid));
        let position_embeddings =
            Tensor::from_vec(resampled, (1, crop_grid * crop_grid + 1, dim), vb.device())?
                .to_dtype(vb.dtype())?;

        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let projection = candle_nn::conv2d(
            cfg.num_channels,
            dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embeddings").pp("projection"),
        )?;

        Ok(Self {
            cls_token,
            position_embeddings,
            projection,
        })
    }

    fn forward(&self, pixels: &Tensor) -> candle::Result<Tensor> {
        let patches = self.projection.forward(pixels)?;
        let (batch, dim, _, _) = patches.dims4()?;
        let patches = patches.flatten_from(2)?.transpose(1, 2)?;
        let cls = self.cls_token.expand((batch, 1, dim))?;
        Tensor::cat(&[&cls, &patches], 1)?.broadcast_add(&self.position_embeddings)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, cfg: &Dinov2Config) -> Result<Self> {
        let dim = cfg.hidden_size;
        let qkv = |name: &str| -> candle::Result<Linear> {
            let vb = vb.pp("attention").pp(name);
            if cfg.qkv_bias {
                candle_nn::linear(dim, dim, vb)
            } else {
                candle_nn::linear_no_bias(dim, dim, vb)
            }
        };
        Ok(Self {
            query: qkv("query")?,
            key: qkv("key")?,
            value: qkv("value")?,
            output: candle_nn::linear(dim, dim, vb.pp("output").pp("dense"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: dim / cfg.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        let (batch, seq, dim) = xs.dims3()?;
        let heads = |t: Tensor| -> candle::Result<Tensor> {
            t.reshape((batch, seq, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.query.forward(xs)?)?;
        let k = heads(self.key.forward(xs)?)?;
        let v = heads(self.value.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, dim))?;
        self.output.forward(&context)
    }
}

struct EncoderLayer {
    norm1: LayerNorm,
    attention: SelfAttention,
    layer_scale1: Tensor,
    norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    layer_scale2: Tensor,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, cfg: &Dinov2Config) -> Result<Self> {
        let dim = cfg.hidden_size;
        let hidden = (dim as f64 * cfg.mlp_ratio) as usize;
        Ok(Self {
            norm1: candle_nn::layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attention: SelfAttention::load(vb.pp("attention"), cfg)?,
            layer_scale1: vb.pp("layer_scale1").get(dim, "lambda1")?,
            norm2: candle_nn::layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm2"))?,
            fc1: candle_nn::linear(dim, hidden, vb.pp("mlp").pp("fc1"))?,
            fc2: candle_nn::linear(hidden, dim, vb.pp("mlp").pp("fc2"))?,
            layer_scale2: vb.pp("layer_scale2").get(dim, "lambda1")?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        let attended = self
            .attention
            .forward(&self.norm1.forward(xs)?)?
            .broadcast_mul(&self.layer_scale1)?;
        let xs = (xs + attended)?;

        let mlp = self
            .fc2
            .forward(&self.fc1.forward(&self.norm2.forward(&xs)?)?.gelu_erf()?)?
            .broadcast_mul(&self.layer_scale2)?;
        xs + mlp
    }
}

/// DINOv2 ViT backbone in the Hugging Face `Dinov2Model` weight layout.
pub struct Dinov2Backbone {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    layernorm: LayerNorm,
}

impl Dinov2Backbone {
    pub fn load(vb: VarBuilder, cfg: &Dinov2Config) -> Result<Self> {
        let crop_grid = DINOV2_TRANSFORM.crop as usize / cfg.patch_size;
        let embeddings = Embeddings::load(vb.pp("embeddings"), cfg, crop_grid)?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::load(vb.pp("encoder").pp("layer").pp(i), cfg))
            .collect::<Result<Vec<_>>>()?;
        let layernorm = candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layernorm"))?;
        Ok(Self {
            embeddings,
            layers,
            layernorm,
        })
    }

    /// Final layer-normed hidden state, `(batch, tokens, hidden)`.
    pub fn forward(&self, pixels: &Tensor) -> candle::Result<Tensor> {
        let mut xs = self.embeddings.forward(pixels)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        self.layernorm.forward(&xs)
    }
}

/// DINOv2 image embedder. Returns the raw CLS token of the last hidden state.
pub struct Dinov2Service {
    inner: Arc<Dinov2Handle>,
    fetcher: ImageFetcher,
    model_id: String,
}

struct Dinov2Handle {
    backbone: Dinov2Backbone,
    device: Device,
}

impl Dinov2Service {
    /// Blocking: resolves files (possibly downloading) and maps weights.
    pub fn load(source: &ModelSource, device: Device, fetcher: ImageFetcher) -> Result<Self> {
        let files = source.resolve(&["config.json", "model.safetensors"])?;
        let config = load_config(&files[0])?;
        let weights = files[1].clone();

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.clone()], DType::F32, &device)
                .map_err(|e| anyhow!("failed to load {}: {e}", weights.display()))?
        };
        let backbone = Dinov2Backbone::load(vb, &config).context("failed to build DINOv2")?;

        let model_id = source.to_string();
        info!(
            model = %model_id,
            device = ?device,
            hidden = config.hidden_size,
            layers = config.num_hidden_layers,
            "DINOv2 loaded"
        );

        Ok(Self {
            inner: Arc::new(Dinov2Handle { backbone, device }),
            fetcher,
            model_id,
        })
    }

    /// Embed an already decoded image on the calling thread.
    pub fn embed_decoded_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.inner.embed_image(image)
    }
}

impl Dinov2Handle {
    fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let pixels = DINOV2_TRANSFORM.to_tensor(image, &self.device)?;
        let hidden = self
            .backbone
            .forward(&pixels)
            .context("DINOv2 forward pass failed")?;
        Ok(hidden.i((0, 0))?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

#[async_trait]
impl Embedder for Dinov2Service {
    fn family(&self) -> ModelFamily {
        ModelFamily::Dinov2
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
        .context("DINOv2 image worker panicked")?
    }
}
