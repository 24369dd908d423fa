use anyhow::{bail, Context, Result};
use candle::{Device, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::transform::CLIP_TRANSFORM;

/// Feed-forward activation named by `hidden_act` in a Hugging Face CLIP config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    QuickGelu,
    Gelu,
    GeluTanh,
}

impl Activation {
    pub fn from_hf(name: &str) -> Result<Self> {
        Ok(match name {
            "quick_gelu" => Activation::QuickGelu,
            "gelu" => Activation::Gelu,
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Activation::GeluTanh,
            other => bail!("unsupported CLIP activation '{other}'"),
        })
    }

    fn forward(self, xs: &Tensor) -> candle::Result<Tensor> {
        match self {
            Activation::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?,
            Activation::Gelu => xs.gelu_erf(),
            Activation::GeluTanh => xs.gelu(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub hidden_act: String,
    pub layer_norm_eps: f64,
}

impl Default for ClipTextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 49408,
            hidden_size: 512,
            intermediate_size: 2048,
            num_hidden_layers: 12,
            num_attention_heads: 8,
            max_position_embeddings: 77,
            hidden_act: "quick_gelu".into(),
            layer_norm_eps: 1e-5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub hidden_act: String,
    pub layer_norm_eps: f64,
}

impl Default for ClipVisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            num_channels: 3,
            image_size: 224,
            patch_size: 32,
            hidden_act: "quick_gelu".into(),
            layer_norm_eps: 1e-5,
        }
    }
}

/// The parts of a Hugging Face `CLIPConfig` the two towers need. Older
/// exports keep the tower settings under `*_config_dict` instead.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipConfig {
    #[serde(default)]
    text_config: Option<ClipTextConfig>,
    #[serde(default)]
    text_config_dict: Option<ClipTextConfig>,
    #[serde(default)]
    vision_config: Option<ClipVisionConfig>,
    #[serde(default)]
    vision_config_dict: Option<ClipVisionConfig>,
    #[serde(default = "default_projection_dim")]
    pub projection_dim: usize,
}

fn default_projection_dim() -> usize {
    512
}

impl ClipConfig {
    pub fn text(&self) -> ClipTextConfig {
        self.text_config
            .clone()
            .or_else(|| self.text_config_dict.clone())
            .unwrap_or_default()
    }

    pub fn vision(&self) -> ClipVisionConfig {
        self.vision_config
            .clone()
            .or_else(|| self.vision_config_dict.clone())
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        let (text, vision) = (self.text(), self.vision());
        for (tower, hidden, heads) in [
            ("text", text.hidden_size, text.num_attention_heads),
            ("vision", vision.hidden_size, vision.num_attention_heads),
        ] {
            if heads == 0 || hidden % heads != 0 {
                bail!("{tower} hidden_size {hidden} is not divisible by {heads} heads");
            }
        }
        if vision.image_size != CLIP_TRANSFORM.crop as usize {
            bail!(
                "vision image_size {} does not match the {} pixel crop",
                vision.image_size,
                CLIP_TRANSFORM.crop
            );
        }
        if vision.patch_size == 0 || vision.image_size % vision.patch_size != 0 {
            bail!(
                "image_size {} is not a multiple of patch_size {}",
                vision.image_size,
                vision.patch_size
            );
        }
        Activation::from_hf(&text.hidden_act)?;
        Activation::from_hf(&vision.hidden_act)?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<ClipConfig> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config: ClipConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Layer sizes shared by both towers' encoder stacks.
#[derive(Debug, Clone, Copy)]
struct EncoderShape {
    hidden: usize,
    intermediate: usize,
    heads: usize,
    layers: usize,
    act: Activation,
    eps: f64,
}

impl EncoderShape {
    fn text(cfg: &ClipTextConfig) -> Result<Self> {
        Ok(Self {
            hidden: cfg.hidden_size,
            intermediate: cfg.intermediate_size,
            heads: cfg.num_attention_heads,
            layers: cfg.num_hidden_layers,
            act: Activation::from_hf(&cfg.hidden_act)?,
            eps: cfg.layer_norm_eps,
        })
    }

    fn vision(cfg: &ClipVisionConfig) -> Result<Self> {
        Ok(Self {
            hidden: cfg.hidden_size,
            intermediate: cfg.intermediate_size,
            heads: cfg.num_attention_heads,
            layers: cfg.num_hidden_layers,
            act: Activation::from_hf(&cfg.hidden_act)?,
            eps: cfg.layer_norm_eps,
        })
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, shape: &EncoderShape) -> Result<Self> {
        let dim = shape.hidden;
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            num_heads: shape.heads,
            head_dim: dim / shape.heads,
        })
    }

    fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> candle::Result<Tensor> {
        let (batch, seq, dim) = xs.dims3()?;
        let heads = |t: Tensor| -> candle::Result<Tensor> {
            t.reshape((batch, seq, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(self.q_proj.forward(xs)?)?;
        let k = heads(self.k_proj.forward(xs)?)?;
        let v = heads(self.v_proj.forward(xs)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.t()?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, dim))?;
        self.out_proj.forward(&context)
    }
}

struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    act: Activation,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, shape: &EncoderShape) -> Result<Self> {
        let dim = shape.hidden;
        Ok(Self {
            layer_norm1: candle_nn::layer_norm(dim, shape.eps, vb.pp("layer_norm1"))?,
            self_attn: Attention::load(vb.pp("self_attn"), shape)?,
            layer_norm2: candle_nn::layer_norm(dim, shape.eps, vb.pp("layer_norm2"))?,
            fc1: candle_nn::linear(dim, shape.intermediate, vb.pp("mlp").pp("fc1"))?,
            fc2: candle_nn::linear(shape.intermediate, dim, vb.pp("mlp").pp("fc2"))?,
            act: shape.act,
        })
    }

    fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> candle::Result<Tensor> {
        let attended = self
            .self_attn
            .forward(&self.layer_norm1.forward(xs)?, mask)?;
        let xs = (xs + attended)?;

        let hidden = self.fc1.forward(&self.layer_norm2.forward(&xs)?)?;
        let mlp = self.fc2.forward(&self.act.forward(&hidden)?)?;
        xs + mlp
    }
}

struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    fn load(vb: VarBuilder, shape: &EncoderShape) -> Result<Self> {
        let layers = (0..shape.layers)
            .map(|i| EncoderLayer::load(vb.pp("layers").pp(i), shape))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> candle::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs, mask)?;
        }
        Ok(xs)
    }
}

/// `(seq, seq)` additive mask hiding later positions.
fn causal_mask(seq: usize, device: &Device) -> candle::Result<Tensor> {
    let mask: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq, seq), device)
}

struct TextTower {
    token_embedding: Embedding,
    position_embedding: Embedding,
    encoder: Encoder,
    final_layer_norm: LayerNorm,
}

impl TextTower {
    fn load(vb: VarBuilder, cfg: &ClipTextConfig) -> Result<Self> {
        let shape = EncoderShape::text(cfg)?;
        let embeddings = vb.pp("embeddings");
        Ok(Self {
            token_embedding: candle_nn::embedding(
                cfg.vocab_size,
                cfg.hidden_size,
                embeddings.pp("token_embedding"),
            )?,
            position_embedding: candle_nn::embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                embeddings.pp("position_embedding"),
            )?,
            encoder: Encoder::load(vb.pp("encoder"), &shape)?,
            final_layer_norm: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
        })
    }

    fn forward(&self, input_ids: &Tensor, pooled_at: usize) -> candle::Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        let device = input_ids.device();
        let positions = Tensor::arange(0u32, seq as u32, device)?.unsqueeze(0)?;
        let xs = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)?;

        let mask = causal_mask(seq, device)?.to_dtype(xs.dtype())?;
        let xs = self.encoder.forward(&xs, Some(&mask))?;
        self.final_layer_norm.forward(&xs)?.i((.., pooled_at))
    }
}

struct VisionTower {
    class_embedding: Tensor,
    patch_embedding: Conv2d,
    position_embedding: Tensor,
    pre_layrnorm: LayerNorm,
    encoder: Encoder,
    post_layernorm: LayerNorm,
}

impl VisionTower {
    fn load(vb: VarBuilder, cfg: &ClipVisionConfig) -> Result<Self> {
        let shape = EncoderShape::vision(cfg)?;
        let dim = cfg.hidden_size;
        let embeddings = vb.pp("embeddings");
        let grid = cfg.image_size / cfg.patch_size;

        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        Ok(Self {
            class_embedding: embeddings.get(dim, "class_embedding")?,
            patch_embedding: candle_nn::conv2d_no_bias(
                cfg.num_channels,
                dim,
                cfg.patch_size,
                conv_cfg,
                embeddings.pp("patch_embedding"),
            )?,
            position_embedding: embeddings
                .pp("position_embedding")
                .get((grid * grid + 1, dim), "weight")?,
            // Hugging Face spells this one without the second "e".
            pre_layrnorm: candle_nn::layer_norm(dim, cfg.layer_norm_eps, vb.pp("pre_layrnorm"))?,
            encoder: Encoder::load(vb.pp("encoder"), &shape)?,
            post_layernorm: candle_nn::layer_norm(dim, cfg.layer_norm_eps, vb.pp("post_layernorm"))?,
        })
    }

    fn forward(&self, pixels: &Tensor) -> candle::Result<Tensor> {
        let patches = self.patch_embedding.forward(pixels)?;
        let (batch, dim, _, _) = patches.dims4()?;
        let patches = patches.flatten_from(2)?.transpose(1, 2)?;
        let cls = self.class_embedding.reshape((1, 1, dim))?.expand((batch, 1, dim))?;
        let xs = Tensor::cat(&[&cls, &patches], 1)?
            .broadcast_add(&self.position_embedding.unsqueeze(0)?)?;

        let xs = self.pre_layrnorm.forward(&xs)?;
        let xs = self.encoder.forward(&xs, None)?;
        self.post_layernorm.forward(&xs.i((.., 0))?)
    }
}

/// CLIP dual encoder in the Hugging Face `CLIPModel` weight layout. The
/// feed-forward activation follows each tower's `hidden_act`, so both
/// QuickGELU (OpenAI) and exact-GELU (LAION/open_clip) checkpoints load.
pub struct ClipModel {
    text: TextTower,
    vision: VisionTower,
    text_projection: Linear,
    visual_projection: Linear,
}

impl ClipModel {
    pub fn load(vb: VarBuilder, cfg: &ClipConfig) -> Result<Self> {
        let (text_cfg, vision_cfg) = (cfg.text(), cfg.vision());
        Ok(Self {
            text: TextTower::load(vb.pp("text_model"), &text_cfg)?,
            vision: VisionTower::load(vb.pp("vision_model"), &vision_cfg)?,
            text_projection: candle_nn::linear_no_bias(
                text_cfg.hidden_size,
                cfg.projection_dim,
                vb.pp("text_projection"),
            )?,
            visual_projection: candle_nn::linear_no_bias(
                vision_cfg.hidden_size,
                cfg.projection_dim,
                vb.pp("visual_projection"),
            )?,
        })
    }

    /// Projected image features, `(batch, projection_dim)`.
    pub fn image_features(&self, pixels: &Tensor) -> candle::Result<Tensor> {
        self.visual_projection.forward(&self.vision.forward(pixels)?)
    }

    /// Projected text features pooled at token `pooled_at` (end-of-text),
    /// `(batch, projection_dim)`.
    pub fn text_features(&self, input_ids: &Tensor, pooled_at: usize) -> candle::Result<Tensor> {
        self.text_projection
            .forward(&self.text.forward(input_ids, pooled_at)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;
    use candle_nn::VarMap;
    use image::{DynamicImage, Rgb, RgbImage};

    fn tiny_config(hidden_act: &str) -> ClipConfig {
        serde_json::from_value(serde_json::json!({
            "projection_dim": 4,
            "text_config": {
                "vocab_size": 16,
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "hidden_act": hidden_act
            },
            "vision_config": {
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "hidden_act": hidden_act
            }
        }))
        .unwrap()
    }

    fn random_model(cfg: &ClipConfig) -> ClipModel {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        ClipModel::load(vb, cfg).unwrap()
    }

    #[test]
    fn activations_follow_hidden_act() {
        assert_eq!(Activation::from_hf("gelu").unwrap(), Activation::Gelu);
        assert_eq!(Activation::from_hf("quick_gelu").unwrap(), Activation::QuickGelu);
        assert!(Activation::from_hf("relu").is_err());

        let xs = Tensor::new(&[-1f32, 0.5, 2.0], &Device::Cpu).unwrap();
        let exact = Activation::Gelu.forward(&xs).unwrap().to_vec1::<f32>().unwrap();
        let quick = Activation::QuickGelu.forward(&xs).unwrap().to_vec1::<f32>().unwrap();
        // gelu(2) = 1.9545, 2 * sigmoid(3.404) = 1.9359
        assert!((exact[2] - 1.9545).abs() < 1e-3);
        assert!((quick[2] - 1.9359).abs() < 1e-3);
    }

    #[test]
    fn missing_tower_settings_default_to_vit_b_32() {
        let cfg: ClipConfig = serde_json::from_str(r#"{"text_config_dict": {"hidden_act": "gelu"}}"#)
            .unwrap();
        assert_eq!(cfg.text().hidden_act, "gelu");
        assert_eq!(cfg.text().hidden_size, 512);
        assert_eq!(cfg.vision().patch_size, 32);
        assert_eq!(cfg.projection_dim, 512);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mismatched_image_size_is_rejected() {
        let cfg: ClipConfig =
            serde_json::from_str(r#"{"vision_config": {"image_size": 336, "patch_size": 14}}"#)
                .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn towers_project_into_one_space() {
        let cfg = tiny_config("gelu");
        let model = random_model(&cfg);

        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(240, 200, Rgb([10, 200, 90])));
        let pixels = CLIP_TRANSFORM.to_tensor(&img, &Device::Cpu).unwrap();
        let image = model.image_features(&pixels).unwrap();
        assert_eq!(image.dims(), &[1, 4]);

        let ids = Tensor::new(&[[1u32, 7, 15, 0, 0]], &Device::Cpu).unwrap();
        let text = model.text_features(&ids, 2).unwrap();
        assert_eq!(text.dims(), &[1, 4]);
    }

    #[test]
    fn padding_after_end_of_text_does_not_change_text_features() {
        let cfg = tiny_config("quick_gelu");
        let model = random_model(&cfg);

        let short = Tensor::new(&[[1u32, 7, 15]], &Device::Cpu).unwrap();
        let padded = Tensor::new(&[[1u32, 7, 15, 0, 0, 0, 0, 0]], &Device::Cpu).unwrap();
        let a = model.text_features(&short, 2).unwrap().flatten_all().unwrap();
        let b = model.text_features(&padded, 2).unwrap().flatten_all().unwrap();
        for (x, y) in a.to_vec1::<f32>().unwrap().iter().zip(b.to_vec1::<f32>().unwrap()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }
}
