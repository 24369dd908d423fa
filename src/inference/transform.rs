use anyhow::Result;
use candle::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

/// Resize / center-crop / normalize pipeline applied before a vision forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageTransform {
    /// Target length of the shorter side after resizing. Must be >= `crop`.
    pub resize_shortest: u32,
    pub crop: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

pub const CLIP_TRANSFORM: ImageTransform = ImageTransform {
    resize_shortest: 224,
    crop: 224,
    mean: [0.481_454_66, 0.457_827_5, 0.408_210_73],
    std: [0.268_629_54, 0.261_302_58, 0.275_777_11],
};

pub const DINOV2_TRANSFORM: ImageTransform = ImageTransform {
    resize_shortest: 256,
    crop: 224,
    mean: [0.485, 0.456, 0.406],
    std: [0.229, 0.224, 0.225],
};

/// Resized images whose long side exceeds this many times the short side are
/// cropped in source coordinates before resizing, so the intermediate buffer
/// stays bounded.
const MAX_FULL_RESIZE_ASPECT: u64 = 8;

impl ImageTransform {
    /// Normalized pixels in CHW order, `3 * crop * crop` values.
    pub fn pixels(&self, image: &DynamicImage) -> Vec<f32> {
        let cropped = self.center_crop(image);

        let plane = (self.crop * self.crop) as usize;
        let mut out = vec![0f32; 3 * plane];
        for (x, y, pixel) in cropped.enumerate_pixels() {
            let idx = (y * self.crop + x) as usize;
            for c in 0..3 {
                let v = pixel.0[c] as f32 / 255.0;
                out[c * plane + idx] = (v - self.mean[c]) / self.std[c];
            }
        }
        out
    }

    /// Batch-of-one input tensor shaped `(1, 3, crop, crop)`.
    pub fn to_tensor(&self, image: &DynamicImage, device: &Device) -> Result<Tensor> {
        let side = self.crop as usize;
        let pixels = self.pixels(image);
        Ok(Tensor::from_vec(pixels, (1, 3, side, side), device)?)
    }

    /// Size after the shortest-side resize. The long side is truncated.
    pub fn resize_dims(&self, width: u32, height: u32) -> (u32, u32) {
        let (width, height) = (width.max(1), height.max(1));
        let short = self.resize_shortest.max(self.crop);
        if width <= height {
            (short, scaled(height, short, width))
        } else {
            (scaled(width, short, height), short)
        }
    }

    fn center_crop(&self, image: &DynamicImage) -> RgbImage {
        let (new_w, new_h) = self.resize_dims(image.width(), image.height());
        let left = (new_w - self.crop) / 2;
        let top = (new_h - self.crop) / 2;

        if !needs_source_crop(new_w, new_h) {
            let resized = image
                .resize_exact(new_w, new_h, FilterType::CatmullRom)
                .to_rgb8();
            return imageops::crop_imm(&resized, left, top, self.crop, self.crop).to_image();
        }

        let (x, width) = source_span(left, self.crop, new_w, image.width());
        let (y, height) = source_span(top, self.crop, new_h, image.height());
        image
            .crop_imm(x, y, width, height)
            .resize_exact(self.crop, self.crop, FilterType::CatmullRom)
            .to_rgb8()
    }
}

fn scaled(long: u32, short_target: u32, short: u32) -> u32 {
    let value = (long as u64 * short_target as u64 / short as u64) as u32;
    value.max(short_target)
}

fn needs_source_crop(new_w: u32, new_h: u32) -> bool {
    let (long, short) = (new_w.max(new_h) as u64, new_w.min(new_h) as u64);
    long > short * MAX_FULL_RESIZE_ASPECT
}

/// Source pixels covering `[start, start + len)` of an axis resized from
/// `source` to `resized`, widened to whole pixels and never empty.
fn source_span(start: u32, len: u32, resized: u32, source: u32) -> (u32, u32) {
    let source = source.max(1);
    let ratio = source as f64 / resized as f64;
    let first = ((start as f64 * ratio).floor() as u32).min(source - 1);
    let end = (((start + len) as f64 * ratio).ceil() as u32).clamp(first + 1, source);
    (first, end - first)
}
