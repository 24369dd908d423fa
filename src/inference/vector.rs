use anyhow::{bail, Result};

/// Scale `values` to unit L2 norm.
///
/// Zero-norm and non-finite inputs are rejected rather than divided through.
pub fn l2_normalize(mut values: Vec<f32>) -> Result<Vec<f32>> {
    if values.is_empty() {
        bail!("cannot normalize an empty embedding");
    }
    let norm = l2_norm(&values);
    if !norm.is_finite() {
        bail!("embedding contains non-finite values");
    }
    if norm == 0.0 {
        bail!("cannot normalize a zero-norm embedding");
    }
    for v in values.iter_mut() {
        *v /= norm;
    }
    Ok(values)
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Cosine similarity of two equally sized vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        bail!("dimension mismatch: {} vs {}", a.len(), b.len());
    }
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        bail!("cosine similarity is undefined for zero vectors");
    }
    Ok(dot / denom)
}
