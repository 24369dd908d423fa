use anyhow::{anyhow, bail, Context, Result};
use embedserve::embeddings::dto::ClipBatchResponse;
use embedserve::inference::vector::cosine_similarity;
use serde_json::json;
use std::env;

const DEFAULT_IMAGE: &str = "https://images.pixelshare.site/Rosa_Precious_platinum.jpg";
const DEFAULT_TEXT: &str = "Photo of a rose";

/// Posts a batch to a running CLIP endpoint and prints image/text similarities.
///
/// usage: embed_probe [--image URL]... [--text TEXT]...
/// env:   API_URL (full URL of /clip/embed), AUTH_TOKEN
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let url = dotenvy::var("API_URL").context("API_URL must be set")?;
    let token = dotenvy::var("AUTH_TOKEN").context("AUTH_TOKEN must be set")?;
    let (mut images, mut texts) = parse_args(env::args().skip(1))?;
    if images.is_empty() && texts.is_empty() {
        images.push(DEFAULT_IMAGE.to_string());
        texts.push(DEFAULT_TEXT.to_string());
    }

    let response = reqwest::Client::new()
        .post(&url)
        .bearer_auth(token)
        .json(&json!({ "images": images, "texts": texts }))
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        println!("❌ Error: {status} {body}");
        return Ok(());
    }

    let body: ClipBatchResponse = response.json().await.context("unexpected response body")?;
    println!("✅ Success! {} image(s), {} text(s)", body.images.len(), body.texts.len());

    for image in &body.images {
        println!("🖼  {} ({} dims)", image.url, image.embedding.len());
        for text in &body.texts {
            let score = cosine_similarity(&image.embedding, &text.embedding)?;
            println!("    {score:+.4}  {}", text.text);
        }
    }
    if body.images.is_empty() {
        for text in &body.texts {
            println!("📝 {} ({} dims)", text.text, text.embedding.len());
        }
    }

    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(Vec<String>, Vec<String>)> {
    let mut images = Vec::new();
    let mut texts = Vec::new();
    while let Some(flag) = args.next() {
        let target = match flag.as_str() {
            "--image" => &mut images,
            "--text" => &mut texts,
            other => bail!("unknown argument '{other}' (expected --image URL or --text TEXT)"),
        };
        let value = args
            .next()
            .ok_or_else(|| anyhow!("{flag} needs a value"))?;
        target.push(value);
    }
    Ok((images, texts))
}
