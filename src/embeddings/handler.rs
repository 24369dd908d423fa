use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{FromRef, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::dto::{
    BatchEmbedRequest, ClipBatchResponse, Dinov2BatchResponse, HealthResponse, ImageEmbedding,
    LoadedModel, SquareRequest, SquareResponse, TextEmbedding,
};
use crate::auth::{Authorized, BearerSecret};
use crate::inference::Embedder;

pub type HandlerError = (StatusCode, String);

/// Per-family router state: the model handle plus the bearer secret.
#[derive(Clone)]
pub struct EmbedState {
    pub embedder: Arc<dyn Embedder>,
    pub secret: BearerSecret,
}

impl FromRef<EmbedState> for BearerSecret {
    fn from_ref(state: &EmbedState) -> Self {
        state.secret.clone()
    }
}

pub async fn clip_batch(
    _auth: Authorized,
    State(state): State<EmbedState>,
    Json(req): Json<BatchEmbedRequest>,
) -> Result<Json<ClipBatchResponse>, HandlerError> {
    let images = req.images.unwrap_or_default();
    let texts = req.texts.unwrap_or_default();
    let span = info_span!(
        "clip_batch",
        request_id = %Uuid::new_v4(),
        images = images.len(),
        texts = texts.len()
    );

    async move {
        let embedder = state.embedder.as_ref();
        let images = embed_images(embedder, images).await?;
        let texts = embed_texts(embedder, texts).await?;
        info!("batch embedded");
        Ok::<_, HandlerError>(Json(ClipBatchResponse { images, texts }))
    }
    .instrument(span)
    .await
}

pub async fn dinov2_batch(
    _auth: Authorized,
    State(state): State<EmbedState>,
    Json(req): Json<BatchEmbedRequest>,
) -> Result<Json<Dinov2BatchResponse>, HandlerError> {
    let images = req.images.unwrap_or_default();
    let span = info_span!(
        "dinov2_batch",
        request_id = %Uuid::new_v4(),
        images = images.len()
    );

    async move {
        let images = embed_images(state.embedder.as_ref(), images).await?;
        info!("batch embedded");
        Ok::<_, HandlerError>(Json(Dinov2BatchResponse { images }))
    }
    .instrument(span)
    .await
}

/// Unauthenticated single-item endpoint: `{"url"}` or `{"text"}`.
///
/// Both kinds answer a flat `{"embedding": [f32, ...]}`. Text embeddings are
/// not wrapped as a batch of one, so clients expecting the nested
/// `{"embedding": [[f32, ...]]}` wire shape must read one level less.
pub async fn clip_square(
    State(state): State<EmbedState>,
    body: Bytes,
) -> Result<Json<SquareResponse>, HandlerError> {
    let result = match SquareRequest::from_body(&body) {
        SquareRequest::Image(url) => match url.as_str() {
            Some(url) => state.embedder.embed_image(url).await,
            None => Err(anyhow!("url must be a string, got {url}")),
        },
        SquareRequest::Text(text) => match text.as_str() {
            Some(text) => state.embedder.embed_text(text).await,
            None => Err(anyhow!("text must be a string, got {text}")),
        },
        SquareRequest::Empty => return Ok(Json(SquareResponse::invalid_request())),
    };

    let embedding = result.map_err(|err| {
        error!(error = %format!("{err:#}"), "single-item embedding failed");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    })?;
    Ok(Json(SquareResponse::Embedding { embedding }))
}

pub async fn health(State(models): State<Arc<Vec<LoadedModel>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        models: models.as_ref().clone(),
    })
}

// Items run one after another in input order; the first failure fails the
// whole batch.
async fn embed_images(
    embedder: &dyn Embedder,
    urls: Vec<String>,
) -> Result<Vec<ImageEmbedding>, HandlerError> {
    let mut out = Vec::with_capacity(urls.len());
    for (index, url) in urls.into_iter().enumerate() {
        let embedding = embedder
            .embed_image(&url)
            .await
            .map_err(|err| item_failure("image", index, &url, err))?;
        out.push(ImageEmbedding { url, embedding });
    }
    Ok(out)
}

async fn embed_texts(
    embedder: &dyn Embedder,
    texts: Vec<String>,
) -> Result<Vec<TextEmbedding>, HandlerError> {
    let mut out = Vec::with_capacity(texts.len());
    for (index, text) in texts.into_iter().enumerate() {
        let embedding = embedder
            .embed_text(&text)
            .await
            .map_err(|err| item_failure("text", index, &text, err))?;
        out.push(TextEmbedding { text, embedding });
    }
    Ok(out)
}

fn item_failure(kind: &str, index: usize, source: &str, err: anyhow::Error) -> HandlerError {
    error!(kind, index, source, error = %format!("{err:#}"), "embedding failed, aborting batch");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("failed to embed {kind} #{index} ({source}): {err:#}"),
    )
}
