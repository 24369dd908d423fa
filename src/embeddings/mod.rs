use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub mod dto;
pub mod handler;

use crate::auth::BearerSecret;
use crate::manager::ModelManager;
use dto::LoadedModel;
use handler::{clip_batch, clip_square, dinov2_batch, health, EmbedState};

/// HTTP routes for every loaded family, plus `/health`.
pub fn router(models: &ModelManager, secret: BearerSecret) -> Router {
    let mut app = Router::new();

    if let Some(clip) = models.clip.clone() {
        let state = EmbedState {
            embedder: clip,
            secret: secret.clone(),
        };
        app = app.merge(
            Router::new()
                .route("/clip/embed", post(clip_batch))
                .route("/clip/square", post(clip_square))
                .with_state(state),
        );
    }

    if let Some(dinov2) = models.dinov2.clone() {
        let state = EmbedState {
            embedder: dinov2,
            secret,
        };
        app = app.merge(
            Router::new()
                .route("/dinov2/embed", post(dinov2_batch))
                .with_state(state),
        );
    }

    let loaded: Vec<LoadedModel> = models
        .loaded()
        .iter()
        .map(|m| LoadedModel {
            family: m.family(),
            model_id: m.model_id().to_string(),
        })
        .collect();

    app.merge(
        Router::new()
            .route("/health", get(health))
            .with_state(Arc::new(loaded)),
    )
}
