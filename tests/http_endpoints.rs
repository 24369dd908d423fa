//! Router-level tests against a deterministic fake embedder, so no weights
//! or network are needed.

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use embedserve::{
    auth::BearerSecret,
    embeddings,
    inference::{vector::l2_normalize, Embedder, ModelFamily},
    manager::ModelManager,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

const TOKEN: &str = "test-token";

struct FakeEmbedder {
    family: ModelFamily,
}

impl FakeEmbedder {
    fn vector(seed: &str) -> Result<Vec<f32>> {
        let mut v = vec![0f32; 4];
        for (i, b) in seed.bytes().enumerate() {
            v[i % 4] += b as f32;
        }
        l2_normalize(v)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn model_id(&self) -> &str {
        match self.family {
            ModelFamily::Clip => "fake/clip",
            ModelFamily::Dinov2 => "fake/dinov2",
        }
    }

    async fn embed_image(&self, url: &str) -> Result<Vec<f32>> {
        if url.contains("broken") {
            bail!("failed to fetch {url}");
        }
        Self::vector(url)
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        if self.family != ModelFamily::Clip {
            bail!("{} does not support text embeddings", self.family);
        }
        Self::vector(text)
    }
}

fn app_with(secret: Option<&str>) -> Router {
    let models = ModelManager::new(
        Some(Arc::new(FakeEmbedder {
            family: ModelFamily::Clip,
        })),
        Some(Arc::new(FakeEmbedder {
            family: ModelFamily::Dinov2,
        })),
    );
    embeddings::router(&models, BearerSecret::new(secret.map(str::to_string)))
}

fn app() -> Router {
    app_with(Some(TOKEN))
}

fn post(uri: &str, token: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(body.into()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn wrong_token_is_401_with_bearer_challenge() {
    let bodies = [
        json!({ "images": ["http://img/a.png"] }).to_string(),
        "{ not json".to_string(),
        String::new(),
    ];
    for body in bodies {
        let response = app()
            .oneshot(post("/clip/embed", Some("nope"), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }
}

#[tokio::test]
async fn missing_token_is_401() {
    let response = app()
        .oneshot(post("/dinov2/embed", None, json!({ "images": [] }).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

fn post_with_authorization(uri: &str, authorization: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, authorization)
        .body(body.into())
        .unwrap()
}

#[tokio::test]
async fn bearer_token_with_extra_spaces_is_401() {
    for authorization in ["Bearer  test-token", "Bearer   test-token", "Bearer test-token "] {
        let response = app()
            .oneshot(post_with_authorization(
                "/clip/embed",
                authorization,
                json!({}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{authorization:?}");
    }
}

#[tokio::test]
async fn bearer_scheme_is_case_insensitive() {
    for authorization in ["bearer test-token", "BEARER test-token"] {
        let response = app()
            .oneshot(post_with_authorization(
                "/clip/embed",
                authorization,
                json!({}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{authorization:?}");
    }
}

#[tokio::test]
async fn unconfigured_secret_is_500() {
    let response = app_with(None)
        .oneshot(post("/clip/embed", Some(TOKEN), json!({}).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn clip_batch_preserves_input_order() {
    let images = ["http://img/c.png", "http://img/a.png", "http://img/b.png"];
    let texts = ["a rose", "a dog"];
    let response = app()
        .oneshot(post(
            "/clip/embed",
            Some(TOKEN),
            json!({ "images": images, "texts": texts }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let got_images: Vec<&str> = body["images"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["url"].as_str().unwrap())
        .collect();
    assert_eq!(got_images, images);

    let got_texts: Vec<&str> = body["texts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["text"].as_str().unwrap())
        .collect();
    assert_eq!(got_texts, texts);

    let first = body["images"][0]["embedding"].as_array().unwrap();
    let expected = FakeEmbedder::vector(images[0]).unwrap();
    assert_eq!(first.len(), expected.len());
    for (got, want) in first.iter().zip(expected.iter()) {
        assert!((got.as_f64().unwrap() as f32 - want).abs() < 1e-6);
    }
}

#[tokio::test]
async fn clip_batch_without_lists_returns_empty_lists() {
    let response = app()
        .oneshot(post("/clip/embed", Some(TOKEN), json!({}).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "images": [], "texts": [] }));
}

#[tokio::test]
async fn one_failing_item_fails_the_batch() {
    let response = app()
        .oneshot(post(
            "/clip/embed",
            Some(TOKEN),
            json!({ "images": ["http://img/ok.png", "http://img/broken.png"] }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let message = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(message.contains("broken.png"), "{message}");
}

#[tokio::test]
async fn dinov2_batch_returns_images_only() {
    let response = app()
        .oneshot(post(
            "/dinov2/embed",
            Some(TOKEN),
            json!({ "images": ["http://img/a.png"], "texts": ["ignored"] }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let object = body.as_object().unwrap();
    assert_eq!(object.len(), 1);
    assert_eq!(body["images"][0]["url"], "http://img/a.png");
}

#[tokio::test]
async fn square_empty_body_is_invalid_request() {
    for body in ["", "{}", "{\"url\": null}"] {
        let response = app()
            .oneshot(post("/clip/square", None, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "error": "invalid request" }));
    }
}

#[tokio::test]
async fn square_embeds_url_before_text() {
    let response = app()
        .oneshot(post(
            "/clip/square",
            None,
            json!({ "url": "http://img/a.png", "text": "a rose" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let embedding: Vec<f32> = serde_json::from_value(body["embedding"].clone()).unwrap();
    assert_eq!(embedding, FakeEmbedder::vector("http://img/a.png").unwrap());

    let response = app()
        .oneshot(post("/clip/square", None, json!({ "text": "a rose" }).to_string()))
        .await
        .unwrap();
    let body = json_body(response).await;
    let embedding: Vec<f32> = serde_json::from_value(body["embedding"].clone()).unwrap();
    assert_eq!(embedding, FakeEmbedder::vector("a rose").unwrap());
}

#[tokio::test]
async fn square_mistyped_url_is_500_even_with_valid_text() {
    let response = app()
        .oneshot(post(
            "/clip/square",
            None,
            json!({ "url": 5, "text": "hi" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let message = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(message.contains("url must be a string"), "{message}");
}

#[tokio::test]
async fn square_text_embedding_is_flat() {
    let response = app()
        .oneshot(post("/clip/square", None, json!({ "text": "hi" }).to_string()))
        .await
        .unwrap();
    let body = json_body(response).await;
    let embedding = body["embedding"].as_array().unwrap();
    assert!(embedding.iter().all(Value::is_number));
}

#[tokio::test]
async fn square_ignores_bearer_token() {
    let response = app()
        .oneshot(post(
            "/clip/square",
            Some("whatever"),
            json!({ "text": "hello" }).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn routes_exist_only_for_loaded_families() {
    let models = ModelManager::new(
        None,
        Some(Arc::new(FakeEmbedder {
            family: ModelFamily::Dinov2,
        })),
    );
    let app = embeddings::router(&models, BearerSecret::new(Some(TOKEN.into())));
    let response = app
        .oneshot(post("/clip/square", None, json!({ "text": "x" }).to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_lists_loaded_models() {
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({
            "status": "ok",
            "models": [
                { "family": "clip", "model_id": "fake/clip" },
                { "family": "dinov2", "model_id": "fake/dinov2" }
            ]
        })
    );
}
