use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::ModelFamily;

/// Body of the authenticated batch endpoints. Missing or `null` lists are empty.
#[derive(Debug, Default, Deserialize)]
pub struct BatchEmbedRequest {
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub texts: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEmbedding {
    pub url: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEmbedding {
    pub text: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClipBatchResponse {
    pub images: Vec<ImageEmbedding>,
    pub texts: Vec<TextEmbedding>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Dinov2BatchResponse {
    pub images: Vec<ImageEmbedding>,
}

/// Body of the single-item endpoint. The first non-null field of `url` then
/// `text` is taken as is, whatever its JSON type.
#[derive(Debug, Clone, PartialEq)]
pub enum SquareRequest {
    Image(Value),
    Text(Value),
    Empty,
}

impl SquareRequest {
    /// Anything that is not a JSON object parses as empty.
    pub fn from_body(body: &[u8]) -> Self {
        let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
            return SquareRequest::Empty;
        };
        let present = |key: &str| fields.get(key).filter(|value| !value.is_null()).cloned();

        if let Some(url) = present("url") {
            SquareRequest::Image(url)
        } else if let Some(text) = present("text") {
            SquareRequest::Text(text)
        } else {
            SquareRequest::Empty
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SquareResponse {
    Embedding { embedding: Vec<f32> },
    Error { error: String },
}

impl SquareResponse {
    pub fn invalid_request() -> Self {
        SquareResponse::Error {
            error: "invalid request".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedModel {
    pub family: ModelFamily,
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub models: Vec<LoadedModel>,
}
