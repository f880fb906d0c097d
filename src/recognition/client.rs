use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::provider::{
    CompareFacesResponse, FaceProvider, IndexFacesResponse, QualityFilter, SearchFacesResponse,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// Face recognition gateway spoken to as JSON over HTTP. Images travel as
/// base64 strings.
#[derive(Clone)]
pub struct HttpFaceProvider {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareRequest {
    source_image: String,
    target_image: String,
    similarity_threshold: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexRequest<'a> {
    image: String,
    external_image_id: &'a str,
    max_faces: u32,
    quality_filter: QualityFilter,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    image: String,
    max_faces: u32,
    face_match_threshold: f32,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Status codes worth retrying: throttling, timeouts and upstream hiccups.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn classify(error: ureq::Error) -> ProviderError {
    match error {
        ureq::Error::Status(status, response) => {
            let body: ErrorBody = response.into_json().unwrap_or_default();
            let message = body
                .message
                .unwrap_or_else(|| format!("HTTP {}", status));
            if is_retryable_status(status) {
                ProviderError::Transient(message)
            } else {
                ProviderError::Permanent {
                    code: body.code.unwrap_or_else(|| format!("Http{}", status)),
                    message,
                }
            }
        }
        ureq::Error::Transport(transport) => ProviderError::Transient(transport.to_string()),
    }
}

impl HttpFaceProvider {
    pub fn new(endpoint: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            &config.endpoint,
            config.api_key.as_deref(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = format!("{}{}", self.endpoint, path);
        let request = self
            .agent
            .request(method, &url)
            .set("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => request.set("Authorization", &format!("Bearer {}", key)),
            None => request,
        }
    }

    /// Send on the blocking pool and decode the JSON reply.
    async fn send<B, R>(&self, method: &'static str, path: String, body: B) -> Result<R, ProviderError>
    where
        B: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let request = self.request(method, &path);
        tokio::task::spawn_blocking(move || {
            let response = request.send_json(&body).map_err(classify)?;
            response
                .into_json::<R>()
                .map_err(|e| ProviderError::Transient(format!("failed to read response: {}", e)))
        })
        .await
        .map_err(|e| ProviderError::Transient(e.to_string()))?
    }
}

#[async_trait]
impl FaceProvider for HttpFaceProvider {
    async fn compare_faces(
        &self,
        source: &[u8],
        target: &[u8],
        similarity_threshold: f32,
    ) -> Result<CompareFacesResponse, ProviderError> {
        let body = CompareRequest {
            source_image: BASE64.encode(source),
            target_image: BASE64.encode(target),
            similarity_threshold,
        };
        self.send("POST", "/faces/compare".to_string(), body).await
    }

    async fn ensure_collection(&self, collection_id: &str) -> Result<(), ProviderError> {
        let path = format!("/collections/{}", collection_id);
        match self
            .send::<_, serde_json::Value>("PUT", path, serde_json::json!({}))
            .await
        {
            Ok(_) => Ok(()),
            Err(ProviderError::Permanent { code, .. }) if code == "ResourceAlreadyExists" || code == "Http409" => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn index_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        external_id: &str,
        max_faces: u32,
        quality_filter: QualityFilter,
    ) -> Result<IndexFacesResponse, ProviderError> {
        let body = serde_json::to_value(IndexRequest {
            image: BASE64.encode(image),
            external_image_id: external_id,
            max_faces,
            quality_filter,
        })
        .map_err(|e| ProviderError::Permanent {
            code: "InvalidRequest".to_string(),
            message: e.to_string(),
        })?;
        let path = format!("/collections/{}/faces", collection_id);
        self.send("POST", path, body).await
    }

    async fn search_faces_by_image(
        &self,
        collection_id: &str,
        image: &[u8],
        max_faces: u32,
        similarity_threshold: f32,
    ) -> Result<SearchFacesResponse, ProviderError> {
        let body = SearchRequest {
            image: BASE64.encode(image),
            max_faces,
            face_match_threshold: similarity_threshold,
        };
        let path = format!("/collections/{}/search", collection_id);
        self.send("POST", path, body).await
    }

    fn provider_name(&self) -> &'static str {
        "HTTP gateway"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{} should retry", status);
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!is_retryable_status(status), "{} should not retry", status);
        }
    }

    #[test]
    fn test_request_bodies_are_camel_case() {
        let body = serde_json::to_value(SearchRequest {
            image: BASE64.encode(b"abc"),
            max_faces: 10,
            face_match_threshold: 80.0,
        })
        .unwrap();

        assert_eq!(body["image"], "YWJj");
        assert_eq!(body["maxFaces"], 10);
        assert_eq!(body["faceMatchThreshold"], 80.0);
    }

    #[test]
    fn test_endpoint_trailing_slash_is_trimmed() {
        let provider = HttpFaceProvider::new("http://gateway/v1/", None, Duration::from_secs(5));
        assert_eq!(provider.endpoint, "http://gateway/v1");
    }
}
