//! Object source: where candidate and probe images come from.

pub mod discovery;
pub mod http;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub use discovery::{enumerate_candidates, is_image};
pub use http::HttpFetcher;
pub use local::LocalObjectSource;

/// One object returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Final path segment.
    pub name: String,
    /// Path from the storage root, `/`-separated.
    pub full_path: String,
}

impl ObjectEntry {
    pub fn new(full_path: impl Into<String>) -> Self {
        let full_path = full_path.into();
        let name = full_path
            .rsplit('/')
            .next()
            .unwrap_or(&full_path)
            .to_string();
        Self { name, full_path }
    }
}

/// Prefix-enumerable blob storage.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// List objects under `prefix`. No ordering is guaranteed.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError>;

    /// Download an object. Fails with [`StorageError::NotFound`] when absent.
    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;
}

/// Fetches images hosted outside the object source.
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, StorageError>;
}

/// Reference to an image, either an HTTP(S) URL or a storage path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ImageRef {
    Url(String),
    Storage(String),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let lower = reference.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageRef::Url(reference.to_string())
        } else {
            ImageRef::Storage(reference.trim_start_matches('/').to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ImageRef::Url(s) | ImageRef::Storage(s) => s,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().trim().is_empty()
    }

    /// Download the referenced image from whichever backend holds it.
    pub async fn fetch(
        &self,
        source: &dyn ObjectSource,
        fetcher: &dyn UrlFetcher,
    ) -> Result<Vec<u8>, StorageError> {
        match self {
            ImageRef::Url(url) => fetcher.get_bytes(url).await,
            ImageRef::Storage(path) => source.get_bytes(path).await,
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
