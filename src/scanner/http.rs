use async_trait::async_trait;
use std::io::Read;
use std::time::Duration;

use super::UrlFetcher;
use crate::error::StorageError;

/// Upper bound on a downloaded probe image.
const MAX_DOWNLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Downloads externally hosted images (e.g. a selfie on a CDN).
#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn download(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, StorageError> {
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(404, _)) => return Err(StorageError::NotFound(url.to_string())),
        Err(e) => {
            return Err(StorageError::Unavailable {
                path: url.to_string(),
                message: e.to_string(),
            })
        }
    };

    let too_large = response
        .header("Content-Length")
        .and_then(|len| len.parse::<u64>().ok())
        .is_some_and(|len| len > MAX_DOWNLOAD_BYTES);
    if too_large {
        return Err(oversized(url));
    }

    read_capped(response.into_reader(), MAX_DOWNLOAD_BYTES, url)
}

fn oversized(url: &str) -> StorageError {
    StorageError::Unavailable {
        path: url.to_string(),
        message: format!("exceeds {} MiB", MAX_DOWNLOAD_BYTES / (1024 * 1024)),
    }
}

/// Read the whole body, failing instead of truncating when it is over `limit`.
fn read_capped(reader: impl Read, limit: u64, url: &str) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| StorageError::Unavailable {
            path: url.to_string(),
            message: e.to_string(),
        })?;

    if bytes.len() as u64 > limit {
        return Err(oversized(url));
    }
    Ok(bytes)
}

#[async_trait]
impl UrlFetcher for HttpFetcher {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let agent = self.agent.clone();
        let target = url.to_string();
        tokio::task::spawn_blocking(move || download(&agent, &target))
            .await
            .map_err(|e| StorageError::Unavailable {
                path: url.to_string(),
                message: e.to_string(),
            })?
    }
}
