use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::processor::{CandidateProcessor, ItemOutcome};
use crate::error::ItemError;
use crate::recognition::FaceProvider;
use crate::scanner::{ObjectEntry, ObjectSource};
use crate::tasks::{MatchResult, RetryPolicy};

/// Compares the probe image against candidates one provider call at a time.
pub struct MatchScanner {
    source: Arc<dyn ObjectSource>,
    provider: Arc<dyn FaceProvider>,
    probe: Arc<Vec<u8>>,
    similarity_threshold: f32,
    retry: RetryPolicy,
}

impl MatchScanner {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        provider: Arc<dyn FaceProvider>,
        probe: Arc<Vec<u8>>,
        similarity_threshold: f32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            provider,
            probe,
            similarity_threshold,
            retry,
        }
    }
}

#[async_trait]
impl CandidateProcessor for MatchScanner {
    fn name(&self) -> &'static str {
        "pairwise_scan"
    }

    async fn process(&self, candidate: &ObjectEntry) -> Result<ItemOutcome, ItemError> {
        let target = self.source.get_bytes(&candidate.full_path).await?;

        let result = self
            .retry
            .run("compare_faces", &candidate.full_path, || {
                self.provider
                    .compare_faces(&self.probe, &target, self.similarity_threshold)
            })
            .await;

        let response = match result {
            Ok(response) => response,
            // No decodable face on either side is a miss, not a failure.
            Err(ItemError::Provider(err)) if err.is_invalid_image() => {
                debug!(item = %candidate.full_path, error = %err, "Image has no comparable face");
                return Ok(ItemOutcome::NoMatch);
            }
            Err(err) => return Err(err),
        };

        Ok(match response.best_match(self.similarity_threshold) {
            Some(best) => {
                let mut result = MatchResult::new(
                    candidate.full_path.clone(),
                    best.similarity,
                    best.face_confidence,
                );
                result.file_path = Some(candidate.full_path.clone());
                ItemOutcome::Matched(vec![result])
            }
            None => ItemOutcome::NoMatch,
        })
    }
}
