use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::processor::{CandidateProcessor, ItemOutcome};
use crate::db::MetadataStore;
use crate::error::ItemError;
use crate::recognition::FaceProvider;
use crate::scanner::ObjectEntry;
use crate::tasks::{CollectionRef, MatchResult, RetryPolicy};

/// Searches a collection with the probe and maps matched faces back to images.
pub struct CollectionMatcher {
    provider: Arc<dyn FaceProvider>,
    metadata: Arc<dyn MetadataStore>,
    probe: Arc<Vec<u8>>,
    collection_id: String,
    max_faces: u32,
    similarity_threshold: f32,
    retry: RetryPolicy,
}

impl CollectionMatcher {
    pub fn new(
        provider: Arc<dyn FaceProvider>,
        metadata: Arc<dyn MetadataStore>,
        probe: Arc<Vec<u8>>,
        collection: &CollectionRef,
        max_faces: u32,
        similarity_threshold: f32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            metadata,
            probe,
            collection_id: collection.collection_id(),
            max_faces: max_faces.max(1),
            similarity_threshold,
            retry,
        }
    }

    /// One search call, resolved to images and sorted by similarity, highest first.
    pub async fn search(&self) -> Result<Vec<MatchResult>, ItemError> {
        let result = self
            .retry
            .run("search_faces_by_image", &self.collection_id, || {
                self.provider.search_faces_by_image(
                    &self.collection_id,
                    &self.probe,
                    self.max_faces,
                    self.similarity_threshold,
                )
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(ItemError::Provider(err)) if err.is_invalid_image() => {
                debug!(collection = %self.collection_id, error = %err, "Probe has no searchable face");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut matches: Vec<MatchResult> = Vec::new();
        for face in response.face_matches {
            if face.similarity < self.similarity_threshold {
                continue;
            }

            let image = self
                .metadata
                .find_by_face_id(&face.face_id)
                .await
                .map_err(|e| ItemError::Metadata(e.to_string()))?;
            let Some(image) = image else {
                warn!(
                    collection = %self.collection_id,
                    face_id = %face.face_id,
                    "Matched face has no owning image, dropping"
                );
                continue;
            };

            // Several faces of one image can match; keep the best.
            if let Some(existing) = matches
                .iter_mut()
                .find(|m| m.source_image_ref == image.path)
            {
                if face.similarity > existing.similarity {
                    existing.similarity = face.similarity;
                    existing.confidence = face.face_confidence;
                    existing.face_id = Some(face.face_id.clone());
                }
                continue;
            }

            matches.push(MatchResult {
                source_image_ref: image.path.clone(),
                similarity: face.similarity,
                confidence: face.face_confidence,
                face_id: Some(face.face_id),
                file_path: Some(image.path),
                event_id: image.event_id,
                folder_name: image.folder_name,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(matches)
    }
}

#[async_trait]
impl CandidateProcessor for CollectionMatcher {
    fn name(&self) -> &'static str {
        "collection_search"
    }

    async fn process(&self, _candidate: &ObjectEntry) -> Result<ItemOutcome, ItemError> {
        let matches = self.search().await?;
        Ok(if matches.is_empty() {
            ItemOutcome::NoMatch
        } else {
            ItemOutcome::Matched(matches)
        })
    }
}
