use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::processor::{CandidateProcessor, ItemOutcome};
use super::{sanitize_identifier, FaceDescriptorSet, MAX_IDENTIFIER_LEN};
use crate::db::MetadataStore;
use crate::error::ItemError;
use crate::recognition::{FaceProvider, IndexFacesResponse, QualityFilter};
use crate::scanner::{ObjectEntry, ObjectSource};
use crate::tasks::{CollectionRef, RetryPolicy};

/// Provider-side tag for faces from `file_name`.
pub fn external_image_id(file_name: &str) -> String {
    sanitize_identifier(file_name, MAX_IDENTIFIER_LEN)
}

/// Registers candidate faces in an event folder's collection and records the
/// resulting face ids on each image.
pub struct CollectionIndexer {
    source: Arc<dyn ObjectSource>,
    provider: Arc<dyn FaceProvider>,
    metadata: Arc<dyn MetadataStore>,
    collection: CollectionRef,
    collection_id: String,
    max_faces: u32,
    reprocess: bool,
    retry: RetryPolicy,
    ensured: OnceCell<()>,
}

impl CollectionIndexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ObjectSource>,
        provider: Arc<dyn FaceProvider>,
        metadata: Arc<dyn MetadataStore>,
        collection: CollectionRef,
        max_faces: u32,
        reprocess: bool,
        retry: RetryPolicy,
    ) -> Self {
        let collection_id = collection.collection_id();
        Self {
            source,
            provider,
            metadata,
            collection,
            collection_id,
            max_faces: max_faces.max(1),
            reprocess,
            retry,
            ensured: OnceCell::new(),
        }
    }

    /// Create the collection on first use. A failure is not cached, so the
    /// next image tries again.
    async fn ensure_collection(&self) -> Result<(), ItemError> {
        self.ensured
            .get_or_try_init(|| async {
                self.retry
                    .run("ensure_collection", &self.collection_id, || {
                        self.provider.ensure_collection(&self.collection_id)
                    })
                    .await?;
                info!(collection = %self.collection_id, "Collection ready");
                Ok::<(), ItemError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CandidateProcessor for CollectionIndexer {
    fn name(&self) -> &'static str {
        "index"
    }

    async fn process(&self, candidate: &ObjectEntry) -> Result<ItemOutcome, ItemError> {
        let path = &candidate.full_path;

        if !self.reprocess {
            let existing = self
                .metadata
                .get_image(path)
                .await
                .map_err(|e| ItemError::Metadata(e.to_string()))?;
            if existing.is_some_and(|image| image.is_indexed_in(&self.collection_id)) {
                debug!(item = %path, "Faces already indexed, skipping");
                return Ok(ItemOutcome::AlreadyIndexed);
            }
        }

        let bytes = self.source.get_bytes(path).await?;
        self.ensure_collection().await?;

        let external_id = external_image_id(&candidate.name);
        let result = self
            .retry
            .run("index_faces", path, || {
                self.provider.index_faces(
                    &self.collection_id,
                    &bytes,
                    &external_id,
                    self.max_faces,
                    QualityFilter::Auto,
                )
            })
            .await;

        let response = match result {
            Ok(response) => response,
            Err(ItemError::Provider(err)) if err.is_invalid_image() => {
                debug!(item = %path, error = %err, "Image could not be decoded, recording no faces");
                IndexFacesResponse::default()
            }
            Err(err) => return Err(err),
        };

        let descriptors = FaceDescriptorSet::from_response(&response, self.max_faces);
        if descriptors.metadata.hit_face_limit {
            warn!(
                item = %path,
                max_faces = self.max_faces,
                detected = descriptors.metadata.total_faces_detected,
                "Face limit reached, some faces were not indexed"
            );
        }

        self.metadata
            .update_face_ids(path, &self.collection, &descriptors)
            .await
            .map_err(|e| ItemError::Metadata(e.to_string()))?;

        Ok(ItemOutcome::Indexed(descriptors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_image_id() {
        assert_eq!(external_image_id("DSC 0042.JPG"), "DSC_0042.JPG");
        assert_eq!(external_image_id(&"a".repeat(300)).len(), MAX_IDENTIFIER_LEN);
    }
}
