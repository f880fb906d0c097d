use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Face location as ratios of the image dimensions (0-1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub width: f32,
    pub height: f32,
    pub left: f32,
    pub top: f32,
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pose {
    pub roll: f32,
    pub yaw: f32,
    pub pitch: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageQuality {
    pub brightness: f32,
    pub sharpness: f32,
}

/// One pairwise match between the source face and a face in the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareFaceMatch {
    pub similarity: f32,
    #[serde(default)]
    pub face_confidence: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareFacesResponse {
    #[serde(default)]
    pub face_matches: Vec<CompareFaceMatch>,
}

impl CompareFacesResponse {
    /// Highest-similarity match at or above `threshold`.
    pub fn best_match(&self, threshold: f32) -> Option<&CompareFaceMatch> {
        self.face_matches
            .iter()
            .filter(|m| m.similarity >= threshold)
            .max_by(|a, b| {
                a.similarity
                    .partial_cmp(&b.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// How aggressively the provider drops low-quality faces while indexing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityFilter {
    None,
    #[default]
    Auto,
    Low,
    Medium,
    High,
}

/// A face the provider stored in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedFace {
    pub face_id: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    #[serde(default)]
    pub pose: Option<Pose>,
    #[serde(default)]
    pub quality: Option<ImageQuality>,
}

/// A face the provider detected but did not store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnindexedFace {
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFacesResponse {
    #[serde(default)]
    pub face_records: Vec<IndexedFace>,
    #[serde(default)]
    pub unindexed_faces: Vec<UnindexedFace>,
}

/// A collection face similar to the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionFaceMatch {
    pub face_id: String,
    pub similarity: f32,
    #[serde(default)]
    pub face_confidence: Option<f32>,
    #[serde(default)]
    pub external_image_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFacesResponse {
    #[serde(default)]
    pub face_matches: Vec<CollectionFaceMatch>,
}

/// Remote face recognition capability.
///
/// Implementations report throttling and timeouts as
/// [`ProviderError::Transient`] so callers can retry them; everything else is
/// [`ProviderError::Permanent`].
#[async_trait]
pub trait FaceProvider: Send + Sync {
    /// Compare the largest face in `source` against every face in `target`.
    async fn compare_faces(
        &self,
        source: &[u8],
        target: &[u8],
        similarity_threshold: f32,
    ) -> Result<CompareFacesResponse, ProviderError>;

    /// Create the collection if it does not exist. Idempotent.
    async fn ensure_collection(&self, collection_id: &str) -> Result<(), ProviderError>;

    /// Detect up to `max_faces` faces in `image` and store them in the collection,
    /// tagged with `external_id`.
    async fn index_faces(
        &self,
        collection_id: &str,
        image: &[u8],
        external_id: &str,
        max_faces: u32,
        quality_filter: QualityFilter,
    ) -> Result<IndexFacesResponse, ProviderError>;

    /// Search a collection for faces matching the largest face in `image`.
    async fn search_faces_by_image(
        &self,
        collection_id: &str,
        image: &[u8],
        max_faces: u32,
        similarity_threshold: f32,
    ) -> Result<SearchFacesResponse, ProviderError>;

    /// Provider name for logs.
    fn provider_name(&self) -> &'static str;
}
