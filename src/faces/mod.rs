//! Per-candidate face matching strategies.
//!
//! Each job mode is a [`CandidateProcessor`]: [`MatchScanner`] compares the
//! probe against one image, [`CollectionIndexer`] registers one image's faces
//! in a collection, and [`CollectionMatcher`] runs one collection search.

pub mod indexer;
pub mod matcher;
pub mod pairwise;
pub mod processor;

use serde::{Deserialize, Serialize};

use crate::recognition::{BoundingBox, ImageQuality, IndexFacesResponse, Pose};

pub use indexer::{external_image_id, CollectionIndexer};
pub use matcher::CollectionMatcher;
pub use pairwise::MatchScanner;
pub use processor::{CandidateProcessor, ItemOutcome};

/// Longest identifier the provider accepts for collections and external ids.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Replace characters outside `[A-Za-z0-9_.-]` with `_` and cap the length.
pub fn sanitize_identifier(raw: &str, max_len: usize) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    if sanitized.is_empty() {
        "image".to_string()
    } else {
        sanitized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceDetectionStatus {
    FaceDetected,
    NoFaceDetected,
}

impl FaceDetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceDetectionStatus::FaceDetected => "face_detected",
            FaceDetectionStatus::NoFaceDetected => "no_face_detected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "face_detected" => Some(FaceDetectionStatus::FaceDetected),
            "no_face_detected" => Some(FaceDetectionStatus::NoFaceDetected),
            _ => None,
        }
    }
}

/// One indexed face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDescriptor {
    pub face_id: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<Pose>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<ImageQuality>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceSetMetadata {
    pub total_faces_detected: u32,
    /// The per-image cap was reached; some faces may be missing.
    pub hit_face_limit: bool,
    pub max_faces_allowed: u32,
}

/// Faces indexed for one image, attached to that image's metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDescriptorSet {
    pub faces: Vec<FaceDescriptor>,
    pub metadata: FaceSetMetadata,
}

/// Reason the provider gives for faces dropped over the cap.
const EXCEEDS_MAX_FACES: &str = "EXCEEDS_MAX_FACES";

impl FaceDescriptorSet {
    /// An image with no usable faces.
    pub fn empty(max_faces: u32) -> Self {
        Self {
            faces: Vec::new(),
            metadata: FaceSetMetadata {
                total_faces_detected: 0,
                hit_face_limit: false,
                max_faces_allowed: max_faces,
            },
        }
    }

    pub fn from_response(response: &IndexFacesResponse, max_faces: u32) -> Self {
        let faces: Vec<FaceDescriptor> = response
            .face_records
            .iter()
            .take(max_faces as usize)
            .map(|record| FaceDescriptor {
                face_id: record.face_id.clone(),
                confidence: record.confidence,
                bounding_box: record.bounding_box,
                pose: record.pose,
                quality: record.quality,
            })
            .collect();

        let over_cap = response
            .unindexed_faces
            .iter()
            .any(|face| face.reasons.iter().any(|r| r == EXCEEDS_MAX_FACES));
        let hit_face_limit = faces.len() >= max_faces as usize || over_cap;

        Self {
            metadata: FaceSetMetadata {
                total_faces_detected: (response.face_records.len() + response.unindexed_faces.len())
                    as u32,
                hit_face_limit,
                max_faces_allowed: max_faces,
            },
            faces,
        }
    }

    pub fn face_ids(&self) -> Vec<String> {
        self.faces.iter().map(|f| f.face_id.clone()).collect()
    }

    pub fn detection_status(&self) -> FaceDetectionStatus {
        if self.faces.is_empty() {
            FaceDetectionStatus::NoFaceDetected
        } else {
            FaceDetectionStatus::FaceDetected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::{IndexedFace, UnindexedFace};

    fn indexed(n: usize) -> Vec<IndexedFace> {
        (0..n)
            .map(|i| IndexedFace {
                face_id: format!("face-{}", i),
                confidence: 99.0,
                bounding_box: BoundingBox::default(),
                pose: None,
                quality: None,
            })
            .collect()
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("IMG 0001 (1).jpg", 255), "IMG_0001__1_.jpg");
        assert_eq!(sanitize_identifier("évent/folder", 255), "_vent_folder");
        assert_eq!(sanitize_identifier("abcdef", 3), "abc");
        assert_eq!(sanitize_identifier("", 255), "image");
    }

    #[test]
    fn test_face_limit_flag() {
        let response = IndexFacesResponse {
            face_records: indexed(30),
            unindexed_faces: vec![UnindexedFace {
                reasons: vec![EXCEEDS_MAX_FACES.to_string()],
                bounding_box: None,
            }],
        };

        let set = FaceDescriptorSet::from_response(&response, 30);
        assert_eq!(set.faces.len(), 30);
        assert!(set.metadata.hit_face_limit);
        assert_eq!(set.metadata.total_faces_detected, 31);
        assert_eq!(set.metadata.max_faces_allowed, 30);
        assert_eq!(set.detection_status(), FaceDetectionStatus::FaceDetected);
    }

    #[test]
    fn test_under_limit() {
        let response = IndexFacesResponse {
            face_records: indexed(2),
            unindexed_faces: vec![UnindexedFace {
                reasons: vec!["LOW_SHARPNESS".to_string()],
                bounding_box: None,
            }],
        };

        let set = FaceDescriptorSet::from_response(&response, 30);
        assert!(!set.metadata.hit_face_limit);
        assert_eq!(set.face_ids(), vec!["face-0", "face-1"]);
        assert_eq!(
            FaceDescriptorSet::empty(30).detection_status(),
            FaceDetectionStatus::NoFaceDetected
        );
    }
}
