//! Progress and image metadata persistence.
//!
//! Both stores are traits so the job runner can be handed any backend:
//! [`SqliteStore`] for the CLI, [`MemoryStore`] for embedding and tests.

mod schema;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::faces::{FaceDescriptorSet, FaceDetectionStatus};
use crate::tasks::{CollectionRef, ProgressPatch, ProgressRecord};

pub use memory::MemoryStore;
pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Metadata kept per stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub path: String,
    pub event_id: Option<String>,
    pub folder_name: Option<String>,
    pub collection_id: Option<String>,
    pub face_ids: Vec<String>,
    pub face_detection_status: Option<FaceDetectionStatus>,
    pub faces: Option<FaceDescriptorSet>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            event_id: None,
            folder_name: None,
            collection_id: None,
            face_ids: Vec::new(),
            face_detection_status: None,
            faces: None,
            updated_at: None,
        }
    }

    /// True when faces were already computed for `collection_id`.
    pub fn is_indexed_in(&self, collection_id: &str) -> bool {
        self.face_detection_status.is_some() && self.collection_id.as_deref() == Some(collection_id)
    }

    /// Overwrite the face fields with a fresh descriptor set.
    pub(crate) fn set_faces(
        &mut self,
        collection: &CollectionRef,
        descriptors: &FaceDescriptorSet,
        now: DateTime<Utc>,
    ) {
        self.event_id = Some(collection.event_id.clone());
        self.folder_name = Some(collection.folder_name.clone());
        self.collection_id = Some(collection.collection_id());
        self.face_ids = descriptors.face_ids();
        self.face_detection_status = Some(descriptors.detection_status());
        self.faces = Some(descriptors.clone());
        self.updated_at = Some(now);
    }
}

/// Keyed job progress records.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Insert a new record. Returns `false`, leaving the stored record
    /// untouched, when the job id already exists.
    async fn create(&self, record: &ProgressRecord) -> Result<bool>;

    /// Atomically read, apply `patch`, and write back. Returns the merged record.
    async fn merge(&self, job_id: &str, patch: ProgressPatch) -> Result<ProgressRecord>;

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>>;
}

/// Per-image face metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_image(&self, path: &str) -> Result<Option<ImageRecord>>;

    /// The image whose `faceIds` contain `face_id`.
    async fn find_by_face_id(&self, face_id: &str) -> Result<Option<ImageRecord>>;

    /// Replace the image's face ids, detection status and descriptors,
    /// creating the record if needed.
    async fn update_face_ids(
        &self,
        path: &str,
        collection: &CollectionRef,
        descriptors: &FaceDescriptorSet,
    ) -> Result<()>;
}
