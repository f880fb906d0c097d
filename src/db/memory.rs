//! In-memory stores.
//!
//! [`MemoryStore`] keeps progress records and image metadata in `HashMap`s
//! behind `tokio::sync::RwLock`s. It is meant for embedding the runner in a
//! single process and for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{ImageRecord, MetadataStore, ProgressStore, Result};
use crate::error::StoreError;
use crate::faces::FaceDescriptorSet;
use crate::tasks::{CollectionRef, ProgressPatch, ProgressRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    progress: RwLock<HashMap<String, ProgressRecord>>,
    images: RwLock<HashMap<String, ImageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every image record, in no particular order.
    pub async fn images(&self) -> Vec<ImageRecord> {
        self.images.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn create(&self, record: &ProgressRecord) -> Result<bool> {
        let mut progress = self.progress.write().await;
        if progress.contains_key(&record.job_id) {
            return Ok(false);
        }
        progress.insert(record.job_id.clone(), record.clone());
        Ok(true)
    }

    async fn merge(&self, job_id: &str, patch: ProgressPatch) -> Result<ProgressRecord> {
        let mut progress = self.progress.write().await;
        let record = progress
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        record.apply(patch, Utc::now());
        Ok(record.clone())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>> {
        Ok(self.progress.read().await.get(job_id).cloned())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_image(&self, path: &str) -> Result<Option<ImageRecord>> {
        Ok(self.images.read().await.get(path).cloned())
    }

    async fn find_by_face_id(&self, face_id: &str) -> Result<Option<ImageRecord>> {
        let images = self.images.read().await;
        Ok(images
            .values()
            .find(|image| image.face_ids.iter().any(|id| id == face_id))
            .cloned())
    }

    async fn update_face_ids(
        &self,
        path: &str,
        collection: &CollectionRef,
        descriptors: &FaceDescriptorSet,
    ) -> Result<()> {
        let mut images = self.images.write().await;
        images
            .entry(path.to_string())
            .or_insert_with(|| ImageRecord::new(path))
            .set_faces(collection, descriptors, Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ImageRef;
    use crate::tasks::{JobSpec, JobStatus};

    #[tokio::test]
    async fn test_create_does_not_overwrite() {
        let store = MemoryStore::new();
        let spec = JobSpec::pairwise("job-1", ImageRef::parse("me.jpg"), vec!["p/".to_string()]);
        let record = ProgressRecord::pending(&spec, Utc::now());

        assert!(store.create(&record).await.unwrap());
        store
            .merge("job-1", ProgressPatch::status(JobStatus::Processing))
            .await
            .unwrap();
        assert!(!store.create(&record).await.unwrap());

        let stored = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_concurrent_merges_do_not_lose_updates() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let spec = JobSpec::pairwise("job-1", ImageRef::parse("me.jpg"), vec!["p/".to_string()]);
        store.create(&ProgressRecord::pending(&spec, Utc::now())).await.unwrap();
        store
            .merge(
                "job-1",
                ProgressPatch {
                    status: Some(JobStatus::Processing),
                    total_files: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .merge(
                            "job-1",
                            ProgressPatch {
                                scanned_delta: 5,
                                ..Default::default()
                            },
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("job-1").await.unwrap().unwrap().scanned_files, 100);
    }
}
