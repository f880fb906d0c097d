//! SQLite backend for progress records and image metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::schema::SCHEMA;
use super::{ImageRecord, MetadataStore, ProgressStore, Result};
use crate::error::StoreError;
use crate::faces::{FaceDescriptorSet, FaceDetectionStatus};
use crate::tasks::{CollectionRef, JobStatus, ProgressPatch, ProgressRecord};

/// Both stores over one SQLite connection. Each call holds the connection
/// lock for its whole transaction, so merges from concurrent batches never
/// lose updates. Queries run on tokio's blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const PROGRESS_COLUMNS: &str = "job_id, status, total_files, scanned_files, matches_found, \
     faces_indexed, matches, error, cancelled, resumable, spec, created_at, last_updated";

const IMAGE_COLUMNS: &str = "path, event_id, folder_name, collection_id, face_ids, \
     face_detection_status, faces, updated_at";

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn optional_json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn progress_from_row(row: &Row) -> rusqlite::Result<ProgressRecord> {
    let status: String = row.get(1)?;
    let status = JobStatus::parse(&status).ok_or_else(|| {
        conversion_error(1, StoreError::Other(format!("unknown job status '{}'", status)))
    })?;

    Ok(ProgressRecord {
        job_id: row.get(0)?,
        status,
        total_files: row.get::<_, i64>(2)? as u64,
        scanned_files: row.get::<_, i64>(3)? as u64,
        matches_found: row.get::<_, i64>(4)? as u64,
        faces_indexed: row.get::<_, i64>(5)? as u64,
        matches: json_column(row, 6)?,
        error: row.get(7)?,
        cancelled: row.get(8)?,
        resumable: row.get(9)?,
        spec: optional_json_column(row, 10)?,
        created_at: timestamp_column(row, 11)?,
        last_updated: timestamp_column(row, 12)?,
    })
}

fn image_from_row(row: &Row) -> rusqlite::Result<ImageRecord> {
    let status: Option<String> = row.get(5)?;
    let updated_at: Option<String> = row.get(7)?;

    Ok(ImageRecord {
        path: row.get(0)?,
        event_id: row.get(1)?,
        folder_name: row.get(2)?,
        collection_id: row.get(3)?,
        face_ids: json_column(row, 4)?,
        face_detection_status: status.as_deref().and_then(FaceDetectionStatus::parse),
        faces: optional_json_column(row, 6)?,
        updated_at: updated_at
            .map(|t| {
                DateTime::parse_from_rfc3339(&t)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| conversion_error(7, e))
            })
            .transpose()?,
    })
}

fn write_progress(conn: &Connection, record: &ProgressRecord) -> Result<()> {
    let spec = record.spec.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        r#"
        UPDATE job_progress
        SET status = ?, total_files = ?, scanned_files = ?, matches_found = ?,
            faces_indexed = ?, matches = ?, error = ?, cancelled = ?, resumable = ?,
            spec = ?, last_updated = ?
        WHERE job_id = ?
        "#,
        params![
            record.status.as_str(),
            record.total_files as i64,
            record.scanned_files as i64,
            record.matches_found as i64,
            record.faces_indexed as i64,
            serde_json::to_string(&record.matches)?,
            record.error,
            record.cancelled,
            record.resumable,
            spec,
            record.last_updated.to_rfc3339(),
            record.job_id,
        ],
    )?;
    Ok(())
}

fn lock_connection(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| StoreError::Other("connection lock poisoned".to_string()))
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Other(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn)
    }

    /// Run `op` with the connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_connection(&conn)?;
            op(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Other(format!("store task failed: {}", e)))?
    }

    fn load_progress(conn: &Connection, job_id: &str) -> Result<Option<ProgressRecord>> {
        let sql = format!("SELECT {} FROM job_progress WHERE job_id = ?", PROGRESS_COLUMNS);
        Ok(conn
            .query_row(&sql, [job_id], progress_from_row)
            .optional()?)
    }

    fn load_image(conn: &Connection, path: &str) -> Result<Option<ImageRecord>> {
        let sql = format!("SELECT {} FROM images WHERE path = ?", IMAGE_COLUMNS);
        Ok(conn.query_row(&sql, [path], image_from_row).optional()?)
    }

    /// Job ids still pending or processing, oldest first.
    pub fn unfinished_jobs(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT job_id FROM job_progress
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at ASC
            "#,
        )?;

        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn create(&self, record: &ProgressRecord) -> Result<bool> {
        let record = record.clone();
        self.blocking(move |conn| {
            let spec = record.spec.as_ref().map(serde_json::to_string).transpose()?;
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO job_progress ({}) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    PROGRESS_COLUMNS
                ),
                params![
                    record.job_id,
                    record.status.as_str(),
                    record.total_files as i64,
                    record.scanned_files as i64,
                    record.matches_found as i64,
                    record.faces_indexed as i64,
                    serde_json::to_string(&record.matches)?,
                    record.error,
                    record.cancelled,
                    record.resumable,
                    spec,
                    record.created_at.to_rfc3339(),
                    record.last_updated.to_rfc3339(),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn merge(&self, job_id: &str, patch: ProgressPatch) -> Result<ProgressRecord> {
        let job_id = job_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut record = Self::load_progress(&tx, &job_id)?
                .ok_or_else(|| StoreError::NotFound(job_id.clone()))?;
            record.apply(patch, Utc::now());
            write_progress(&tx, &record)?;

            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>> {
        let job_id = job_id.to_string();
        self.blocking(move |conn| Self::load_progress(conn, &job_id)).await
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn get_image(&self, path: &str) -> Result<Option<ImageRecord>> {
        let path = path.to_string();
        self.blocking(move |conn| Self::load_image(conn, &path)).await
    }

    async fn find_by_face_id(&self, face_id: &str) -> Result<Option<ImageRecord>> {
        let face_id = face_id.to_string();
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {} FROM images WHERE path = (SELECT path FROM image_faces WHERE face_id = ?)",
                IMAGE_COLUMNS
            );
            Ok(conn.query_row(&sql, [&face_id], image_from_row).optional()?)
        })
        .await
    }

    async fn update_face_ids(
        &self,
        path: &str,
        collection: &CollectionRef,
        descriptors: &FaceDescriptorSet,
    ) -> Result<()> {
        let path = path.to_string();
        let collection = collection.clone();
        let descriptors = descriptors.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut image =
                Self::load_image(&tx, &path)?.unwrap_or_else(|| ImageRecord::new(path.clone()));
            image.set_faces(&collection, &descriptors, Utc::now());

            let status = image.face_detection_status.map(|s| s.as_str());
            let faces = image.faces.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                &format!(
                    r#"
                    INSERT INTO images ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(path) DO UPDATE SET
                        event_id = excluded.event_id,
                        folder_name = excluded.folder_name,
                        collection_id = excluded.collection_id,
                        face_ids = excluded.face_ids,
                        face_detection_status = excluded.face_detection_status,
                        faces = excluded.faces,
                        updated_at = excluded.updated_at
                    "#,
                    IMAGE_COLUMNS
                ),
                params![
                    image.path,
                    image.event_id,
                    image.folder_name,
                    image.collection_id,
                    serde_json::to_string(&image.face_ids)?,
                    status,
                    faces,
                    image.updated_at.map(|t| t.to_rfc3339()),
                ],
            )?;

            tx.execute("DELETE FROM image_faces WHERE path = ?", [&path])?;
            for face_id in &image.face_ids {
                tx.execute(
                    "INSERT OR REPLACE INTO image_faces (face_id, path) VALUES (?, ?)",
                    params![face_id, path],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::{FaceDescriptor, FaceSetMetadata};
    use crate::recognition::BoundingBox;
    use crate::scanner::ImageRef;
    use crate::tasks::{JobSpec, MatchResult};
    use tempfile::tempdir;

    fn descriptors(ids: &[&str]) -> FaceDescriptorSet {
        FaceDescriptorSet {
            faces: ids
                .iter()
                .map(|id| FaceDescriptor {
                    face_id: id.to_string(),
                    confidence: 99.0,
                    bounding_box: BoundingBox::default(),
                    pose: None,
                    quality: None,
                })
                .collect(),
            metadata: FaceSetMetadata {
                total_faces_detected: ids.len() as u32,
                hit_face_limit: false,
                max_faces_allowed: 30,
            },
        }
    }

    fn spec() -> JobSpec {
        JobSpec::pairwise(
            "job-1",
            ImageRef::parse("selfies/me.jpg"),
            vec!["events/e1/".to_string()],
        )
    }

    #[tokio::test]
    async fn test_progress_create_merge_get() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("facematch.db")).unwrap();

        let record = ProgressRecord::pending(&spec(), Utc::now());
        assert!(store.create(&record).await.unwrap());
        assert!(!store.create(&record).await.unwrap());

        store
            .merge(
                "job-1",
                ProgressPatch {
                    status: Some(JobStatus::Processing),
                    total_files: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let merged = store
            .merge(
                "job-1",
                ProgressPatch {
                    scanned_delta: 2,
                    new_matches: vec![MatchResult::new("events/e1/a.jpg", 92.5, Some(99.9))],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(merged.scanned_files, 2);

        let loaded = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(loaded, merged);
        assert_eq!(loaded.status, JobStatus::Processing);
        assert_eq!(loaded.matches_found, 1);
        assert_eq!(loaded.matches[0].source_image_ref, "events/e1/a.jpg");
        assert_eq!(loaded.spec, Some(spec()));
        assert_eq!(store.unfinished_jobs().unwrap(), vec!["job-1".to_string()]);

        assert!(store.get("nope").await.unwrap().is_none());
        assert!(matches!(
            store.merge("nope", ProgressPatch::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_face_ids_are_overwritten_not_duplicated() {
        let store = SqliteStore::open_in_memory().unwrap();
        let collection = CollectionRef::new("e1", "ceremony");
        let path = "events/e1/ceremony/a.jpg";

        store
            .update_face_ids(path, &collection, &descriptors(&["f1", "f2"]))
            .await
            .unwrap();
        store
            .update_face_ids(path, &collection, &descriptors(&["f3"]))
            .await
            .unwrap();

        let image = store.get_image(path).await.unwrap().unwrap();
        assert_eq!(image.face_ids, vec!["f3".to_string()]);
        assert_eq!(image.collection_id.as_deref(), Some("e1_ceremony"));
        assert_eq!(image.face_detection_status, Some(FaceDetectionStatus::FaceDetected));
        assert!(image.is_indexed_in("e1_ceremony"));

        assert!(store.find_by_face_id("f1").await.unwrap().is_none());
        let owner = store.find_by_face_id("f3").await.unwrap().unwrap();
        assert_eq!(owner.path, path);
        assert_eq!(owner.folder_name.as_deref(), Some("ceremony"));
    }

    #[tokio::test]
    async fn test_no_face_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .update_face_ids("b.jpg", &CollectionRef::new("e1", "party"), &descriptors(&[]))
            .await
            .unwrap();

        let image = store.get_image("b.jpg").await.unwrap().unwrap();
        assert!(image.face_ids.is_empty());
        assert_eq!(image.face_detection_status, Some(FaceDetectionStatus::NoFaceDetected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_merges_on_worker_threads() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.create(&ProgressRecord::pending(&spec(), Utc::now())).await.unwrap();
        store
            .merge("job-1", ProgressPatch { total_files: Some(40), ..Default::default() })
            .await
            .unwrap();

        let merges = (0..40).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .merge("job-1", ProgressPatch { scanned_delta: 1, ..Default::default() })
                    .await
            })
        });
        for result in futures::future::join_all(merges).await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.get("job-1").await.unwrap().unwrap().scanned_files, 40);
    }
}
