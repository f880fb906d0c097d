//! Shared fixtures: an in-memory object source and a scripted face provider.
//!
//! Image bytes are small scripts read by [`ScriptedProvider`], separated by `;`:
//! `sim:N` (compare similarity), `faces:N` (faces found when indexing),
//! `throttle:N` (first N calls are throttled), `delay:S` (seconds per call),
//! `noface` (provider rejects the image).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use facematch::config::JobsConfig;
use facematch::db::{MemoryStore, ProgressStore};
use facematch::error::{ProviderError, StorageError, StoreError};
use facematch::recognition::{
    BoundingBox, CollectionFaceMatch, CompareFaceMatch, CompareFacesResponse, FaceProvider,
    IndexFacesResponse, IndexedFace, QualityFilter, SearchFacesResponse, UnindexedFace,
};
use facematch::scanner::{ObjectEntry, ObjectSource, UrlFetcher};
use facematch::tasks::{JobRunner, ProgressPatch, ProgressRecord, RetryPolicy, Services};

pub const PROBE: &str = "probes/selfie.jpg";

#[derive(Default)]
pub struct MemorySource {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    listed_only: Mutex<Vec<String>>,
    fail_listing: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, script: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), script.as_bytes().to_vec());
    }

    /// Listed under its prefix but gone by the time it is downloaded.
    pub fn put_vanishing(&self, path: &str) {
        self.listed_only.lock().unwrap().push(path.to_string());
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                path: prefix.to_string(),
                message: "bucket offline".to_string(),
            });
        }

        let mut paths: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.extend(
            self.listed_only
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.starts_with(prefix))
                .cloned(),
        );
        Ok(paths.into_iter().map(ObjectEntry::new).collect())
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}

/// Serves URLs from a fixed map.
#[derive(Default)]
pub struct MemoryFetcher {
    urls: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, StorageError>>,
}

impl MemoryFetcher {
    pub fn put(&self, url: &str, script: &str) {
        self.urls
            .lock()
            .unwrap()
            .insert(url.to_string(), script.as_bytes().to_vec());
    }

    /// Answer `url` with the error a real download of an oversized body gives.
    pub fn put_oversized(&self, url: &str) {
        self.failures.lock().unwrap().insert(
            url.to_string(),
            StorageError::Unavailable {
                path: url.to_string(),
                message: "exceeds 25 MiB".to_string(),
            },
        );
    }
}

#[async_trait]
impl UrlFetcher for MemoryFetcher {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(err) = self.failures.lock().unwrap().get(url) {
            return Err(err.clone());
        }
        self.urls
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(url.to_string()))
    }
}

#[derive(Debug, Default, Clone)]
struct Script {
    similarity: Option<f32>,
    faces: u32,
    throttle: u32,
    delay_secs: u64,
    no_face: bool,
}

fn parse_script(bytes: &[u8]) -> (String, Script) {
    let text = String::from_utf8_lossy(bytes).to_string();
    let mut script = Script::default();
    for token in text.split(';') {
        let (key, value) = token.split_once(':').unwrap_or((token, ""));
        match key {
            "sim" => script.similarity = value.parse().ok(),
            "faces" => script.faces = value.parse().unwrap_or(0),
            "throttle" => script.throttle = value.parse().unwrap_or(0),
            "delay" => script.delay_secs = value.parse().unwrap_or(0),
            "noface" => script.no_face = true,
            _ => {}
        }
    }
    (text, script)
}

fn invalid_image() -> ProviderError {
    ProviderError::Permanent {
        code: ProviderError::INVALID_IMAGE.to_string(),
        message: "no face detected".to_string(),
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    attempts: Mutex<HashMap<String, u32>>,
    search_results: Mutex<Vec<CollectionFaceMatch>>,
    generation: AtomicUsize,
    pub compare_calls: AtomicUsize,
    pub index_calls: AtomicUsize,
    pub ensure_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made for the image with this script.
    pub fn attempts(&self, script: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(script)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_search_results(&self, matches: Vec<(&str, f32)>) {
        *self.search_results.lock().unwrap() = matches
            .into_iter()
            .map(|(face_id, similarity)| CollectionFaceMatch {
                face_id: face_id.to_string(),
                similarity,
                face_confidence: Some(99.0),
                external_image_id: None,
            })
            .collect();
    }

    async fn begin(&self, image: &[u8]) -> Result<Script, ProviderError> {
        let (key, script) = parse_script(image);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        if script.delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(script.delay_secs)).await;
        }
        if attempt <= script.throttle {
            return Err(ProviderError::Transient("ThrottlingException".to_string()));
        }
        if script.no_face {
            return Err(invalid_image());
        }
        Ok(script)
    }
}

#[async_trait]
impl FaceProvider for ScriptedProvider {
    async fn compare_faces(
        &self,
        source: &[u8],
        target: &[u8],
        _similarity_threshold: f32,
    ) -> Result<CompareFacesResponse, ProviderError> {
        self.compare_calls.fetch_add(1, Ordering::SeqCst);
        if parse_script(source).1.no_face {
            return Err(invalid_image());
        }

        let script = self.begin(target).await?;
        Ok(CompareFacesResponse {
            face_matches: script
                .similarity
                .map(|similarity| CompareFaceMatch {
                    similarity,
                    face_confidence: Some(99.5),
                })
                .into_iter()
                .collect(),
        })
    }

    async fn ensure_collection(&self, _collection_id: &str) -> Result<(), ProviderError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn index_faces(
        &self,
        _collection_id: &str,
        image: &[u8],
        external_id: &str,
        max_faces: u32,
        _quality_filter: QualityFilter,
    ) -> Result<IndexFacesResponse, ProviderError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.begin(image).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        let indexed = script.faces.min(max_faces);
        Ok(IndexFacesResponse {
            face_records: (0..indexed)
                .map(|n| IndexedFace {
                    face_id: format!("{}-g{}-f{}", external_id, generation, n),
                    confidence: 99.0,
                    bounding_box: BoundingBox::default(),
                    pose: None,
                    quality: None,
                })
                .collect(),
            unindexed_faces: (indexed..script.faces)
                .map(|_| UnindexedFace {
                    reasons: vec!["EXCEEDS_MAX_FACES".to_string()],
                    bounding_box: None,
                })
                .collect(),
        })
    }

    async fn search_faces_by_image(
        &self,
        _collection_id: &str,
        image: &[u8],
        _max_faces: u32,
        _similarity_threshold: f32,
    ) -> Result<SearchFacesResponse, ProviderError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.begin(image).await?;
        Ok(SearchFacesResponse {
            face_matches: self.search_results.lock().unwrap().clone(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

/// Progress store that keeps every merged record for ordering checks.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    history: Mutex<Vec<ProgressRecord>>,
}

impl RecordingStore {
    pub fn history(&self) -> Vec<ProgressRecord> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressStore for RecordingStore {
    async fn create(&self, record: &ProgressRecord) -> Result<bool, StoreError> {
        self.inner.create(record).await
    }

    async fn merge(&self, job_id: &str, patch: ProgressPatch) -> Result<ProgressRecord, StoreError> {
        let record = self.inner.merge(job_id, patch).await?;
        self.history.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        self.inner.get(job_id).await
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

pub fn jobs_config(batch_size: usize) -> JobsConfig {
    JobsConfig {
        batch_size,
        deadline_secs: 0,
        ..JobsConfig::default()
    }
}

pub struct Harness {
    pub source: Arc<MemorySource>,
    pub fetcher: Arc<MemoryFetcher>,
    pub provider: Arc<ScriptedProvider>,
    pub progress: Arc<RecordingStore>,
    pub metadata: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let harness = Self {
            source: Arc::new(MemorySource::new()),
            fetcher: Arc::new(MemoryFetcher::default()),
            provider: Arc::new(ScriptedProvider::new()),
            progress: Arc::new(RecordingStore::default()),
            metadata: Arc::new(MemoryStore::new()),
        };
        harness.source.put(PROBE, "probe");
        harness
    }

    pub fn services(&self) -> Services {
        Services {
            source: self.source.clone(),
            fetcher: self.fetcher.clone(),
            provider: self.provider.clone(),
            progress: self.progress.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn runner(&self, jobs: JobsConfig) -> JobRunner {
        JobRunner::new(self.services(), jobs, fast_retry())
    }
}
