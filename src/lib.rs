//! Face matching jobs over event photo storage.
//!
//! A [`JobRunner`] takes a [`JobSpec`] in one of three modes (pairwise scan
//! against a probe, collection indexing, collection search), runs it in the
//! background in bounded batches, and keeps a [`ProgressRecord`] current in a
//! [`ProgressStore`] so callers can poll it.

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod logging;
pub mod recognition;
pub mod scanner;
pub mod tasks;

pub use config::Config;
pub use db::{MemoryStore, MetadataStore, ProgressStore, SqliteStore};
pub use error::{ItemError, JobError, ProviderError, StorageError, StoreError};
pub use recognition::{FaceProvider, HttpFaceProvider};
pub use scanner::{HttpFetcher, ImageRef, LocalObjectSource, ObjectSource, UrlFetcher};
pub use tasks::{
    CandidateScope, CollectionRef, JobHandle, JobMode, JobRunner, JobSpec, JobStatus,
    MatchResult, ProgressPatch, ProgressRecord, RetryPolicy, Services,
};
