use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{ObjectEntry, ObjectSource};
use crate::error::StorageError;

/// Object source backed by a directory tree. Object paths are relative to
/// `root` and use `/` separators, so prefixes behave like bucket prefixes.
#[derive(Debug, Clone)]
pub struct LocalObjectSource {
    root: PathBuf,
}

impl LocalObjectSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::Unavailable {
                path: path.to_string(),
                message: "path escapes storage root".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

fn list_blocking(root: &Path, prefix: &str) -> Vec<ObjectEntry> {
    // Walk from the directory part of the prefix; the remainder is matched
    // as a plain string prefix like an object store would.
    let dir_part = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };
    let start = root.join(dir_part);
    if !start.is_dir() {
        return Vec::new();
    }

    WalkDir::new(&start)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let relative = e.path().strip_prefix(root).ok()?;
            let full_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            full_path.starts_with(prefix).then(|| ObjectEntry::new(full_path))
        })
        .collect()
}

#[async_trait]
impl ObjectSource for LocalObjectSource {
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        let prefix = prefix.trim_start_matches('/').to_string();
        // Validates the prefix the same way object reads are validated.
        self.resolve(&prefix)?;

        let root = self.root.clone();
        let listing_prefix = prefix.clone();
        tokio::task::spawn_blocking(move || list_blocking(&root, &listing_prefix))
            .await
            .map_err(|e| StorageError::Unavailable {
                path: prefix,
                message: e.to_string(),
            })
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(StorageError::Unavailable {
                path: path.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
