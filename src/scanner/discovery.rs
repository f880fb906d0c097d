use std::collections::HashSet;

use tracing::debug;

use super::{ObjectEntry, ObjectSource};
use crate::error::StorageError;

/// True when `name` is a file (not a folder marker) with one of `extensions`,
/// compared case-insensitively.
pub fn is_image(name: &str, extensions: &[String]) -> bool {
    if name.ends_with('/') {
        return false;
    }

    let file_name = name.rsplit('/').next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext_lower = ext.to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        }
        _ => false,
    }
}

/// List every prefix once, keep image objects, and return them deduplicated
/// by full path and sorted so repeated enumerations line up for resuming.
pub async fn enumerate_candidates(
    source: &dyn ObjectSource,
    prefixes: &[String],
    extensions: &[String],
) -> Result<Vec<ObjectEntry>, StorageError> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for prefix in prefixes {
        let objects = source.list_objects(prefix).await?;
        let before = candidates.len();

        for object in objects {
            if is_image(&object.full_path, extensions) && seen.insert(object.full_path.clone()) {
                candidates.push(object);
            }
        }

        debug!(prefix = %prefix, images = candidates.len() - before, "Listed prefix");
    }

    candidates.sort_by(|a, b| a.full_path.cmp(&b.full_path));
    Ok(candidates)
}
