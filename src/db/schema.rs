pub const SCHEMA: &str = r#"
-- Job progress: one row per job id, polled by callers
CREATE TABLE IF NOT EXISTS job_progress (
    job_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    total_files INTEGER NOT NULL DEFAULT 0,
    scanned_files INTEGER NOT NULL DEFAULT 0,
    matches_found INTEGER NOT NULL DEFAULT 0,
    faces_indexed INTEGER NOT NULL DEFAULT 0,
    matches TEXT NOT NULL DEFAULT '[]',  -- JSON array, append-only
    error TEXT,
    cancelled INTEGER NOT NULL DEFAULT 0,
    resumable INTEGER NOT NULL DEFAULT 0,
    spec TEXT,                           -- JSON job spec, used to resume
    created_at TEXT NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_progress_status ON job_progress(status);

-- Image metadata: face detection results per stored image
CREATE TABLE IF NOT EXISTS images (
    path TEXT PRIMARY KEY,
    event_id TEXT,
    folder_name TEXT,
    collection_id TEXT,
    face_ids TEXT NOT NULL DEFAULT '[]',  -- JSON array
    face_detection_status TEXT,
    faces TEXT,                           -- JSON face descriptor set
    updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_images_collection ON images(collection_id);

-- Reverse lookup from provider face id to owning image
CREATE TABLE IF NOT EXISTS image_faces (
    face_id TEXT PRIMARY KEY,
    path TEXT NOT NULL REFERENCES images(path) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_image_faces_path ON image_faces(path);
"#;
