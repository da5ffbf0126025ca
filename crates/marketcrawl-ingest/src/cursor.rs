//! Resumption cursor
//!
//! A small JSON file recording the last page whose batch reached both sinks.
//! It is replaced atomically (write to a sibling temp file, then rename), so a
//! crash leaves either the old or the new position on disk.

use chrono::{DateTime, Utc};
use marketcrawl_common::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persisted cursor contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub last_committed_page: u32,
    pub updated_at: DateTime<Utc>,
}

/// File-backed resumption cursor
#[derive(Debug, Clone)]
pub struct ResumeCursor {
    path: PathBuf,
}

impl ResumeCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cursor; `None` when no run has committed anything yet
    pub fn load(&self) -> Result<Option<CursorState>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let state: CursorState = serde_json::from_str(&text)
            .map_err(|e| CommonError::corrupt_state(&self.path, e.to_string()))?;

        if state.last_committed_page == 0 {
            return Err(CommonError::corrupt_state(&self.path, "page index is zero"));
        }

        debug!(path = %self.path.display(), page = state.last_committed_page, "Loaded cursor");
        Ok(Some(state))
    }

    /// Record `page` as the last committed page
    pub fn save(&self, page: u32) -> Result<CursorState> {
        let state = CursorState {
            last_committed_page: page,
            updated_at: Utc::now(),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&state)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), page, "Saved cursor");
        Ok(state)
    }

    /// Remove the cursor; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Cleared cursor");
                Ok(true)
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cursor".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_cursor_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let cursor = ResumeCursor::new(dir.path().join("cursor.json"));
        assert_eq!(cursor.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let cursor = ResumeCursor::new(dir.path().join("state/cursor.json"));

        let saved = cursor.save(5).unwrap();
        let loaded = cursor.load().unwrap().unwrap();

        assert_eq!(loaded.last_committed_page, 5);
        assert_eq!(loaded, saved);
        assert!(!dir.path().join("state/cursor.json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_position() {
        let dir = TempDir::new().unwrap();
        let cursor = ResumeCursor::new(dir.path().join("cursor.json"));

        cursor.save(2).unwrap();
        cursor.save(3).unwrap();

        assert_eq!(cursor.load().unwrap().unwrap().last_committed_page, 3);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let cursor = ResumeCursor::new(dir.path().join("cursor.json"));

        cursor.save(1).unwrap();
        assert!(cursor.clear().unwrap());
        assert!(!cursor.clear().unwrap());
        assert_eq!(cursor.load().unwrap(), None);
    }

    #[test]
    fn test_garbage_is_reported_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cursor.json");
        fs::write(&path, "{ not json").unwrap();

        let err = ResumeCursor::new(&path).load().unwrap_err();
        assert!(matches!(err, CommonError::CorruptState { .. }));
    }

    #[test]
    fn test_zero_page_is_reported_as_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cursor.json");
        fs::write(
            &path,
            r#"{ "last_committed_page": 0, "updated_at": "2024-01-01T00:00:00Z" }"#,
        )
        .unwrap();

        let err = ResumeCursor::new(&path).load().unwrap_err();
        assert!(matches!(err, CommonError::CorruptState { .. }));
    }
}
