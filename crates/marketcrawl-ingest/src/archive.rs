// Raw page archive

use crate::fetcher::FetchedPage;
use crate::models::RawExtension;
use marketcrawl_common::Result;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Writes each fetched page as `{dir}/{page}.json`, without version payloads
#[derive(Debug, Clone)]
pub struct RawArchive {
    dir: PathBuf,
}

impl RawArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("{}.json", page))
    }

    pub fn save(&self, page: &FetchedPage) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let extensions: Vec<Value> = page.records.iter().map(RawExtension::without_versions).collect();
        let path = self.page_path(page.index);
        fs::write(&path, serde_json::to_string_pretty(&extensions)?)?;

        debug!(page = page.index, path = %path.display(), "Archived raw page");
        Ok(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_strips_versions() {
        let dir = TempDir::new().unwrap();
        let archive = RawArchive::new(dir.path().join("raw"));
        let page = FetchedPage {
            index: 7,
            records: vec![RawExtension::new(json!({
                "extensionId": "ext-1",
                "versions": [{ "version": "1.0.0" }]
            }))],
            is_last: false,
        };

        let path = archive.save(&page).unwrap();

        assert_eq!(path, dir.path().join("raw/7.json"));
        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, json!([{ "extensionId": "ext-1" }]));
    }
}
