// Append-only CSV sink

use crate::error::SinkWriteError;
use crate::models::{ExtensionRecord, COLUMNS};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

/// Position of an append, used to undo it if the batch does not commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvAppend {
    /// File length before the append
    pub offset: u64,
    /// Data rows written (header excluded)
    pub rows: usize,
}

/// UTF-8, comma-delimited file with a fixed header
///
/// Rows are appended across runs without deduplication. Clones share one
/// lock, so an append that outlived its timeout finishes before the next
/// append or rollback reads the file length.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `records`, writing the header first when the file is empty
    ///
    /// A failed append is truncated away before the error is returned.
    pub fn write_csv(&self, records: &[ExtensionRecord]) -> Result<CsvAppend, SinkWriteError> {
        let _guard = self.exclusive();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let offset = file.metadata()?.len();

        match append_rows(&file, offset == 0, records) {
            Ok(rows) => {
                debug!(path = %self.path.display(), rows, "Appended CSV rows");
                Ok(CsvAppend { offset, rows })
            },
            Err(err) => {
                if let Err(truncate_err) = file.set_len(offset) {
                    error!(
                        path = %self.path.display(),
                        offset,
                        error = %truncate_err,
                        "Failed to truncate partial CSV append"
                    );
                }
                Err(err)
            },
        }
    }

    /// Remove the rows added by `append`
    pub fn rollback(&self, append: CsvAppend) -> Result<(), SinkWriteError> {
        let _guard = self.exclusive();
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(append.offset)?;
        file.sync_data()?;
        debug!(path = %self.path.display(), offset = append.offset, "Rolled back CSV append");
        Ok(())
    }
}

fn append_rows(
    file: &File,
    with_header: bool,
    records: &[ExtensionRecord],
) -> Result<usize, SinkWriteError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if with_header {
        writer.write_record(COLUMNS)?;
    }
    for record in records {
        writer.write_record(&record.to_row()?)?;
    }
    writer.flush()?;
    drop(writer);

    file.sync_data()?;
    Ok(records.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::fixtures::record;
    use tempfile::TempDir;

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap()
            .records()
            .map(|row| row.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn test_header_written_once_on_empty_sink() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path().join("out.csv"));

        sink.write_csv(&[record("pub", "a", 1)]).unwrap();
        sink.write_csv(&[record("pub", "b", 2)]).unwrap();

        let rows = read_rows(sink.path());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], COLUMNS.to_vec());
        assert_eq!(rows[1][3], "a");
        assert_eq!(rows[2][3], "b");
    }

    #[test]
    fn test_append_does_not_dedupe_across_calls() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path().join("out.csv"));

        sink.write_csv(&[record("pub", "a", 1)]).unwrap();
        sink.write_csv(&[record("pub", "a", 1)]).unwrap();

        assert_eq!(read_rows(sink.path()).len(), 3);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path().join("nested/deeper/out.csv"));

        let append = sink.write_csv(&[record("pub", "a", 1)]).unwrap();
        assert_eq!(append, CsvAppend { offset: 0, rows: 1 });
        assert!(sink.path().exists());
    }

    #[test]
    fn test_rollback_restores_previous_length() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path().join("out.csv"));

        sink.write_csv(&[record("pub", "a", 1)]).unwrap();
        let before = std::fs::read_to_string(sink.path()).unwrap();

        let append = sink
            .write_csv(&[record("pub", "b", 2), record("pub", "c", 3)])
            .unwrap();
        sink.rollback(append).unwrap();

        assert_eq!(std::fs::read_to_string(sink.path()).unwrap(), before);
    }

    #[test]
    fn test_categories_are_quoted_json() {
        let dir = TempDir::new().unwrap();
        let sink = CsvSink::new(dir.path().join("out.csv"));

        sink.write_csv(&[record("pub", "a", 1)]).unwrap();

        let rows = read_rows(sink.path());
        assert_eq!(rows[1][8], r#"["Linters","Formatters"]"#);
    }
}
