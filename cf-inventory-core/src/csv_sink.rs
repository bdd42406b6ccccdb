//! Append-only CSV files shared by concurrent collector workers.
//!
//! Each row is encoded to a complete line before the lock is taken, then
//! written with one `write_all` under a mutex, so concurrent appends never
//! interleave partial lines.

use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, error, info};

/// A flat record with a fixed column set.
pub trait CsvRow: Serialize {
    const HEADERS: &'static [&'static str];
}

#[derive(Debug)]
pub enum CollectError {
    Api(crate::contract::ApiError),
    Io { path: PathBuf, source: std::io::Error },
    Encode { path: PathBuf, detail: String },
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::Api(e) => write!(f, "{e}"),
            CollectError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            CollectError::Encode { path, detail } => {
                write!(f, "cannot encode CSV row for {}: {detail}", path.display())
            }
        }
    }
}

impl std::error::Error for CollectError {}

impl From<crate::contract::ApiError> for CollectError {
    fn from(e: crate::contract::ApiError) -> Self {
        CollectError::Api(e)
    }
}

pub struct CsvSink<R> {
    path: PathBuf,
    file: Mutex<File>,
    rows: AtomicUsize,
    _row: PhantomData<fn(R)>,
}

impl<R: CsvRow> CsvSink<R> {
    /// Create (or truncate) `path` and write the header line.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, CollectError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| CollectError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = File::create(&path).map_err(io_err)?;
        let header = encode_line(&path, |w| w.write_record(R::HEADERS))?;
        file.write_all(&header).map_err(io_err)?;
        debug!(path = %path.display(), columns = R::HEADERS.len(), "Created CSV sink");
        Ok(Self {
            path,
            file: Mutex::new(file),
            rows: AtomicUsize::new(0),
            _row: PhantomData,
        })
    }

    pub fn append(&self, row: &R) -> Result<(), CollectError> {
        let line = encode_line(&self.path, |w| w.serialize(row))?;
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            // A panicking writer cannot have left a partial line behind: lines go out in one call.
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(&line).map_err(|source| {
            error!(path = %self.path.display(), error = %source, "CSV append failed");
            CollectError::Io {
                path: self.path.clone(),
                source,
            }
        })?;
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(self) -> Result<usize, CollectError> {
        let rows = self.rows();
        let file = self.file.into_inner().unwrap_or_else(|p| p.into_inner());
        file.sync_all().map_err(|source| CollectError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), rows, "CSV written");
        Ok(rows)
    }
}

fn encode_line<F>(path: &Path, write: F) -> Result<Vec<u8>, CollectError>
where
    F: FnOnce(&mut csv::Writer<Vec<u8>>) -> csv::Result<()>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    write(&mut writer).map_err(|e| CollectError::Encode {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    writer.into_inner().map_err(|e| CollectError::Encode {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Pair {
        name: String,
        note: String,
    }

    impl CsvRow for Pair {
        const HEADERS: &'static [&'static str] = &["name", "note"];
    }

    #[test]
    fn fields_with_separators_stay_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::<Pair>::create(dir.path().join("out/pairs.csv")).unwrap();
        sink.append(&Pair {
            name: "a,b".into(),
            note: "line1\nline2 \"quoted\"".into(),
        })
        .unwrap();
        let path = sink.path().to_path_buf();
        assert_eq!(sink.finish().unwrap(), 1);

        let mut reader = csv::Reader::from_path(path).unwrap();
        assert_eq!(reader.headers().unwrap(), vec!["name", "note"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "a,b");
        assert_eq!(&rows[0][1], "line1\nline2 \"quoted\"");
    }
}
