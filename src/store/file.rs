//! JSON file backed progress store.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ProgressRecord, ProgressStore, UnitUpdate, SCHEMA_VERSION};
use crate::error::StoreError;
use crate::job::JobId;

/// Stores one `<job_id>.json` record per job under a root directory.
///
/// Writes go to a uniquely named temporary file in the same directory which
/// is fsynced and then renamed over the record, so readers only ever observe
/// a complete record. The async [`ProgressStore`] methods run the file I/O on
/// the blocking pool; the `*_blocking` methods are for callers outside the
/// runtime.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileProgressStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record file for a job.
    pub fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{job_id}.json"))
    }

    pub fn load_blocking(&self, job_id: &JobId) -> Result<ProgressRecord, StoreError> {
        read_record(&self.record_path(job_id), job_id)
    }

    pub fn save_blocking(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.write_record(record)
    }

    fn update_unit_blocking(
        &self,
        job_id: &JobId,
        index: usize,
        update: UnitUpdate,
    ) -> Result<ProgressRecord, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut record = read_record(&self.record_path(job_id), job_id)?;
        let unit = record
            .units
            .get_mut(index)
            .ok_or_else(|| StoreError::UnitOutOfRange {
                job_id: job_id.to_string(),
                index,
            })?;
        update(unit);
        record.updated_at = Utc::now();

        self.write_record(&record)?;
        Ok(record)
    }

    fn delete_blocking(&self, job_id: &JobId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.record_path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub fn list_blocking(&self) -> Result<Vec<ProgressRecord>, StoreError> {
        let pattern = format!(
            "{}/*.json",
            glob::Pattern::escape(&self.root.to_string_lossy())
        );
        let paths = glob::glob(&pattern).map_err(|e| StoreError::Io {
            path: self.root.clone(),
            source: std::io::Error::new(ErrorKind::InvalidInput, e.to_string()),
        })?;

        let mut records = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable store entry");
                    continue;
                }
            };
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            match read_record(&path, &JobId::from_string(stem)) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable progress record"),
            }
        }

        records.sort_by(|a, b| a.job.created_at.cmp(&b.job.created_at));
        Ok(records)
    }

    fn write_record(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.job.id);
        let json = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            message: format!("failed to serialize record: {e}"),
        })?;
        write_atomic(&path, &json)?;
        debug!(job_id = %record.job.id, path = ?path, "Progress record saved");
        Ok(())
    }

    /// Runs `op` against a clone of this store on the blocking pool.
    async fn offload<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&FileProgressStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self, job_id: &JobId) -> Result<ProgressRecord, StoreError> {
        let job_id = job_id.clone();
        self.offload(move |store| store.load_blocking(&job_id)).await
    }

    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.offload(move |store| store.save_blocking(&record)).await
    }

    async fn update_unit(
        &self,
        job_id: &JobId,
        index: usize,
        update: UnitUpdate,
    ) -> Result<ProgressRecord, StoreError> {
        let job_id = job_id.clone();
        self.offload(move |store| store.update_unit_blocking(&job_id, index, update))
            .await
    }

    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError> {
        let job_id = job_id.clone();
        self.offload(move |store| store.delete_blocking(&job_id)).await
    }

    async fn list(&self) -> Result<Vec<ProgressRecord>, StoreError> {
        self.offload(|store| store.list_blocking()).await
    }
}

/// Reads and validates a record file.
fn read_record(path: &Path, job_id: &JobId) -> Result<ProgressRecord, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                job_id: job_id.to_string(),
            })
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let corrupt = |message: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        message,
    };

    let record: ProgressRecord =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    if record.schema_version != SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema version {} (expected {})",
            record.schema_version, SCHEMA_VERSION
        )));
    }
    if &record.job.id != job_id {
        return Err(corrupt(format!(
            "record belongs to job {} not {}",
            record.job.id, job_id
        )));
    }
    if !record.is_consistent() {
        return Err(corrupt(
            "work units do not cover the source duration".to_string(),
        ));
    }

    Ok(record)
}

/// Writes `contents` to `path` through an fsynced temporary file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "record".to_string());
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(parent)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
