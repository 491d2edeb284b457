use crate::constants::metadata;
use crate::errors::FleetError;
use crate::model::{MetadataItem, MetadataResource, MetadataScope};
use crate::services::metadata_store::MetadataStore;
use crate::stores::memory_metadata_store::{MemoryMetadataStore, StoredResource};
use crate::utils::fs_atomic::{atomic_write_text_file, ensure_dir_for_file};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// JSON-file metadata store shared by every fleetrun process on the
/// machine. Reads always come from disk, and writes re-read the file
/// under a sibling `.lock` file, so a fingerprint taken by one process is
/// rejected once another process has committed.
#[derive(Clone)]
pub struct FileMetadataStore {
    inner: MemoryMetadataStore,
    file_path: PathBuf,
    lock_path: PathBuf,
    lock_wait: Duration,
    queue: Arc<Mutex<()>>,
}

impl FileMetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let file_path = path.as_ref().to_path_buf();
        let mut lock_name = file_path.clone().into_os_string();
        lock_name.push(".lock");
        let store = Self {
            inner: MemoryMetadataStore::new(),
            file_path,
            lock_path: PathBuf::from(lock_name),
            lock_wait: Duration::from_millis(metadata::LOCK_WAIT_MS),
            queue: Arc::new(Mutex::new(())),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    /// How long a write waits for another process to release the lock.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn load_from_disk(&self) -> Result<(), FleetError> {
        if !self.file_path.exists() {
            self.inner.import(BTreeMap::new());
            return Ok(());
        }
        let raw = fs::read_to_string(&self.file_path).map_err(|err| {
            FleetError::reconciliation(format!("Failed to load metadata store: {}", err))
        })?;
        let parsed: BTreeMap<String, StoredResource> = serde_json::from_str(&raw).map_err(|err| {
            FleetError::reconciliation(format!("Failed to parse metadata store: {}", err))
        })?;
        self.inner.import(parsed);
        Ok(())
    }

    fn persist(&self) -> Result<(), FleetError> {
        let payload = serde_json::to_string_pretty(&self.inner.export())?;
        atomic_write_text_file(&self.file_path, &format!("{}\n", payload), 0o600).map_err(|err| {
            FleetError::reconciliation(format!("Failed to persist metadata store: {}", err))
        })
    }

    pub fn inner(&self) -> &MemoryMetadataStore {
        &self.inner
    }
}

/// Exclusive hold on the store's lock file; removed on drop.
struct LockGuard {
    lock_path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path, wait: Duration) -> Result<Self, FleetError> {
        ensure_dir_for_file(path)?;
        let started = Instant::now();
        loop {
            match OpenOptions::new().create_new(true).write(true).open(path) {
                Ok(mut handle) => {
                    let _ = writeln!(handle, "{}", std::process::id());
                    return Ok(Self {
                        lock_path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= wait {
                        return Err(FleetError::timeout(format!(
                            "metadata store is locked by another process ({})",
                            path.display()
                        ))
                        .with_hint("If no other fleetrun is running, remove the lock file."));
                    }
                    std::thread::sleep(Duration::from_millis(metadata::LOCK_POLL_MS));
                }
                Err(err) => {
                    return Err(FleetError::reconciliation(format!(
                        "Failed to lock metadata store: {}",
                        err
                    )))
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn get_metadata(&self, scope: &MetadataScope) -> Result<MetadataResource, FleetError> {
        let _guard = self.queue.lock().unwrap_or_else(|err| err.into_inner());
        self.load_from_disk()?;
        Ok(self.inner.snapshot(scope))
    }

    async fn set_metadata(
        &self,
        scope: &MetadataScope,
        items: Vec<MetadataItem>,
        fingerprint: &str,
    ) -> Result<(), FleetError> {
        let _guard = self.queue.lock().unwrap_or_else(|err| err.into_inner());
        let _lock = LockGuard::acquire(&self.lock_path, self.lock_wait)?;
        self.load_from_disk()?;
        self.inner.compare_and_set(scope, items, fingerprint)?;
        self.persist()
    }
}
