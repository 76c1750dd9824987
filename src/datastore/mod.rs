// Container datastore - one JSON file mapping handle -> {handle, ip, metadata}.
// Writers hold `<path>_lock` exclusively and bump `<path>_version` so long-lived
// readers can skip re-parsing an unchanged file.

use crate::utils::filesystem::FileSystemUtils;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("container {0} already exists")]
    Duplicate(String),

    #[error("decoding file: {0}")]
    Decode(String),

    #[error("encoding file: {0}")]
    Encode(String),

    #[error("lock: {0}")]
    Lock(String),

    #[error("{0}")]
    Io(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One live container on this host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub handle: String,
    pub ip: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Container {
    fn metadata_str(&self, key: &str) -> &str {
        self.metadata.get(key).and_then(Value::as_str).unwrap_or("")
    }

    pub fn policy_group_id(&self) -> &str {
        self.metadata_str("policy_group_id")
    }

    pub fn space_id(&self) -> &str {
        self.metadata_str("space_id")
    }

    /// `app`, `task`, `staging` or empty
    pub fn workload(&self) -> &str {
        self.metadata_str("container_workload")
    }

    /// Exposed ports; entries that fail to parse are dropped.
    pub fn ports(&self) -> Vec<u16> {
        self.metadata_str("ports")
            .split(',')
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .collect()
    }
}

pub type Containers = BTreeMap<String, Container>;

pub struct Store {
    path: PathBuf,
    lock_path: PathBuf,
    version_path: PathBuf,
    owner: Option<(String, String)>,
    rw: RwLock<()>,
    cache: Mutex<Option<(u64, Containers)>>,
}

impl Store {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = suffixed(&path, "_lock");
        let version_path = suffixed(&path, "_version");
        Self {
            path,
            lock_path,
            version_path,
            owner: None,
            rw: RwLock::new(()),
            cache: Mutex::new(None),
        }
    }

    /// chown newly created state files; ignored unless both are set
    pub fn with_owner(mut self, user: &str, group: &str) -> Self {
        if !user.is_empty() && !group.is_empty() {
            self.owner = Some((user.to_string(), group.to_string()));
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a new container; an existing record for `handle` is left alone.
    pub fn add(&self, handle: &str, ip: &str, metadata: Metadata) -> StoreResult<()> {
        if handle.is_empty() {
            return Err(StoreError::InvalidHandle);
        }

        self.modify(|containers| {
            if containers.contains_key(handle) {
                return Err(StoreError::Duplicate(handle.to_string()));
            }
            containers.insert(
                handle.to_string(),
                Container {
                    handle: handle.to_string(),
                    ip: ip.to_string(),
                    metadata,
                },
            );
            Ok(())
        })?;
        tracing::debug!(handle, ip, "stored container");
        Ok(())
    }

    /// Remove `handle`, returning the record so callers can still learn its IP.
    pub fn delete(&self, handle: &str) -> StoreResult<Option<Container>> {
        if handle.is_empty() {
            return Err(StoreError::InvalidHandle);
        }
        self.modify(|containers| Ok(containers.remove(handle)))
    }

    pub fn contains(&self, handle: &str) -> StoreResult<bool> {
        Ok(self.read_all()?.contains_key(handle))
    }

    pub fn read_all(&self) -> StoreResult<Containers> {
        let _guard = self.rw.read();
        let lock = self.open_lock()?;
        lock.lock_shared()
            .map_err(|e| StoreError::Lock(format!("{}: {}", self.lock_path.display(), e)))?;

        let result = self.read_cached();
        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(path = %self.lock_path.display(), error = %e, "releasing shared lock");
        }
        result
    }

    fn read_cached(&self) -> StoreResult<Containers> {
        let version = self.read_version()?;
        if let Some((cached_version, containers)) = self.cache.lock().as_ref() {
            if *cached_version == version && version > 0 {
                return Ok(containers.clone());
            }
        }

        let containers = self.load()?;
        *self.cache.lock() = Some((version, containers.clone()));
        Ok(containers)
    }

    /// Load, edit and write back under the exclusive lock; an `Err` from `f`
    /// leaves the file untouched.
    fn modify<R>(&self, f: impl FnOnce(&mut Containers) -> StoreResult<R>) -> StoreResult<R> {
        let _guard = self.rw.write();
        let lock = self.open_lock()?;
        lock.lock_exclusive()
            .map_err(|e| StoreError::Lock(format!("{}: {}", self.lock_path.display(), e)))?;

        let result = self.modify_locked(f);
        if let Err(e) = FileExt::unlock(&lock) {
            tracing::warn!(path = %self.lock_path.display(), error = %e, "releasing exclusive lock");
        }
        result
    }

    fn modify_locked<R>(
        &self,
        f: impl FnOnce(&mut Containers) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut containers = self.load()?;
        let out = f(&mut containers)?;

        let created = !self.path.exists();
        let encoded =
            serde_json::to_vec(&containers).map_err(|e| StoreError::Encode(e.to_string()))?;
        FileSystemUtils::write_atomic(&self.path, &encoded).map_err(StoreError::Io)?;
        if created {
            self.chown(&self.path)?;
        }

        let version = self.read_version()? + 1;
        let version_created = !self.version_path.exists();
        FileSystemUtils::write_atomic(&self.version_path, version.to_string().as_bytes())
            .map_err(StoreError::Io)?;
        if version_created {
            self.chown(&self.version_path)?;
        }

        *self.cache.lock() = Some((version, containers));
        Ok(out)
    }

    fn load(&self) -> StoreResult<Containers> {
        let bytes = FileSystemUtils::read_file_or_empty(&self.path).map_err(StoreError::Io)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Containers::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn read_version(&self) -> StoreResult<u64> {
        let bytes =
            FileSystemUtils::read_file_or_empty(&self.version_path).map_err(StoreError::Io)?;
        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim();
        if text.is_empty() {
            return Ok(0);
        }
        text.parse::<u64>()
            .map_err(|e| StoreError::Decode(format!("version file: {}", e)))
    }

    fn open_lock(&self) -> StoreResult<File> {
        FileSystemUtils::ensure_parent_dir(&self.lock_path).map_err(StoreError::Io)?;
        let created = !self.lock_path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_path)
            .map_err(|e| StoreError::Lock(format!("open {}: {}", self.lock_path.display(), e)))?;
        if created {
            self.chown(&self.lock_path)?;
        }
        Ok(file)
    }

    fn chown(&self, path: &Path) -> StoreResult<()> {
        if let Some((user, group)) = &self.owner {
            FileSystemUtils::chown_by_name(path, user, group).map_err(StoreError::Io)?;
        }
        Ok(())
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
