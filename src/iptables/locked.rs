use crate::iptables::error::{IpTablesError, IpTablesResult};
use crate::iptables::{IpTables, IpTablesRule};
use crate::utils::filesystem::FileSystemUtils;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Inter-process advisory lock guarding the packet filter
pub trait Locker: Send + Sync {
    fn lock(&self) -> IpTablesResult<()>;
    fn unlock(&self) -> IpTablesResult<()>;
}

/// flock(2)-based locker on a well-known path shared by every process that
/// edits the filter tables (install engine invocations and the agent).
pub struct FileLocker {
    path: PathBuf,
    owner: Option<(String, String)>,
    held: Mutex<Option<File>>,
}

impl FileLocker {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            owner: None,
            held: Mutex::new(None),
        }
    }

    /// chown the lock file on creation so unprivileged readers can open it
    pub fn with_owner(mut self, user: &str, group: &str) -> Self {
        if !user.is_empty() && !group.is_empty() {
            self.owner = Some((user.to_string(), group.to_string()));
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> IpTablesResult<File> {
        let existed = self.path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| {
                IpTablesError::Lock(format!("open {}: {}", self.path.display(), e))
            })?;

        if !existed {
            if let Some((user, group)) = &self.owner {
                FileSystemUtils::chown_by_name(&self.path, user, group)
                    .map_err(|e| IpTablesError::Lock(format!("chown lock file: {}", e)))?;
            }
        }
        Ok(file)
    }
}

impl Locker for FileLocker {
    fn lock(&self) -> IpTablesResult<()> {
        let file = self.open()?;
        file.lock_exclusive().map_err(|e| {
            IpTablesError::Lock(format!("flock {}: {}", self.path.display(), e))
        })?;
        *self.held.lock() = Some(file);
        Ok(())
    }

    fn unlock(&self) -> IpTablesResult<()> {
        match self.held.lock().take() {
            Some(file) => FileExt::unlock(&file).map_err(|e| {
                IpTablesError::Lock(format!("unlock {}: {}", self.path.display(), e))
            }),
            None => Err(IpTablesError::Lock(format!(
                "{} is not locked",
                self.path.display()
            ))),
        }
    }
}

/// Packet-filter adapter that holds the inter-process lock around every call.
///
/// Single calls lock and unlock on their own. `locked` holds the lock across a
/// closure so a caller can make several edits (create chain, link it, fill it)
/// that no other process can observe half-done.
pub struct LockedIpTables {
    ipt: Box<dyn IpTables>,
    locker: Box<dyn Locker>,
    // serialises in-process callers; the file lock only orders processes
    guard: Mutex<()>,
}

impl LockedIpTables {
    pub fn new(ipt: Box<dyn IpTables>, locker: Box<dyn Locker>) -> Self {
        Self {
            ipt,
            locker,
            guard: Mutex::new(()),
        }
    }

    pub fn locked<R>(
        &self,
        f: impl FnOnce(&dyn IpTables) -> IpTablesResult<R>,
    ) -> IpTablesResult<R> {
        let _guard = self.guard.lock();
        self.locker.lock()?;

        let result = f(self.ipt.as_ref());
        let unlocked = self.locker.unlock();

        match (result, unlocked) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(op), Ok(())) => Err(op),
            (Err(op), Err(unlock)) => Err(IpTablesError::Unlock {
                op: Box::new(op),
                unlock: unlock.to_string(),
            }),
            (Ok(_), Err(unlock)) => Err(unlock),
        }
    }
}

impl IpTables for LockedIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.new_chain(table, chain))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.delete_chain(table, chain))
    }

    fn clear_chain(&self, table: &str, chain: &str) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.clear_chain(table, chain))
    }

    fn append(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.append(table, chain, rule))
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &IpTablesRule,
    ) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.insert(table, chain, position, rule))
    }

    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.delete(table, chain, rule))
    }

    fn exists(&self, table: &str, chain: &str, rule: &IpTablesRule) -> IpTablesResult<bool> {
        self.locked(|ipt| ipt.exists(table, chain, rule))
    }

    fn list(&self, table: &str, chain: &str) -> IpTablesResult<Vec<String>> {
        self.locked(|ipt| ipt.list(table, chain))
    }

    fn list_chains(&self, table: &str) -> IpTablesResult<Vec<String>> {
        self.locked(|ipt| ipt.list_chains(table))
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.bulk_append(table, chain, rules))
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.bulk_insert(table, chain, position, rules))
    }

    fn flush_and_restore(&self, script: &str) -> IpTablesResult<()> {
        self.locked(|ipt| ipt.flush_and_restore(script))
    }

    fn rule_count(&self, table: &str) -> IpTablesResult<usize> {
        self.locked(|ipt| ipt.rule_count(table))
    }
}
