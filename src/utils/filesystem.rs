use nix::unistd::{chown, Group, User};
use std::fs;
use std::io::Write;
use std::path::Path;

pub struct FileSystemUtils;

impl FileSystemUtils {
    /// Change ownership of `path` to the named user and group
    pub fn chown_by_name<P: AsRef<Path>>(path: P, user: &str, group: &str) -> Result<(), String> {
        let path_ref = path.as_ref();

        let uid = User::from_name(user)
            .map_err(|e| format!("Failed to look up user '{}': {}", user, e))?
            .ok_or_else(|| format!("Unknown user '{}'", user))?
            .uid;
        let gid = Group::from_name(group)
            .map_err(|e| format!("Failed to look up group '{}': {}", group, e))?
            .ok_or_else(|| format!("Unknown group '{}'", group))?
            .gid;

        chown(path_ref, Some(uid), Some(gid))
            .map_err(|e| format!("Failed to chown '{}': {}", path_ref.display(), e))
    }

    /// Create the parent directory of `path` if it does not exist
    pub fn ensure_parent_dir<P: AsRef<Path>>(path: P) -> Result<(), String> {
        match path.as_ref().parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
                fs::create_dir_all(parent).map_err(|e| {
                    format!(
                        "Failed to create parent directory '{}': {}",
                        parent.display(),
                        e
                    )
                })
            }
            _ => Ok(()),
        }
    }

    /// Replace `path` with `content` via write-to-temp, fsync, rename.
    /// Readers see either the old or the new file, never a partial one.
    pub fn write_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<(), String> {
        let path_ref = path.as_ref();
        let dir = match path_ref.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| format!("Failed to create temp file in '{}': {}", dir.display(), e))?;
        tmp.write_all(content)
            .map_err(|e| format!("Failed to write temp file: {}", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| format!("Failed to sync temp file: {}", e))?;
        tmp.persist(path_ref)
            .map_err(|e| format!("Failed to rename into '{}': {}", path_ref.display(), e.error))?;
        Ok(())
    }

    /// Read a file, treating a missing file as empty
    pub fn read_file_or_empty<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, String> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(format!(
                "Failed to read file '{}': {}",
                path.as_ref().display(),
                e
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        FileSystemUtils::write_atomic(&path, b"{\"a\":1}").unwrap();
        FileSystemUtils::write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");

        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = FileSystemUtils::read_file_or_empty(dir.path().join("nope")).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_ensure_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        FileSystemUtils::ensure_parent_dir(&path).unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn test_chown_unknown_user_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        let err = FileSystemUtils::chown_by_name(&path, "no-such-user-xyz", "no-such-group-xyz")
            .unwrap_err();
        assert!(err.contains("no-such-user-xyz"));
    }
}
