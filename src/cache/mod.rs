//! Cache module for atlas
//!
//! Persists the change cache (file fingerprints + per-agent outcomes) and
//! the response cache (model responses keyed by canonical request hash)
//! to the `.atlas/` directory.
//!
//! # Error Handling
//!
//! Cache operations are best-effort. A missing or corrupt cache file loads
//! as an empty cache, and a failed write is logged by the caller without
//! affecting the run verdict. The worst case is redundant model calls.

pub mod change;
pub mod response;

pub use change::{AgentOutcome, ChangeCache, ChangeCacheSnapshot, ChangeReport, FileRecord};
pub use response::{CacheStats, ResponseCache, ResponseCacheEntry};

use crate::error::CacheError;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const CACHE_DIR: &str = ".atlas";
pub const CHANGE_CACHE_FILE: &str = "change_cache.json";
pub const RESPONSE_CACHE_FILE: &str = "response_cache.json";
const CACHE_LOCK_TIMEOUT_SECS: u64 = 5;
const CACHE_LOCK_RETRY_MS: u64 = 50;

/// Options for selective cache reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOption {
    /// Clear change_cache.json - file fingerprints and agent outcomes
    ChangeCache,
    /// Clear response_cache.json - cached model responses
    ResponseCache,
    /// Clear generated agent reports
    Reports,
}

impl ResetOption {
    pub fn label(&self) -> &'static str {
        match self {
            ResetOption::ChangeCache => "Change Cache",
            ResetOption::ResponseCache => "Response Cache",
            ResetOption::Reports => "Reports",
        }
    }

    pub fn all() -> Vec<ResetOption> {
        vec![
            ResetOption::ChangeCache,
            ResetOption::ResponseCache,
            ResetOption::Reports,
        ]
    }
}

/// Owner of the `.atlas/` directory for one repository.
#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
}

pub(crate) struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Cache {
    pub fn new(project_root: &Path) -> Self {
        Self {
            cache_dir: project_root.join(CACHE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn change_cache_path(&self) -> PathBuf {
        self.cache_dir.join(CHANGE_CACHE_FILE)
    }

    pub fn response_cache_path(&self) -> PathBuf {
        self.cache_dir.join(RESPONSE_CACHE_FILE)
    }

    /// Ensure the cache directory exists
    pub(crate) fn ensure_dir(&self) -> Result<(), CacheError> {
        if !self.cache_dir.exists() {
            fs::create_dir_all(&self.cache_dir)
                .map_err(|e| CacheError::io(&self.cache_dir, e))?;
        }
        // Reports may have created the directory first, so check every time.
        if let Err(err) = self.ensure_atlas_ignored() {
            tracing::debug!(error = %err, "could not add .atlas/ to ignore files");
        }
        Ok(())
    }

    fn ensure_atlas_ignored(&self) -> std::io::Result<()> {
        let Some(repo_root) = self.cache_dir.parent() else {
            return Ok(());
        };

        let gitignore_path = repo_root.join(".gitignore");
        if gitignore_path.exists() {
            return append_ignore_entry(&gitignore_path, ".atlas/");
        }

        let git_dir = repo_root.join(".git");
        if git_dir.is_dir() {
            let info_exclude_path = git_dir.join("info").join("exclude");
            if let Some(parent) = info_exclude_path.parent() {
                fs::create_dir_all(parent)?;
            }
            return append_ignore_entry(&info_exclude_path, ".atlas/");
        }

        Ok(())
    }

    /// Advisory exclusive lock held for the duration of a cache write.
    pub(crate) fn lock(&self) -> Result<CacheLock, CacheError> {
        self.ensure_dir()?;

        let lock_path = self.cache_dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CacheError::io(&lock_path, e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(CacheError::io(&lock_path, err));
                    }
                    if start.elapsed() >= Duration::from_secs(CACHE_LOCK_TIMEOUT_SECS) {
                        return Err(CacheError::LockTimeout(CACHE_LOCK_TIMEOUT_SECS));
                    }
                    std::thread::sleep(Duration::from_millis(CACHE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(CacheLock { file })
    }

    /// Remove the selected cache files; returns the labels that were cleared.
    pub fn clear_selective(
        &self,
        options: &[ResetOption],
        reports_dir: &Path,
    ) -> Result<Vec<String>, CacheError> {
        let mut cleared = Vec::new();
        for option in options {
            let removed = match option {
                ResetOption::ChangeCache => remove_if_exists(&self.change_cache_path())?,
                ResetOption::ResponseCache => remove_if_exists(&self.response_cache_path())?,
                ResetOption::Reports => {
                    if reports_dir.is_dir() {
                        fs::remove_dir_all(reports_dir)
                            .map_err(|e| CacheError::io(reports_dir, e))?;
                        true
                    } else {
                        false
                    }
                }
            };
            if removed {
                cleared.push(option.label().to_string());
            }
        }
        Ok(cleared)
    }
}

/// Read a JSON cache file. `Ok(None)` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CacheError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CacheError::io(path, err)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| CacheError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_if_exists(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CacheError::io(path, err)),
    }
}

fn append_ignore_entry(path: &Path, entry: &str) -> std::io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };
    let trimmed = entry.trim_end_matches('/');
    if existing
        .lines()
        .any(|line| line.trim() == entry || line.trim() == trimmed)
    {
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(entry);
    updated.push('\n');
    fs::write(path, updated)
}

/// Write content atomically by writing to a temp file first, then renaming.
///
/// # Platform Notes
/// - **Unix**: Uses atomic `rename()` which is guaranteed to be atomic by POSIX.
/// - **Windows**: Uses a backup-and-restore pattern since `rename()` can fail if the
///   destination exists. A crash between the two renames leaves a `.bak` file
///   that can be used for recovery.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(|e| CacheError::io(&tmp_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&tmp_path, perms);
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(CacheError::io(path, err));
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(CacheError::io(path, err));
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(CacheError::io(path, err));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, "{\"a\":1}").unwrap();
        write_atomic(&path, "{\"a\":2}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn read_json_distinguishes_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let missing: Option<serde_json::Value> = read_json(&path).unwrap();
        assert!(missing.is_none());

        fs::write(&path, "{not json").unwrap();
        let corrupt = read_json::<serde_json::Value>(&path);
        assert!(matches!(corrupt, Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn ensure_dir_adds_gitignore_entry_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "target/").unwrap();

        let cache = Cache::new(dir.path());
        cache.ensure_dir().unwrap();
        append_ignore_entry(&dir.path().join(".gitignore"), ".atlas/").unwrap();

        let content = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content.matches(".atlas/").count(), 1);
        assert!(content.starts_with("target/\n"));
    }

    #[test]
    fn clear_selective_removes_requested_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        cache.ensure_dir().unwrap();
        fs::write(cache.change_cache_path(), "{}").unwrap();
        fs::write(cache.response_cache_path(), "{}").unwrap();
        let reports = cache.dir().join("reports");
        fs::create_dir_all(&reports).unwrap();
        fs::write(reports.join("structure.md"), "# x").unwrap();

        let cleared = cache
            .clear_selective(&[ResetOption::ChangeCache, ResetOption::Reports], &reports)
            .unwrap();

        assert_eq!(cleared, vec!["Change Cache", "Reports"]);
        assert!(!cache.change_cache_path().exists());
        assert!(cache.response_cache_path().exists());
        assert!(!reports.exists());
    }

    #[test]
    fn lock_is_reentrant_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        {
            let _lock = cache.lock().unwrap();
        }
        assert!(cache.lock().is_ok());
    }
}
