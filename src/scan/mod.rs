//! Repository scanner
//!
//! Walks the repository, skips ignored directories and binary files, and
//! fingerprints every remaining file. A file whose size and modification
//! time match the previous snapshot keeps its stored hash without being
//! read again; everything else is hashed on a bounded rayon pool.

use crate::cache::FileRecord;
use crate::config::effective_workers;
use crate::error::ScanError;
use crate::util::{hash_bytes, normalize_rel_path};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Bytes inspected when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8192;

/// Directory names that are never scanned.
const ALWAYS_IGNORED: &[&str] = &[
    "target",
    "node_modules",
    ".git",
    ".svn",
    ".hg",
    "dist",
    "build",
    "__pycache__",
    ".pytest_cache",
    "vendor",
    ".idea",
    ".vscode",
    crate::cache::CACHE_DIR,
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "doc", "docx", "xls", "xlsx", "ppt",
    "pptx", "zip", "tar", "gz", "rar", "7z", "exe", "dll", "so", "dylib", "a", "o", "class",
    "jar", "wasm", "mp3", "mp4", "avi", "mov", "wav", "woff", "woff2", "ttf", "otf", "eot",
];

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Glob patterns matched against repo-relative paths and file names.
    pub ignore_patterns: Vec<String>,
    /// Repo-relative directories pruned as a whole, such as the report
    /// directory when it lives inside the repository.
    pub excluded_dirs: Vec<String>,
    /// Hash threads. `0` means available parallelism.
    pub max_hash_workers: usize,
    pub max_file_bytes: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            excluded_dirs: Vec::new(),
            max_hash_workers: 0,
            max_file_bytes: 4 * 1024 * 1024,
        }
    }
}

/// A file that could not be fingerprinted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanFailure {
    pub path: String,
    pub message: String,
}

/// Cache effectiveness counters for one scan.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ScanMetrics {
    pub total_files: usize,
    /// Fingerprint reused from the previous snapshot.
    pub cached_files: usize,
    /// Fingerprint computed by reading the file.
    pub hashed_files: usize,
    pub skipped_binary: usize,
    pub skipped_large: usize,
    pub failed_files: usize,
    pub errors: Vec<ScanFailure>,
}

impl ScanMetrics {
    /// Share of files whose fingerprint was reused, 0.0 to 1.0.
    pub fn reuse_ratio(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.cached_files as f64 / self.total_files as f64
    }
}

/// Files keyed by repo-relative path, plus scan metrics.
pub type ScanResult = (BTreeMap<String, FileRecord>, ScanMetrics);

struct Candidate {
    rel: String,
    abs: PathBuf,
    size: u64,
    modified_at: Option<DateTime<Utc>>,
}

enum HashOutcome {
    Hashed(FileRecord),
    Binary,
    Failed(ScanFailure),
}

pub struct FileScanner {
    options: ScanOptions,
    ignore: GlobSet,
}

impl FileScanner {
    pub fn new(options: ScanOptions) -> Result<Self, ScanError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.ignore_patterns {
            let glob = Glob::new(pattern).map_err(|source| ScanError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let ignore = builder.build().map_err(|source| ScanError::InvalidPattern {
            pattern: options.ignore_patterns.join(", "),
            source,
        })?;
        Ok(Self { options, ignore })
    }

    /// Scan `root`, reusing hashes from `previous` where size and mtime match.
    pub fn scan(
        &self,
        root: &Path,
        previous: Option<&BTreeMap<String, FileRecord>>,
    ) -> Result<ScanResult, ScanError> {
        if !root.exists() {
            return Err(ScanError::RootMissing(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let mut metrics = ScanMetrics::default();
        let candidates = self.collect_candidates(root, &mut metrics);

        let mut files = BTreeMap::new();
        let mut to_hash = Vec::new();
        for candidate in candidates {
            let reusable = previous
                .and_then(|prev| prev.get(&candidate.rel))
                .filter(|record| {
                    record.size == candidate.size
                        && candidate.modified_at == Some(record.modified_at)
                });
            match reusable {
                Some(record) => {
                    metrics.cached_files += 1;
                    files.insert(
                        candidate.rel.clone(),
                        FileRecord {
                            path: candidate.rel,
                            hash: record.hash.clone(),
                            size: record.size,
                            modified_at: record.modified_at,
                        },
                    );
                }
                None => to_hash.push(candidate),
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(effective_workers(self.options.max_hash_workers))
            .build()
            .map_err(|e| ScanError::WorkerPool(e.to_string()))?;
        let outcomes: Vec<HashOutcome> =
            pool.install(|| to_hash.into_par_iter().map(hash_candidate).collect());

        for outcome in outcomes {
            match outcome {
                HashOutcome::Hashed(record) => {
                    metrics.hashed_files += 1;
                    files.insert(record.path.clone(), record);
                }
                HashOutcome::Binary => metrics.skipped_binary += 1,
                HashOutcome::Failed(failure) => {
                    tracing::debug!(
                        path = %failure.path,
                        error = %failure.message,
                        "failed to hash file"
                    );
                    metrics.failed_files += 1;
                    metrics.errors.push(failure);
                }
            }
        }
        metrics.total_files = files.len();

        tracing::debug!(
            total = metrics.total_files,
            cached = metrics.cached_files,
            hashed = metrics.hashed_files,
            failed = metrics.failed_files,
            "scan complete"
        );
        Ok((files, metrics))
    }

    fn collect_candidates(&self, root: &Path, metrics: &mut ScanMetrics) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            e.depth() == 0 || !self.is_ignored(root, e.path(), e.file_type().is_dir())
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| normalize_rel_path(p, root))
                        .unwrap_or_default();
                    metrics.failed_files += 1;
                    metrics.errors.push(ScanFailure {
                        path,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let rel = normalize_rel_path(path, root);
            if has_binary_extension(path) {
                metrics.skipped_binary += 1;
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    metrics.failed_files += 1;
                    metrics.errors.push(ScanFailure {
                        path: rel,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if metadata.len() > self.options.max_file_bytes {
                metrics.skipped_large += 1;
                continue;
            }

            candidates.push(Candidate {
                rel,
                abs: path.to_path_buf(),
                size: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        candidates
    }

    fn is_ignored(&self, root: &Path, path: &Path, is_dir: bool) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if is_dir && (ALWAYS_IGNORED.contains(&name) || name.starts_with('.')) {
            return true;
        }
        if self.ignore.is_empty() && self.options.excluded_dirs.is_empty() {
            return false;
        }
        let rel = normalize_rel_path(path, root);
        if is_dir && self.options.excluded_dirs.iter().any(|d| *d == rel) {
            return true;
        }
        self.ignore.is_match(&rel) || self.ignore.is_match(name)
    }
}

/// Convenience wrapper for one-off scans.
pub fn scan(
    root: &Path,
    options: ScanOptions,
    previous: Option<&BTreeMap<String, FileRecord>>,
) -> Result<ScanResult, ScanError> {
    FileScanner::new(options)?.scan(root, previous)
}

fn hash_candidate(candidate: Candidate) -> HashOutcome {
    let bytes = match fs::read(&candidate.abs) {
        Ok(bytes) => bytes,
        Err(err) => {
            return HashOutcome::Failed(ScanFailure {
                path: candidate.rel,
                message: err.to_string(),
            })
        }
    };
    if looks_binary(&bytes) {
        return HashOutcome::Binary;
    }
    HashOutcome::Hashed(FileRecord {
        hash: hash_bytes(&bytes),
        size: bytes.len() as u64,
        modified_at: candidate.modified_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        path: candidate.rel,
    })
}

fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn scan_skips_ignored_dirs_and_binaries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/lib.rs", b"pub fn a() {}");
        write(root, "node_modules/pkg/index.js", b"module.exports = 1");
        write(root, ".atlas/change_cache.json", b"{}");
        write(root, "assets/logo.png", b"\x89PNG");
        write(root, "data/blob.bin", b"abc\0def");
        write(root, "logs/run.log", b"noise");

        let options = ScanOptions {
            ignore_patterns: vec!["logs".to_string()],
            ..ScanOptions::default()
        };
        let (files, metrics) = scan(root, options, None).unwrap();

        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["src/lib.rs"]);
        assert_eq!(metrics.total_files, 1);
        assert_eq!(metrics.hashed_files, 1);
        assert_eq!(metrics.cached_files, 0);
        assert_eq!(metrics.skipped_binary, 2);
        assert_eq!(files["src/lib.rs"].hash, hash_bytes(b"pub fn a() {}"));
    }

    #[test]
    fn unchanged_files_reuse_previous_hash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.rs", b"fn a() {}");
        write(root, "b.rs", b"fn b() {}");

        let (first, _) = scan(root, ScanOptions::default(), None).unwrap();

        // Poison the stored hash: a cache hit must not re-read the file.
        let mut previous = first.clone();
        previous.get_mut("a.rs").unwrap().hash = "stale".to_string();

        let (second, metrics) = scan(root, ScanOptions::default(), Some(&previous)).unwrap();
        assert_eq!(metrics.cached_files, 2);
        assert_eq!(metrics.hashed_files, 0);
        assert_eq!(second["a.rs"].hash, "stale");
    }

    #[test]
    fn changed_mtime_triggers_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "a.rs", b"fn a() {}");
        let (first, _) = scan(root, ScanOptions::default(), None).unwrap();

        write(root, "a.rs", b"fn a() { 1 }");
        let file = fs::File::options().write(true).open(root.join("a.rs")).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();

        let (second, metrics) = scan(root, ScanOptions::default(), Some(&first)).unwrap();
        assert_eq!(metrics.hashed_files, 1);
        assert_ne!(second["a.rs"].hash, first["a.rs"].hash);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = scan(&missing, ScanOptions::default(), None).unwrap_err();
        assert!(matches!(err, ScanError::RootMissing(_)));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let options = ScanOptions {
            ignore_patterns: vec!["[".to_string()],
            ..ScanOptions::default()
        };
        assert!(matches!(
            FileScanner::new(options),
            Err(ScanError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn single_hash_worker_still_hashes_everything() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            write(dir.path(), &format!("src/f{i}.rs"), format!("fn f{i}() {{}}").as_bytes());
        }
        let options = ScanOptions {
            max_hash_workers: 1,
            ..ScanOptions::default()
        };
        let (files, metrics) = scan(dir.path(), options, None).unwrap();
        assert_eq!(files.len(), 20);
        assert_eq!(metrics.hashed_files, 20);
    }

    #[test]
    fn binary_sniffing_reads_prefix_only() {
        assert!(!looks_binary(b"plain text"));
        assert!(looks_binary(b"\0\0\0"));

        let mut late_nul = vec![b'a'; BINARY_SNIFF_BYTES];
        late_nul.push(0);
        assert!(!looks_binary(&late_nul));
        assert!(has_binary_extension(Path::new("assets/Logo.PNG")));
    }

    #[test]
    fn excluded_dirs_are_pruned_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "docs/atlas/structure.md", b"# Structure");
        write(root, "docs/guide.md", b"# Guide");
        write(root, "atlas/keep.rs", b"fn keep() {}");

        let options = ScanOptions {
            excluded_dirs: vec!["docs/atlas".to_string()],
            ..ScanOptions::default()
        };
        let (files, _) = scan(root, options, None).unwrap();
        assert_eq!(
            files.keys().collect::<Vec<_>>(),
            vec!["atlas/keep.rs", "docs/guide.md"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_recorded_and_siblings_are_hashed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/a.rs", b"fn a() {}");
        write(root, "src/locked.rs", b"fn locked() {}");
        write(root, "src/b.rs", b"fn b() {}");
        let locked = root.join("src/locked.rs");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&locked).is_ok() {
            // Running as root: permissions are not enforced.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
            return;
        }

        let result = scan(root, ScanOptions::default(), None);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
        let (files, metrics) = result.unwrap();

        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(metrics.hashed_files, 2);
        assert_eq!(metrics.failed_files, 1);
        assert_eq!(metrics.errors.len(), 1);
        assert_eq!(metrics.errors[0].path, "src/locked.rs");
        assert_eq!(metrics.total_files, 2);
    }

    #[test]
    fn reuse_ratio_reflects_cached_share() {
        assert_eq!(ScanMetrics::default().reuse_ratio(), 0.0);
        let metrics = ScanMetrics {
            total_files: 4,
            cached_files: 3,
            ..ScanMetrics::default()
        };
        assert_eq!(metrics.reuse_ratio(), 0.75);
    }
}
