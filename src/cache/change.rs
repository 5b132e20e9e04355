//! Change cache: file fingerprints and per-agent outcomes from the last run.
//!
//! The snapshot is loaded once at the start of a run, diffed against the
//! fresh scan to decide which agents must rerun, and replaced atomically
//! after every dispatched agent has finished.

use super::{read_json, write_atomic, Cache};
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Fingerprint of one scanned file. Identity is `path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Repo-relative path; stored as the map key on disk.
    #[serde(skip)]
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutcome {
    pub succeeded: bool,
    /// Aggregate fingerprint of the file set the agent last observed.
    pub input_fingerprint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeCacheSnapshot {
    pub files: BTreeMap<String, FileRecord>,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub agent_outcomes: BTreeMap<String, AgentOutcome>,
}

impl ChangeCacheSnapshot {
    fn restore_paths(&mut self) {
        for (path, record) in self.files.iter_mut() {
            record.path = path.clone();
        }
    }
}

/// Diff between the previous snapshot and the current scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeReport {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub has_changes: bool,
    pub agents_to_run: BTreeSet<String>,
    pub agents_to_skip: BTreeSet<String>,
}

impl ChangeReport {
    pub fn changed_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Order-independent digest over `(path, hash)` pairs.
pub fn aggregate_fingerprint(files: &BTreeMap<String, FileRecord>) -> String {
    let mut hasher = Sha256::new();
    for (path, record) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(record.hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct ChangeCache {
    cache: Cache,
    snapshot: ChangeCacheSnapshot,
}

impl ChangeCache {
    /// Load the previous snapshot. A missing or unreadable file yields an
    /// empty snapshot; cache loss only costs a full run.
    pub fn load(root: &Path) -> Self {
        let cache = Cache::new(root);
        let snapshot = match read_json::<ChangeCacheSnapshot>(&cache.change_cache_path()) {
            Ok(Some(mut snapshot)) => {
                snapshot.restore_paths();
                snapshot
            }
            Ok(None) => ChangeCacheSnapshot::default(),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "change cache unreadable; starting from an empty snapshot"
                );
                ChangeCacheSnapshot::default()
            }
        };
        Self { cache, snapshot }
    }

    /// A change cache that has never been persisted.
    pub fn empty(root: &Path) -> Self {
        Self {
            cache: Cache::new(root),
            snapshot: ChangeCacheSnapshot::default(),
        }
    }

    pub fn snapshot(&self) -> &ChangeCacheSnapshot {
        &self.snapshot
    }

    /// Diff `current` against the loaded snapshot and decide, for each of
    /// `agents`, whether it must rerun.
    pub fn detect_changes(
        &self,
        current: &BTreeMap<String, FileRecord>,
        agents: &[String],
    ) -> ChangeReport {
        let mut report = ChangeReport::default();
        let previous = &self.snapshot.files;

        for (path, record) in current {
            match previous.get(path) {
                None => {
                    report.added.insert(path.clone());
                }
                Some(old) if old.hash != record.hash => {
                    report.modified.insert(path.clone());
                }
                Some(_) => {}
            }
        }
        for path in previous.keys() {
            if !current.contains_key(path) {
                report.deleted.insert(path.clone());
            }
        }
        report.has_changes =
            !(report.added.is_empty() && report.modified.is_empty() && report.deleted.is_empty());

        let fingerprint = aggregate_fingerprint(current);
        for agent in agents {
            let skip = self
                .snapshot
                .agent_outcomes
                .get(agent)
                .map(|outcome| outcome.succeeded && outcome.input_fingerprint == fingerprint)
                .unwrap_or(false);
            if skip {
                report.agents_to_skip.insert(agent.clone());
            } else {
                report.agents_to_run.insert(agent.clone());
            }
        }

        report
    }

    /// Record `agent_results` (name -> succeeded) against the current file
    /// set and persist the new snapshot atomically. Agents not named in
    /// `agent_results` keep their previous outcome.
    pub fn commit(
        &mut self,
        current: &BTreeMap<String, FileRecord>,
        agent_results: &BTreeMap<String, bool>,
    ) -> Result<(), CacheError> {
        let fingerprint = aggregate_fingerprint(current);
        let mut next = ChangeCacheSnapshot {
            files: current.clone(),
            last_analysis_at: Some(Utc::now()),
            agent_outcomes: self.snapshot.agent_outcomes.clone(),
        };
        for (agent, succeeded) in agent_results {
            next.agent_outcomes.insert(
                agent.clone(),
                AgentOutcome {
                    succeeded: *succeeded,
                    input_fingerprint: fingerprint.clone(),
                },
            );
        }

        let content = serde_json::to_string_pretty(&next)?;
        {
            let _lock = self.cache.lock()?;
            write_atomic(&self.cache.change_cache_path(), &content)?;
        }
        self.snapshot = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            hash: hash.to_string(),
            size: hash.len() as u64,
            modified_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, FileRecord> {
        entries
            .iter()
            .map(|(p, h)| (p.to_string(), record(p, h)))
            .collect()
    }

    fn agents() -> Vec<String> {
        vec!["structure".to_string(), "dependencies".to_string()]
    }

    fn all_ok() -> BTreeMap<String, bool> {
        agents().into_iter().map(|a| (a, true)).collect()
    }

    #[test]
    fn unchanged_file_set_reports_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let current = files(&[("a.rs", "1"), ("b.rs", "2")]);
        let mut cache = ChangeCache::load(dir.path());
        cache.commit(&current, &all_ok()).unwrap();

        let reloaded = ChangeCache::load(dir.path());
        let report = reloaded.detect_changes(&current, &agents());
        assert!(!report.has_changes);
        assert!(report.agents_to_run.is_empty());
        assert_eq!(report.agents_to_skip.len(), 2);
    }

    #[test]
    fn added_modified_deleted_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChangeCache::load(dir.path());
        cache
            .commit(&files(&[("a.rs", "1"), ("b.rs", "2")]), &all_ok())
            .unwrap();

        let current = files(&[("a.rs", "1"), ("b.rs", "changed"), ("c.rs", "3")]);
        let report = cache.detect_changes(&current, &agents());
        assert!(report.has_changes);
        assert!(report.added.contains("c.rs"));
        assert!(report.modified.contains("b.rs"));
        assert!(report.deleted.is_empty());
        assert_eq!(report.agents_to_run.len(), 2);

        let shrunk = files(&[("a.rs", "1")]);
        let report = cache.detect_changes(&shrunk, &agents());
        assert!(report.deleted.contains("b.rs"));
        assert_eq!(report.changed_count(), 1);
    }

    #[test]
    fn failed_or_unknown_agents_rerun_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let current = files(&[("a.rs", "1")]);
        let mut cache = ChangeCache::load(dir.path());
        let mut results = BTreeMap::new();
        results.insert("structure".to_string(), true);
        results.insert("dependencies".to_string(), false);
        cache.commit(&current, &results).unwrap();

        let mut names = agents();
        names.push("api_surface".to_string());
        let report = cache.detect_changes(&current, &names);

        assert!(!report.has_changes);
        assert!(report.agents_to_skip.contains("structure"));
        assert!(report.agents_to_run.contains("dependencies"));
        assert!(report.agents_to_run.contains("api_surface"));
    }

    #[test]
    fn commit_keeps_outcomes_of_agents_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChangeCache::load(dir.path());
        cache.commit(&files(&[("a.rs", "1")]), &all_ok()).unwrap();

        let mut only_structure = BTreeMap::new();
        only_structure.insert("structure".to_string(), true);
        let current = files(&[("a.rs", "2")]);
        cache.commit(&current, &only_structure).unwrap();

        let outcomes = &cache.snapshot().agent_outcomes;
        assert_eq!(
            outcomes["structure"].input_fingerprint,
            aggregate_fingerprint(&current)
        );
        assert_ne!(
            outcomes["dependencies"].input_fingerprint,
            aggregate_fingerprint(&current)
        );
    }

    #[test]
    fn commit_is_idempotent_apart_from_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let current = files(&[("a.rs", "1"), ("src/b.rs", "2")]);
        let mut cache = ChangeCache::load(dir.path());

        cache.commit(&current, &all_ok()).unwrap();
        let path = Cache::new(dir.path()).change_cache_path();
        let mut first: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

        cache.commit(&current, &all_ok()).unwrap();
        let mut second: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

        first.as_object_mut().unwrap().remove("lastAnalysisAt");
        second.as_object_mut().unwrap().remove("lastAnalysisAt");
        assert_eq!(first, second);
        assert!(first["files"]["src/b.rs"]["hash"] == "2");
        assert!(first["agentOutcomes"]["structure"]["succeeded"] == true);
    }

    #[test]
    fn corrupt_file_loads_as_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        cache.ensure_dir().unwrap();
        fs::write(cache.change_cache_path(), "{\"files\": [oops").unwrap();

        let loaded = ChangeCache::load(dir.path());
        assert_eq!(loaded.snapshot(), &ChangeCacheSnapshot::default());

        let report = loaded.detect_changes(&files(&[("a.rs", "1")]), &agents());
        assert!(report.added.contains("a.rs"));
        assert_eq!(report.agents_to_run.len(), 2);
    }

    #[test]
    fn reload_restores_record_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChangeCache::load(dir.path());
        cache.commit(&files(&[("src/a.rs", "1")]), &all_ok()).unwrap();

        let reloaded = ChangeCache::load(dir.path());
        assert_eq!(reloaded.snapshot().files["src/a.rs"].path, "src/a.rs");
        assert!(reloaded.snapshot().last_analysis_at.is_some());
    }

    #[test]
    fn fingerprint_depends_on_paths_and_hashes() {
        let a = aggregate_fingerprint(&files(&[("a.rs", "1")]));
        let b = aggregate_fingerprint(&files(&[("a.rs", "2")]));
        let c = aggregate_fingerprint(&files(&[("b.rs", "1")]));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, aggregate_fingerprint(&files(&[("a.rs", "1")])));
        assert_eq!(a.len(), 64);
    }
}
