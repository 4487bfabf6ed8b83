use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::now_ms;
use crate::core::store::JsonStore;

/// One approved command pattern. A trailing `*` makes the pattern a prefix
/// match; otherwise the command must match exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    pub pattern: String,
    pub created_at_ms: u64,
    pub last_used_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistFile {
    pub entries: Vec<AllowlistEntry>,
}

/// Persisted per-agent allowlist (`allowlist/<agentId>.json`).
pub struct AllowlistStore {
    store: JsonStore<AllowlistFile>,
    agent_id: String,
}

impl AllowlistStore {
    pub fn open(state_dir: &Path, agent_id: &str) -> Result<Arc<Self>> {
        let path = state_dir.join("allowlist").join(format!("{agent_id}.json"));
        Ok(Arc::new(Self {
            store: JsonStore::load(path)?,
            agent_id: agent_id.to_string(),
        }))
    }

    pub fn entries(&self) -> Vec<AllowlistEntry> {
        self.store.get().entries.clone()
    }

    /// Find the first entry matching `command`, if any.
    pub fn matching_pattern(&self, command: &str) -> Option<String> {
        let command = command.trim();
        self.store
            .get()
            .entries
            .iter()
            .find(|e| pattern_matches(&e.pattern, command))
            .map(|e| e.pattern.clone())
    }

    /// Bump `lastUsedAtMs` on the matched entry.
    pub async fn record_use(&self, pattern: &str) -> Result<()> {
        let now = now_ms();
        self.store
            .mutate(|f| {
                if let Some(entry) = f.entries.iter_mut().find(|e| e.pattern == pattern) {
                    entry.last_used_at_ms = Some(now);
                }
            })
            .await
    }

    /// Persist a new pattern (no-op if it already exists).
    pub async fn add(&self, pattern: &str) -> Result<()> {
        let now = now_ms();
        let agent_id = self.agent_id.clone();
        let pattern = pattern.trim().to_string();
        self.store
            .mutate(move |f| {
                if f.entries.iter().any(|e| e.pattern == pattern) {
                    return;
                }
                f.entries.push(AllowlistEntry {
                    pattern,
                    created_at_ms: now,
                    last_used_at_ms: None,
                    agent_id: Some(agent_id),
                });
            })
            .await
    }

    pub async fn remove(&self, pattern: &str) -> Result<bool> {
        self.store
            .mutate(|f| {
                let before = f.entries.len();
                f.entries.retain(|e| e.pattern != pattern);
                f.entries.len() != before
            })
            .await
    }
}

pub fn pattern_matches(pattern: &str, command: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        command.starts_with(prefix.trim_end())
            || command == prefix.trim_end()
    } else {
        command == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_exactly() {
        assert!(pattern_matches("git status", "git status"));
        assert!(!pattern_matches("git status", "git status --short"));
    }

    #[test]
    fn star_pattern_is_prefix_match() {
        assert!(pattern_matches("git *", "git status"));
        assert!(pattern_matches("git *", "git log --oneline"));
        assert!(pattern_matches("git *", "git"));
        assert!(!pattern_matches("git *", "gitk"));
    }

    #[tokio::test]
    async fn add_match_and_use_tracking() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AllowlistStore::open(tmp.path(), "main").unwrap();

        store.add("git *").await.unwrap();
        let pattern = store.matching_pattern("git status").unwrap();
        assert_eq!(pattern, "git *");

        store.record_use(&pattern).await.unwrap();
        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].last_used_at_ms.is_some());
        assert_eq!(entries[0].agent_id.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AllowlistStore::open(tmp.path(), "main").unwrap();
        store.add("ls *").await.unwrap();
        store.add("ls *").await.unwrap();
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn remove_reports_whether_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AllowlistStore::open(tmp.path(), "main").unwrap();
        store.add("ls *").await.unwrap();
        assert!(store.remove("ls *").await.unwrap());
        assert!(!store.remove("ls *").await.unwrap());
    }
}
