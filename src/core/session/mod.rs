pub mod router;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::now_ms;
use crate::core::store::JsonStore;

/// Canonical conversation identifier:
/// `agent:<agentId>:main`, `agent:<agentId>:<surface>:<peerId>`, or
/// `agent:<agentId>:<surface>:group:<gid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    pub fn direct(agent_id: &str, surface: &str, peer_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{surface}:{peer_id}"))
    }

    pub fn group(agent_id: &str, surface: &str, group_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{surface}:group:{group_id}"))
    }

    pub fn named(key: &str) -> Self {
        Self(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_main(&self) -> bool {
        self.0.ends_with(":main")
    }

    pub fn is_group(&self) -> bool {
        self.0.contains(":group:")
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    #[default]
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// Next rung down, used when a model rejects the requested level.
    pub fn lower(self) -> Option<Self> {
        match self {
            Self::High => Some(Self::Medium),
            Self::Medium => Some(Self::Low),
            Self::Low => Some(Self::Minimal),
            Self::Minimal => Some(Self::Off),
            Self::Off => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerboseLevel {
    #[default]
    Off,
    On,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevatedLevel {
    #[default]
    Off,
    Ask,
    On,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Interrupt,
    #[default]
    Steer,
    Followup,
    Drop,
}

impl QueueMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interrupt" => Some(Self::Interrupt),
            "steer" => Some(Self::Steer),
            "followup" => Some(Self::Followup),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupActivation {
    #[default]
    Mention,
    Always,
}

/// Where the last reply for this session went, so later sends (cron
/// announcements, bare-id targets) can reuse it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    pub channel: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub context_tokens: u64,
}

/// Per-key session record. Every mutation goes through
/// [`SessionStore::update`], which bumps `updatedAt` and rewrites the file
/// atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: String,
    pub session_file: String,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Set by the `/model` directive; wins over channel defaults until
    /// `/reset`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    pub thinking_level: ThinkingLevel,
    pub verbose_level: VerboseLevel,
    pub elevated_level: ElevatedLevel,
    pub send_policy: SendPolicy,
    pub queue_mode: QueueMode,
    pub group_activation: GroupActivation,
    pub compaction_count: u64,
    #[serde(default)]
    pub totals: TokenTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery: Option<DeliveryContext>,
}

pub type SessionsFile = BTreeMap<String, SessionEntry>;

/// Durable map of session key → entry (`sessions/<agentId>.json`).
pub struct SessionStore {
    store: JsonStore<SessionsFile>,
}

impl SessionStore {
    pub fn open(state_dir: &Path, agent_id: &str) -> Result<Arc<Self>> {
        let path = state_dir.join("sessions").join(format!("{agent_id}.json"));
        Ok(Arc::new(Self {
            store: JsonStore::load(path)?,
        }))
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.store.get().get(key.as_str()).cloned()
    }

    pub fn list(&self) -> Vec<(String, SessionEntry)> {
        self.store
            .get()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Fetch the entry for `key`, creating it on first inbound match.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<SessionEntry> {
        if let Some(entry) = self.get(key) {
            return Ok(entry);
        }
        let key_str = key.as_str().to_string();
        self.store
            .mutate(move |file| {
                file.entry(key_str.clone())
                    .or_insert_with(|| SessionEntry {
                        session_id: uuid::Uuid::new_v4().to_string(),
                        session_file: format!("runs/{key_str}.jsonl").replace(':', "-"),
                        updated_at: now_ms(),
                        ..SessionEntry::default()
                    })
                    .clone()
            })
            .await
    }

    /// Mutate an entry in place. Bumps `updatedAt` even for no-op closures
    /// so the invariant holds trivially.
    pub async fn update(
        &self,
        key: &SessionKey,
        apply: impl FnOnce(&mut SessionEntry) + Send,
    ) -> Result<Option<SessionEntry>> {
        let key_str = key.as_str().to_string();
        self.store
            .mutate(move |file| {
                let entry = file.get_mut(&key_str)?;
                apply(entry);
                entry.updated_at = now_ms();
                Some(entry.clone())
            })
            .await
    }

    /// Replace the run file, clearing the per-session overrides. Used by
    /// `/reset`.
    pub async fn reset(&self, key: &SessionKey) -> Result<Option<SessionEntry>> {
        self.update(key, |entry| {
            entry.session_id = uuid::Uuid::new_v4().to_string();
            entry.model_override = None;
            entry.compaction_count = 0;
            entry.totals = TokenTotals::default();
        })
        .await
    }
}
