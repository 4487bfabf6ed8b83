use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::core::now_ms;
use crate::core::store::JsonStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMode {
    Oauth,
    ApiKey,
}

/// One credential for a provider. Credentials are opaque to the control
/// plane; only the rotator's bookkeeping fields are interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub mode: AuthMode,
    pub credentials: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_good: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<u64>,
    #[serde(default)]
    pub usage_count: u64,
}

impl AuthProfile {
    pub fn api_key(&self) -> Option<String> {
        match self.mode {
            AuthMode::ApiKey => self
                .credentials
                .get("apiKey")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            AuthMode::Oauth => self
                .credentials
                .get("accessToken")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    fn is_ready(&self, now: u64) -> bool {
        self.cooldown_until.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthFile {
    pub profiles: Vec<AuthProfile>,
}

/// Profile store plus the rotation order used by the runner
/// (`auth.json`).
pub struct AuthRotator {
    store: JsonStore<AuthFile>,
}

impl AuthRotator {
    /// Profiles live in `auth.json` under the state dir, unless
    /// `OPENCLAW_OAUTH_DIR` points credentials somewhere else.
    pub fn open(state_dir: &Path) -> Result<Arc<Self>> {
        let dir = std::env::var("OPENCLAW_OAUTH_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| state_dir.to_path_buf());
        Ok(Arc::new(Self {
            store: JsonStore::load(dir.join("auth.json"))?,
        }))
    }

    pub fn profiles(&self) -> Vec<AuthProfile> {
        self.store.get().profiles.clone()
    }

    pub fn get(&self, id: &str) -> Option<AuthProfile> {
        self.store.get().profiles.iter().find(|p| p.id == id).cloned()
    }

    pub async fn upsert(&self, profile: AuthProfile) -> Result<()> {
        self.store
            .mutate(move |file| {
                file.profiles.retain(|p| p.id != profile.id);
                file.profiles.push(profile);
            })
            .await
    }

    /// The order credentials are tried for a provider: an explicit id
    /// first, then the configured order, then least-recently-used among
    /// ready profiles. Cooling-down profiles are excluded.
    pub fn profile_order(
        &self,
        provider: &str,
        explicit: Option<&str>,
        configured: &[String],
    ) -> Vec<String> {
        let now = now_ms();
        let snapshot = self.store.get();
        let mut order: Vec<String> = Vec::new();
        let mut push = |id: &str, order: &mut Vec<String>| {
            if !order.iter().any(|o| o == id) {
                order.push(id.to_string());
            }
        };

        if let Some(id) = explicit {
            if let Some(p) = snapshot.profiles.iter().find(|p| p.id == id) {
                if p.provider == provider && p.is_ready(now) {
                    push(id, &mut order);
                }
            }
        }
        for id in configured {
            if let Some(p) = snapshot.profiles.iter().find(|p| &p.id == id) {
                if p.provider == provider && p.is_ready(now) {
                    push(id, &mut order);
                }
            }
        }

        let mut ready: Vec<&AuthProfile> = snapshot
            .profiles
            .iter()
            .filter(|p| p.provider == provider && p.is_ready(now))
            .collect();
        // Least-recently-used first; never-used profiles lead.
        ready.sort_by_key(|p| p.last_good.unwrap_or(0));
        for p in ready {
            push(&p.id, &mut order);
        }
        order
    }

    /// A successful call clears cooldown and stamps `lastGood`.
    pub async fn mark_success(&self, id: &str) -> Result<()> {
        let now = now_ms();
        let id = id.to_string();
        self.store
            .mutate(move |file| {
                if let Some(p) = file.profiles.iter_mut().find(|p| p.id == id) {
                    p.last_good = Some(now);
                    p.cooldown_until = None;
                    p.usage_count += 1;
                }
            })
            .await
    }

    /// Put a profile on cooldown after an auth failure or rate limit.
    pub async fn mark_cooldown(&self, id: &str, cooldown_ms: u64) -> Result<()> {
        let until = now_ms() + cooldown_ms;
        let id = id.to_string();
        info!("[auth] profile {id} cooling down for {cooldown_ms}ms");
        self.store
            .mutate(move |file| {
                if let Some(p) = file.profiles.iter_mut().find(|p| p.id == id) {
                    p.cooldown_until = Some(until);
                }
            })
            .await
    }
}
