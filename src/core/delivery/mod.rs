pub mod chunker;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::channels::{ChannelAdapter, ChannelRegistry, OutboundMessage};
use crate::core::session::{DeliveryContext, SessionKey, SessionStore};
use crate::core::store::JsonStore;

/// A reply that produced no user-visible output on purpose.
pub const SILENT_REPLY: &str = "__SILENT_REPLY__";
/// Keep-alive token emitted by heartbeat turns.
pub const HEARTBEAT_TOKEN: &str = "HEARTBEAT_OK";

const TYPING_REFRESH: Duration = Duration::from_secs(4);
const WEBHOOK_USERNAME_MAX: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReplyTo {
    #[default]
    None,
    Current,
    Explicit(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyPayload {
    pub text: String,
    pub media_urls: Vec<String>,
    pub reply_to: ReplyTo,
}

impl ReplyPayload {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }

    /// The silent sentinel with no media is dropped entirely.
    pub fn is_silent(&self) -> bool {
        self.text.trim() == SILENT_REPLY && self.media_urls.is_empty()
    }
}

/// Strip heartbeat tokens. `None` means the whole payload was heartbeat
/// noise and should be skipped.
pub fn strip_heartbeat(text: &str) -> Option<String> {
    if !text.contains(HEARTBEAT_TOKEN) {
        return Some(text.to_string());
    }
    let stripped = text.replace(HEARTBEAT_TOKEN, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extract `[[reply_to:<id>]]` / `[[reply_to_current]]` directive tags.
/// An explicit id wins over the current-message tag. The extraction is
/// deterministic so dedup fingerprints agree between streamed and final
/// payloads.
pub fn extract_reply_directives(text: &str) -> (String, ReplyTo) {
    let mut reply_to = ReplyTo::None;
    let mut clean = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("[[") {
        let Some(end_rel) = rest[start..].find("]]") else {
            break;
        };
        let end = start + end_rel;
        let tag = &rest[start + 2..end];
        clean.push_str(&rest[..start]);
        if tag == "reply_to_current" {
            if reply_to == ReplyTo::None {
                reply_to = ReplyTo::Current;
            }
        } else if let Some(id) = tag.strip_prefix("reply_to:") {
            reply_to = ReplyTo::Explicit(id.trim().to_string());
        } else {
            // Not a directive tag; keep it verbatim.
            clean.push_str(&rest[start..end + 2]);
        }
        rest = &rest[end + 2..];
    }
    clean.push_str(rest);
    (clean.trim().to_string(), reply_to)
}

pub fn payload_fingerprint(payload: &ReplyPayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.text.as_bytes());
    hasher.update([0]);
    for url in &payload.media_urls {
        hasher.update(url.as_bytes());
        hasher.update([0]);
    }
    match &payload.reply_to {
        ReplyTo::None => hasher.update(b"-"),
        ReplyTo::Current => hasher.update(b"current"),
        ReplyTo::Explicit(id) => hasher.update(id.as_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// Tracks what was already streamed as block replies so the final payload
/// set never duplicates it.
#[derive(Debug, Default)]
pub struct StreamLedger {
    fingerprints: HashSet<String>,
    any_block: bool,
}

impl StreamLedger {
    pub fn record_block(&mut self, payload: &ReplyPayload) {
        self.any_block = true;
        self.fingerprints.insert(payload_fingerprint(payload));
    }

    pub fn should_drop_final_payloads(&self) -> bool {
        self.any_block
    }

    /// Final payload set after dedup. Anything was streamed → everything
    /// final is suppressed; otherwise fingerprint-matched payloads are.
    pub fn filter_final(&self, payloads: Vec<ReplyPayload>) -> Vec<ReplyPayload> {
        if self.any_block {
            return Vec::new();
        }
        payloads
            .into_iter()
            .filter(|p| !self.fingerprints.contains(&payload_fingerprint(p)))
            .collect()
    }
}

/// `user:<id>` / `channel:<id>` pass through; a bare numeric id resolves
/// through the session's recorded Discord delivery context or is rejected
/// as ambiguous.
pub fn resolve_discord_target(
    target: &str,
    last_delivery: Option<&DeliveryContext>,
) -> Result<String, String> {
    let target = target.trim();
    if target.starts_with("user:") || target.starts_with("channel:") {
        return Ok(target.to_string());
    }
    if !target.is_empty() && target.chars().all(|c| c.is_ascii_digit()) {
        if let Some(ctx) = last_delivery {
            if ctx.channel == "discord" {
                return Ok(ctx.to.clone());
            }
        }
        return Err(format!(
            "Ambiguous Discord recipient '{target}': use user:<id> or channel:<id>"
        ));
    }
    Err(format!(
        "Unrecognized Discord recipient '{target}': use user:<id> or channel:<id>"
    ))
}

/// Discord forum/thread impersonation record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadBinding {
    pub thread_id: String,
    pub agent_id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
    pub account_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadBindingFile {
    pub bindings: Vec<ThreadBinding>,
}

/// Webhook display names cap at 80 code points.
pub fn webhook_username(name: &str) -> String {
    name.chars().take(WEBHOOK_USERNAME_MAX).collect()
}

/// Arms a channel typing loop on first visible output and clears it when
/// the run completes. Heartbeat turns never show typing.
pub struct TypingController {
    adapter: Arc<dyn ChannelAdapter>,
    to: String,
    heartbeat: bool,
    stop: Option<oneshot::Sender<()>>,
}

impl TypingController {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, to: &str, heartbeat: bool) -> Self {
        Self {
            adapter,
            to: to.to_string(),
            heartbeat,
            stop: None,
        }
    }

    /// Start the typing loop the first time visible text shows up.
    pub fn start_typing_on_text(&mut self, text: &str) {
        if self.heartbeat || self.stop.is_some() || text.trim().is_empty() {
            return;
        }
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        self.stop = Some(stop_tx);
        let adapter = self.adapter.clone();
        let to = self.to.clone();
        tokio::spawn(async move {
            loop {
                let _ = adapter.start_typing(&to).await;
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(TYPING_REFRESH) => {}
                }
            }
        });
    }

    pub fn mark_run_complete(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for TypingController {
    fn drop(&mut self) {
        self.mark_run_complete();
    }
}

/// What actually gets sent on each channel: chunking, dedup, reply/thread
/// routing, webhook impersonation, and delivery-context bookkeeping.
pub struct DeliveryPipeline {
    channels: Arc<ChannelRegistry>,
    sessions: Arc<SessionStore>,
    bindings: Arc<JsonStore<ThreadBindingFile>>,
    http: reqwest::Client,
}

impl DeliveryPipeline {
    pub fn new(
        channels: Arc<ChannelRegistry>,
        sessions: Arc<SessionStore>,
        state_dir: &Path,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            channels,
            sessions,
            bindings: Arc::new(JsonStore::load(state_dir.join("thread-bindings.json"))?),
            http: reqwest::Client::new(),
        }))
    }

    pub fn binding_for_thread(&self, thread_id: &str) -> Option<ThreadBinding> {
        self.bindings
            .get()
            .bindings
            .iter()
            .find(|b| b.thread_id == thread_id)
            .cloned()
    }

    pub async fn bind_thread(&self, binding: ThreadBinding) -> Result<()> {
        self.bindings
            .mutate(move |file| {
                file.bindings.retain(|b| b.thread_id != binding.thread_id);
                file.bindings.push(binding);
            })
            .await
    }

    /// Deliver a payload set to one target, chunked per channel limits.
    /// Returns the number of messages actually sent.
    pub async fn deliver(
        &self,
        key: &SessionKey,
        channel_id: &str,
        to: &str,
        payloads: Vec<ReplyPayload>,
        thread_id: Option<String>,
    ) -> Result<usize> {
        let adapter = self
            .channels
            .get(channel_id)
            .ok_or_else(|| anyhow!("unknown channel '{channel_id}'"))?;
        let limits = adapter.limits();

        let mut sent = 0usize;
        for payload in payloads {
            if payload.is_silent() {
                debug!("[delivery] dropping silent payload for {key}");
                continue;
            }
            let reply_to_id = match &payload.reply_to {
                ReplyTo::Explicit(id) if limits.supports_reply => Some(id.clone()),
                _ => None,
            };

            // Webhook impersonation takes over for bound Discord threads
            // with text-only payloads.
            if channel_id == "discord" && payload.media_urls.is_empty() {
                if let Some(thread) = &thread_id {
                    if let Some(binding) = self.binding_for_thread(thread) {
                        if binding.webhook_id.is_some() && binding.webhook_token.is_some() {
                            sent += self
                                .send_via_webhook(&binding, &payload.text, &limits, thread)
                                .await?;
                            continue;
                        }
                    }
                }
            }

            let chunks = chunker::chunk_text(&payload.text, limits.min_chars, limits.max_chars);
            for (i, chunk) in chunks.iter().enumerate() {
                let msg = OutboundMessage {
                    to: to.to_string(),
                    text: chunk.clone(),
                    media_urls: if i == 0 { payload.media_urls.clone() } else { Vec::new() },
                    reply_to_id: if i == 0 { reply_to_id.clone() } else { None },
                    thread_id: if limits.supports_threads {
                        thread_id.clone()
                    } else {
                        None
                    },
                };
                adapter.send(&msg).await?;
                sent += 1;
            }
        }

        if sent > 0 {
            let ctx = DeliveryContext {
                channel: channel_id.to_string(),
                to: to.to_string(),
                thread_id,
            };
            if let Err(e) = self.sessions.update(key, |e| e.last_delivery = Some(ctx)).await {
                warn!("[delivery] failed to record delivery context: {e}");
            }
        }
        Ok(sent)
    }

    async fn send_via_webhook(
        &self,
        binding: &ThreadBinding,
        text: &str,
        limits: &crate::channels::ChannelLimits,
        thread_id: &str,
    ) -> Result<usize> {
        let id = binding.webhook_id.as_deref().unwrap_or_default();
        let token = binding.webhook_token.as_deref().unwrap_or_default();
        let url = format!(
            "https://discord.com/api/webhooks/{id}/{token}?thread_id={thread_id}"
        );
        let username = webhook_username(&binding.label);

        let mut sent = 0usize;
        for chunk in chunker::chunk_text(text, limits.min_chars, limits.max_chars) {
            let body = serde_json::json!({
                "content": chunk,
                "username": username,
            });
            self.http
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            sent += 1;
        }
        Ok(sent)
    }
}
