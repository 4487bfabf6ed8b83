use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

/// Outbound message contract handed to a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub to: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Per-channel sending constraints consumed by the delivery pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ChannelLimits {
    pub max_chars: usize,
    pub min_chars: usize,
    pub supports_reply: bool,
    pub supports_threads: bool,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            min_chars: 500,
            supports_reply: false,
            supports_threads: false,
        }
    }
}

/// Known per-message caps for the stock channels.
pub fn limits_for(channel_id: &str) -> ChannelLimits {
    match channel_id {
        "discord" => ChannelLimits {
            max_chars: 2000,
            min_chars: 400,
            supports_reply: true,
            supports_threads: true,
        },
        "telegram" => ChannelLimits {
            max_chars: 4096,
            min_chars: 600,
            supports_reply: true,
            supports_threads: false,
        },
        "whatsapp" => ChannelLimits {
            max_chars: 65_000,
            min_chars: 1000,
            supports_reply: true,
            supports_threads: false,
        },
        "slack" => ChannelLimits {
            max_chars: 40_000,
            min_chars: 1000,
            supports_reply: false,
            supports_threads: true,
        },
        _ => ChannelLimits::default(),
    }
}

/// One messaging surface. Concrete protocol plumbing lives behind this
/// seam; the control plane only needs send and typing.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn id(&self) -> &str;

    fn limits(&self) -> ChannelLimits {
        limits_for(self.id())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    async fn start_typing(&self, _to: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        info!("[channels] registered adapter '{}'", adapter.id());
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Generic HTTP adapter: POSTs the outbound contract as JSON to a webhook
/// endpoint. Serves WebChat-style surfaces and acts as the template for
/// REST-backed channels.
pub struct WebhookChannel {
    id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(id: &str, endpoint: &str) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let response = self.client.post(&self.endpoint).json(msg).send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// In-memory adapter used by tests and the loopback `send` CLI path.
#[derive(Default)]
pub struct RecordingChannel {
    id: String,
    limits: ChannelLimits,
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub typing: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            limits: limits_for(id),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
        })
    }

    pub fn with_limits(id: &str, limits: ChannelLimits) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            limits,
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
        })
    }

    pub async fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn limits(&self) -> ChannelLimits {
        self.limits
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        self.sent.lock().await.push(msg.clone());
        Ok(())
    }

    async fn start_typing(&self, to: &str) -> Result<()> {
        self.typing.lock().await.push(to.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_limits_match_platform_caps() {
        assert_eq!(limits_for("discord").max_chars, 2000);
        assert_eq!(limits_for("telegram").max_chars, 4096);
        assert_eq!(limits_for("whatsapp").max_chars, 65_000);
        assert_eq!(limits_for("slack").max_chars, 40_000);
        assert!(limits_for("discord").supports_threads);
        assert!(!limits_for("telegram").supports_threads);
    }

    #[tokio::test]
    async fn registry_round_trip() {
        let mut registry = ChannelRegistry::new();
        registry.register(RecordingChannel::new("telegram"));
        registry.register(RecordingChannel::new("discord"));

        assert!(registry.get("telegram").is_some());
        assert!(registry.get("signal").is_none());
        assert_eq!(registry.ids(), vec!["discord", "telegram"]);
    }

    #[tokio::test]
    async fn recording_channel_captures_sends() {
        let channel = RecordingChannel::new("telegram");
        channel
            .send(&OutboundMessage {
                to: "123".to_string(),
                text: "hi".to_string(),
                ..OutboundMessage::default()
            })
            .await
            .unwrap();
        assert_eq!(channel.sent_texts().await, vec!["hi"]);
    }
}
