use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::session::ThinkingLevel;

/// One chat message in runtime order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Typed event stream emitted by an agent turn. The partial/block/tool
/// fan-out flows through one channel instead of a bundle of callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AgentEvent {
    /// Incremental token stream.
    #[serde(rename_all = "camelCase")]
    Partial {
        text: String,
        #[serde(default)]
        media_urls: Vec<String>,
    },
    /// A complete block, pushed before the turn ends.
    #[serde(rename_all = "camelCase")]
    Block {
        text: String,
        #[serde(default)]
        media_urls: Vec<String>,
    },
    /// Tool I/O, surfaced when verbose is on.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        text: String,
        #[serde(default)]
        media_urls: Vec<String>,
    },
    /// Generic runtime events (compaction phases and the like).
    Agent { stream: String, data: Value },
    #[serde(rename_all = "camelCase")]
    Compaction { phase: String, will_retry: bool },
    #[serde(rename_all = "camelCase")]
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        context_tokens: u64,
    },
    Final { text: String },
    Error { message: String },
}

/// Everything the runtime needs for one LLM call.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub run_id: String,
    pub session_id: String,
    pub session_key: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: String,
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub thinking_level: ThinkingLevel,
    pub verbose: bool,
    pub elevated: bool,
    pub workspace_dir: String,
}

/// The seam to the LLM agent runtime. The control plane never talks to a
/// provider directly; it streams a turn through this trait and consumes
/// the typed events.
#[async_trait]
pub trait StreamFn: Send + Sync {
    async fn stream(&self, ctx: &TurnContext, events: mpsc::Sender<AgentEvent>) -> Result<()>;

    /// Inject a user message into an active run (steer). Returns false
    /// when the runtime cannot accept it, e.g. mid-compaction.
    async fn queue_message(&self, _session_id: &str, _text: &str) -> Result<bool> {
        Ok(false)
    }
}
