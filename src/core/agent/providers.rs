use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::events::{AgentEvent, StreamFn, TurnContext};

/// Minimal built-in runtime: one non-streaming chat-completions call per
/// turn, emitted as a `Final` event plus usage. Richer runtimes plug in
/// behind the same [`StreamFn`] seam.
pub struct HttpChatStream {
    client: Client,
    base_urls: Vec<(String, String)>,
}

impl Default for HttpChatStream {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpChatStream {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_urls: vec![
                (
                    "openai".to_string(),
                    "https://api.openai.com/v1".to_string(),
                ),
                (
                    "anthropic".to_string(),
                    "https://api.anthropic.com/v1/openai".to_string(),
                ),
            ],
        }
    }

    pub fn with_base_url(mut self, provider: &str, base_url: &str) -> Self {
        self.base_urls
            .retain(|(p, _)| p != provider);
        self.base_urls
            .push((provider.to_string(), base_url.to_string()));
        self
    }

    fn base_url(&self, provider: &str) -> Result<&str> {
        self.base_urls
            .iter()
            .find(|(p, _)| p == provider)
            .map(|(_, url)| url.as_str())
            .ok_or_else(|| anyhow!("no endpoint configured for provider '{provider}'"))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl StreamFn for HttpChatStream {
    async fn stream(&self, ctx: &TurnContext, events: mpsc::Sender<AgentEvent>) -> Result<()> {
        let base = self.base_url(&ctx.provider)?;
        let mut messages = vec![WireMessage {
            role: "system",
            content: &ctx.system_prompt,
        }];
        for m in &ctx.messages {
            messages.push(WireMessage {
                role: &m.role,
                content: &m.content,
            });
        }

        let response = self
            .client
            .post(format!("{base}/chat/completions"))
            .bearer_auth(&ctx.api_key)
            .json(&ChatRequest {
                model: &ctx.model,
                messages,
            })
            .send()
            .await
            .map_err(|e| anyhow!("LLM request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM call failed ({status}): {body}"));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("LLM response parse failed: {e}"))?;

        if let Some(usage) = parsed.usage {
            let _ = events
                .send(AgentEvent::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    context_tokens: usage.prompt_tokens,
                })
                .await;
        }
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let _ = events.send(AgentEvent::Final { text }).await;
        Ok(())
    }
}
