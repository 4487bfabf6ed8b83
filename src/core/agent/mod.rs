pub mod auth;
pub mod events;
pub mod providers;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::delivery::{
    ReplyPayload, ReplyTo, StreamLedger, extract_reply_directives, strip_heartbeat,
};
use crate::core::hooks::{HookContext, HookPhase, HookRunner, blocked_call_message};
use crate::core::session::{SessionKey, SessionStore, ThinkingLevel};
use auth::AuthRotator;
use events::{AgentEvent, ChatMessage, StreamFn, TurnContext};

const AUTH_COOLDOWN_MS: u64 = 5 * 60 * 1000;
const RATE_LIMIT_COOLDOWN_MS: u64 = 10 * 60 * 1000;
const SOCKET_CLOSED_MARKER: &str = "socket closed unexpectedly";
const SOCKET_CLOSED_REWRITE: &str =
    "LLM connection failed. The provider dropped the connection; please try again.";

/// A model the runner may address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub provider: String,
    pub id: String,
    /// Highest thinking level the model accepts.
    pub max_thinking: ThinkingLevel,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let spec = |provider: &str, id: &str, max_thinking| ModelSpec {
            provider: provider.to_string(),
            id: id.to_string(),
            max_thinking,
        };
        Self {
            models: vec![
                spec("anthropic", "claude-opus-4", ThinkingLevel::High),
                spec("anthropic", "claude-sonnet-4", ThinkingLevel::High),
                spec("anthropic", "claude-haiku-3-5", ThinkingLevel::Low),
                spec("openai", "gpt-4.1", ThinkingLevel::Off),
                spec("openai", "o4-mini", ThinkingLevel::High),
            ],
        }
    }
}

impl ModelRegistry {
    pub fn with_models(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    /// Resolve `name` as `provider/model` or a bare model id.
    pub fn resolve(&self, name: &str) -> Option<&ModelSpec> {
        if let Some((provider, id)) = name.split_once('/') {
            return self
                .models
                .iter()
                .find(|m| m.provider == provider && m.id == id);
        }
        self.models.iter().find(|m| m.id == name)
    }

    pub fn list(&self) -> &[ModelSpec] {
        &self.models
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReplyBreak {
    #[default]
    TextEnd,
    MessageEnd,
}

/// Inputs for one agent turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub run_id: String,
    pub session_key: SessionKey,
    pub session_id: String,
    pub session_file: String,
    pub workspace_dir: String,
    pub prompt: String,
    pub model: String,
    pub auth_profile_id: Option<String>,
    pub thinking_level: ThinkingLevel,
    pub verbose: bool,
    pub elevated: bool,
    pub timeout_ms: u64,
    pub block_reply_break: BlockReplyBreak,
    pub block_reply_chunking: bool,
    pub heartbeat: bool,
}

/// The runner's result, handed to the delivery pipeline.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub payloads: Vec<ReplyPayload>,
    pub final_text: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LlmErrorKind {
    Auth,
    RateLimit,
    UnsupportedThinking,
    Timeout,
    Other,
}

fn classify_llm_error(message: &str) -> LlmErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("401")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
        || lower.contains("oauth token expired")
        || lower.contains("unauthorized")
    {
        LlmErrorKind::Auth
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded")
    {
        LlmErrorKind::RateLimit
    } else if lower.contains("thinking")
        && (lower.contains("unsupported") || lower.contains("not supported"))
    {
        LlmErrorKind::UnsupportedThinking
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LlmErrorKind::Timeout
    } else {
        LlmErrorKind::Other
    }
}

fn rewrite_known_errors(message: &str) -> String {
    if message.contains(SOCKET_CLOSED_MARKER) {
        SOCKET_CLOSED_REWRITE.to_string()
    } else {
        message.to_string()
    }
}

/// Inputs to the system prompt beyond the conversation itself.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub agent_name: String,
    pub skills: Vec<String>,
    pub bootstrap_files: Vec<String>,
    pub tool_names: Vec<String>,
    pub sandboxed: bool,
    pub user_timezone: Option<String>,
}

/// Assemble the system prompt: identity, skills snapshot, workspace
/// bootstrap files, runtime info, tool names, and the user's local time.
pub fn build_system_prompt(inputs: &PromptInputs) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are {}, a personal assistant reachable across the operator's chat channels.\n",
        inputs.agent_name
    ));
    prompt.push_str(
        "Keep replies concise and suited to chat. Use tools when a task needs real actions.\n",
    );

    if !inputs.tool_names.is_empty() {
        prompt.push_str("\nAvailable tools: ");
        prompt.push_str(&inputs.tool_names.join(", "));
        prompt.push('\n');
    }
    if !inputs.skills.is_empty() {
        prompt.push_str("\n--- SKILLS ---\n");
        for skill in &inputs.skills {
            prompt.push_str(&format!("- {skill}\n"));
        }
        prompt.push_str("--- END SKILLS ---\n");
    }
    if !inputs.bootstrap_files.is_empty() {
        prompt.push_str("\nWorkspace bootstrap files:\n");
        for file in &inputs.bootstrap_files {
            prompt.push_str(&format!("- {file}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nRuntime: {} {} ({})\n",
        std::env::consts::OS,
        std::env::consts::ARCH,
        if inputs.sandboxed {
            "sandboxed"
        } else {
            "unsandboxed"
        }
    ));

    let now = match inputs
        .user_timezone
        .as_deref()
        .and_then(|tz| tz.parse::<chrono_tz::Tz>().ok())
    {
        Some(tz) => chrono::Utc::now()
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M %Z")
            .to_string(),
        None => chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
    };
    prompt.push_str(&format!("Current user time: {now}\n"));
    prompt
}

/// What one streaming attempt produced.
#[derive(Debug, Default)]
struct Collected {
    partials: String,
    final_text: Option<String>,
    blocks: Vec<ReplyPayload>,
    usage: Option<(u64, u64, u64, u64)>,
    compactions_completed: u64,
}

/// Runs one agent turn: model/credential resolution, hook wrapping, event
/// multiplexing, error recovery, and finalization.
pub struct AgentRunner {
    registry: ModelRegistry,
    auth: Arc<AuthRotator>,
    hooks: Arc<HookRunner>,
    stream_fn: Arc<dyn StreamFn>,
    sessions: Arc<SessionStore>,
    prompt_inputs: PromptInputs,
    model_fallbacks: Vec<String>,
    configured_profiles: Vec<String>,
}

impl AgentRunner {
    pub fn new(
        registry: ModelRegistry,
        auth: Arc<AuthRotator>,
        hooks: Arc<HookRunner>,
        stream_fn: Arc<dyn StreamFn>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            registry,
            auth,
            hooks,
            stream_fn,
            sessions,
            prompt_inputs: PromptInputs::default(),
            model_fallbacks: Vec::new(),
            configured_profiles: Vec::new(),
        }
    }

    pub fn with_prompt_inputs(mut self, inputs: PromptInputs) -> Self {
        self.prompt_inputs = inputs;
        self
    }

    pub fn with_model_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.model_fallbacks = fallbacks;
        self
    }

    pub fn with_configured_profiles(mut self, profiles: Vec<String>) -> Self {
        self.configured_profiles = profiles;
        self
    }

    pub fn stream_fn(&self) -> Arc<dyn StreamFn> {
        self.stream_fn.clone()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub async fn run_turn(
        &self,
        req: &TurnRequest,
        events_tx: mpsc::Sender<AgentEvent>,
    ) -> Result<TurnOutcome> {
        let mut candidates = vec![req.model.clone()];
        for fallback in &self.model_fallbacks {
            if !candidates.contains(fallback) {
                candidates.push(fallback.clone());
            }
        }

        let mut last_error: String = format!("unknown-model: {}", req.model);
        let mut thinking = req.thinking_level;
        let mut thinking_retried = false;
        let mut first_call = true;

        for model_name in &candidates {
            let Some(spec) = self.registry.resolve(model_name) else {
                last_error = format!("unknown-model: {model_name}");
                continue;
            };
            if thinking > spec.max_thinking {
                thinking = spec.max_thinking;
            }

            let order = self.auth.profile_order(
                &spec.provider,
                req.auth_profile_id.as_deref(),
                &self.configured_profiles,
            );
            if order.is_empty() {
                last_error = format!("no ready credentials for provider '{}'", spec.provider);
                continue;
            }
            let multi_profile = order.len() > 1;
            let mut timeout_rotated = false;

            let mut idx = 0;
            while idx < order.len() {
                let profile_id = &order[idx];
                let Some(profile) = self.auth.get(profile_id) else {
                    idx += 1;
                    continue;
                };
                let Some(api_key) = profile.api_key() else {
                    idx += 1;
                    continue;
                };

                let mut ctx = TurnContext {
                    run_id: req.run_id.clone(),
                    session_id: req.session_id.clone(),
                    session_key: req.session_key.to_string(),
                    messages: vec![ChatMessage {
                        role: "user".to_string(),
                        content: req.prompt.clone(),
                    }],
                    system_prompt: build_system_prompt(&self.prompt_inputs),
                    provider: spec.provider.clone(),
                    model: spec.id.clone(),
                    api_key,
                    thinking_level: thinking,
                    verbose: req.verbose,
                    elevated: req.elevated,
                    workspace_dir: req.workspace_dir.clone(),
                };

                let hook_ctx = HookContext {
                    session_key: req.session_key.to_string(),
                    run_id: req.run_id.clone(),
                    messages: ctx
                        .messages
                        .iter()
                        .map(|m| (m.role.clone(), m.content.clone()))
                        .collect(),
                    system_prompt: Some(ctx.system_prompt.clone()),
                    ..HookContext::default()
                };
                let before = self
                    .hooks
                    .run_modifying(HookPhase::BeforeLlmCall, &hook_ctx)
                    .await?;
                if before.block {
                    let message = blocked_call_message(before.block_reason.as_deref());
                    let _ = events_tx
                        .send(AgentEvent::Error {
                            message: message.clone(),
                        })
                        .await;
                    return Ok(TurnOutcome {
                        error: Some(message),
                        ..TurnOutcome::default()
                    });
                }
                if let Some(system_prompt) = before.system_prompt {
                    ctx.system_prompt = system_prompt;
                }
                if let Some(messages) = before.messages {
                    ctx.messages = messages
                        .into_iter()
                        .map(|(role, content)| ChatMessage { role, content })
                        .collect();
                }

                if first_call {
                    self.hooks
                        .run_parallel(HookPhase::ContextAssembled, &hook_ctx)
                        .await;
                    first_call = false;
                }

                match self.stream_once(req, &ctx, &events_tx).await {
                    Ok(collected) => {
                        self.auth.mark_success(&profile.id).await?;
                        let _ = self
                            .hooks
                            .run_modifying(HookPhase::AfterLlmCall, &hook_ctx)
                            .await?;
                        return self.finalize(req, collected, &events_tx).await;
                    }
                    Err(e) => {
                        let message = e.to_string();
                        match classify_llm_error(&message) {
                            LlmErrorKind::Auth => {
                                warn!(
                                    "[agent] auth failure on profile {}: {message}",
                                    profile.id
                                );
                                self.auth
                                    .mark_cooldown(&profile.id, AUTH_COOLDOWN_MS)
                                    .await?;
                                last_error = message;
                                idx += 1;
                            }
                            LlmErrorKind::RateLimit => {
                                warn!("[agent] rate limit on profile {}: {message}", profile.id);
                                self.auth
                                    .mark_cooldown(&profile.id, RATE_LIMIT_COOLDOWN_MS)
                                    .await?;
                                last_error = message;
                                idx += 1;
                            }
                            LlmErrorKind::Timeout if multi_profile && !timeout_rotated => {
                                // On multi-profile accounts a stream timeout is
                                // treated as a probable rate limit.
                                warn!("[agent] timeout on profile {}; rotating", profile.id);
                                timeout_rotated = true;
                                self.auth
                                    .mark_cooldown(&profile.id, RATE_LIMIT_COOLDOWN_MS)
                                    .await?;
                                last_error = message;
                                idx += 1;
                            }
                            LlmErrorKind::UnsupportedThinking if !thinking_retried => {
                                if let Some(lower) = thinking.lower() {
                                    info!(
                                        "[agent] thinking level {:?} rejected; retrying at {:?}",
                                        thinking, lower
                                    );
                                    thinking = lower;
                                    thinking_retried = true;
                                    // Same profile, lower level.
                                } else {
                                    last_error = message;
                                    idx += 1;
                                }
                            }
                            _ => {
                                let friendly = rewrite_known_errors(&message);
                                let _ = events_tx
                                    .send(AgentEvent::Error {
                                        message: friendly.clone(),
                                    })
                                    .await;
                                return Ok(TurnOutcome {
                                    error: Some(friendly),
                                    ..TurnOutcome::default()
                                });
                            }
                        }
                    }
                }
            }
        }

        let friendly = rewrite_known_errors(&last_error);
        let _ = events_tx
            .send(AgentEvent::Error {
                message: friendly.clone(),
            })
            .await;
        Ok(TurnOutcome {
            error: Some(friendly),
            ..TurnOutcome::default()
        })
    }

    /// One streaming attempt: forwards transformed events downstream while
    /// collecting the turn's assembled state.
    async fn stream_once(
        &self,
        req: &TurnRequest,
        ctx: &TurnContext,
        events_tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Collected> {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let stream_fn = self.stream_fn.clone();
        let ctx_clone = ctx.clone();
        let handle = tokio::spawn(async move { stream_fn.stream(&ctx_clone, tx).await });

        let mut collected = Collected::default();
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(req.timeout_ms.max(1));

        loop {
            let event = tokio::select! {
                ev = rx.recv() => ev,
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    // The runtime may keep streaming briefly after an abort;
                    // flag it so a wedged provider shows up in the logs.
                    warn!("[agent] run {} timed out after {}ms", req.run_id, req.timeout_ms);
                    return Err(anyhow!("LLM call timed out after {}ms", req.timeout_ms));
                }
            };
            let Some(event) = event else { break };

            match event {
                AgentEvent::Partial { text, media_urls } => {
                    collected.partials.push_str(&text);
                    let _ = events_tx
                        .send(AgentEvent::Partial { text, media_urls })
                        .await;
                }
                AgentEvent::Block { text, media_urls } => {
                    if let Some(stripped) = strip_heartbeat(&text) {
                        let (clean, reply_to) = extract_reply_directives(&stripped);
                        if !clean.is_empty() || !media_urls.is_empty() {
                            let payload = ReplyPayload {
                                text: clean.clone(),
                                media_urls: media_urls.clone(),
                                reply_to,
                            };
                            collected.blocks.push(payload);
                            let _ = events_tx
                                .send(AgentEvent::Block {
                                    text: clean,
                                    media_urls,
                                })
                                .await;
                        }
                    }
                }
                AgentEvent::ToolResult { text, media_urls } => {
                    if req.verbose {
                        let _ = events_tx
                            .send(AgentEvent::ToolResult { text, media_urls })
                            .await;
                    }
                }
                AgentEvent::Compaction { phase, will_retry } => {
                    if phase == "end" && !will_retry {
                        collected.compactions_completed += 1;
                    }
                    let _ = events_tx
                        .send(AgentEvent::Compaction { phase, will_retry })
                        .await;
                }
                AgentEvent::Usage {
                    input_tokens,
                    output_tokens,
                    total_tokens,
                    context_tokens,
                } => {
                    collected.usage =
                        Some((input_tokens, output_tokens, total_tokens, context_tokens));
                    let _ = events_tx
                        .send(AgentEvent::Usage {
                            input_tokens,
                            output_tokens,
                            total_tokens,
                            context_tokens,
                        })
                        .await;
                }
                AgentEvent::Final { text } => {
                    collected.final_text = Some(text);
                }
                other => {
                    let _ = events_tx.send(other).await;
                }
            }
        }

        match handle.await {
            Ok(result) => result.map(|_| collected),
            Err(join_err) if join_err.is_cancelled() => {
                Err(anyhow!("LLM call timed out after {}ms", req.timeout_ms))
            }
            Err(join_err) => Err(anyhow!("stream task failed: {join_err}")),
        }
    }

    /// Finalization: heartbeat stripping, directive extraction, stream
    /// dedup, compaction/usage accounting, and the at-most-once final.
    async fn finalize(
        &self,
        req: &TurnRequest,
        collected: Collected,
        events_tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<TurnOutcome> {
        let raw = collected
            .final_text
            .unwrap_or_else(|| collected.partials.clone());

        let mut payloads: Vec<ReplyPayload> = Vec::new();
        let mut final_text = String::new();
        if let Some(stripped) = strip_heartbeat(&raw) {
            let (clean, reply_to) = extract_reply_directives(&stripped);
            final_text = clean.clone();
            if !clean.is_empty() {
                payloads.push(ReplyPayload {
                    text: clean,
                    media_urls: Vec::new(),
                    reply_to,
                });
            }
        }

        if collected.compactions_completed > 0 {
            let count = self
                .sessions
                .update(&req.session_key, |entry| {
                    entry.compaction_count += 1;
                })
                .await?
                .map(|e| e.compaction_count)
                .unwrap_or(collected.compactions_completed);
            if req.verbose {
                payloads.insert(
                    0,
                    ReplyPayload::text(&format!("Auto-compaction complete (count {count})")),
                );
            }
        }

        if let Some((input, output, total, context)) = collected.usage {
            if total > 0 {
                self.sessions
                    .update(&req.session_key, |entry| {
                        entry.totals.input_tokens += input;
                        entry.totals.output_tokens += output;
                        entry.totals.total_tokens += total;
                        entry.totals.context_tokens = context;
                    })
                    .await?;
            }
        }

        // Hooks may suppress the current reply without touching queued
        // follow-ups.
        let emit_ctx = HookContext {
            session_key: req.session_key.to_string(),
            run_id: req.run_id.clone(),
            content: Some(final_text.clone()),
            ..HookContext::default()
        };
        let emit = self
            .hooks
            .run_modifying(HookPhase::BeforeResponseEmit, &emit_ctx)
            .await?;
        if emit.block {
            info!(
                "[agent] reply suppressed by plugin: {}",
                emit.block_reason.as_deref().unwrap_or("unspecified")
            );
            payloads.clear();
        } else if let Some(content) = emit.content {
            if let Some(payload) = payloads.last_mut() {
                payload.text = content.clone();
            }
            final_text = content;
        }

        // Block-streamed chunks are not re-sent as the final payload set.
        let mut ledger = StreamLedger::default();
        for block in &collected.blocks {
            ledger.record_block(block);
        }
        let payloads = ledger.filter_final(payloads);

        let _ = events_tx
            .send(AgentEvent::Final {
                text: final_text.clone(),
            })
            .await;

        Ok(TurnOutcome {
            payloads,
            final_text,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::{Hook, HookOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    enum Attempt {
        Events(Vec<AgentEvent>),
        Fail(String),
    }

    struct ScriptedStream {
        attempts: StdMutex<Vec<Attempt>>,
        seen_thinking: StdMutex<Vec<ThinkingLevel>>,
        seen_keys: StdMutex<Vec<String>>,
    }

    impl ScriptedStream {
        fn new(attempts: Vec<Attempt>) -> Arc<Self> {
            Arc::new(Self {
                attempts: StdMutex::new(attempts),
                seen_thinking: StdMutex::new(Vec::new()),
                seen_keys: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamFn for ScriptedStream {
        async fn stream(&self, ctx: &TurnContext, events: mpsc::Sender<AgentEvent>) -> Result<()> {
            self.seen_thinking.lock().unwrap().push(ctx.thinking_level);
            self.seen_keys.lock().unwrap().push(ctx.api_key.clone());
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                if attempts.is_empty() {
                    Attempt::Events(vec![AgentEvent::Final {
                        text: "default".to_string(),
                    }])
                } else {
                    attempts.remove(0)
                }
            };
            match attempt {
                Attempt::Events(evs) => {
                    for ev in evs {
                        let _ = events.send(ev).await;
                    }
                    Ok(())
                }
                Attempt::Fail(msg) => Err(anyhow!(msg)),
            }
        }
    }

    struct TestHarness {
        runner: AgentRunner,
        sessions: Arc<SessionStore>,
        auth: Arc<AuthRotator>,
        _tmp: tempfile::TempDir,
    }

    async fn harness(stream: Arc<ScriptedStream>, profiles: usize) -> TestHarness {
        harness_with_hooks(stream, profiles, HookRunner::new(true)).await
    }

    async fn harness_with_hooks(
        stream: Arc<ScriptedStream>,
        profiles: usize,
        hooks: HookRunner,
    ) -> TestHarness {
        let tmp = tempfile::tempdir().unwrap();
        let auth = AuthRotator::open(tmp.path()).unwrap();
        for i in 0..profiles {
            auth.upsert(auth::AuthProfile {
                id: format!("p{i}"),
                provider: "anthropic".to_string(),
                mode: auth::AuthMode::ApiKey,
                credentials: json!({ "apiKey": format!("sk-{i}") }),
                last_good: Some(i as u64),
                cooldown_until: None,
                usage_count: 0,
            })
            .await
            .unwrap();
        }
        let sessions = SessionStore::open(tmp.path(), "ada").unwrap();
        sessions
            .get_or_create(&SessionKey::main("ada"))
            .await
            .unwrap();
        let runner = AgentRunner::new(
            ModelRegistry::default(),
            auth.clone(),
            Arc::new(hooks),
            stream,
            sessions.clone(),
        );
        TestHarness {
            runner,
            sessions,
            auth,
            _tmp: tmp,
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            run_id: "run-1".to_string(),
            session_key: SessionKey::main("ada"),
            session_id: "sess-1".to_string(),
            session_file: "runs/main.jsonl".to_string(),
            workspace_dir: "/tmp/ws".to_string(),
            prompt: "hello".to_string(),
            model: "claude-opus-4".to_string(),
            auth_profile_id: None,
            thinking_level: ThinkingLevel::Low,
            verbose: false,
            elevated: false,
            timeout_ms: 5_000,
            block_reply_break: BlockReplyBreak::TextEnd,
            block_reply_chunking: false,
            heartbeat: false,
        }
    }

    fn channel() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
        mpsc::channel(64)
    }

    async fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn happy_path_produces_final_payload() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![
            AgentEvent::Partial {
                text: "hel".to_string(),
                media_urls: vec![],
            },
            AgentEvent::Partial {
                text: "lo".to_string(),
                media_urls: vec![],
            },
            AgentEvent::Final {
                text: "hello there".to_string(),
            },
        ])]);
        let h = harness(stream, 1).await;
        let (tx, mut rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.payloads.len(), 1);
        assert_eq!(outcome.payloads[0].text, "hello there");

        let events = drain(&mut rx).await;
        let finals = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Final { .. }))
            .count();
        assert_eq!(finals, 1, "exactly one final per run");
    }

    #[tokio::test]
    async fn streamed_blocks_suppress_final_payloads() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![
            AgentEvent::Block {
                text: "hi".to_string(),
                media_urls: vec![],
            },
            AgentEvent::Block {
                text: "done".to_string(),
                media_urls: vec![],
            },
            AgentEvent::Final {
                text: "hi".to_string(),
            },
        ])]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert!(
            outcome.payloads.is_empty(),
            "finals are dropped once blocks streamed"
        );
        assert_eq!(outcome.final_text, "hi");
    }

    #[tokio::test]
    async fn auth_failure_rotates_to_next_profile() {
        let stream = ScriptedStream::new(vec![
            Attempt::Fail("401 invalid api key".to_string()),
            Attempt::Events(vec![AgentEvent::Final {
                text: "recovered".to_string(),
            }]),
        ]);
        let h = harness(stream.clone(), 2).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.payloads[0].text, "recovered");

        let keys = stream.seen_keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1], "second attempt used a different profile");

        // The failing profile is on cooldown now.
        let cooled = h
            .auth
            .profiles()
            .into_iter()
            .filter(|p| p.cooldown_until.is_some())
            .count();
        assert_eq!(cooled, 1);
    }

    #[tokio::test]
    async fn all_profiles_exhausted_surfaces_error() {
        let stream = ScriptedStream::new(vec![
            Attempt::Fail("429 rate limit exceeded".to_string()),
            Attempt::Fail("429 rate limit exceeded".to_string()),
        ]);
        let h = harness(stream, 2).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        let error = outcome.error.unwrap();
        assert!(error.contains("rate limit"), "got: {error}");
    }

    #[tokio::test]
    async fn unsupported_thinking_retries_lower() {
        let stream = ScriptedStream::new(vec![
            Attempt::Fail("thinking level unsupported for this model".to_string()),
            Attempt::Events(vec![AgentEvent::Final {
                text: "ok".to_string(),
            }]),
        ]);
        let h = harness(stream.clone(), 1).await;
        let (tx, _rx) = channel();

        let mut req = request();
        req.thinking_level = ThinkingLevel::High;
        let outcome = h.runner.run_turn(&req, tx).await.unwrap();
        assert_eq!(outcome.error, None);

        let levels = stream.seen_thinking.lock().unwrap().clone();
        assert_eq!(levels, vec![ThinkingLevel::High, ThinkingLevel::Medium]);
    }

    #[tokio::test]
    async fn timeout_on_multi_profile_rotates() {
        let stream = ScriptedStream::new(vec![
            Attempt::Fail("request timed out".to_string()),
            Attempt::Events(vec![AgentEvent::Final {
                text: "after rotate".to_string(),
            }]),
        ]);
        let h = harness(stream.clone(), 2).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert_eq!(outcome.error, None);
        assert_eq!(stream.seen_keys.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn timeout_on_single_profile_surfaces() {
        let stream = ScriptedStream::new(vec![Attempt::Fail("request timed out".to_string())]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_model_fails_without_stream_call() {
        let stream = ScriptedStream::new(vec![]);
        let h = harness(stream.clone(), 1).await;
        let (tx, _rx) = channel();

        let mut req = request();
        req.model = "no-such-model".to_string();
        let outcome = h.runner.run_turn(&req, tx).await.unwrap();
        assert!(outcome.error.unwrap().contains("unknown-model"));
        assert!(stream.seen_keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_fallback_is_tried() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![AgentEvent::Final {
            text: "via fallback".to_string(),
        }])]);
        let tmp_harness = harness(stream, 1).await;
        let runner = tmp_harness
            .runner
            .with_model_fallbacks(vec!["claude-sonnet-4".to_string()]);
        let (tx, _rx) = channel();

        let mut req = request();
        req.model = "no-such-model".to_string();
        let outcome = runner.run_turn(&req, tx).await.unwrap();
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.payloads[0].text, "via fallback");
    }

    #[tokio::test]
    async fn heartbeat_only_reply_is_empty() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![AgentEvent::Final {
            text: "HEARTBEAT_OK".to_string(),
        }])]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert!(outcome.payloads.is_empty());
        assert_eq!(outcome.final_text, "");
        assert_eq!(outcome.error, None);
    }

    #[tokio::test]
    async fn directive_tag_only_reply_echoes_empty_final() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![AgentEvent::Final {
            text: "[[reply_to_current]]".to_string(),
        }])]);
        let h = harness(stream, 1).await;
        let (tx, mut rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert!(outcome.payloads.is_empty());
        assert_eq!(outcome.final_text, "");

        let events = drain(&mut rx).await;
        let final_texts: Vec<String> = events
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::Final { text } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(final_texts, vec![String::new()]);
    }

    #[tokio::test]
    async fn reply_tags_become_payload_targets() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![AgentEvent::Final {
            text: "done [[reply_to:msg-9]]".to_string(),
        }])]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert_eq!(outcome.payloads.len(), 1);
        assert_eq!(outcome.payloads[0].text, "done");
        assert_eq!(
            outcome.payloads[0].reply_to,
            ReplyTo::Explicit("msg-9".to_string())
        );
    }

    #[tokio::test]
    async fn socket_closed_error_is_rewritten() {
        let stream = ScriptedStream::new(vec![Attempt::Fail(
            "transport: socket closed unexpectedly".to_string(),
        )]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some(SOCKET_CLOSED_REWRITE));
    }

    #[tokio::test]
    async fn usage_is_persisted_to_session() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![
            AgentEvent::Usage {
                input_tokens: 100,
                output_tokens: 40,
                total_tokens: 140,
                context_tokens: 9_000,
            },
            AgentEvent::Final {
                text: "counted".to_string(),
            },
        ])]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        h.runner.run_turn(&request(), tx).await.unwrap();
        let entry = h.sessions.get(&SessionKey::main("ada")).unwrap();
        assert_eq!(entry.totals.input_tokens, 100);
        assert_eq!(entry.totals.output_tokens, 40);
        assert_eq!(entry.totals.total_tokens, 140);
        assert_eq!(entry.totals.context_tokens, 9_000);
    }

    #[tokio::test]
    async fn compaction_end_increments_session_counter() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![
            AgentEvent::Compaction {
                phase: "start".to_string(),
                will_retry: false,
            },
            AgentEvent::Compaction {
                phase: "end".to_string(),
                will_retry: false,
            },
            AgentEvent::Final {
                text: "compacted".to_string(),
            },
        ])]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();

        let mut req = request();
        req.verbose = true;
        let outcome = h.runner.run_turn(&req, tx).await.unwrap();

        let entry = h.sessions.get(&SessionKey::main("ada")).unwrap();
        assert_eq!(entry.compaction_count, 1);
        assert!(
            outcome.payloads[0]
                .text
                .contains("Auto-compaction complete (count 1)")
        );
    }

    #[tokio::test]
    async fn compaction_retry_phase_does_not_count() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![
            AgentEvent::Compaction {
                phase: "end".to_string(),
                will_retry: true,
            },
            AgentEvent::Final {
                text: "x".to_string(),
            },
        ])]);
        let h = harness(stream, 1).await;
        let (tx, _rx) = channel();
        h.runner.run_turn(&request(), tx).await.unwrap();
        let entry = h.sessions.get(&SessionKey::main("ada")).unwrap();
        assert_eq!(entry.compaction_count, 0);
    }

    struct BlockingHook;

    #[async_trait]
    impl Hook for BlockingHook {
        fn name(&self) -> &str {
            "blocker"
        }

        async fn on_modify(
            &self,
            phase: HookPhase,
            _ctx: &HookContext,
        ) -> Result<Option<HookOutcome>> {
            if phase == HookPhase::BeforeLlmCall {
                return Ok(Some(HookOutcome {
                    block: true,
                    block_reason: Some("policy".to_string()),
                    ..HookOutcome::default()
                }));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn before_llm_call_block_prevents_stream() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![AgentEvent::Final {
            text: "must not run".to_string(),
        }])]);
        let mut hooks = HookRunner::new(true);
        hooks.register(Arc::new(BlockingHook));
        let h = harness_with_hooks(stream.clone(), 1, hooks).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert_eq!(
            outcome.error.as_deref(),
            Some("LLM call blocked by plugin: policy")
        );
        assert!(stream.seen_keys.lock().unwrap().is_empty());
    }

    struct EmitSuppressor;

    #[async_trait]
    impl Hook for EmitSuppressor {
        fn name(&self) -> &str {
            "suppressor"
        }

        async fn on_modify(
            &self,
            phase: HookPhase,
            _ctx: &HookContext,
        ) -> Result<Option<HookOutcome>> {
            if phase == HookPhase::BeforeResponseEmit {
                return Ok(Some(HookOutcome {
                    block: true,
                    block_reason: Some("quiet hours".to_string()),
                    ..HookOutcome::default()
                }));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn before_response_emit_block_suppresses_current_reply() {
        let stream = ScriptedStream::new(vec![Attempt::Events(vec![AgentEvent::Final {
            text: "loud reply".to_string(),
        }])]);
        let mut hooks = HookRunner::new(true);
        hooks.register(Arc::new(EmitSuppressor));
        let h = harness_with_hooks(stream, 1, hooks).await;
        let (tx, _rx) = channel();

        let outcome = h.runner.run_turn(&request(), tx).await.unwrap();
        assert!(outcome.payloads.is_empty());
        assert_eq!(outcome.error, None, "suppression is not an error");
    }

    #[test]
    fn error_classification_covers_the_taxonomy() {
        assert_eq!(classify_llm_error("401 Unauthorized"), LlmErrorKind::Auth);
        assert_eq!(
            classify_llm_error("invalid api key provided"),
            LlmErrorKind::Auth
        );
        assert_eq!(
            classify_llm_error("429 too many requests: rate limit"),
            LlmErrorKind::RateLimit
        );
        assert_eq!(
            classify_llm_error("model overloaded, retry later"),
            LlmErrorKind::RateLimit
        );
        assert_eq!(
            classify_llm_error("thinking level not supported"),
            LlmErrorKind::UnsupportedThinking
        );
        assert_eq!(
            classify_llm_error("request timed out"),
            LlmErrorKind::Timeout
        );
        assert_eq!(
            classify_llm_error("something else broke"),
            LlmErrorKind::Other
        );
    }

    #[test]
    fn system_prompt_carries_runtime_and_time() {
        let prompt = build_system_prompt(&PromptInputs {
            agent_name: "ada".to_string(),
            skills: vec!["notes".to_string()],
            bootstrap_files: vec!["AGENTS.md".to_string()],
            tool_names: vec!["exec".to_string(), "canvas".to_string()],
            sandboxed: true,
            user_timezone: Some("Europe/Berlin".to_string()),
        });
        assert!(prompt.contains("ada"));
        assert!(prompt.contains("notes"));
        assert!(prompt.contains("AGENTS.md"));
        assert!(prompt.contains("exec, canvas"));
        assert!(prompt.contains("sandboxed"));
        assert!(prompt.contains("Current user time:"));
    }
}
