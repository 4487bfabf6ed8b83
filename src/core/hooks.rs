use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// Phases a plugin hook can register for. Modifying phases fold results in
/// registration order; event phases fan out in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    BeforeLlmCall,
    AfterLlmCall,
    BeforeResponseEmit,
    ContextAssembled,
    LoopIterationStart,
    LoopIterationEnd,
    SessionStart,
    SessionEnd,
    GatewayStart,
    GatewayStop,
    BeforeToolCall,
    AfterToolCall,
}

impl HookPhase {
    pub fn is_modifying(self) -> bool {
        matches!(
            self,
            Self::BeforeLlmCall | Self::AfterLlmCall | Self::BeforeResponseEmit
        )
    }
}

/// Context handed to every hook invocation.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub session_key: String,
    pub run_id: String,
    pub messages: Vec<(String, String)>,
    pub system_prompt: Option<String>,
    pub tools: Vec<String>,
    pub content: Option<String>,
    pub data: Value,
}

/// Partial result from a modifying hook. Later handlers' non-`None` fields
/// overwrite earlier ones; `block` short-circuits the call site.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub messages: Option<Vec<(String, String)>>,
    pub system_prompt: Option<String>,
    pub tools: Option<Vec<String>>,
    pub content: Option<String>,
    pub block: bool,
    pub block_reason: Option<String>,
}

impl HookOutcome {
    fn fold(&mut self, other: HookOutcome) {
        if other.messages.is_some() {
            self.messages = other.messages;
        }
        if other.system_prompt.is_some() {
            self.system_prompt = other.system_prompt;
        }
        if other.tools.is_some() {
            self.tools = other.tools;
        }
        if other.content.is_some() {
            self.content = other.content;
        }
        if other.block {
            self.block = true;
            self.block_reason = other.block_reason;
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Called for modifying phases. Return `None` to pass through.
    async fn on_modify(
        &self,
        _phase: HookPhase,
        _ctx: &HookContext,
    ) -> Result<Option<HookOutcome>> {
        Ok(None)
    }

    /// Called for event phases; the result is ignored beyond logging.
    async fn on_event(&self, _phase: HookPhase, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
}

/// Dispatches registered hooks per phase kind.
pub struct HookRunner {
    hooks: Vec<Arc<dyn Hook>>,
    catch_errors: bool,
}

impl HookRunner {
    pub fn new(catch_errors: bool) -> Self {
        Self {
            hooks: Vec::new(),
            catch_errors,
        }
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Sequential fold over handlers in registration order. Stops early on
    /// `block = true`.
    pub async fn run_modifying(&self, phase: HookPhase, ctx: &HookContext) -> Result<HookOutcome> {
        debug_assert!(phase.is_modifying());
        let mut folded = HookOutcome::default();
        for hook in &self.hooks {
            match hook.on_modify(phase, ctx).await {
                Ok(Some(outcome)) => {
                    folded.fold(outcome);
                    if folded.block {
                        return Ok(folded);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if self.catch_errors {
                        warn!("[hooks] {} failed in {:?}: {e}", hook.name(), phase);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(folded)
    }

    /// Fire-and-forget parallel fan-out for event phases.
    pub async fn run_parallel(&self, phase: HookPhase, ctx: &HookContext) {
        debug_assert!(!phase.is_modifying());
        let mut handles = Vec::with_capacity(self.hooks.len());
        for hook in &self.hooks {
            let hook = hook.clone();
            let ctx = ctx.clone();
            let catch = self.catch_errors;
            handles.push(tokio::spawn(async move {
                if let Err(e) = hook.on_event(phase, &ctx).await {
                    if catch {
                        warn!("[hooks] {} failed in {:?}: {e}", hook.name(), phase);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Formats the user-facing error for a hook-blocked LLM call.
pub fn blocked_call_message(reason: Option<&str>) -> String {
    format!(
        "LLM call blocked by plugin: {}",
        reason.unwrap_or("unspecified")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PromptHook {
        name: &'static str,
        prompt: Option<&'static str>,
        block_reason: Option<&'static str>,
        fail: bool,
        events: Arc<AtomicUsize>,
    }

    impl PromptHook {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                prompt: None,
                block_reason: None,
                fail: false,
                events: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Hook for PromptHook {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_modify(
            &self,
            _phase: HookPhase,
            _ctx: &HookContext,
        ) -> Result<Option<HookOutcome>> {
            if self.fail {
                anyhow::bail!("hook broke");
            }
            if let Some(reason) = self.block_reason {
                return Ok(Some(HookOutcome {
                    block: true,
                    block_reason: Some(reason.to_string()),
                    ..HookOutcome::default()
                }));
            }
            Ok(self.prompt.map(|p| HookOutcome {
                system_prompt: Some(p.to_string()),
                ..HookOutcome::default()
            }))
        }

        async fn on_event(&self, _phase: HookPhase, _ctx: &HookContext) -> Result<()> {
            if self.fail {
                anyhow::bail!("hook broke");
            }
            self.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn later_handlers_overwrite_earlier_fields() {
        let mut runner = HookRunner::new(true);
        let mut first = PromptHook::new("first");
        first.prompt = Some("from-first");
        let mut second = PromptHook::new("second");
        second.prompt = Some("from-second");
        runner.register(Arc::new(first));
        runner.register(Arc::new(second));

        let out = runner
            .run_modifying(HookPhase::BeforeLlmCall, &HookContext::default())
            .await
            .unwrap();
        assert_eq!(out.system_prompt.as_deref(), Some("from-second"));
    }

    #[tokio::test]
    async fn block_short_circuits_the_chain() {
        let mut runner = HookRunner::new(true);
        let mut blocker = PromptHook::new("blocker");
        blocker.block_reason = Some("policy");
        let mut late = PromptHook::new("late");
        late.prompt = Some("never-applied");
        runner.register(Arc::new(blocker));
        runner.register(Arc::new(late));

        let out = runner
            .run_modifying(HookPhase::BeforeLlmCall, &HookContext::default())
            .await
            .unwrap();
        assert!(out.block);
        assert_eq!(out.block_reason.as_deref(), Some("policy"));
        assert_eq!(out.system_prompt, None, "chain stopped before 'late'");
        assert_eq!(
            blocked_call_message(out.block_reason.as_deref()),
            "LLM call blocked by plugin: policy"
        );
    }

    #[tokio::test]
    async fn catch_errors_keeps_the_chain_alive() {
        let mut runner = HookRunner::new(true);
        let mut broken = PromptHook::new("broken");
        broken.fail = true;
        let mut fine = PromptHook::new("fine");
        fine.prompt = Some("survived");
        runner.register(Arc::new(broken));
        runner.register(Arc::new(fine));

        let out = runner
            .run_modifying(HookPhase::BeforeLlmCall, &HookContext::default())
            .await
            .unwrap();
        assert_eq!(out.system_prompt.as_deref(), Some("survived"));
    }

    #[tokio::test]
    async fn without_catch_errors_failure_propagates() {
        let mut runner = HookRunner::new(false);
        let mut broken = PromptHook::new("broken");
        broken.fail = true;
        runner.register(Arc::new(broken));

        let result = runner
            .run_modifying(HookPhase::BeforeLlmCall, &HookContext::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn parallel_events_reach_all_hooks() {
        let mut runner = HookRunner::new(true);
        let a = PromptHook::new("a");
        let b = PromptHook::new("b");
        let count_a = a.events.clone();
        let count_b = b.events.clone();
        runner.register(Arc::new(a));
        runner.register(Arc::new(b));

        runner
            .run_parallel(HookPhase::LoopIterationStart, &HookContext::default())
            .await;
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_event_hook_does_not_stop_others() {
        let mut runner = HookRunner::new(true);
        let mut broken = PromptHook::new("broken");
        broken.fail = true;
        let fine = PromptHook::new("fine");
        let count = fine.events.clone();
        runner.register(Arc::new(broken));
        runner.register(Arc::new(fine));

        runner
            .run_parallel(HookPhase::ContextAssembled, &HookContext::default())
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn phase_kinds_are_stable() {
        assert!(HookPhase::BeforeLlmCall.is_modifying());
        assert!(HookPhase::AfterLlmCall.is_modifying());
        assert!(HookPhase::BeforeResponseEmit.is_modifying());
        assert!(!HookPhase::ContextAssembled.is_modifying());
        assert!(!HookPhase::LoopIterationEnd.is_modifying());
        assert!(!HookPhase::GatewayStart.is_modifying());
    }
}
