use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::agent::events::AgentEvent;
use crate::core::agent::{AgentRunner, BlockReplyBreak, TurnRequest};
use crate::core::cron::{CronExecutor, CronJob, CronPayload, CronRunOutcome, SessionTarget};
use crate::core::cron::CronDeliveryMode;
use crate::core::delivery::{DeliveryPipeline, ReplyPayload};
use crate::core::session::{QueueMode, SessionKey, SessionStore};

/// Where a turn's replies go. `None` runs the turn silently.
#[derive(Debug, Clone)]
pub struct TurnDelivery {
    pub channel: String,
    pub to: String,
    pub thread_id: Option<String>,
}

/// A queued turn, drained FIFO after the active turn ends.
#[derive(Debug, Clone)]
pub struct FollowupRun {
    pub prompt: String,
    pub summary_line: String,
    pub enqueued_at: u64,
    pub request: TurnRequest,
    pub delivery: Option<TurnDelivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started,
    Interrupted,
    Steered,
    Queued,
    Dropped,
}

/// Event relayed to gateway subscribers, tagged with its session and run.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub session_key: String,
    pub run_id: String,
    pub event: AgentEvent,
}

struct ActiveTurn {
    run_id: String,
    session_id: String,
    compacting: Arc<AtomicBool>,
    /// Attached right after spawn; a turn that finishes faster than the
    /// attach simply leaves nothing to abort.
    handle: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct SessionLane {
    gate: Mutex<()>,
    queue: StdMutex<VecDeque<FollowupRun>>,
    active: StdMutex<Option<ActiveTurn>>,
}

/// Defaults applied when building a turn for a session.
#[derive(Debug, Clone)]
pub struct DispatchDefaults {
    pub model: String,
    pub timeout_ms: u64,
    pub workspace_dir: String,
}

impl Default for DispatchDefaults {
    fn default() -> Self {
        Self {
            model: "claude-opus-4".to_string(),
            timeout_ms: 600_000,
            workspace_dir: ".".to_string(),
        }
    }
}

/// Per-session serial lanes with interrupt/steer/followup/drop semantics,
/// plus an optional global lane capping concurrency across the host.
pub struct Dispatcher {
    agent_id: String,
    runner: Arc<AgentRunner>,
    delivery: Arc<DeliveryPipeline>,
    sessions: Arc<SessionStore>,
    lanes: Mutex<HashMap<String, Arc<SessionLane>>>,
    global: Option<Arc<Semaphore>>,
    defaults: DispatchDefaults,
    events: broadcast::Sender<DispatchEvent>,
    /// Self-handle for the turn tasks this dispatcher spawns.
    me: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        agent_id: &str,
        runner: Arc<AgentRunner>,
        delivery: Arc<DeliveryPipeline>,
        sessions: Arc<SessionStore>,
        defaults: DispatchDefaults,
        max_concurrent: Option<usize>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(512);
        Arc::new_cyclic(|me| Self {
            agent_id: agent_id.to_string(),
            runner,
            delivery,
            sessions,
            lanes: Mutex::new(HashMap::new()),
            global: max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            defaults,
            events,
            me: me.clone(),
        })
    }

    fn strong(&self) -> Arc<Dispatcher> {
        self.me.upgrade().expect("dispatcher dropped mid-flight")
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// The runtime seam, exposed for steer-style message injection.
    pub fn runner_stream_fn(&self) -> Arc<dyn crate::core::agent::events::StreamFn> {
        self.runner.stream_fn()
    }

    /// Build a turn for `key` from the session entry and the dispatch
    /// defaults. The session's `/model` override wins over the default.
    pub async fn prepare(
        &self,
        key: &SessionKey,
        prompt: &str,
        delivery: Option<TurnDelivery>,
    ) -> Result<FollowupRun> {
        let entry = self.sessions.get_or_create(key).await?;
        let model = entry
            .model_override
            .clone()
            .or(entry.model.clone())
            .unwrap_or_else(|| self.defaults.model.clone());
        let request = TurnRequest {
            run_id: uuid::Uuid::new_v4().to_string(),
            session_key: key.clone(),
            session_id: entry.session_id.clone(),
            session_file: entry.session_file.clone(),
            workspace_dir: self.defaults.workspace_dir.clone(),
            prompt: prompt.to_string(),
            model,
            auth_profile_id: None,
            thinking_level: entry.thinking_level,
            verbose: entry.verbose_level == crate::core::session::VerboseLevel::On,
            elevated: entry.elevated_level == crate::core::session::ElevatedLevel::On,
            timeout_ms: self.defaults.timeout_ms,
            block_reply_break: BlockReplyBreak::TextEnd,
            block_reply_chunking: false,
            heartbeat: false,
        };
        let summary_line = prompt.lines().next().unwrap_or_default().chars().take(80).collect();
        Ok(FollowupRun {
            prompt: prompt.to_string(),
            summary_line,
            enqueued_at: crate::core::now_ms(),
            request,
            delivery,
        })
    }

    /// Submit a turn under the session's queue mode.
    pub async fn submit(&self, turn: FollowupRun, mode: QueueMode) -> Result<SubmitOutcome> {
        let lane = self.lane(&turn.request.session_key).await;

        let active_info = {
            let active = lane.active.lock().expect("lane active poisoned");
            active
                .as_ref()
                .map(|a| (a.session_id.clone(), a.compacting.clone()))
        };

        if let Some((active_session, compacting)) = active_info {
            match mode {
                QueueMode::Drop => {
                    info!(
                        "[dispatch] dropping turn for {} (active run in flight)",
                        turn.request.session_key
                    );
                    return Ok(SubmitOutcome::Dropped);
                }
                QueueMode::Steer => {
                    let injectable = !compacting.load(Ordering::SeqCst);
                    if injectable {
                        let injected = self
                            .runner
                            .stream_fn()
                            .queue_message(&active_session, &turn.prompt)
                            .await
                            .unwrap_or(false);
                        if injected {
                            debug!(
                                "[dispatch] steered message into active run for {}",
                                turn.request.session_key
                            );
                            return Ok(SubmitOutcome::Steered);
                        }
                    }
                    // Injection unavailable; fall back to followup.
                    lane.queue
                        .lock()
                        .expect("lane queue poisoned")
                        .push_back(turn);
                    return Ok(SubmitOutcome::Queued);
                }
                QueueMode::Followup => {
                    lane.queue
                        .lock()
                        .expect("lane queue poisoned")
                        .push_back(turn);
                    return Ok(SubmitOutcome::Queued);
                }
                QueueMode::Interrupt => {
                    let taken = lane.active.lock().expect("lane active poisoned").take();
                    if let Some(active) = taken {
                        warn!(
                            "[dispatch] interrupting run {} on {}",
                            active.run_id, turn.request.session_key
                        );
                        if let Some(handle) = active.handle {
                            handle.abort();
                        }
                    }
                    self.spawn_turn(lane, turn, None);
                    return Ok(SubmitOutcome::Interrupted);
                }
            }
        }

        self.spawn_turn(lane, turn, None);
        Ok(SubmitOutcome::Started)
    }

    /// Run a turn to completion on its lane and report the outcome. Used
    /// by the cron executor and the CLI `agent` path.
    pub async fn run_and_wait(&self, turn: FollowupRun) -> Result<TurnReport> {
        let lane = self.lane(&turn.request.session_key).await;
        let (done_tx, done_rx) = oneshot::channel();
        self.spawn_turn(lane, turn, Some(done_tx));
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("turn task dropped before reporting"))
    }

    async fn lane(&self, key: &SessionKey) -> Arc<SessionLane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(SessionLane::default()))
            .clone()
    }

    fn spawn_turn(
        &self,
        lane: Arc<SessionLane>,
        turn: FollowupRun,
        done: Option<oneshot::Sender<TurnReport>>,
    ) {
        let me = self.strong();
        let compacting = Arc::new(AtomicBool::new(false));
        let run_id = turn.request.run_id.clone();
        let session_id = turn.request.session_id.clone();
        let compacting_for_task = compacting.clone();
        let lane_for_task = lane.clone();

        // Mark the turn active before its task exists, so a fast-finishing
        // task never races its own registration.
        {
            let mut active = lane.active.lock().expect("lane active poisoned");
            *active = Some(ActiveTurn {
                run_id: run_id.clone(),
                session_id,
                compacting: compacting.clone(),
                handle: None,
            });
        }

        let handle = tokio::spawn(async move {
            let report = me
                .execute_turn(&lane_for_task, &turn, compacting_for_task)
                .await;
            if let Some(done) = done {
                let _ = done.send(report);
            }

            // Clear the active marker (unless an interrupt already took it)
            // and schedule the follow-up drain.
            {
                let mut active = lane_for_task.active.lock().expect("lane active poisoned");
                if active
                    .as_ref()
                    .map(|a| a.run_id == turn.request.run_id)
                    .unwrap_or(false)
                {
                    *active = None;
                }
            }
            me.schedule_followup_drain(lane_for_task);
        });

        let mut active = lane.active.lock().expect("lane active poisoned");
        if let Some(entry) = active.as_mut() {
            if entry.run_id == run_id {
                entry.handle = Some(handle);
            }
        }
    }

    async fn execute_turn(
        &self,
        lane: &SessionLane,
        turn: &FollowupRun,
        compacting: Arc<AtomicBool>,
    ) -> TurnReport {
        let _permit = match &self.global {
            Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore closed")),
            None => None,
        };
        let _gate = lane.gate.lock().await;

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let key = turn.request.session_key.clone();
        let run_id = turn.request.run_id.clone();
        let delivery_target = turn.delivery.clone();
        let delivery = self.delivery.clone();
        let events = self.events.clone();
        let key_str = key.as_str().to_string();

        // Relay: typed events flow to gateway subscribers; block replies are
        // pushed to the channel as they arrive.
        let relay = tokio::spawn(async move {
            let mut streamed = 0usize;
            while let Some(event) = rx.recv().await {
                match &event {
                    AgentEvent::Compaction { phase, .. } => {
                        compacting.store(phase != "end", Ordering::SeqCst);
                    }
                    AgentEvent::Block { text, media_urls } => {
                        if let Some(target) = &delivery_target {
                            let payload = ReplyPayload {
                                text: text.clone(),
                                media_urls: media_urls.clone(),
                                reply_to: crate::core::delivery::ReplyTo::None,
                            };
                            match delivery
                                .deliver(
                                    &key,
                                    &target.channel,
                                    &target.to,
                                    vec![payload],
                                    target.thread_id.clone(),
                                )
                                .await
                            {
                                Ok(n) => streamed += n,
                                Err(e) => warn!("[dispatch] block delivery failed: {e}"),
                            }
                        }
                    }
                    _ => {}
                }
                let _ = events.send(DispatchEvent {
                    session_key: key_str.clone(),
                    run_id: run_id.clone(),
                    event,
                });
            }
            streamed
        });

        let outcome = self.runner.run_turn(&turn.request, tx).await;
        let streamed = relay.await.unwrap_or(0);

        let mut report = TurnReport {
            streamed_messages: streamed,
            ..TurnReport::default()
        };
        match outcome {
            Ok(result) => {
                report.error = result.error.clone();
                report.final_text = result.final_text.clone();
                if let Some(target) = &turn.delivery {
                    let mut payloads = result.payloads;
                    if let Some(error) = &result.error {
                        payloads = vec![ReplyPayload::text(error)];
                    }
                    if !payloads.is_empty() {
                        match self
                            .delivery
                            .deliver(
                                &turn.request.session_key,
                                &target.channel,
                                &target.to,
                                payloads,
                                target.thread_id.clone(),
                            )
                            .await
                        {
                            Ok(n) => report.delivered_messages = n,
                            Err(e) => {
                                warn!("[dispatch] final delivery failed: {e}");
                                report.error = Some(e.to_string());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("[dispatch] turn failed on {}: {e}", turn.request.session_key);
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// Schedule the queue drain as its own task, so it runs even when the
    /// finishing turn's callbacks outlive its future.
    fn schedule_followup_drain(&self, lane: Arc<SessionLane>) {
        let next = lane.queue.lock().expect("lane queue poisoned").pop_front();
        let Some(next) = next else { return };
        let me = self.strong();
        tokio::spawn(async move {
            debug!(
                "[dispatch] draining follow-up for {}",
                next.request.session_key
            );
            me.spawn_turn(lane, next, None);
        });
    }
}

#[derive(Debug, Default)]
pub struct TurnReport {
    pub final_text: String,
    pub delivered_messages: usize,
    pub streamed_messages: usize,
    pub error: Option<String>,
}

/// Bridges the cron scheduler onto the dispatcher: resolves the session
/// target, runs the job's agent turn, and reports delivery status.
pub struct CronDispatchExecutor {
    dispatcher: Arc<Dispatcher>,
}

impl CronDispatchExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { dispatcher })
    }

    fn session_key(&self, job: &CronJob) -> SessionKey {
        match &job.session_target {
            SessionTarget::Main => SessionKey::main(self.dispatcher.agent_id()),
            SessionTarget::Named { key } => SessionKey::named(key),
            SessionTarget::Isolated => SessionKey::named(&format!(
                "agent:{}:cron:{}",
                self.dispatcher.agent_id(),
                job.id
            )),
        }
    }
}

#[async_trait]
impl CronExecutor for CronDispatchExecutor {
    async fn execute(&self, job: &CronJob) -> Result<CronRunOutcome> {
        let CronPayload::AgentTurn { message } = &job.payload;
        let key = self.session_key(job);

        let delivery = match job.delivery.mode {
            CronDeliveryMode::Silent => None,
            CronDeliveryMode::Announce | CronDeliveryMode::Direct => {
                match (&job.delivery.channel, &job.delivery.to) {
                    (Some(channel), Some(to)) => Some(TurnDelivery {
                        channel: channel.clone(),
                        to: to.clone(),
                        thread_id: None,
                    }),
                    _ => {
                        // Fall back to where the session last delivered.
                        self.dispatcher
                            .sessions
                            .get(&key)
                            .and_then(|e| e.last_delivery)
                            .map(|ctx| TurnDelivery {
                                channel: ctx.channel,
                                to: ctx.to,
                                thread_id: ctx.thread_id,
                            })
                    }
                }
            }
        };

        let turn = self.dispatcher.prepare(&key, message, delivery).await?;
        let report = self.dispatcher.run_and_wait(turn).await?;
        if let Some(error) = report.error {
            anyhow::bail!("{error}");
        }
        Ok(CronRunOutcome {
            delivery_status: Some(if report.delivered_messages + report.streamed_messages > 0 {
                format!("delivered {} message(s)", report.delivered_messages + report.streamed_messages)
            } else {
                "silent".to_string()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelRegistry, RecordingChannel};
    use crate::core::agent::auth::{AuthMode, AuthProfile, AuthRotator};
    use crate::core::agent::events::{StreamFn, TurnContext};
    use crate::core::agent::ModelRegistry;
    use crate::core::hooks::HookRunner;
    use serde_json::json;
    use std::time::Duration;

    struct EchoStream {
        delay: Duration,
        accept_steer: bool,
        steered: StdMutex<Vec<String>>,
    }

    impl EchoStream {
        fn new(delay: Duration, accept_steer: bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                accept_steer,
                steered: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamFn for EchoStream {
        async fn stream(
            &self,
            ctx: &TurnContext,
            events: mpsc::Sender<AgentEvent>,
        ) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let prompt = ctx
                .messages
                .first()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let _ = events
                .send(AgentEvent::Final {
                    text: format!("echo: {prompt}"),
                })
                .await;
            Ok(())
        }

        async fn queue_message(&self, _session_id: &str, text: &str) -> Result<bool> {
            if self.accept_steer {
                self.steered.lock().unwrap().push(text.to_string());
            }
            Ok(self.accept_steer)
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        channel: Arc<RecordingChannel>,
        _tmp: tempfile::TempDir,
    }

    async fn fixture(stream: Arc<EchoStream>, max_concurrent: Option<usize>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let auth = AuthRotator::open(tmp.path()).unwrap();
        auth.upsert(AuthProfile {
            id: "p0".to_string(),
            provider: "anthropic".to_string(),
            mode: AuthMode::ApiKey,
            credentials: json!({ "apiKey": "sk-test" }),
            last_good: None,
            cooldown_until: None,
            usage_count: 0,
        })
        .await
        .unwrap();

        let sessions = SessionStore::open(tmp.path(), "ada").unwrap();
        let channel = RecordingChannel::new("webchat");
        let mut registry = ChannelRegistry::new();
        registry.register(channel.clone());
        let delivery =
            DeliveryPipeline::new(Arc::new(registry), sessions.clone(), tmp.path()).unwrap();

        let runner = Arc::new(AgentRunner::new(
            ModelRegistry::default(),
            auth,
            Arc::new(HookRunner::new(true)),
            stream,
            sessions.clone(),
        ));
        let dispatcher = Dispatcher::new(
            "ada",
            runner,
            delivery,
            sessions,
            DispatchDefaults::default(),
            max_concurrent,
        );
        Fixture {
            dispatcher,
            channel,
            _tmp: tmp,
        }
    }

    fn delivery_to(channel: &str, to: &str) -> Option<TurnDelivery> {
        Some(TurnDelivery {
            channel: channel.to_string(),
            to: to.to_string(),
            thread_id: None,
        })
    }

    async fn wait_for_sends(channel: &RecordingChannel, count: usize) {
        for _ in 0..200 {
            if channel.sent.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} sends, got {}",
            channel.sent.lock().await.len()
        );
    }

    #[tokio::test]
    async fn followup_turns_drain_in_order() {
        let f = fixture(EchoStream::new(Duration::from_millis(50), false), None).await;
        let key = SessionKey::main("ada");

        for prompt in ["one", "two", "three"] {
            let turn = f
                .dispatcher
                .prepare(&key, prompt, delivery_to("webchat", "op"))
                .await
                .unwrap();
            f.dispatcher.submit(turn, QueueMode::Followup).await.unwrap();
        }

        wait_for_sends(&f.channel, 3).await;
        let texts = f.channel.sent_texts().await;
        assert_eq!(texts, vec!["echo: one", "echo: two", "echo: three"]);
    }

    #[tokio::test]
    async fn drop_mode_discards_while_active() {
        let f = fixture(EchoStream::new(Duration::from_millis(100), false), None).await;
        let key = SessionKey::main("ada");

        let first = f
            .dispatcher
            .prepare(&key, "keep", delivery_to("webchat", "op"))
            .await
            .unwrap();
        assert_eq!(
            f.dispatcher.submit(first, QueueMode::Drop).await.unwrap(),
            SubmitOutcome::Started
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = f
            .dispatcher
            .prepare(&key, "discard", delivery_to("webchat", "op"))
            .await
            .unwrap();
        assert_eq!(
            f.dispatcher.submit(second, QueueMode::Drop).await.unwrap(),
            SubmitOutcome::Dropped
        );

        wait_for_sends(&f.channel, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.channel.sent_texts().await, vec!["echo: keep"]);
    }

    #[tokio::test]
    async fn steer_injects_into_active_run() {
        let stream = EchoStream::new(Duration::from_millis(150), true);
        let f = fixture(stream.clone(), None).await;
        let key = SessionKey::main("ada");

        let first = f
            .dispatcher
            .prepare(&key, "long task", delivery_to("webchat", "op"))
            .await
            .unwrap();
        f.dispatcher.submit(first, QueueMode::Steer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = f
            .dispatcher
            .prepare(&key, "also consider this", delivery_to("webchat", "op"))
            .await
            .unwrap();
        assert_eq!(
            f.dispatcher.submit(second, QueueMode::Steer).await.unwrap(),
            SubmitOutcome::Steered
        );
        assert_eq!(
            stream.steered.lock().unwrap().clone(),
            vec!["also consider this"]
        );

        wait_for_sends(&f.channel, 1).await;
        assert_eq!(f.channel.sent_texts().await, vec!["echo: long task"]);
    }

    #[tokio::test]
    async fn steer_falls_back_to_followup_when_injection_fails() {
        let f = fixture(EchoStream::new(Duration::from_millis(80), false), None).await;
        let key = SessionKey::main("ada");

        let first = f
            .dispatcher
            .prepare(&key, "first", delivery_to("webchat", "op"))
            .await
            .unwrap();
        f.dispatcher.submit(first, QueueMode::Steer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = f
            .dispatcher
            .prepare(&key, "second", delivery_to("webchat", "op"))
            .await
            .unwrap();
        assert_eq!(
            f.dispatcher.submit(second, QueueMode::Steer).await.unwrap(),
            SubmitOutcome::Queued
        );

        wait_for_sends(&f.channel, 2).await;
        assert_eq!(
            f.channel.sent_texts().await,
            vec!["echo: first", "echo: second"]
        );
    }

    #[tokio::test]
    async fn interrupt_cancels_active_run() {
        let f = fixture(EchoStream::new(Duration::from_millis(300), false), None).await;
        let key = SessionKey::main("ada");

        let slow = f
            .dispatcher
            .prepare(&key, "slow", delivery_to("webchat", "op"))
            .await
            .unwrap();
        f.dispatcher.submit(slow, QueueMode::Interrupt).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = f
            .dispatcher
            .prepare(&key, "fresh", delivery_to("webchat", "op"))
            .await
            .unwrap();
        assert_eq!(
            f.dispatcher
                .submit(fresh, QueueMode::Interrupt)
                .await
                .unwrap(),
            SubmitOutcome::Interrupted
        );

        wait_for_sends(&f.channel, 1).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            f.channel.sent_texts().await,
            vec!["echo: fresh"],
            "the interrupted run must not deliver"
        );
    }

    #[tokio::test]
    async fn run_and_wait_reports_delivery() {
        let f = fixture(EchoStream::new(Duration::ZERO, false), None).await;
        let key = SessionKey::main("ada");
        let turn = f
            .dispatcher
            .prepare(&key, "ping", delivery_to("webchat", "op"))
            .await
            .unwrap();
        let report = f.dispatcher.run_and_wait(turn).await.unwrap();
        assert_eq!(report.final_text, "echo: ping");
        assert_eq!(report.delivered_messages, 1);
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn silent_turn_delivers_nothing() {
        let f = fixture(EchoStream::new(Duration::ZERO, false), None).await;
        let key = SessionKey::main("ada");
        let turn = f.dispatcher.prepare(&key, "quiet", None).await.unwrap();
        let report = f.dispatcher.run_and_wait(turn).await.unwrap();
        assert_eq!(report.final_text, "echo: quiet");
        assert_eq!(report.delivered_messages, 0);
        assert!(f.channel.sent_texts().await.is_empty());
    }

    #[tokio::test]
    async fn sessions_run_concurrently_without_global_cap() {
        let f = fixture(EchoStream::new(Duration::from_millis(100), false), None).await;
        let a = f
            .dispatcher
            .prepare(
                &SessionKey::direct("ada", "webchat", "u1"),
                "a",
                delivery_to("webchat", "u1"),
            )
            .await
            .unwrap();
        let b = f
            .dispatcher
            .prepare(
                &SessionKey::direct("ada", "webchat", "u2"),
                "b",
                delivery_to("webchat", "u2"),
            )
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let (ra, rb) = tokio::join!(
            f.dispatcher.run_and_wait(a),
            f.dispatcher.run_and_wait(b)
        );
        ra.unwrap();
        rb.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(190),
            "two sessions should overlap"
        );
    }

    #[tokio::test]
    async fn global_cap_serializes_across_sessions() {
        let f = fixture(EchoStream::new(Duration::from_millis(100), false), Some(1)).await;
        let a = f
            .dispatcher
            .prepare(
                &SessionKey::direct("ada", "webchat", "u1"),
                "a",
                delivery_to("webchat", "u1"),
            )
            .await
            .unwrap();
        let b = f
            .dispatcher
            .prepare(
                &SessionKey::direct("ada", "webchat", "u2"),
                "b",
                delivery_to("webchat", "u2"),
            )
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let (ra, rb) = tokio::join!(
            f.dispatcher.run_and_wait(a),
            f.dispatcher.run_and_wait(b)
        );
        ra.unwrap();
        rb.unwrap();
        assert!(
            started.elapsed() >= Duration::from_millis(190),
            "global lane must serialize"
        );
    }

    #[tokio::test]
    async fn cron_executor_runs_isolated_jobs() {
        use crate::core::cron::{CronDelivery, CronSchedule};

        let f = fixture(EchoStream::new(Duration::ZERO, false), None).await;
        let executor = CronDispatchExecutor::new(f.dispatcher.clone());

        let mut job = CronJob::new(
            "morning",
            CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: 0,
            },
            "summarize the news",
        );
        job.delivery = CronDelivery {
            mode: CronDeliveryMode::Direct,
            channel: Some("webchat".to_string()),
            to: Some("op".to_string()),
        };

        let outcome = executor.execute(&job).await.unwrap();
        assert_eq!(
            outcome.delivery_status.as_deref(),
            Some("delivered 1 message(s)")
        );
        assert_eq!(
            f.channel.sent_texts().await,
            vec!["echo: summarize the news"]
        );
    }

    #[tokio::test]
    async fn cron_silent_jobs_report_silent() {
        use crate::core::cron::CronSchedule;

        let f = fixture(EchoStream::new(Duration::ZERO, false), None).await;
        let executor = CronDispatchExecutor::new(f.dispatcher.clone());
        let job = CronJob::new(
            "quiet",
            CronSchedule::Every {
                every_ms: 60_000,
                anchor_ms: 0,
            },
            "internal bookkeeping",
        );
        let outcome = executor.execute(&job).await.unwrap();
        assert_eq!(outcome.delivery_status.as_deref(), Some("silent"));
        assert!(f.channel.sent_texts().await.is_empty());
    }
}
