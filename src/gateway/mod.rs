pub mod protocol;
pub mod reconnect;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{Config, GatewayAuthMode, GatewayBind, TailscaleMode};
use crate::core::agent::events::AgentEvent;
use crate::core::cron::{
    CronDelivery, CronEvent, CronJob, CronPayload, CronSchedule, CronScheduler, RunMode,
    SessionTarget,
};
use crate::core::delivery::{DeliveryPipeline, ReplyPayload, resolve_discord_target};
use crate::core::dispatch::{Dispatcher, TurnDelivery};
use crate::core::session::{
    ElevatedLevel, GroupActivation, QueueMode, SessionKey, SessionStore, ThinkingLevel,
    VerboseLevel,
};
use crate::core::store::JsonStore;
use crate::node::NodeHost;
use protocol::{Frame, FrameError};

const EVENT_BUFFER_CAP: usize = 200;

/// Broadcast hub with a replay buffer: every subscription sees the newest
/// `cap` events even when it joins late.
pub struct EventBus {
    tx: broadcast::Sender<Frame>,
    buffer: StdMutex<VecDeque<Frame>>,
    cap: usize,
}

impl EventBus {
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(512);
        Arc::new(Self {
            tx,
            buffer: StdMutex::new(VecDeque::new()),
            cap,
        })
    }

    pub fn publish(&self, event: &str, params: Value) {
        let frame = Frame::event(event, params);
        {
            let mut buffer = self.buffer.lock().expect("event buffer poisoned");
            if buffer.len() == self.cap {
                buffer.pop_front();
            }
            buffer.push_back(frame.clone());
        }
        let _ = self.tx.send(frame);
    }

    /// Replay snapshot plus a live receiver.
    pub fn subscribe(&self) -> (Vec<Frame>, broadcast::Receiver<Frame>) {
        let rx = self.tx.subscribe();
        let replay = self
            .buffer
            .lock()
            .expect("event buffer poisoned")
            .iter()
            .cloned()
            .collect();
        (replay, rx)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoicewakeState {
    pub enabled: bool,
    pub phrase: String,
}

/// Components the protocol surface routes into.
pub struct GatewayDeps {
    pub state_dir: PathBuf,
    pub config: Arc<JsonStore<Config>>,
    pub dispatcher: Arc<Dispatcher>,
    pub cron: Arc<CronScheduler>,
    pub sessions: Arc<SessionStore>,
    pub delivery: Arc<DeliveryPipeline>,
    pub node_host: Arc<NodeHost>,
}

/// The WebSocket control endpoint: auth, framing, request routing, and
/// event fan-out with replay buffers.
pub struct GatewayServer {
    deps: GatewayDeps,
    bus: Arc<EventBus>,
    voicewake: StdMutex<VoicewakeState>,
}

impl GatewayServer {
    pub fn new(deps: GatewayDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            bus: EventBus::new(EVENT_BUFFER_CAP),
            voicewake: StdMutex::new(VoicewakeState::default()),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    fn config(&self) -> Arc<Config> {
        self.deps.config.get()
    }

    /// Forward cron, dispatch, and exec events onto the bus.
    pub fn start_event_forwarding(&self) {
        let bus = self.bus.clone();
        let mut cron_rx = self.deps.cron.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = cron_rx.recv().await {
                let name = match &event {
                    CronEvent::Added { .. } => "cron.added",
                    CronEvent::Removed { .. } => "cron.removed",
                    CronEvent::Updated { .. } => "cron.updated",
                    CronEvent::Started { .. } => "cron.started",
                    CronEvent::Finished { .. } => "cron.finished",
                };
                bus.publish(name, serde_json::to_value(&event).unwrap_or(Value::Null));
            }
        });

        let bus = self.bus.clone();
        let mut dispatch_rx = self.deps.dispatcher.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = dispatch_rx.recv().await {
                let name = match &event.event {
                    AgentEvent::Compaction { .. } => "compaction.phase",
                    _ => "chat",
                };
                let payload = json!({
                    "sessionKey": event.session_key,
                    "runId": event.run_id,
                    "event": serde_json::to_value(&event.event).unwrap_or(Value::Null),
                });
                bus.publish(name, payload);
            }
        });

        let bus = self.bus.clone();
        let mut exec_rx = self.deps.node_host.subscribe_exec();
        tokio::spawn(async move {
            while let Ok(event) = exec_rx.recv().await {
                let name = match &event {
                    crate::core::policy::ExecEvent::Started { .. } => "exec.started",
                    crate::core::policy::ExecEvent::Finished { .. } => "exec.finished",
                    crate::core::policy::ExecEvent::Denied { .. } => "exec.denied",
                };
                bus.publish(name, serde_json::to_value(&event).unwrap_or(Value::Null));
            }
        });
    }

    /// Check a connection's credentials against the configured auth mode.
    /// Funnel exposure always demands the password.
    pub fn authorize(
        &self,
        token: Option<&str>,
        tailscale_user: Option<&str>,
    ) -> Result<(), String> {
        let config = self.config();
        let expected = config.gateway.auth.token.as_deref().unwrap_or_default();
        let password_ok = !expected.is_empty() && token == Some(expected);
        let tailscale_ok = tailscale_user.map(|u| !u.is_empty()).unwrap_or(false);

        let funneled = config.gateway.tailscale.mode == TailscaleMode::Funnel;
        let mode = config.gateway.auth.mode;

        let ok = if funneled {
            password_ok
        } else {
            match mode {
                GatewayAuthMode::Password => password_ok,
                GatewayAuthMode::TailscaleIdentity => tailscale_ok,
                GatewayAuthMode::PasswordOrTailscale => password_ok || tailscale_ok,
            }
        };
        if ok {
            Ok(())
        } else {
            Err("unauthorized: bad or missing gateway credentials".to_string())
        }
    }

    /// Pick the listen address for the configured bind mode.
    pub fn resolve_bind_addr(&self) -> String {
        let config = self.config();
        let tailnet = config.gateway.tailscale.address.clone();
        match config.gateway.bind {
            GatewayBind::Loopback => "127.0.0.1".to_string(),
            GatewayBind::Tailnet => tailnet.unwrap_or_else(|| {
                warn!("[gateway] tailnet bind requested but no address known; using loopback");
                "127.0.0.1".to_string()
            }),
            GatewayBind::Auto => tailnet.unwrap_or_else(|| "127.0.0.1".to_string()),
        }
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.resolve_bind_addr(), self.config().gateway.port);
        let app = Router::new()
            .route("/extension", get(ws_upgrade))
            .with_state(self.clone());
        info!("[gateway] listening on ws://{addr}/extension");
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Route one inbound frame. Returns the response frame for requests;
    /// `None` for frames that need no reply.
    pub async fn handle_frame(&self, frame: Frame) -> Option<Frame> {
        let id = frame.id.clone();
        let Some(method) = frame.method.clone() else {
            return Some(Frame::error(
                id.as_deref(),
                "INVALID_REQUEST",
                "frame has no method",
            ));
        };
        let params = frame.params.unwrap_or(Value::Null);
        match self.dispatch_method(&method, params).await {
            Ok(result) => Some(Frame::response(id.as_deref().unwrap_or_default(), result)),
            Err(e) => Some(Frame::error(id.as_deref(), &e.code, &e.message)),
        }
    }

    async fn dispatch_method(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, FrameError> {
        match method {
            "chat.send" | "sessions.send" => self.method_chat_send(params).await,
            "chat.inject" => self.method_chat_inject(params).await,
            "config.get" => Ok(serde_json::to_value(&*self.config()).map_err(internal)?),
            "config.set" => self.method_config_set(params).await,
            "cron.add" => self.method_cron_add(params).await,
            "cron.list" => {
                let jobs = self.deps.cron.list().await;
                Ok(json!({ "jobs": jobs }))
            }
            "cron.update" => self.method_cron_update(params).await,
            "cron.remove" => {
                let id = require_str(&params, "id")?;
                let removed = self.deps.cron.remove(&id).await.map_err(internal)?;
                Ok(json!({ "removed": removed }))
            }
            "cron.run" => self.method_cron_run(params).await,
            "sessions.list" => {
                let sessions: Vec<Value> = self
                    .deps
                    .sessions
                    .list()
                    .into_iter()
                    .map(|(key, entry)| json!({ "key": key, "entry": entry }))
                    .collect();
                Ok(json!({ "sessions": sessions }))
            }
            "sessions.history" => self.method_sessions_history(params).await,
            "sessions.patch" => self.method_sessions_patch(params).await,
            "voicewake.get" => {
                let state = self.voicewake.lock().expect("voicewake poisoned").clone();
                Ok(json!({ "enabled": state.enabled, "phrase": state.phrase }))
            }
            "voicewake.set" => {
                let enabled = params
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| invalid("'enabled' (bool) is required"))?;
                let phrase = params
                    .get("phrase")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                {
                    let mut state = self.voicewake.lock().expect("voicewake poisoned");
                    state.enabled = enabled;
                    state.phrase = phrase.clone();
                }
                self.bus.publish(
                    "voicewake.changed",
                    json!({ "enabled": enabled, "phrase": phrase }),
                );
                Ok(json!({ "ok": true }))
            }
            "node.list" => Ok(json!({ "nodes": self.deps.node_host.list().await })),
            "node.describe" => {
                let node_id = require_str(&params, "nodeId")?;
                match self.deps.node_host.describe(&node_id).await {
                    Some(descriptor) => Ok(serde_json::to_value(descriptor).map_err(internal)?),
                    None => Err(FrameError {
                        code: "UNAVAILABLE".to_string(),
                        message: format!("node '{node_id}' is not connected"),
                    }),
                }
            }
            "node.invoke" => self.method_node_invoke(params).await,
            "agent" => self.method_agent(params).await,
            "send" => self.method_send(params).await,
            _ => Err(FrameError {
                code: "INVALID_REQUEST".to_string(),
                message: format!("unknown method '{method}'"),
            }),
        }
    }

    fn session_key_from(&self, params: &Value) -> SessionKey {
        params
            .get("sessionKey")
            .and_then(Value::as_str)
            .map(SessionKey::named)
            .unwrap_or_else(|| SessionKey::main(self.deps.dispatcher.agent_id()))
    }

    async fn method_chat_send(&self, params: Value) -> Result<Value, FrameError> {
        let text = require_str(&params, "text")?;
        let key = self.session_key_from(&params);

        let delivery = match (
            params.get("channel").and_then(Value::as_str),
            params.get("to").and_then(Value::as_str),
        ) {
            (Some(channel), Some(to)) => Some(TurnDelivery {
                channel: channel.to_string(),
                to: to.to_string(),
                thread_id: params
                    .get("threadId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            _ => self
                .deps
                .sessions
                .get(&key)
                .and_then(|e| e.last_delivery)
                .map(|ctx| TurnDelivery {
                    channel: ctx.channel,
                    to: ctx.to,
                    thread_id: ctx.thread_id,
                }),
        };

        let entry = self
            .deps
            .sessions
            .get_or_create(&key)
            .await
            .map_err(internal)?;
        let turn = self
            .deps
            .dispatcher
            .prepare(&key, &text, delivery)
            .await
            .map_err(internal)?;
        let run_id = turn.request.run_id.clone();
        let outcome = self
            .deps
            .dispatcher
            .submit(turn, entry.queue_mode)
            .await
            .map_err(internal)?;
        Ok(json!({ "runId": run_id, "outcome": format!("{outcome:?}").to_lowercase() }))
    }

    async fn method_chat_inject(&self, params: Value) -> Result<Value, FrameError> {
        let text = require_str(&params, "text")?;
        let key = self.session_key_from(&params);
        let entry = self
            .deps
            .sessions
            .get(&key)
            .ok_or_else(|| invalid("unknown sessionKey"))?;
        let injected = self
            .deps
            .dispatcher
            .runner_stream_fn()
            .queue_message(&entry.session_id, &text)
            .await
            .unwrap_or(false);
        Ok(json!({ "injected": injected }))
    }

    async fn method_config_set(&self, params: Value) -> Result<Value, FrameError> {
        let patch = params
            .get("patch")
            .cloned()
            .ok_or_else(|| invalid("'patch' object is required"))?;
        if !patch.is_object() {
            return Err(invalid("'patch' must be an object"));
        }
        self.deps
            .config
            .mutate(move |config| {
                let mut value = serde_json::to_value(&*config).unwrap_or_default();
                merge_json(&mut value, &patch);
                if let Ok(updated) = serde_json::from_value::<Config>(value) {
                    *config = updated;
                }
            })
            .await
            .map_err(internal)?;
        Ok(serde_json::to_value(&*self.config()).map_err(internal)?)
    }

    async fn method_cron_add(&self, params: Value) -> Result<Value, FrameError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AddParams {
            name: String,
            schedule: CronSchedule,
            message: String,
            #[serde(default)]
            session_target: Option<SessionTarget>,
            #[serde(default)]
            delivery: Option<CronDelivery>,
            #[serde(default)]
            enabled: Option<bool>,
        }
        let add: AddParams = serde_json::from_value(params)
            .map_err(|e| invalid(&format!("bad cron.add params: {e}")))?;

        let mut job = CronJob::new(&add.name, add.schedule, &add.message);
        if let Some(target) = add.session_target {
            job.session_target = target;
        }
        if let Some(delivery) = add.delivery {
            job.delivery = delivery;
        }
        if let Some(enabled) = add.enabled {
            job.enabled = enabled;
        }
        let job = self.deps.cron.add(job).await.map_err(internal)?;
        Ok(serde_json::to_value(job).map_err(internal)?)
    }

    async fn method_cron_update(&self, params: Value) -> Result<Value, FrameError> {
        let id = require_str(&params, "id")?;
        let enabled = params.get("enabled").and_then(Value::as_bool);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        let schedule: Option<CronSchedule> = params
            .get("schedule")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        let updated = self
            .deps
            .cron
            .update(&id, move |job| {
                if let Some(enabled) = enabled {
                    job.enabled = enabled;
                }
                if let Some(name) = name {
                    job.name = name;
                }
                if let Some(message) = message {
                    job.payload = CronPayload::AgentTurn { message };
                }
                if let Some(schedule) = schedule {
                    job.schedule = schedule;
                }
            })
            .await
            .map_err(internal)?;
        match updated {
            Some(job) => Ok(serde_json::to_value(job).map_err(internal)?),
            None => Err(invalid("unknown cron job id")),
        }
    }

    async fn method_cron_run(&self, params: Value) -> Result<Value, FrameError> {
        let id = require_str(&params, "id")?;
        let force = params
            .get("force")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mode = if force { RunMode::Force } else { RunMode::Due };
        let summary = self.deps.cron.run(&id, mode).await.map_err(internal)?;
        Ok(json!({ "ran": summary.ran, "reason": summary.reason }))
    }

    async fn method_sessions_history(
        &self,
        params: Value,
    ) -> Result<Value, FrameError> {
        let key = self.session_key_from(&params);
        let entry = self
            .deps
            .sessions
            .get(&key)
            .ok_or_else(|| invalid("unknown sessionKey"))?;
        let path = self.deps.state_dir.join(&entry.session_file);
        let lines: Vec<Value> = match std::fs::read_to_string(&path) {
            Ok(raw) => raw
                .lines()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        Ok(json!({ "messages": lines }))
    }

    async fn method_sessions_patch(&self, params: Value) -> Result<Value, FrameError> {
        let key = self.session_key_from(&params);
        let patch = params
            .get("patch")
            .cloned()
            .ok_or_else(|| invalid("'patch' object is required"))?;

        let thinking = patch
            .get("thinkingLevel")
            .and_then(Value::as_str)
            .and_then(ThinkingLevel::parse);
        let verbose = patch.get("verboseLevel").and_then(Value::as_str).map(|s| s == "on");
        let elevated = patch
            .get("elevatedLevel")
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "off" => Some(ElevatedLevel::Off),
                "ask" => Some(ElevatedLevel::Ask),
                "on" => Some(ElevatedLevel::On),
                _ => None,
            });
        let queue_mode = patch
            .get("queueMode")
            .and_then(Value::as_str)
            .and_then(QueueMode::parse);
        let activation = patch
            .get("groupActivation")
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "mention" => Some(GroupActivation::Mention),
                "always" => Some(GroupActivation::Always),
                _ => None,
            });
        let model = patch
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.deps
            .sessions
            .get_or_create(&key)
            .await
            .map_err(internal)?;
        let updated = self
            .deps
            .sessions
            .update(&key, move |entry| {
                if let Some(level) = thinking {
                    entry.thinking_level = level;
                }
                if let Some(on) = verbose {
                    entry.verbose_level = if on { VerboseLevel::On } else { VerboseLevel::Off };
                }
                if let Some(level) = elevated {
                    entry.elevated_level = level;
                }
                if let Some(mode) = queue_mode {
                    entry.queue_mode = mode;
                }
                if let Some(activation) = activation {
                    entry.group_activation = activation;
                }
                if let Some(model) = model {
                    entry.model_override = Some(model);
                }
            })
            .await
            .map_err(internal)?
            .ok_or_else(|| invalid("unknown sessionKey"))?;

        self.bus.publish(
            "session.updated",
            json!({ "sessionKey": key.as_str(), "entry": updated }),
        );
        Ok(serde_json::to_value(updated).map_err(internal)?)
    }

    async fn method_node_invoke(&self, params: Value) -> Result<Value, FrameError> {
        let node_id = require_str(&params, "nodeId")?;
        let cmd = require_str(&params, "cmd")?;
        let call_params = params.get("params").cloned().unwrap_or(Value::Null);
        let timeout = params
            .get("timeoutSeconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        match self
            .deps
            .node_host
            .invoke(&node_id, &cmd, call_params, timeout)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => Err(FrameError {
                code: e.code.as_str().to_string(),
                message: e.message,
            }),
        }
    }

    async fn method_agent(&self, params: Value) -> Result<Value, FrameError> {
        let text = require_str(&params, "message")?;
        let key = self.session_key_from(&params);
        let turn = self
            .deps
            .dispatcher
            .prepare(&key, &text, None)
            .await
            .map_err(internal)?;
        let report = self
            .deps
            .dispatcher
            .run_and_wait(turn)
            .await
            .map_err(internal)?;
        Ok(json!({
            "finalText": report.final_text,
            "error": report.error,
        }))
    }

    async fn method_send(&self, params: Value) -> Result<Value, FrameError> {
        let channel = require_str(&params, "channel")?;
        let to = require_str(&params, "to")?;
        let text = require_str(&params, "text")?;
        let key = self.session_key_from(&params);

        let to = if channel == "discord" {
            let last = self.deps.sessions.get(&key).and_then(|e| e.last_delivery);
            resolve_discord_target(&to, last.as_ref())
                .map_err(|message| invalid(&message))?
        } else {
            to
        };

        self.deps
            .sessions
            .get_or_create(&key)
            .await
            .map_err(internal)?;
        let sent = self
            .deps
            .delivery
            .deliver(&key, &channel, &to, vec![ReplyPayload::text(&text)], None)
            .await
            .map_err(internal)?;
        Ok(json!({ "sent": sent }))
    }
}

fn require_str(params: &Value, field: &str) -> Result<String, FrameError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| invalid(&format!("'{field}' (string) is required")))
}

fn invalid(message: &str) -> FrameError {
    FrameError {
        code: "INVALID_REQUEST".to_string(),
        message: message.to_string(),
    }
}

fn internal(e: impl std::fmt::Display) -> FrameError {
    FrameError {
        code: "INTERNAL".to_string(),
        message: e.to_string(),
    }
}

/// Shallow-recursive JSON merge: objects merge, everything else replaces.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                merge_json(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(server): State<Arc<GatewayServer>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let tailscale_user = headers
        .get("tailscale-user-login")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Err(reason) = server.authorize(query.token.as_deref(), tailscale_user.as_deref()) {
        warn!("[gateway] rejected connection: {reason}");
        return (StatusCode::UNAUTHORIZED, reason).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, server))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, server: Arc<GatewayServer>) {
    let (replay, mut events) = server.bus.subscribe();
    for frame in replay {
        if send_frame(&mut socket, &frame).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                let frame = match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let err = Frame::error(None, "INVALID_REQUEST", &format!("bad frame: {e}"));
                        if send_frame(&mut socket, &err).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                if let Some(response) = server.handle_frame(frame).await {
                    if send_frame(&mut socket, &response).await.is_err() {
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[gateway] subscriber lagged, skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!("[gateway] connection closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<()> {
    let raw = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(raw.into()))
        .await
        .map_err(|e| anyhow::anyhow!("ws send failed: {e}"))
}
