use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{info, warn};

use crate::channels::{ChannelRegistry, WebhookChannel};
use crate::cli::output::{Section, print_info, print_warn};
use crate::config::Config;
use crate::core::agent::auth::AuthRotator;
use crate::core::agent::providers::HttpChatStream;
use crate::core::agent::{AgentRunner, ModelRegistry, PromptInputs};
use crate::core::cron::{CronFile, CronScheduler};
use crate::core::dispatch::{CronDispatchExecutor, DispatchDefaults, Dispatcher};
use crate::core::delivery::DeliveryPipeline;
use crate::core::hooks::HookRunner;
use crate::core::policy::PolicyEngine;
use crate::core::policy::allowlist::AllowlistStore;
use crate::core::session::router::PairingStore;
use crate::core::session::SessionStore;
use crate::core::statedir::restrict_dir_permissions;
use crate::core::store::JsonStore;
use crate::gateway::{GatewayDeps, GatewayServer};
use crate::node::NodeHost;

pub const DEFAULT_AGENT_ID: &str = "main";

/// The wired control plane, shared by the daemon and the in-process CLI
/// paths (`agent`, `send`, `cron`).
pub struct App {
    pub state_dir: PathBuf,
    pub config: Arc<JsonStore<Config>>,
    pub sessions: Arc<SessionStore>,
    pub pairing: Arc<PairingStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub delivery: Arc<DeliveryPipeline>,
    pub cron: Arc<CronScheduler>,
    pub node_host: Arc<NodeHost>,
    pub registry: ModelRegistry,
}

pub async fn build_app(state_dir: &Path) -> Result<App> {
    let config_store: Arc<JsonStore<Config>> =
        Arc::new(JsonStore::load(state_dir.join("config.json"))?);
    config_store
        .mutate(|config| {
            config.apply_env_auto_enable(&|name| std::env::var(name).ok());
            if config.gateway.auth.token.is_none() {
                config.gateway.auth.token = Some(generate_token());
            }
        })
        .await?;
    let config = config_store.get();

    let auth = AuthRotator::open(state_dir)?;
    let sessions = SessionStore::open(state_dir, DEFAULT_AGENT_ID)?;
    let pairing = PairingStore::open(state_dir)?;

    let mut channels = ChannelRegistry::new();
    for (id, channel) in &config.channels {
        if !channel.enabled {
            continue;
        }
        if let Some(url) = &channel.webhook_url {
            channels.register(Arc::new(WebhookChannel::new(id, url)));
        }
    }
    let channels = Arc::new(channels);
    let delivery = DeliveryPipeline::new(channels, sessions.clone(), state_dir)?;

    let registry = ModelRegistry::default();
    let hooks = Arc::new(HookRunner::new(config.hooks.enabled));
    let stream_fn = Arc::new(HttpChatStream::new());
    let runner = Arc::new(
        AgentRunner::new(
            registry.clone(),
            auth,
            hooks,
            stream_fn,
            sessions.clone(),
        )
        .with_prompt_inputs(PromptInputs {
            agent_name: "clawdbot".to_string(),
            skills: Vec::new(),
            bootstrap_files: Vec::new(),
            tool_names: vec!["exec".to_string(), "node".to_string()],
            sandboxed: config.agent.sandbox.mode != crate::config::SandboxMode::Off,
            user_timezone: config.agent.user_timezone.clone(),
        })
        .with_model_fallbacks(config.agent.model.fallbacks.clone()),
    );

    let workspace_dir = state_dir.join("workspace");
    std::fs::create_dir_all(&workspace_dir).ok();
    let defaults = DispatchDefaults {
        model: config
            .agent
            .model
            .primary
            .clone()
            .unwrap_or_else(|| "claude-opus-4".to_string()),
        timeout_ms: config.agent.timeout_seconds * 1000,
        workspace_dir: workspace_dir.to_string_lossy().to_string(),
    };
    let dispatcher = Dispatcher::new(
        DEFAULT_AGENT_ID,
        runner,
        delivery.clone(),
        sessions.clone(),
        defaults,
        config.agent.max_concurrent,
    );

    let allowlist = AllowlistStore::open(state_dir, DEFAULT_AGENT_ID)?;
    let policy = Arc::new(PolicyEngine::new(
        config.tools.exec.security,
        config.tools.exec.ask,
        allowlist,
    ));
    let node_host = NodeHost::new(policy);

    let cron_store: Arc<JsonStore<CronFile>> = Arc::new(JsonStore::load(
        state_dir.join("cron").join(format!("{DEFAULT_AGENT_ID}.json")),
    )?);
    let cron = CronScheduler::new(cron_store, CronDispatchExecutor::new(dispatcher.clone()));

    Ok(App {
        state_dir: state_dir.to_path_buf(),
        config: config_store,
        sessions,
        pairing,
        dispatcher,
        delivery,
        cron,
        node_host,
        registry,
    })
}

impl App {
    /// Inbound channel traffic: resolve the session, honor activation and
    /// pairing gates, apply directives locally, and queue agent turns
    /// under the session's queue mode.
    pub async fn handle_inbound(
        &self,
        msg: &crate::core::session::router::InboundMessage,
    ) -> Result<InboundOutcome> {
        use crate::core::dispatch::TurnDelivery;
        use crate::core::session::router::{RouteOutcome, Router, apply_directive};

        let router = Router::new(DEFAULT_AGENT_ID, self.config.get(), self.pairing.clone());
        let activation = match &msg.chat {
            crate::core::session::router::ChatType::Group { group_id } => {
                let key = crate::core::session::SessionKey::group(
                    DEFAULT_AGENT_ID,
                    &msg.surface,
                    group_id,
                );
                self.sessions.get(&key).map(|e| e.group_activation)
            }
            _ => None,
        };

        match router.route(msg, activation).await? {
            RouteOutcome::Skip { reason } => Ok(InboundOutcome::Skipped(reason)),
            RouteOutcome::PairingReply { message } => {
                let sent = self
                    .deliver_notice(&msg.surface, &msg.sender_id, &message)
                    .await;
                Ok(InboundOutcome::PairingReply { delivered: sent })
            }
            RouteOutcome::Directive { key, directive } => {
                let reply =
                    apply_directive(&self.sessions, &key, &directive, &msg.sender_id).await?;
                let sent = self
                    .deliver_notice(&msg.surface, &msg.sender_id, &reply)
                    .await;
                Ok(InboundOutcome::Directive { delivered: sent })
            }
            RouteOutcome::Turn { key, prompt } => {
                let entry = self.sessions.get_or_create(&key).await?;
                let turn = self
                    .dispatcher
                    .prepare(
                        &key,
                        &prompt,
                        Some(TurnDelivery {
                            channel: msg.surface.clone(),
                            to: msg.sender_id.clone(),
                            thread_id: None,
                        }),
                    )
                    .await?;
                let run_id = turn.request.run_id.clone();
                let outcome = self.dispatcher.submit(turn, entry.queue_mode).await?;
                Ok(InboundOutcome::Turn { run_id, outcome })
            }
        }
    }

    async fn deliver_notice(&self, channel: &str, to: &str, text: &str) -> bool {
        let key = crate::core::session::SessionKey::main(DEFAULT_AGENT_ID);
        if self.sessions.get_or_create(&key).await.is_err() {
            return false;
        }
        match self
            .delivery
            .deliver(
                &key,
                channel,
                to,
                vec![crate::core::delivery::ReplyPayload::text(text)],
                None,
            )
            .await
        {
            Ok(sent) => sent > 0,
            Err(e) => {
                warn!("[daemon] notice delivery failed: {e}");
                false
            }
        }
    }
}

#[derive(Debug)]
pub enum InboundOutcome {
    Skipped(&'static str),
    PairingReply { delivered: bool },
    Directive { delivered: bool },
    Turn {
        run_id: String,
        outcome: crate::core::dispatch::SubmitOutcome,
    },
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// The long-lived daemon: scheduler, gateway, log streaming.
pub async fn run_daemon(state_dir: &Path) -> Result<()> {
    let log_events = crate::logging::init_logging(false);
    let app = build_app(state_dir).await?;
    info!("[daemon] state dir: {}", state_dir.display());

    app.cron.clone().start().await?;

    let server = GatewayServer::new(GatewayDeps {
        state_dir: app.state_dir.clone(),
        config: app.config.clone(),
        dispatcher: app.dispatcher.clone(),
        cron: app.cron.clone(),
        sessions: app.sessions.clone(),
        delivery: app.delivery.clone(),
        node_host: app.node_host.clone(),
    });
    server.start_event_forwarding();

    // Stream daemon log lines to control peers.
    let bus = server.bus();
    let mut log_rx = log_events.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = log_rx.recv().await {
            bus.publish("logs", serde_json::json!({ "line": line.trim_end() }));
        }
    });

    server.serve().await
}

fn run_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("run")
}

fn pid_file(state_dir: &Path) -> PathBuf {
    run_dir(state_dir).join("gateway.pid")
}

fn read_pid(state_dir: &Path) -> Option<i32> {
    std::fs::read_to_string(pid_file(state_dir))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn pid_alive(pid: i32) -> bool {
    // Safety: kill with signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

pub async fn gateway_start(state_dir: &Path) -> Result<()> {
    let run_dir = run_dir(state_dir);
    std::fs::create_dir_all(&run_dir)?;
    restrict_dir_permissions(&run_dir);

    if let Some(pid) = read_pid(state_dir) {
        if pid_alive(pid) {
            print_warn("Gateway is already running. Use 'clawdbot gateway stop' first.");
            return Ok(());
        }
        warn!("stale pid file for {pid}; replacing");
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join("gateway.log"))?;
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("daemon-run")
        .stdin(std::process::Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()
        .context("failed to spawn daemon process")?;
    std::fs::write(pid_file(state_dir), child.id().to_string())?;

    let port = {
        let config: Arc<JsonStore<Config>> =
            Arc::new(JsonStore::load(state_dir.join("config.json"))?);
        config.get().gateway.port
    };
    Section::new("Gateway Started")
        .status("Status", &format!("RUNNING (pid {})", child.id()))
        .status("Endpoint", &format!("ws://127.0.0.1:{port}/extension"))
        .blank()
        .info("Run 'clawdbot doctor' to verify the install.")
        .print();
    Ok(())
}

pub async fn gateway_stop(state_dir: &Path) -> Result<()> {
    match read_pid(state_dir) {
        Some(pid) => {
            // Safety: plain SIGTERM to our own recorded daemon pid.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            std::fs::remove_file(pid_file(state_dir)).ok();
            Section::new("Gateway Stopped")
                .status("Status", &format!("STOPPED (was pid {pid})"))
                .print();
        }
        None => print_info("Gateway is not currently running."),
    }
    Ok(())
}

pub async fn gateway_restart(state_dir: &Path) -> Result<()> {
    gateway_stop(state_dir).await?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    gateway_start(state_dir).await
}

pub async fn gateway_status(state_dir: &Path) -> Result<()> {
    match read_pid(state_dir) {
        Some(pid) if pid_alive(pid) => {
            Section::new("Gateway Status")
                .status("Status", &format!("RUNNING (pid {pid})"))
                .status("State dir", &state_dir.display().to_string())
                .print();
        }
        Some(pid) => {
            Section::new("Gateway Status")
                .status("Status", &format!("STALE (pid {pid} is gone)"))
                .print();
        }
        None => print_info("Gateway is not currently running."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::router::{ChatType, InboundMessage};

    async fn app_with_open_webchat() -> (App, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = serde_json::json!({
            "channels": {
                "webchat": { "enabled": true, "dmPolicy": "open", "allowFrom": ["*"] }
            }
        });
        std::fs::write(
            tmp.path().join("config.json"),
            serde_json::to_string_pretty(&config).unwrap(),
        )
        .unwrap();
        let app = build_app(tmp.path()).await.unwrap();
        (app, tmp)
    }

    fn inbound(body: &str, chat: ChatType, mentioned: bool) -> InboundMessage {
        InboundMessage {
            surface: "webchat".to_string(),
            sender_id: "op".to_string(),
            to: "bot".to_string(),
            chat,
            was_mentioned: mentioned,
            reply_to_assistant: false,
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn unmentioned_group_messages_produce_no_work() {
        let (app, _tmp) = app_with_open_webchat().await;
        let outcome = app
            .handle_inbound(&inbound(
                "just chatting",
                ChatType::Group {
                    group_id: "g1".to_string(),
                },
                false,
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Skipped("not-mentioned")));
        // No session was created and nothing went out.
        assert!(app.sessions.list().is_empty());
    }

    #[tokio::test]
    async fn directives_are_answered_without_a_turn() {
        let (app, _tmp) = app_with_open_webchat().await;
        let outcome = app
            .handle_inbound(&inbound("/think high", ChatType::Direct, false))
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Directive { .. }));

        let key = crate::core::session::SessionKey::direct(DEFAULT_AGENT_ID, "webchat", "op");
        let entry = app.sessions.get(&key).unwrap();
        assert_eq!(
            entry.thinking_level,
            crate::core::session::ThinkingLevel::High
        );
    }

    #[tokio::test]
    async fn direct_messages_queue_agent_turns() {
        let (app, _tmp) = app_with_open_webchat().await;
        let outcome = app
            .handle_inbound(&inbound("hello there", ChatType::Direct, false))
            .await
            .unwrap();
        match outcome {
            InboundOutcome::Turn { run_id, outcome } => {
                assert!(!run_id.is_empty());
                assert_eq!(outcome, crate::core::dispatch::SubmitOutcome::Started);
            }
            other => panic!("expected Turn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_app_generates_a_gateway_token() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_app(tmp.path()).await.unwrap();
        let token = app.config.get().gateway.auth.token.clone().unwrap();
        assert_eq!(token.len(), 32);

        // A rebuilt app keeps the persisted token.
        let again = build_app(tmp.path()).await.unwrap();
        assert_eq!(again.config.get().gateway.auth.token.clone().unwrap(), token);
    }
}
