use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ElevatedLevel, GroupActivation, SessionKey, ThinkingLevel};
use crate::config::{ChannelConfig, Config, DmPolicy, SessionScope};
use crate::core::now_ms;
use crate::core::store::JsonStore;

const PAIRING_CODE_TTL_MS: u64 = 60 * 60 * 1000;

/// Inbound message contract from a channel adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub surface: String,
    pub sender_id: String,
    pub to: String,
    pub chat: ChatType,
    pub was_mentioned: bool,
    /// The message is a direct reply to something the assistant sent.
    pub reply_to_assistant: bool,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatType {
    Direct,
    Group { group_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Start (or queue) an agent turn on this session.
    Turn { key: SessionKey, prompt: String },
    /// A control directive, applied locally without an agent turn.
    Directive { key: SessionKey, directive: Directive },
    /// The message produced no work.
    Skip { reason: &'static str },
    /// Unknown sender on a pairing-gated channel; reply with this text.
    PairingReply { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Think(ThinkingLevel),
    Verbose(bool),
    Elevated(ElevatedLevel),
    Model(Option<String>),
    Reset,
    Compact,
    Activation(GroupActivation),
    Status,
    Whoami,
    Commands,
}

impl Directive {
    /// Parse a leading slash-command. Unknown commands are not directives;
    /// they flow through as ordinary message text.
    pub fn parse(body: &str) -> Option<Self> {
        let trimmed = body.trim();
        let rest = trimmed.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let command = parts.next()?;
        let arg = parts.next();
        match command {
            "think" => arg.and_then(ThinkingLevel::parse).map(Self::Think),
            "verbose" => match arg {
                Some("on") | None => Some(Self::Verbose(true)),
                Some("off") => Some(Self::Verbose(false)),
                _ => None,
            },
            "elevated" => match arg {
                Some("off") => Some(Self::Elevated(ElevatedLevel::Off)),
                Some("ask") => Some(Self::Elevated(ElevatedLevel::Ask)),
                Some("on") => Some(Self::Elevated(ElevatedLevel::On)),
                _ => None,
            },
            "model" => Some(Self::Model(arg.map(str::to_string))),
            "reset" => Some(Self::Reset),
            "compact" => Some(Self::Compact),
            "activation" => match arg {
                Some("mention") => Some(Self::Activation(GroupActivation::Mention)),
                Some("always") => Some(Self::Activation(GroupActivation::Always)),
                _ => None,
            },
            "status" => Some(Self::Status),
            "whoami" => Some(Self::Whoami),
            "commands" => Some(Self::Commands),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub code: String,
    pub channel: String,
    pub sender_id: String,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedPeer {
    pub channel: String,
    pub sender_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingFile {
    pub pending: Vec<PairingRequest>,
    pub approved: Vec<ApprovedPeer>,
}

/// Durable pairing-code exchange for `dmPolicy = "pairing"` channels.
pub struct PairingStore {
    store: JsonStore<PairingFile>,
}

impl PairingStore {
    pub fn open(state_dir: &Path) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            store: JsonStore::load(state_dir.join("pairing.json"))?,
        }))
    }

    pub fn is_approved(&self, channel: &str, sender_id: &str) -> bool {
        self.store
            .get()
            .approved
            .iter()
            .any(|p| p.channel == channel && p.sender_id == sender_id)
    }

    pub fn pending(&self) -> Vec<PairingRequest> {
        let now = now_ms();
        self.store
            .get()
            .pending
            .iter()
            .filter(|p| now.saturating_sub(p.created_at_ms) < PAIRING_CODE_TTL_MS)
            .cloned()
            .collect()
    }

    /// Issue (or re-issue) a pairing code for an unknown sender.
    pub async fn issue_code(&self, channel: &str, sender_id: &str) -> Result<String> {
        let now = now_ms();
        let code: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let channel = channel.to_string();
        let sender_id = sender_id.to_string();
        let issued = code.clone();
        self.store
            .mutate(move |file| {
                file.pending
                    .retain(|p| now.saturating_sub(p.created_at_ms) < PAIRING_CODE_TTL_MS);
                if let Some(existing) = file
                    .pending
                    .iter()
                    .find(|p| p.channel == channel && p.sender_id == sender_id)
                {
                    return existing.code.clone();
                }
                file.pending.push(PairingRequest {
                    code: issued.clone(),
                    channel,
                    sender_id,
                    created_at_ms: now,
                });
                issued
            })
            .await
    }

    /// Approve a pending code, promoting its sender to the approved set.
    pub async fn approve(&self, channel: &str, code: &str) -> Result<Option<ApprovedPeer>> {
        let channel = channel.to_string();
        let code = code.to_string();
        self.store
            .mutate(move |file| {
                let idx = file
                    .pending
                    .iter()
                    .position(|p| p.channel == channel && p.code == code)?;
                let request = file.pending.remove(idx);
                let peer = ApprovedPeer {
                    channel: request.channel,
                    sender_id: request.sender_id,
                };
                if !file.approved.contains(&peer) {
                    file.approved.push(peer.clone());
                }
                Some(peer)
            })
            .await
    }
}

/// Maps inbound messages to session keys, applying activation and
/// access rules, and peels off directive commands.
pub struct Router {
    agent_id: String,
    config: Arc<Config>,
    pairing: Arc<PairingStore>,
}

impl Router {
    pub fn new(agent_id: &str, config: Arc<Config>, pairing: Arc<PairingStore>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            config,
            pairing,
        }
    }

    pub async fn route(
        &self,
        msg: &InboundMessage,
        activation: Option<GroupActivation>,
    ) -> Result<RouteOutcome> {
        let Some(channel) = self.config.channels.get(&msg.surface) else {
            return Ok(RouteOutcome::Skip {
                reason: "channel-not-configured",
            });
        };
        if !channel.enabled {
            return Ok(RouteOutcome::Skip {
                reason: "channel-disabled",
            });
        }

        match &msg.chat {
            ChatType::Group { group_id } => {
                let key = SessionKey::group(&self.agent_id, &msg.surface, group_id);
                let activation = activation.unwrap_or_default();
                if activation == GroupActivation::Mention
                    && !msg.was_mentioned
                    && !msg.reply_to_assistant
                {
                    return Ok(RouteOutcome::Skip {
                        reason: "not-mentioned",
                    });
                }
                if let Some(directive) = Directive::parse(&msg.body) {
                    // Directives in groups are owner-only.
                    if !is_owner(channel, &msg.sender_id) {
                        return Ok(RouteOutcome::Skip {
                            reason: "directive-not-owner",
                        });
                    }
                    return Ok(RouteOutcome::Directive { key, directive });
                }
                Ok(RouteOutcome::Turn {
                    key,
                    prompt: msg.body.clone(),
                })
            }
            ChatType::Direct => {
                if !self.sender_allowed(channel, &msg.sender_id) {
                    match channel.dm_policy {
                        DmPolicy::Pairing => {
                            if !self.pairing.is_approved(&msg.surface, &msg.sender_id) {
                                let code =
                                    self.pairing.issue_code(&msg.surface, &msg.sender_id).await?;
                                info!(
                                    "[router] pairing code issued for {}:{}",
                                    msg.surface, msg.sender_id
                                );
                                return Ok(RouteOutcome::PairingReply {
                                    message: format!(
                                        "This chat is not paired yet. Your pairing code is {code}. \
                                         Approve it with: clawdbot pairing approve --provider {} {code}",
                                        msg.surface
                                    ),
                                });
                            }
                        }
                        DmPolicy::Open => {
                            return Ok(RouteOutcome::Skip {
                                reason: "sender-not-allowed",
                            });
                        }
                    }
                }

                let key = match self.config.session.scope {
                    SessionScope::Global => SessionKey::main(&self.agent_id),
                    SessionScope::PerSender => {
                        SessionKey::direct(&self.agent_id, &msg.surface, &msg.sender_id)
                    }
                };
                if let Some(directive) = Directive::parse(&msg.body) {
                    return Ok(RouteOutcome::Directive { key, directive });
                }
                Ok(RouteOutcome::Turn {
                    key,
                    prompt: msg.body.clone(),
                })
            }
        }
    }

    fn sender_allowed(&self, channel: &ChannelConfig, sender_id: &str) -> bool {
        let listed = |list: &[String]| {
            list.iter().any(|a| a == "*") || list.iter().any(|a| a == sender_id)
        };
        listed(&channel.allow_from) || listed(&channel.dm.allow_from)
    }
}

/// Apply a directive to its session and produce the local reply text.
/// Directives never start an agent turn.
pub async fn apply_directive(
    sessions: &crate::core::session::SessionStore,
    key: &SessionKey,
    directive: &Directive,
    sender_id: &str,
) -> Result<String> {
    sessions.get_or_create(key).await?;
    let reply = match directive {
        Directive::Think(level) => {
            let level = *level;
            sessions
                .update(key, move |e| e.thinking_level = level)
                .await?;
            format!("Thinking level set to {level:?}").to_lowercase()
        }
        Directive::Verbose(on) => {
            let on = *on;
            sessions
                .update(key, move |e| {
                    e.verbose_level = if on {
                        crate::core::session::VerboseLevel::On
                    } else {
                        crate::core::session::VerboseLevel::Off
                    };
                })
                .await?;
            format!("Verbose {}", if on { "on" } else { "off" })
        }
        Directive::Elevated(level) => {
            let level = *level;
            sessions
                .update(key, move |e| e.elevated_level = level)
                .await?;
            format!("Elevated set to {level:?}").to_lowercase()
        }
        Directive::Model(model) => {
            let model = model.clone();
            let entry = sessions
                .update(key, move |e| e.model_override = model)
                .await?;
            match entry.and_then(|e| e.model_override) {
                Some(model) => format!("Model override set to {model}"),
                None => "Model override cleared".to_string(),
            }
        }
        Directive::Reset => {
            sessions.reset(key).await?;
            "Session reset; starting fresh.".to_string()
        }
        Directive::Compact => "Compaction requested for the next turn.".to_string(),
        Directive::Activation(activation) => {
            let activation = *activation;
            sessions
                .update(key, move |e| e.group_activation = activation)
                .await?;
            format!("Group activation set to {activation:?}").to_lowercase()
        }
        Directive::Status => {
            let entry = sessions.get(key).unwrap_or_default();
            format!(
                "session {key}: model={} thinking={:?} verbose={:?} queue={:?} tokens={}",
                entry
                    .model_override
                    .or(entry.model)
                    .unwrap_or_else(|| "default".to_string()),
                entry.thinking_level,
                entry.verbose_level,
                entry.queue_mode,
                entry.totals.total_tokens,
            )
            .to_lowercase()
        }
        Directive::Whoami => format!("You are {sender_id} on session {key}."),
        Directive::Commands => {
            "/think /verbose /elevated /model /reset /compact /activation /status /whoami /commands"
                .to_string()
        }
    };
    Ok(reply)
}

fn is_owner(channel: &ChannelConfig, sender_id: &str) -> bool {
    channel
        .allow_from
        .iter()
        .any(|a| a == sender_id && a != "*")
}
