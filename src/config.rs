use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration, persisted as `config.json` in the state dir.
///
/// Every section carries serde defaults so a partial (or missing) file
/// yields a usable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub session: SessionConfig,
    pub agent: AgentConfig,
    pub agents: AgentsConfig,
    pub tools: ToolsConfig,
    pub gateway: GatewayConfig,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub plugins: PluginsConfig,
    pub hooks: HooksConfig,
    pub ui: UiConfig,
    pub talk: TalkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub main_key: String,
    pub scope: SessionScope,
    pub store: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            main_key: "main".to_string(),
            scope: SessionScope::PerSender,
            store: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    PerSender,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub timeout_seconds: u64,
    pub max_concurrent: Option<usize>,
    pub user_timezone: Option<String>,
    pub model: ModelConfig,
    pub bash: BashConfig,
    pub sandbox: SandboxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 600,
            max_concurrent: None,
            user_timezone: None,
            model: ModelConfig::default(),
            bash: BashConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub primary: Option<String>,
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BashConfig {
    pub elevated: ElevatedConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ElevatedConfig {
    pub enabled: bool,
    pub allowed: Vec<String>,
    pub default_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    #[default]
    Off,
    NonMain,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub subagents: SubagentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentDefaults {
    pub announce_timeout_ms: u64,
}

impl Default for SubagentDefaults {
    fn default() -> Self {
        Self {
            announce_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub exec: ExecConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecConfig {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecSecurity {
    Full,
    #[default]
    Allowlist,
    Deny,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Off,
    #[default]
    OnMiss,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: GatewayBind,
    pub auth: GatewayAuthConfig,
    pub tailscale: TailscaleConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 18792,
            bind: GatewayBind::Loopback,
            auth: GatewayAuthConfig::default(),
            tailscale: TailscaleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayBind {
    #[default]
    Loopback,
    Tailnet,
    Auto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayAuthConfig {
    pub mode: GatewayAuthMode,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayAuthMode {
    #[default]
    Password,
    TailscaleIdentity,
    PasswordOrTailscale,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TailscaleConfig {
    pub mode: TailscaleMode,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TailscaleMode {
    #[default]
    Off,
    Serve,
    Funnel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub dm_policy: DmPolicy,
    pub allow_from: Vec<String>,
    pub groups: Vec<String>,
    pub dm: DmConfig,
    /// Outbound endpoint for webhook-backed surfaces (WebChat).
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DmConfig {
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmPolicy {
    #[default]
    Pairing,
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginsConfig {
    pub enabled: bool,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub entries: BTreeMap<String, PluginEntry>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow: Vec::new(),
            deny: Vec::new(),
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginEntry {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HooksConfig {
    pub enabled: bool,
    pub gmail: GmailHookConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailHookConfig {
    pub account: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiConfig {
    pub seam_color: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            seam_color: "#BD5B3E".to_string(),
        }
    }
}

impl UiConfig {
    /// `seamColor` must be a `#RRGGBB` hex color; anything else falls back
    /// to the default at use sites.
    pub fn seam_color_valid(&self) -> bool {
        static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
        PATTERN
            .get_or_init(|| regex::Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("static pattern"))
            .is_match(&self.seam_color)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TalkConfig {
    pub voice_aliases: BTreeMap<String, String>,
}

/// Channel plugins that auto-enable when their credentials appear in the
/// environment. Each entry lists the env vars that must all be present.
const ENV_AUTO_ENABLE: &[(&str, &[&str])] = &[
    ("telegram", &["TELEGRAM_BOT_TOKEN"]),
    ("discord", &["DISCORD_BOT_TOKEN"]),
    ("slack", &["SLACK_BOT_TOKEN", "SLACK_APP_TOKEN"]),
    ("irc", &["IRC_HOST", "IRC_NICK"]),
];

impl Config {
    /// Enable channel plugins whose credentials are present in the
    /// environment, unless the plugin is explicitly denied or already
    /// configured.
    pub fn apply_env_auto_enable(&mut self, env: &dyn Fn(&str) -> Option<String>) {
        if !self.plugins.enabled {
            return;
        }
        for (plugin, vars) in ENV_AUTO_ENABLE {
            if self.plugins.deny.iter().any(|d| d == plugin) {
                continue;
            }
            if self.plugins.entries.contains_key(*plugin) {
                continue;
            }
            let all_present = vars
                .iter()
                .all(|v| env(v).map(|s| !s.trim().is_empty()).unwrap_or(false));
            if all_present {
                self.plugins
                    .entries
                    .insert(plugin.to_string(), PluginEntry { enabled: true });
                self.channels.entry(plugin.to_string()).or_insert_with(|| {
                    ChannelConfig {
                        enabled: true,
                        ..ChannelConfig::default()
                    }
                });
            }
        }
    }

    pub fn plugin_enabled(&self, id: &str) -> bool {
        if !self.plugins.enabled {
            return false;
        }
        if self.plugins.deny.iter().any(|d| d == id) {
            return false;
        }
        if !self.plugins.allow.is_empty() && !self.plugins.allow.iter().any(|a| a == id) {
            return false;
        }
        self.plugins
            .entries
            .get(id)
            .map(|e| e.enabled)
            .unwrap_or(false)
    }
}
