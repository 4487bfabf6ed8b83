use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::info;

use crate::core::policy::{CommandInput, ExecEvent, ExecRequest, PolicyEngine};

/// Default per-call bridge timeout; callers may pass their own.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeErrorCode {
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
    #[serde(rename = "PERMISSION_MISSING")]
    PermissionMissing,
    #[serde(rename = "NODE_BACKGROUND_UNAVAILABLE")]
    NodeBackgroundUnavailable,
    #[serde(rename = "CAMERA_DISABLED")]
    CameraDisabled,
    #[serde(rename = "LOCATION_DISABLED")]
    LocationDisabled,
    #[serde(rename = "LOCATION_PERMISSION_REQUIRED")]
    LocationPermissionRequired,
    #[serde(rename = "A2UI_HOST_NOT_CONFIGURED")]
    A2uiHostNotConfigured,
    #[serde(rename = "A2UI_HOST_UNAVAILABLE")]
    A2uiHostUnavailable,
}

impl NodeErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unavailable => "UNAVAILABLE",
            Self::PermissionMissing => "PERMISSION_MISSING",
            Self::NodeBackgroundUnavailable => "NODE_BACKGROUND_UNAVAILABLE",
            Self::CameraDisabled => "CAMERA_DISABLED",
            Self::LocationDisabled => "LOCATION_DISABLED",
            Self::LocationPermissionRequired => "LOCATION_PERMISSION_REQUIRED",
            Self::A2uiHostNotConfigured => "A2UI_HOST_NOT_CONFIGURED",
            Self::A2uiHostUnavailable => "A2UI_HOST_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeError {
    pub code: NodeErrorCode,
    pub message: String,
}

impl NodeError {
    pub fn new(code: NodeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenePhase {
    Foreground,
    Background,
}

/// Capabilities and permission state a node reported at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub node_id: String,
    pub caps: BTreeSet<String>,
    pub permissions: BTreeMap<String, PermissionStatus>,
    pub scene_phase: ScenePhase,
}

/// The peer side of a node bridge session. The gateway provides the real
/// frame round trip; tests provide scripted ones.
#[async_trait]
pub trait NodeBridge: Send + Sync {
    async fn call(&self, cmd: &str, params: Value) -> Result<Value, NodeError>;
}

struct NodeSession {
    descriptor: NodeDescriptor,
    bridge: Arc<dyn NodeBridge>,
}

/// Capabilities requiring the companion app to be foregrounded.
fn requires_foreground(cmd: &str) -> bool {
    cmd.starts_with("canvas.") || cmd.starts_with("camera.") || cmd.starts_with("screen.")
}

/// Invokes device capabilities over peer-initiated bridges, with the
/// policy engine gating `system.run` exactly like local shell commands.
pub struct NodeHost {
    nodes: Mutex<HashMap<String, NodeSession>>,
    policy: Arc<PolicyEngine>,
    exec_events: broadcast::Sender<ExecEvent>,
}

impl NodeHost {
    pub fn new(policy: Arc<PolicyEngine>) -> Arc<Self> {
        let (exec_events, _) = broadcast::channel(128);
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            policy,
            exec_events,
        })
    }

    pub fn subscribe_exec(&self) -> broadcast::Receiver<ExecEvent> {
        self.exec_events.subscribe()
    }

    pub async fn register(&self, descriptor: NodeDescriptor, bridge: Arc<dyn NodeBridge>) {
        info!("[node] registered {}", descriptor.node_id);
        self.nodes.lock().await.insert(
            descriptor.node_id.clone(),
            NodeSession { descriptor, bridge },
        );
    }

    pub async fn unregister(&self, node_id: &str) -> bool {
        self.nodes.lock().await.remove(node_id).is_some()
    }

    pub async fn set_scene_phase(&self, node_id: &str, phase: ScenePhase) {
        if let Some(session) = self.nodes.lock().await.get_mut(node_id) {
            session.descriptor.scene_phase = phase;
        }
    }

    pub async fn list(&self) -> Vec<NodeDescriptor> {
        let nodes = self.nodes.lock().await;
        let mut out: Vec<NodeDescriptor> =
            nodes.values().map(|s| s.descriptor.clone()).collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub async fn describe(&self, node_id: &str) -> Option<NodeDescriptor> {
        self.nodes
            .lock()
            .await
            .get(node_id)
            .map(|s| s.descriptor.clone())
    }

    /// Invoke one capability. Gates: capability present, foreground phase
    /// for screen-bound caps, per-capability permission, policy for
    /// `system.run`. A bridge timeout surfaces as `UNAVAILABLE`.
    pub async fn invoke(
        &self,
        node_id: &str,
        cmd: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, NodeError> {
        let (descriptor, bridge) = {
            let nodes = self.nodes.lock().await;
            let Some(session) = nodes.get(node_id) else {
                return Err(NodeError::new(
                    NodeErrorCode::Unavailable,
                    format!("node '{node_id}' is not connected"),
                ));
            };
            (session.descriptor.clone(), session.bridge.clone())
        };

        if !descriptor.caps.contains(cmd) {
            return Err(NodeError::new(
                NodeErrorCode::InvalidRequest,
                format!("node '{node_id}' has no capability '{cmd}'"),
            ));
        }

        if requires_foreground(cmd) && descriptor.scene_phase == ScenePhase::Background {
            return Err(NodeError::new(
                NodeErrorCode::NodeBackgroundUnavailable,
                format!("'{cmd}' needs the app in the foreground"),
            ));
        }

        if let Some(err) = permission_gate(cmd, &descriptor) {
            return Err(err);
        }

        if cmd == "system.run" {
            self.gate_system_run(&params).await?;
        }

        let timeout = timeout.unwrap_or(DEFAULT_INVOKE_TIMEOUT);
        match tokio::time::timeout(timeout, bridge.call(cmd, params)).await {
            Ok(result) => {
                if cmd == "system.run" {
                    let success = result.is_ok();
                    let _ = self.exec_events.send(ExecEvent::Finished {
                        command: cmd.to_string(),
                        success,
                    });
                }
                result
            }
            Err(_) => Err(NodeError::new(
                NodeErrorCode::Unavailable,
                format!("'{cmd}' timed out after {}s", timeout.as_secs()),
            )),
        }
    }

    async fn gate_system_run(&self, params: &Value) -> Result<(), NodeError> {
        let command = params
            .get("command")
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let argv: Option<Vec<String>> = params.get("argv").and_then(|a| {
            a.as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
        });

        let input = match (argv, &command) {
            (Some(argv), _) if !argv.is_empty() => CommandInput::Argv(argv),
            (_, Some(cmd)) if !cmd.trim().is_empty() => CommandInput::Shell(cmd.clone()),
            _ => {
                return Err(NodeError::new(
                    NodeErrorCode::InvalidRequest,
                    "system.run needs 'argv' or 'command'",
                ));
            }
        };
        let display = match &input {
            CommandInput::Argv(argv) => argv.join(" "),
            CommandInput::Shell(cmd) => cmd.clone(),
        };
        let request = ExecRequest {
            command: input,
            cwd: None,
            env: HashMap::new(),
        };

        let decision = self.policy.evaluate(&request, None).await;
        if !decision.allowed {
            let reason = decision
                .event_reason
                .clone()
                .unwrap_or_else(|| "denied".to_string());
            let message = decision
                .error_message
                .clone()
                .unwrap_or_else(|| "command denied".to_string());
            let _ = self.exec_events.send(ExecEvent::Denied {
                command: display,
                event_reason: reason,
                message: message.clone(),
            });
            return Err(NodeError::new(NodeErrorCode::InvalidRequest, message));
        }
        let _ = self.exec_events.send(ExecEvent::Started { command: display });
        Ok(())
    }
}

/// Map a denied/unknown permission to its capability-specific error.
fn permission_gate(cmd: &str, descriptor: &NodeDescriptor) -> Option<NodeError> {
    let status = descriptor.permissions.get(cmd).copied();
    if cmd.starts_with("camera.") {
        if status == Some(PermissionStatus::Denied) {
            return Some(NodeError::new(
                NodeErrorCode::CameraDisabled,
                "camera permission denied",
            ));
        }
    } else if cmd == "location.get" {
        match status {
            Some(PermissionStatus::Denied) => {
                return Some(NodeError::new(
                    NodeErrorCode::LocationDisabled,
                    "location permission denied",
                ));
            }
            Some(PermissionStatus::Unknown) | None => {
                return Some(NodeError::new(
                    NodeErrorCode::LocationPermissionRequired,
                    "location permission has not been granted yet",
                ));
            }
            Some(PermissionStatus::Granted) => {}
        }
    } else if status == Some(PermissionStatus::Denied) {
        return Some(NodeError::new(
            NodeErrorCode::PermissionMissing,
            format!("PERMISSION_MISSING:{cmd}"),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecAsk, ExecSecurity};
    use crate::core::policy::allowlist::AllowlistStore;
    use serde_json::json;

    struct ScriptedBridge {
        delay: Duration,
        response: Value,
    }

    #[async_trait]
    impl NodeBridge for ScriptedBridge {
        async fn call(&self, _cmd: &str, _params: Value) -> Result<Value, NodeError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.response.clone())
        }
    }

    fn descriptor(node_id: &str) -> NodeDescriptor {
        NodeDescriptor {
            node_id: node_id.to_string(),
            caps: [
                "system.run",
                "canvas.draw",
                "camera.capture",
                "screen.record",
                "location.get",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            permissions: BTreeMap::from([
                ("camera.capture".to_string(), PermissionStatus::Granted),
                ("location.get".to_string(), PermissionStatus::Granted),
                ("screen.record".to_string(), PermissionStatus::Granted),
            ]),
            scene_phase: ScenePhase::Foreground,
        }
    }

    async fn host() -> (Arc<NodeHost>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let allowlist = AllowlistStore::open(tmp.path(), "main").unwrap();
        let policy = Arc::new(PolicyEngine::new(
            ExecSecurity::Allowlist,
            ExecAsk::OnMiss,
            allowlist,
        ));
        (NodeHost::new(policy), tmp)
    }

    fn ok_bridge() -> Arc<ScriptedBridge> {
        Arc::new(ScriptedBridge {
            delay: Duration::ZERO,
            response: json!({ "ok": true }),
        })
    }

    #[tokio::test]
    async fn invoke_reaches_registered_node() {
        let (host, _tmp) = host().await;
        host.register(descriptor("mac-1"), ok_bridge()).await;
        let result = host
            .invoke("mac-1", "canvas.draw", json!({}), None)
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn unknown_node_is_unavailable() {
        let (host, _tmp) = host().await;
        let err = host
            .invoke("ghost", "canvas.draw", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn missing_capability_is_invalid_request() {
        let (host, _tmp) = host().await;
        host.register(descriptor("mac-1"), ok_bridge()).await;
        let err = host
            .invoke("mac-1", "printer.jam", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn background_blocks_screen_caps() {
        let (host, _tmp) = host().await;
        host.register(descriptor("phone"), ok_bridge()).await;
        host.set_scene_phase("phone", ScenePhase::Background).await;

        for cmd in ["canvas.draw", "camera.capture", "screen.record"] {
            let err = host.invoke("phone", cmd, json!({}), None).await.unwrap_err();
            assert_eq!(err.code, NodeErrorCode::NodeBackgroundUnavailable, "{cmd}");
        }
        // Non-screen capabilities still work in the background.
        assert!(host.invoke("phone", "location.get", json!({}), None).await.is_ok());
    }

    #[tokio::test]
    async fn camera_denied_maps_to_camera_disabled() {
        let (host, _tmp) = host().await;
        let mut desc = descriptor("phone");
        desc.permissions
            .insert("camera.capture".to_string(), PermissionStatus::Denied);
        host.register(desc, ok_bridge()).await;
        let err = host
            .invoke("phone", "camera.capture", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::CameraDisabled);
    }

    #[tokio::test]
    async fn location_permission_states() {
        let (host, _tmp) = host().await;
        let mut desc = descriptor("phone");
        desc.permissions
            .insert("location.get".to_string(), PermissionStatus::Denied);
        host.register(desc, ok_bridge()).await;
        let err = host
            .invoke("phone", "location.get", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::LocationDisabled);

        let mut desc = descriptor("tablet");
        desc.permissions.remove("location.get");
        host.register(desc, ok_bridge()).await;
        let err = host
            .invoke("tablet", "location.get", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::LocationPermissionRequired);
    }

    #[tokio::test]
    async fn generic_denied_permission_names_the_cap() {
        let (host, _tmp) = host().await;
        let mut desc = descriptor("phone");
        desc.permissions
            .insert("screen.record".to_string(), PermissionStatus::Denied);
        host.register(desc, ok_bridge()).await;
        let err = host
            .invoke("phone", "screen.record", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::PermissionMissing);
        assert!(err.message.contains("PERMISSION_MISSING:screen.record"));
    }

    #[tokio::test]
    async fn timeout_surfaces_as_unavailable() {
        let (host, _tmp) = host().await;
        host.register(
            descriptor("slow"),
            Arc::new(ScriptedBridge {
                delay: Duration::from_millis(200),
                response: json!({}),
            }),
        )
        .await;
        let err = host
            .invoke(
                "slow",
                "canvas.draw",
                json!({}),
                Some(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::Unavailable);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn system_run_goes_through_policy() {
        let (host, _tmp) = host().await;
        host.register(descriptor("mac-1"), ok_bridge()).await;
        let mut exec_events = host.subscribe_exec();

        // Safe command passes and emits started/finished.
        let result = host
            .invoke(
                "mac-1",
                "system.run",
                json!({ "argv": ["echo", "hi"] }),
                None,
            )
            .await;
        assert!(result.is_ok());
        assert!(matches!(
            exec_events.try_recv().unwrap(),
            ExecEvent::Started { .. }
        ));
        assert!(matches!(
            exec_events.try_recv().unwrap(),
            ExecEvent::Finished { success: true, .. }
        ));

        // Privileged wrapper is denied with exec.denied.
        let err = host
            .invoke(
                "mac-1",
                "system.run",
                json!({ "argv": ["sudo", "rm", "-rf", "/"] }),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, NodeErrorCode::InvalidRequest);
        match exec_events.try_recv().unwrap() {
            ExecEvent::Denied { event_reason, .. } => {
                assert_eq!(event_reason, "allowlist-miss");
            }
            other => panic!("expected Denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_and_describe_round_trip() {
        let (host, _tmp) = host().await;
        host.register(descriptor("b-node"), ok_bridge()).await;
        host.register(descriptor("a-node"), ok_bridge()).await;

        let listed = host.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].node_id, "a-node");

        let described = host.describe("b-node").await.unwrap();
        assert!(described.caps.contains("system.run"));
        assert!(host.describe("missing").await.is_none());

        assert!(host.unregister("a-node").await);
        assert!(!host.unregister("a-node").await);
    }
}
