use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON frame on the control socket. Requests carry `id` + `method`;
/// responses echo `id` with `result` or `error`; server pushes carry
/// `event`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
    /// Set on streaming responses whose last frame is marked final.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_final: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

impl Frame {
    pub fn request(id: &str, method: &str, params: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            method: Some(method.to_string()),
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn response(id: &str, result: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn error(id: Option<&str>, code: &str, message: &str) -> Self {
        Self {
            id: id.map(str::to_string),
            error: Some(FrameError {
                code: code.to_string(),
                message: message.to_string(),
            }),
            ..Self::default()
        }
    }

    pub fn event(name: &str, params: Value) -> Self {
        Self {
            event: Some(name.to_string()),
            params: Some(params),
            ..Self::default()
        }
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Compose the gateway WebSocket URL a control peer connects to.
///
/// The missing-token message is a contract: peers detect the
/// non-retryable case by the `"Missing gatewayToken"` substring.
pub fn build_relay_ws_url(port: u16, gateway_token: &str) -> Result<String> {
    if gateway_token.is_empty() {
        bail!(
            "Missing gatewayToken in extension settings; pair the peer with the gateway first"
        );
    }
    Ok(format!(
        "ws://127.0.0.1:{port}/extension?token={}",
        url_encode(gateway_token)
    ))
}
