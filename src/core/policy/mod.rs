pub mod allowlist;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ExecAsk, ExecSecurity};
use allowlist::AllowlistStore;

/// Wrappers that merely dispatch to another command and can be stripped.
const DISPATCH_WRAPPERS: &[&str] = &["env", "nice", "nohup", "stdbuf", "timeout"];

/// Wrappers that change privileges or scheduling class. Never unwrapped.
const BLOCKED_WRAPPERS: &[&str] = &["chrt", "doas", "ionice", "setsid", "sudo", "taskset"];

const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ash", "ksh", "fish"];

const MAX_UNWRAP_DEPTH: usize = 4;

/// A command submitted for screening: either a pre-split argv or an inline
/// shell string.
#[derive(Debug, Clone)]
pub enum CommandInput {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: CommandInput,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl ExecRequest {
    pub fn argv(argv: &[&str]) -> Self {
        Self {
            command: CommandInput::Argv(argv.iter().map(|s| s.to_string()).collect()),
            cwd: None,
            env: HashMap::new(),
        }
    }

    pub fn shell(command: &str) -> Self {
        Self {
            command: CommandInput::Shell(command.to_string()),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_ask: bool,
    pub allowlist_satisfied: bool,
    pub analysis_ok: bool,
    pub shell_wrapper_blocked: bool,
    pub windows_shell_wrapper_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Broadcast when gated commands run. `Denied` is emitted iff the policy
/// engine denied; a policy-allowed run that fails emits `Finished` with
/// `success = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExecEvent {
    Started {
        command: String,
    },
    Finished {
        command: String,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    Denied {
        command: String,
        event_reason: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellKind {
    Posix,
    WindowsCmd,
    PowerShell,
}

#[derive(Debug, Default)]
struct Analysis {
    segments: Vec<Segment>,
    ok: bool,
    shell_wrapper: Option<ShellKind>,
    failure: Option<String>,
}

#[derive(Debug)]
struct Segment {
    text: String,
    head: String,
    allowlist_pattern: Option<String>,
    satisfied: bool,
}

/// Shell-command screening: wrapper unwrapping, shell-wrapper detection,
/// segmentation, and the allow/ask/deny decision.
pub struct PolicyEngine {
    security: ExecSecurity,
    ask: ExecAsk,
    safe_bins: HashSet<String>,
    skill_bins: HashSet<String>,
    allowlist: Arc<AllowlistStore>,
}

impl PolicyEngine {
    pub fn new(security: ExecSecurity, ask: ExecAsk, allowlist: Arc<AllowlistStore>) -> Self {
        Self {
            security,
            ask,
            safe_bins: default_safe_bins(),
            skill_bins: HashSet::new(),
            allowlist,
        }
    }

    pub fn with_skill_bins(mut self, bins: impl IntoIterator<Item = String>) -> Self {
        self.skill_bins.extend(bins);
        self
    }

    pub async fn evaluate(
        &self,
        req: &ExecRequest,
        approval: Option<ApprovalDecision>,
    ) -> PolicyDecision {
        let analysis = self.analyze(req);
        let allowlist_satisfied =
            !analysis.segments.is_empty() && analysis.segments.iter().all(|s| s.satisfied);

        let mut decision = PolicyDecision {
            allowed: false,
            requires_ask: false,
            allowlist_satisfied,
            analysis_ok: analysis.ok,
            shell_wrapper_blocked: analysis.shell_wrapper == Some(ShellKind::Posix),
            windows_shell_wrapper_blocked: matches!(
                analysis.shell_wrapper,
                Some(ShellKind::WindowsCmd) | Some(ShellKind::PowerShell)
            ),
            event_reason: None,
            error_message: analysis.failure.clone(),
        };

        if self.security == ExecSecurity::Deny {
            decision.event_reason = Some("security-deny".to_string());
            decision.error_message = Some("Command execution is disabled.".to_string());
            return decision;
        }

        if self.ask == ExecAsk::Always {
            decision.requires_ask = true;
            if approval.is_none() {
                decision.event_reason = Some("approval-required".to_string());
                decision.error_message =
                    Some("This command requires approval before it can run.".to_string());
                return decision;
            }
        }

        let shell_gated =
            decision.shell_wrapper_blocked || decision.windows_shell_wrapper_blocked;

        if self.security == ExecSecurity::Full && !shell_gated {
            decision.allowed = true;
            self.touch_allowlist(&analysis).await;
            return decision;
        }

        if decision.analysis_ok && decision.allowlist_satisfied && !shell_gated {
            decision.allowed = true;
            self.touch_allowlist(&analysis).await;
            return decision;
        }

        match approval {
            Some(ApprovalDecision::AllowOnce) => {
                decision.allowed = true;
                decision
            }
            Some(ApprovalDecision::AllowAlways) => {
                decision.allowed = true;
                if self.security == ExecSecurity::Allowlist {
                    for seg in &analysis.segments {
                        let pattern = derive_allowlist_pattern(seg);
                        if let Err(e) = self.allowlist.add(&pattern).await {
                            debug!("failed to persist allowlist pattern {pattern}: {e}");
                        }
                    }
                }
                decision
            }
            None => {
                decision.event_reason = Some("allowlist-miss".to_string());
                decision.error_message = Some(format_allowlist_miss_message(&decision));
                decision
            }
        }
    }

    async fn touch_allowlist(&self, analysis: &Analysis) {
        for seg in &analysis.segments {
            if let Some(pattern) = &seg.allowlist_pattern {
                let _ = self.allowlist.record_use(pattern).await;
            }
        }
    }

    fn analyze(&self, req: &ExecRequest) -> Analysis {
        let mut analysis = Analysis {
            ok: true,
            ..Analysis::default()
        };

        let inline = match &req.command {
            CommandInput::Shell(cmd) => Some(cmd.clone()),
            CommandInput::Argv(argv) => {
                let unwrapped = unwrap_wrappers(argv);
                if let Some(wrapper) = unwrapped.blocked {
                    analysis.ok = false;
                    analysis.failure =
                        Some(format!("privilege wrapper '{wrapper}' is not permitted"));
                    return analysis;
                }
                if let Some(flag) = unwrapped.ambiguous {
                    analysis.ok = false;
                    analysis.failure = Some(format!(
                        "wrapper flag '{flag}' is ambiguous; refusing to analyze"
                    ));
                    return analysis;
                }
                if unwrapped.depth_exceeded {
                    analysis.ok = false;
                    analysis.failure = Some("wrapper nesting too deep to analyze".to_string());
                    return analysis;
                }
                match detect_shell(&unwrapped.argv) {
                    Some((kind, inline)) => {
                        analysis.shell_wrapper = Some(kind);
                        inline
                    }
                    None => {
                        self.push_segment(&mut analysis, &unwrapped.argv.join(" "));
                        return analysis;
                    }
                }
            }
        };

        let Some(inline) = inline else {
            analysis.ok = false;
            analysis.failure = Some("shell wrapper without an inline command".to_string());
            return analysis;
        };

        for segment in split_segments(&inline) {
            self.push_segment(&mut analysis, &segment);
        }
        if analysis.segments.is_empty() {
            analysis.ok = false;
            analysis.failure = Some("empty command".to_string());
        }
        analysis
    }

    fn push_segment(&self, analysis: &mut Analysis, text: &str) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let head = segment_head(&text);
        if BLOCKED_WRAPPERS.contains(&head.as_str()) {
            analysis.ok = false;
            analysis.segments.push(Segment {
                text,
                head,
                allowlist_pattern: None,
                satisfied: false,
            });
            return;
        }
        let allowlist_pattern = self.allowlist.matching_pattern(&text);
        let satisfied = allowlist_pattern.is_some()
            || self.safe_bins.contains(&head)
            || self.skill_bins.contains(&head);
        analysis.segments.push(Segment {
            text,
            head,
            allowlist_pattern,
            satisfied,
        });
    }
}

/// Compose the deny message for an allowlist miss, naming the wrapper
/// family that triggered the gate when one did.
pub fn format_allowlist_miss_message(decision: &PolicyDecision) -> String {
    let mut parts = vec!["Command is not covered by the allowlist.".to_string()];
    if decision.shell_wrapper_blocked {
        parts.push(
            "Inline shells (sh/bash/zsh -c) require explicit approval before running.".to_string(),
        );
    }
    if decision.windows_shell_wrapper_blocked {
        parts.push(
            "Windows shells (cmd.exe /c, powershell -Command) require explicit approval."
                .to_string(),
        );
    }
    parts.push("Ask the operator to approve it, or add a matching allowlist entry.".to_string());
    parts.join(" ")
}

struct Unwrapped {
    argv: Vec<String>,
    blocked: Option<String>,
    ambiguous: Option<String>,
    depth_exceeded: bool,
}

/// Strip dispatch wrappers (`env`, `nice`, `nohup`, `stdbuf`, `timeout`)
/// from the front of an argv, preserving flags that consume values. Stops
/// at privilege wrappers and at [`MAX_UNWRAP_DEPTH`].
fn unwrap_wrappers(argv: &[String]) -> Unwrapped {
    let mut current: Vec<String> = argv.to_vec();
    for depth in 0..=MAX_UNWRAP_DEPTH {
        let Some(head) = current.first().map(|h| basename(h)) else {
            break;
        };
        if BLOCKED_WRAPPERS.contains(&head.as_str()) {
            return Unwrapped {
                argv: current,
                blocked: Some(head),
                ambiguous: None,
                depth_exceeded: false,
            };
        }
        if !DISPATCH_WRAPPERS.contains(&head.as_str()) {
            break;
        }
        if depth == MAX_UNWRAP_DEPTH {
            return Unwrapped {
                argv: current,
                blocked: None,
                ambiguous: None,
                depth_exceeded: true,
            };
        }
        match strip_wrapper(&head, &current[1..]) {
            Ok(rest) => current = rest,
            Err(flag) => {
                return Unwrapped {
                    argv: current,
                    blocked: None,
                    ambiguous: Some(flag),
                    depth_exceeded: false,
                };
            }
        }
    }
    Unwrapped {
        argv: current,
        blocked: None,
        ambiguous: None,
        depth_exceeded: false,
    }
}

/// Remove one wrapper's own arguments, returning the wrapped command.
/// Returns `Err(flag)` when a flag makes the remainder ambiguous.
fn strip_wrapper(wrapper: &str, args: &[String]) -> Result<Vec<String>, String> {
    let (value_flags, ambiguous_flags, skip_positionals): (&[&str], &[&str], usize) = match wrapper
    {
        "env" => (&["-u", "--unset", "-C", "--chdir"], &["-S", "--split-string"], 0),
        "nice" => (&["-n", "--adjustment"], &[], 0),
        "nohup" => (&[], &[], 0),
        "stdbuf" => (&["-i", "-o", "-e"], &[], 0),
        "timeout" => (&["-s", "--signal", "-k", "--kill-after"], &[], 1),
        _ => (&[], &[], 0),
    };

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if ambiguous_flags.iter().any(|f| arg == f || arg.starts_with(&format!("{f}="))) {
            return Err(arg.clone());
        }
        if wrapper == "env" && arg.contains('=') && !arg.starts_with('-') {
            i += 1;
            continue;
        }
        if arg.starts_with('-') {
            if value_flags.contains(&arg.as_str()) {
                i += 2;
                continue;
            }
            // Attached value (`--signal=TERM`, `-oL`, `--adjustment=10`).
            if value_flags
                .iter()
                .any(|f| arg.starts_with(&format!("{f}=")) || (f.len() == 2 && arg.len() > 2 && arg.starts_with(f)))
            {
                i += 1;
                continue;
            }
            // Bare switch with no value.
            i += 1;
            continue;
        }
        break;
    }
    let mut remaining = &args[i..];
    let mut skipped = 0;
    while skipped < skip_positionals && !remaining.is_empty() {
        remaining = &remaining[1..];
        skipped += 1;
    }
    Ok(remaining.to_vec())
}

/// Recognize POSIX shells, cmd.exe, and powershell/pwsh; extract the inline
/// command when present.
fn detect_shell(argv: &[String]) -> Option<(ShellKind, Option<String>)> {
    let head = basename(argv.first()?);
    let lowered = head.to_lowercase();
    if POSIX_SHELLS.contains(&lowered.as_str()) {
        let inline = argv
            .iter()
            .position(|a| a == "-c")
            .and_then(|i| argv.get(i + 1))
            .cloned();
        return Some((ShellKind::Posix, inline));
    }
    if lowered == "cmd" || lowered == "cmd.exe" {
        let inline = argv
            .iter()
            .position(|a| a.eq_ignore_ascii_case("/c"))
            .and_then(|i| argv.get(i + 1))
            .cloned();
        return Some((ShellKind::WindowsCmd, inline));
    }
    if lowered == "powershell" || lowered == "powershell.exe" || lowered == "pwsh" {
        let inline = argv
            .iter()
            .position(|a| {
                a.eq_ignore_ascii_case("-command") || a.eq_ignore_ascii_case("-c")
            })
            .and_then(|i| argv.get(i + 1))
            .cloned();
        return Some((ShellKind::PowerShell, inline));
    }
    None
}

/// Split an inline shell command on `;`, `&&`, `||`, and `|` outside
/// quotes.
pub fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                segments.push(std::mem::take(&mut current));
            }
            '&' if !in_single && !in_double && chars.peek() == Some(&'&') => {
                chars.next();
                segments.push(std::mem::take(&mut current));
            }
            '|' if !in_single && !in_double => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn segment_head(segment: &str) -> String {
    segment
        .split_whitespace()
        .find(|tok| !(tok.contains('=') && !tok.starts_with('-')))
        .map(basename)
        .unwrap_or_default()
}

fn basename(token: &str) -> String {
    token.rsplit('/').next().unwrap_or(token).to_string()
}

fn derive_allowlist_pattern(segment: &Segment) -> String {
    if segment.text.split_whitespace().count() > 1 {
        format!("{} *", segment.head)
    } else {
        segment.head.clone()
    }
}

fn default_safe_bins() -> HashSet<String> {
    [
        "ls", "cat", "echo", "pwd", "head", "tail", "wc", "grep", "rg", "find", "sed", "awk",
        "cut", "sort", "uniq", "tr", "date", "uname", "which", "printf", "stat", "file", "du",
        "df", "basename", "dirname", "true", "false",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(security: ExecSecurity, ask: ExecAsk) -> (PolicyEngine, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let allowlist = AllowlistStore::open(tmp.path(), "main").unwrap();
        (PolicyEngine::new(security, ask, allowlist), tmp)
    }

    #[tokio::test]
    async fn sudo_is_denied_as_allowlist_miss() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["sudo", "echo", "x"]), None)
            .await;
        assert!(!decision.allowed);
        assert!(!decision.analysis_ok);
        assert!(!decision.shell_wrapper_blocked);
        assert_eq!(decision.event_reason.as_deref(), Some("allowlist-miss"));
    }

    #[tokio::test]
    async fn bash_dash_c_is_shell_wrapper_blocked() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["bash", "-c", "echo x"]), None)
            .await;
        assert!(!decision.allowed);
        assert!(decision.shell_wrapper_blocked);
        assert!(!decision.windows_shell_wrapper_blocked);
        let msg = decision.error_message.unwrap();
        assert!(msg.contains("sh/bash/zsh -c"), "got: {msg}");
    }

    #[tokio::test]
    async fn shell_wrapper_allowed_with_approval() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(
                &ExecRequest::argv(&["bash", "-c", "echo x"]),
                Some(ApprovalDecision::AllowOnce),
            )
            .await;
        assert!(decision.allowed);
    }

    #[test]
    fn miss_message_names_windows_shells() {
        let decision = PolicyDecision {
            shell_wrapper_blocked: true,
            windows_shell_wrapper_blocked: true,
            ..PolicyDecision::default()
        };
        let msg = format_allowlist_miss_message(&decision);
        assert!(msg.contains("cmd.exe /c"));
        assert!(msg.contains("sh/bash/zsh -c"));
    }

    #[tokio::test]
    async fn safe_bins_pass_without_allowlist() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["echo", "hello"]), None)
            .await;
        assert!(decision.allowed);
        assert!(decision.analysis_ok);
        assert!(decision.allowlist_satisfied);
    }

    #[tokio::test]
    async fn security_deny_wins() {
        let (engine, _tmp) = engine(ExecSecurity::Deny, ExecAsk::Off);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["echo", "hi"]), None)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.event_reason.as_deref(), Some("security-deny"));
    }

    #[tokio::test]
    async fn ask_always_requires_approval() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::Always);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["echo", "hi"]), None)
            .await;
        assert!(!decision.allowed);
        assert!(decision.requires_ask);
        assert_eq!(decision.event_reason.as_deref(), Some("approval-required"));

        let approved = engine
            .evaluate(
                &ExecRequest::argv(&["echo", "hi"]),
                Some(ApprovalDecision::AllowOnce),
            )
            .await;
        assert!(approved.allowed);
    }

    #[tokio::test]
    async fn allow_always_persists_derived_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        let allowlist = AllowlistStore::open(tmp.path(), "main").unwrap();
        let engine = PolicyEngine::new(ExecSecurity::Allowlist, ExecAsk::OnMiss, allowlist.clone());

        let first = engine
            .evaluate(
                &ExecRequest::shell("cargo build --release"),
                Some(ApprovalDecision::AllowAlways),
            )
            .await;
        assert!(first.allowed);

        // The derived pattern now covers future cargo invocations.
        let second = engine
            .evaluate(&ExecRequest::shell("cargo test --all"), None)
            .await;
        assert!(second.allowed, "persisted pattern should satisfy the rerun");
    }

    #[tokio::test]
    async fn dispatch_wrappers_are_unwrapped() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(
                &ExecRequest::argv(&["env", "FOO=bar", "nice", "-n", "10", "echo", "hi"]),
                None,
            )
            .await;
        assert!(decision.allowed, "wrapped echo should be analyzed as echo");
    }

    #[tokio::test]
    async fn timeout_duration_operand_is_skipped() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["timeout", "5", "cat", "/etc/hosts"]), None)
            .await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn env_split_string_flag_aborts_analysis() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["env", "-S", "echo hi", "cat"]), None)
            .await;
        assert!(!decision.allowed);
        assert!(!decision.analysis_ok);
    }

    #[tokio::test]
    async fn nested_blocked_wrapper_is_caught() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let decision = engine
            .evaluate(&ExecRequest::argv(&["nohup", "sudo", "rm", "-rf", "/"]), None)
            .await;
        assert!(!decision.allowed);
        assert!(!decision.analysis_ok);
    }

    #[tokio::test]
    async fn shell_segments_all_must_be_satisfied() {
        let (engine, _tmp) = engine(ExecSecurity::Allowlist, ExecAsk::OnMiss);
        let good = engine
            .evaluate(&ExecRequest::shell("ls -la | grep foo && echo done"), None)
            .await;
        assert!(good.allowed);

        let bad = engine
            .evaluate(&ExecRequest::shell("ls -la && curl evil.example"), None)
            .await;
        assert!(!bad.allowed);
        assert_eq!(bad.event_reason.as_deref(), Some("allowlist-miss"));
    }

    #[tokio::test]
    async fn full_security_allows_unknown_commands() {
        let (engine, _tmp) = engine(ExecSecurity::Full, ExecAsk::Off);
        let decision = engine
            .evaluate(&ExecRequest::shell("some-unknown-binary --flag"), None)
            .await;
        assert!(decision.allowed);
    }

    #[test]
    fn split_respects_quotes() {
        let segments = split_segments(r#"echo "a;b" && grep 'x|y' file ; ls"#);
        assert_eq!(segments, vec![r#"echo "a;b""#, "grep 'x|y' file", "ls"]);
    }

    #[test]
    fn split_handles_pipes_and_ors() {
        let segments = split_segments("a | b || c");
        assert_eq!(segments, vec!["a", "b", "c"]);
    }

    #[test]
    fn segment_head_skips_assignments() {
        assert_eq!(segment_head("FOO=bar echo hi"), "echo");
        assert_eq!(segment_head("/usr/bin/grep -r x"), "grep");
    }
}
