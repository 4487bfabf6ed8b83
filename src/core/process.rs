use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;

pub type OutputHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinMode {
    /// Pipe that is closed immediately: the child sees EOF on first read.
    #[default]
    PipeClosed,
    /// Pipe kept open for the lifetime of the run.
    PipeOpen,
    Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exit,
    OverallTimeout,
    NoOutputTimeout,
    ManualCancel,
    Signal,
}

#[derive(Debug)]
pub struct RunExit {
    pub reason: ExitReason,
    pub timed_out: bool,
    pub no_output_timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Default)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Wall-clock cap for the whole run.
    pub overall_timeout: Option<Duration>,
    /// Silence window, reset by any stdout/stderr activity.
    pub no_output_timeout: Option<Duration>,
    pub stdin: StdinMode,
    pub capture_output: bool,
    pub on_stdout: Option<OutputHandler>,
    pub on_stderr: Option<OutputHandler>,
    /// Ties the run to an owner so a later run can replace it.
    pub scope_key: Option<String>,
    pub replace_existing_scope: bool,
}

impl RunRequest {
    pub fn new(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            capture_output: true,
            ..Self::default()
        }
    }
}

/// Child/PTY process lifecycle: spawn, stream, time out, cancel.
pub struct ProcessSupervisor {
    scopes: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel the run currently owning `scope_key`, if any.
    pub async fn cancel_scope(&self, scope_key: &str) -> bool {
        let scopes = self.scopes.lock().await;
        match scopes.get(scope_key) {
            Some(cancel) => {
                cancel.notify_waiters();
                true
            }
            None => false,
        }
    }

    async fn register_scope(&self, req: &RunRequest) -> Result<Option<(String, Arc<Notify>)>> {
        let Some(key) = req.scope_key.clone() else {
            return Ok(None);
        };
        let mut scopes = self.scopes.lock().await;
        if let Some(existing) = scopes.get(&key) {
            if req.replace_existing_scope {
                existing.notify_waiters();
            } else {
                return Err(anyhow!("scope '{key}' already has an active run"));
            }
        }
        let cancel = Arc::new(Notify::new());
        scopes.insert(key.clone(), cancel.clone());
        Ok(Some((key, cancel)))
    }

    async fn release_scope(&self, key: &str, cancel: &Arc<Notify>) {
        let mut scopes = self.scopes.lock().await;
        if let Some(current) = scopes.get(key) {
            if Arc::ptr_eq(current, cancel) {
                scopes.remove(key);
            }
        }
    }

    /// Run a child process to completion under the request's contracts.
    pub async fn run(&self, req: RunRequest) -> Result<RunExit> {
        let scope = self.register_scope(&req).await?;
        let result = self.run_inner(&req, scope.as_ref().map(|(_, c)| c.clone())).await;
        if let Some((key, cancel)) = scope {
            self.release_scope(&key, &cancel).await;
        }
        result
    }

    async fn run_inner(&self, req: &RunRequest, cancel: Option<Arc<Notify>>) -> Result<RunExit> {
        let program = req
            .argv
            .first()
            .ok_or_else(|| anyhow!("empty argv"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&req.argv[1..]);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &req.env {
            cmd.env(k, v);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        match req.stdin {
            StdinMode::PipeClosed | StdinMode::PipeOpen => cmd.stdin(Stdio::piped()),
            StdinMode::Inherit => cmd.stdin(Stdio::inherit()),
        };
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let stdin = child.stdin.take();
        if req.stdin == StdinMode::PipeClosed {
            drop(stdin);
        }

        let last_output = Arc::new(StdMutex::new(Instant::now()));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

        let stdout_buf = spawn_line_reader(
            child.stdout.take(),
            req.capture_output,
            req.on_stdout.clone(),
            last_output.clone(),
            done_tx.clone(),
        );
        let stderr_buf = spawn_line_reader(
            child.stderr.take(),
            req.capture_output,
            req.on_stderr.clone(),
            last_output.clone(),
            done_tx,
        );

        let started = Instant::now();
        let mut reason = ExitReason::Exit;
        let mut status = None;

        loop {
            let overall_deadline = req.overall_timeout.map(|t| started + t);
            let silence_deadline = req
                .no_output_timeout
                .map(|t| *last_output.lock().expect("last_output poisoned") + t);

            tokio::select! {
                exit = child.wait() => {
                    status = Some(exit.context("wait failed")?);
                    break;
                }
                _ = sleep_until_opt(overall_deadline) => {
                    reason = ExitReason::OverallTimeout;
                    let _ = child.start_kill();
                    status = Some(child.wait().await.context("wait after kill failed")?);
                    break;
                }
                _ = sleep_until_opt(silence_deadline) => {
                    // The deadline may have moved while we slept.
                    let fresh = *last_output.lock().expect("last_output poisoned")
                        + req.no_output_timeout.unwrap_or_default();
                    if Instant::now() < fresh {
                        continue;
                    }
                    reason = ExitReason::NoOutputTimeout;
                    let _ = child.start_kill();
                    status = Some(child.wait().await.context("wait after kill failed")?);
                    break;
                }
                _ = notified_opt(cancel.as_deref()) => {
                    reason = ExitReason::ManualCancel;
                    let _ = child.start_kill();
                    status = Some(child.wait().await.context("wait after cancel failed")?);
                    break;
                }
            }
        }

        // Drain reader tasks so late output is still captured.
        let _ = done_rx.recv().await;
        let _ = done_rx.recv().await;

        let status = status.expect("loop always sets status");
        let exit_code = status.code();
        if reason == ExitReason::Exit && exit_code.is_none() {
            reason = ExitReason::Signal;
        }
        debug!("process {:?} finished: {:?} code={:?}", req.argv, reason, exit_code);

        Ok(RunExit {
            reason,
            timed_out: reason == ExitReason::OverallTimeout,
            no_output_timed_out: reason == ExitReason::NoOutputTimeout,
            exit_code,
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
        })
    }

    /// Run a command inside a PTY. Output is a single interleaved stream.
    /// Reader and exit listeners are torn down on every path, including
    /// timeouts, so repeated PTY runs do not leak.
    pub async fn run_pty(&self, req: RunRequest) -> Result<RunExit> {
        use portable_pty::{CommandBuilder, PtySize, native_pty_system};

        let scope = self.register_scope(&req).await?;
        let cancel = scope.as_ref().map(|(_, c)| c.clone());

        let result = async {
            let program = req.argv.first().ok_or_else(|| anyhow!("empty argv"))?;
            let pty_system = native_pty_system();
            let pair = pty_system
                .openpty(PtySize {
                    rows: 24,
                    cols: 80,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| anyhow!("openpty failed: {e}"))?;

            let mut builder = CommandBuilder::new(program);
            builder.args(&req.argv[1..]);
            if let Some(cwd) = &req.cwd {
                builder.cwd(cwd);
            }
            for (k, v) in &req.env {
                builder.env(k, v);
            }

            let mut child = pair
                .slave
                .spawn_command(builder)
                .map_err(|e| anyhow!("pty spawn failed: {e}"))?;
            drop(pair.slave);

            let mut killer = child.clone_killer();
            let mut reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| anyhow!("pty reader failed: {e}"))?;
            let master = pair.master;

            let last_output = Arc::new(StdMutex::new(Instant::now()));
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
            let reader_last = last_output.clone();
            let reader_task = tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match std::io::Read::read(&mut reader, &mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            *reader_last.lock().expect("last_output poisoned") = Instant::now();
                            let text = String::from_utf8_lossy(&buf[..n]).to_string();
                            if chunk_tx.blocking_send(text).is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let (exit_tx, mut exit_rx) = mpsc::channel::<Option<i32>>(1);
            let wait_task = tokio::task::spawn_blocking(move || {
                let code = child.wait().ok().map(|s| s.exit_code() as i32);
                let _ = exit_tx.blocking_send(code);
            });

            let started = Instant::now();
            let mut output = String::new();
            let mut reason = ExitReason::Exit;
            let mut exit_code = None;

            loop {
                let overall_deadline = req.overall_timeout.map(|t| started + t);
                let silence_deadline = req
                    .no_output_timeout
                    .map(|t| *last_output.lock().expect("last_output poisoned") + t);

                tokio::select! {
                    chunk = chunk_rx.recv() => {
                        match chunk {
                            Some(text) => {
                                if let Some(handler) = &req.on_stdout {
                                    handler(&text);
                                }
                                if req.capture_output {
                                    output.push_str(&text);
                                }
                            }
                            None => {
                                // Reader hit EOF; the child is gone or going.
                                exit_code = exit_rx.recv().await.flatten();
                                break;
                            }
                        }
                    }
                    code = exit_rx.recv() => {
                        exit_code = code.flatten();
                        break;
                    }
                    _ = sleep_until_opt(overall_deadline) => {
                        reason = ExitReason::OverallTimeout;
                        let _ = killer.kill();
                        break;
                    }
                    _ = sleep_until_opt(silence_deadline) => {
                        let fresh = *last_output.lock().expect("last_output poisoned")
                            + req.no_output_timeout.unwrap_or_default();
                        if Instant::now() < fresh {
                            continue;
                        }
                        reason = ExitReason::NoOutputTimeout;
                        let _ = killer.kill();
                        break;
                    }
                    _ = notified_opt(cancel.as_deref()) => {
                        reason = ExitReason::ManualCancel;
                        let _ = killer.kill();
                        break;
                    }
                }
            }

            // Tear down listeners on every path: dropping the master closes
            // the reader side; aborting the blocking tasks releases their
            // threads once the fds are gone.
            drop(master);
            while let Ok(chunk) = chunk_rx.try_recv() {
                if req.capture_output {
                    output.push_str(&chunk);
                }
            }
            reader_task.abort();
            wait_task.abort();

            Ok(RunExit {
                reason,
                timed_out: reason == ExitReason::OverallTimeout,
                no_output_timed_out: reason == ExitReason::NoOutputTimeout,
                exit_code,
                stdout: output,
                stderr: String::new(),
            })
        }
        .await;

        if let Some((key, cancel)) = scope {
            self.release_scope(&key, &cancel).await;
        }
        result
    }
}

fn spawn_line_reader<R>(
    stream: Option<R>,
    capture: bool,
    handler: Option<OutputHandler>,
    last_output: Arc<StdMutex<Instant>>,
    done: mpsc::Sender<()>,
) -> Arc<StdMutex<String>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(StdMutex::new(String::new()));
    let out = buffer.clone();
    tokio::spawn(async move {
        if let Some(stream) = stream {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                *last_output.lock().expect("last_output poisoned") = Instant::now();
                if let Some(handler) = &handler {
                    handler(&line);
                }
                if capture {
                    let mut buf = out.lock().expect("output buffer poisoned");
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
        }
        let _ = done.send(()).await;
    });
    buffer
}

fn take_buffer(buf: &Arc<StdMutex<String>>) -> String {
    std::mem::take(&mut *buf.lock().expect("output buffer poisoned"))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn notified_opt(cancel: Option<&Notify>) {
    match cancel {
        Some(cancel) => cancel.notified().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let sup = ProcessSupervisor::new();
        let exit = sup
            .run(RunRequest::new(&["sh", "-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(exit.reason, ExitReason::Exit);
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.stdout.trim(), "hello");
        assert!(!exit.timed_out);
    }

    #[tokio::test]
    async fn overall_timeout_kills_the_child() {
        let sup = ProcessSupervisor::new();
        let mut req = RunRequest::new(&["sh", "-c", "sleep 5"]);
        req.overall_timeout = Some(Duration::from_millis(50));
        let exit = sup.run(req).await.unwrap();
        assert_eq!(exit.reason, ExitReason::OverallTimeout);
        assert!(exit.timed_out);
        assert!(!exit.no_output_timed_out);
    }

    #[tokio::test]
    async fn no_output_timeout_fires_on_silence() {
        let sup = ProcessSupervisor::new();
        let mut req = RunRequest::new(&["sh", "-c", "sleep 5"]);
        req.no_output_timeout = Some(Duration::from_millis(50));
        let exit = sup.run(req).await.unwrap();
        assert_eq!(exit.reason, ExitReason::NoOutputTimeout);
        assert!(exit.no_output_timed_out);
        assert!(!exit.timed_out);
    }

    #[tokio::test]
    async fn output_resets_the_silence_window() {
        let sup = ProcessSupervisor::new();
        let mut req = RunRequest::new(&[
            "sh",
            "-c",
            "for i in 1 2 3 4; do echo tick; sleep 0.05; done",
        ]);
        req.no_output_timeout = Some(Duration::from_millis(150));
        let exit = sup.run(req).await.unwrap();
        assert_eq!(exit.reason, ExitReason::Exit, "steady output must not trip");
        assert_eq!(exit.stdout.matches("tick").count(), 4);
    }

    #[tokio::test]
    async fn replace_existing_scope_cancels_prior_run() {
        let sup = Arc::new(ProcessSupervisor::new());

        let mut first = RunRequest::new(&["sh", "-c", "sleep 5"]);
        first.scope_key = Some("owner".to_string());
        let sup_first = sup.clone();
        let first_task = tokio::spawn(async move { sup_first.run(first).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = RunRequest::new(&["sh", "-c", "echo second"]);
        second.scope_key = Some("owner".to_string());
        second.replace_existing_scope = true;
        let second_exit = sup.run(second).await.unwrap();
        assert_eq!(second_exit.reason, ExitReason::Exit);

        let first_exit = first_task.await.unwrap().unwrap();
        assert_eq!(first_exit.reason, ExitReason::ManualCancel);
    }

    #[tokio::test]
    async fn scope_without_replace_rejects_second_run() {
        let sup = Arc::new(ProcessSupervisor::new());
        let mut first = RunRequest::new(&["sh", "-c", "sleep 2"]);
        first.scope_key = Some("solo".to_string());
        let sup_first = sup.clone();
        let first_task = tokio::spawn(async move { sup_first.run(first).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = RunRequest::new(&["sh", "-c", "echo nope"]);
        second.scope_key = Some("solo".to_string());
        assert!(sup.run(second).await.is_err());

        sup.cancel_scope("solo").await;
        let first_exit = first_task.await.unwrap().unwrap();
        assert_eq!(first_exit.reason, ExitReason::ManualCancel);
    }

    #[tokio::test]
    async fn on_stdout_handler_sees_lines() {
        let sup = ProcessSupervisor::new();
        let seen = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let mut req = RunRequest::new(&["sh", "-c", "echo one; echo two"]);
        req.on_stdout = Some(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        }));
        sup.run(req).await.unwrap();
        let lines = seen.lock().unwrap().clone();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn pty_run_captures_output() {
        let sup = ProcessSupervisor::new();
        let mut req = RunRequest::new(&["sh", "-c", "echo pty-works"]);
        req.overall_timeout = Some(Duration::from_secs(5));
        let exit = sup.run_pty(req).await.unwrap();
        assert!(exit.stdout.contains("pty-works"), "got: {}", exit.stdout);
    }

    #[tokio::test]
    async fn pty_overall_timeout() {
        let sup = ProcessSupervisor::new();
        let mut req = RunRequest::new(&["sh", "-c", "sleep 5"]);
        req.overall_timeout = Some(Duration::from_millis(100));
        let exit = sup.run_pty(req).await.unwrap();
        assert_eq!(exit.reason, ExitReason::OverallTimeout);
    }
}
