mod daemon;
mod doctor;
pub mod output;

use std::path::Path;

use anyhow::{Result, anyhow};
use console::style;

use crate::core::cron::{CronJob, CronSchedule, RunMode};
use crate::core::session::SessionKey;
use crate::core::statedir::resolve_state_dir;
use output::{Section, print_banner, print_error, print_info, print_success};

pub use daemon::{DEFAULT_AGENT_ID, build_app, run_daemon};

/// Misuse (unknown command, bad flags) maps to exit code 2.
#[derive(Debug)]
pub struct Misuse(pub String);

impl std::fmt::Display for Misuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Misuse {}

fn misuse(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Misuse(message.into()))
}

fn print_help() {
    print_banner();
    Section::new("Core")
        .command("onboard", "Create the state dir and a default config")
        .command("agent", "Run a single agent turn")
        .command("send", "Send a message on a channel")
        .print();
    Section::new("Management")
        .command("gateway", "Manage the daemon (start|stop|restart|status)")
        .command("cron", "Manage scheduled jobs")
        .command("pairing", "List or approve pairing requests")
        .command("models", "List or set models")
        .print();
    Section::new("Diagnostics")
        .command("doctor", "Check state dir, config, and daemon health")
        .print();
    println!(
        "\n {} {} <command> [args]\n",
        style("Usage:").bold(),
        style("clawdbot").green()
    );
}

/// Rewrite an invocation to include `--profile <name>` from
/// `CLAWDBOT_PROFILE`, unless the user already passed `--profile` or
/// `--dev`.
pub fn transform_profile_args(
    args: Vec<String>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Vec<String> {
    let Some(profile) = env("CLAWDBOT_PROFILE").filter(|p| !p.trim().is_empty()) else {
        return args;
    };
    if args.iter().any(|a| a == "--profile" || a == "--dev") {
        return args;
    }
    let mut out = Vec::with_capacity(args.len() + 2);
    let mut iter = args.into_iter();
    if let Some(program) = iter.next() {
        out.push(program);
    }
    out.push("--profile".to_string());
    out.push(profile);
    out.extend(iter);
    out
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

pub async fn run_main() -> Result<()> {
    let raw: Vec<String> = std::env::args().collect();
    let mut args = transform_profile_args(raw, &|name| std::env::var(name).ok());

    // The profile only scopes the state dir; strip it before dispatch.
    let profile = flag_value(&args, "--profile");
    if let Some(i) = args.iter().position(|a| a == "--profile") {
        args.drain(i..=(i + 1).min(args.len() - 1));
    }

    let state_dir = match profile {
        Some(profile) => {
            let base = resolve_state_dir()?;
            let dir = base.join("profiles").join(profile);
            crate::core::statedir::ensure_private_dir(&dir)?;
            dir
        }
        None => resolve_state_dir()?,
    };

    match args.get(1).map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some("onboard") => onboard(&state_dir).await,
        Some("gateway") => match args.get(2).map(String::as_str) {
            Some("start") | None => daemon::gateway_start(&state_dir).await,
            Some("stop") => daemon::gateway_stop(&state_dir).await,
            Some("restart") => daemon::gateway_restart(&state_dir).await,
            Some("status") => daemon::gateway_status(&state_dir).await,
            Some(other) => Err(misuse(format!("unknown gateway subcommand '{other}'"))),
        },
        Some("daemon-run") => daemon::run_daemon(&state_dir).await,
        Some("agent") => agent_cmd(&state_dir, &args).await,
        Some("send") => send_cmd(&state_dir, &args).await,
        Some("pairing") => pairing_cmd(&state_dir, &args).await,
        Some("cron") => cron_cmd(&state_dir, &args).await,
        Some("models") => models_cmd(&state_dir, &args).await,
        Some("hooks") => hooks_cmd(&state_dir, &args).await,
        Some("doctor") => doctor::run(&state_dir),
        Some(other) => Err(misuse(format!("unknown command '{other}'"))),
    }
}

async fn onboard(state_dir: &Path) -> Result<()> {
    let app = daemon::build_app(state_dir).await?;
    let config = app.config.get();
    Section::new("Onboarded")
        .status("State dir", &state_dir.display().to_string())
        .status(
            "Gateway token",
            config.gateway.auth.token.as_deref().unwrap_or("<missing>"),
        )
        .blank()
        .info("Start the daemon with 'clawdbot gateway start'.")
        .print();
    Ok(())
}

async fn agent_cmd(state_dir: &Path, args: &[String]) -> Result<()> {
    let message = flag_value(args, "--message")
        .or_else(|| flag_value(args, "-m"))
        .ok_or_else(|| misuse("agent needs --message <text>"))?;
    let key = flag_value(args, "--session")
        .map(|k| SessionKey::named(&k))
        .unwrap_or_else(|| SessionKey::main(DEFAULT_AGENT_ID));

    let app = daemon::build_app(state_dir).await?;
    let turn = app.dispatcher.prepare(&key, &message, None).await?;
    let report = app.dispatcher.run_and_wait(turn).await?;
    match report.error {
        Some(error) => {
            print_error(&error);
            Err(anyhow!("{error}"))
        }
        None => {
            println!("{}", report.final_text);
            Ok(())
        }
    }
}

async fn send_cmd(state_dir: &Path, args: &[String]) -> Result<()> {
    let channel = flag_value(args, "--channel").ok_or_else(|| misuse("send needs --channel"))?;
    let to = flag_value(args, "--to").ok_or_else(|| misuse("send needs --to"))?;
    let text = flag_value(args, "--text").ok_or_else(|| misuse("send needs --text"))?;

    let app = daemon::build_app(state_dir).await?;
    let key = SessionKey::main(DEFAULT_AGENT_ID);
    app.sessions.get_or_create(&key).await?;
    let sent = app
        .delivery
        .deliver(
            &key,
            &channel,
            &to,
            vec![crate::core::delivery::ReplyPayload::text(&text)],
            None,
        )
        .await?;
    print_success(&format!("Sent {sent} message(s) on {channel}."));
    Ok(())
}

async fn pairing_cmd(state_dir: &Path, args: &[String]) -> Result<()> {
    let app = daemon::build_app(state_dir).await?;
    match args.get(2).map(String::as_str) {
        Some("list") | None => {
            let pending = app.pairing.pending();
            if pending.is_empty() {
                print_info("No pending pairing requests.");
                return Ok(());
            }
            let mut section = Section::new("Pending Pairings");
            for request in pending {
                section = section.status(
                    &request.code,
                    &format!("{}:{}", request.channel, request.sender_id),
                );
            }
            section.print();
            Ok(())
        }
        Some("approve") => {
            let provider =
                flag_value(args, "--provider").ok_or_else(|| misuse("approve needs --provider"))?;
            let code = args
                .iter()
                .skip(3)
                .find(|a| !a.starts_with("--") && Some(a.as_str()) != Some(provider.as_str()))
                .ok_or_else(|| misuse("approve needs the pairing code"))?;
            match app.pairing.approve(&provider, code).await? {
                Some(peer) => {
                    print_success(&format!(
                        "Approved {}:{} for direct messages.",
                        peer.channel, peer.sender_id
                    ));
                    Ok(())
                }
                None => Err(anyhow!("no pending pairing with that code")),
            }
        }
        Some(other) => Err(misuse(format!("unknown pairing subcommand '{other}'"))),
    }
}

async fn cron_cmd(state_dir: &Path, args: &[String]) -> Result<()> {
    let app = daemon::build_app(state_dir).await?;
    match args.get(2).map(String::as_str) {
        Some("list") | None => {
            let jobs = app.cron.list().await;
            if jobs.is_empty() {
                print_info("No cron jobs.");
                return Ok(());
            }
            let mut section = Section::new("Cron Jobs");
            for job in jobs {
                let next = job
                    .state
                    .next_run_at_ms
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                section = section.status(
                    &job.name,
                    &format!(
                        "id={} enabled={} next={next}",
                        &job.id[..8.min(job.id.len())],
                        job.enabled
                    ),
                );
            }
            section.print();
            Ok(())
        }
        Some("add") => {
            let name = flag_value(args, "--name").ok_or_else(|| misuse("cron add needs --name"))?;
            let message =
                flag_value(args, "--message").ok_or_else(|| misuse("cron add needs --message"))?;
            let schedule = parse_schedule_flags(args)?;
            let job = app.cron.add(CronJob::new(&name, schedule, &message)).await?;
            print_success(&format!("Added job '{}' ({})", job.name, job.id));
            Ok(())
        }
        Some("rm") => {
            let id = args.get(3).ok_or_else(|| misuse("cron rm needs a job id"))?;
            if app.cron.remove(id).await? {
                print_success("Removed.");
                Ok(())
            } else {
                Err(anyhow!("no job with id {id}"))
            }
        }
        Some("run") => {
            let id = args.get(3).ok_or_else(|| misuse("cron run needs a job id"))?;
            let mode = if args.iter().any(|a| a == "--force") {
                RunMode::Force
            } else {
                RunMode::Due
            };
            let summary = app.cron.run(id, mode).await?;
            if summary.ran {
                print_success("Job executed.");
            } else {
                print_info(&format!(
                    "Not run: {}",
                    summary.reason.as_deref().unwrap_or("unknown")
                ));
            }
            Ok(())
        }
        Some(toggle @ ("enable" | "disable")) => {
            let id = args.get(3).ok_or_else(|| misuse("cron enable/disable needs a job id"))?;
            let enabled = toggle == "enable";
            match app.cron.update(id, |job| job.enabled = enabled).await? {
                Some(job) => {
                    print_success(&format!("Job '{}' enabled={}", job.name, job.enabled));
                    Ok(())
                }
                None => Err(anyhow!("no job with id {id}")),
            }
        }
        Some(other) => Err(misuse(format!("unknown cron subcommand '{other}'"))),
    }
}

fn parse_schedule_flags(args: &[String]) -> Result<CronSchedule> {
    if let Some(every) = flag_value(args, "--every-ms") {
        let every_ms: u64 = every
            .parse()
            .map_err(|_| misuse("--every-ms must be a number"))?;
        let anchor_ms = flag_value(args, "--anchor-ms")
            .and_then(|a| a.parse().ok())
            .unwrap_or_else(crate::core::now_ms);
        return Ok(CronSchedule::Every { every_ms, anchor_ms });
    }
    if let Some(expr) = flag_value(args, "--cron") {
        return Ok(CronSchedule::Cron {
            expr,
            tz: flag_value(args, "--tz"),
        });
    }
    if let Some(at) = flag_value(args, "--at-ms") {
        let at_ms: u64 = at.parse().map_err(|_| misuse("--at-ms must be a number"))?;
        return Ok(CronSchedule::At { at_ms });
    }
    Err(misuse(
        "cron add needs one of --every-ms, --cron, or --at-ms",
    ))
}

async fn hooks_cmd(state_dir: &Path, args: &[String]) -> Result<()> {
    if args.get(2).map(String::as_str) != Some("gmail") {
        return Err(misuse("usage: clawdbot hooks gmail setup|run"));
    }
    let app = daemon::build_app(state_dir).await?;
    match args.get(3).map(String::as_str) {
        Some("setup") => {
            let account =
                flag_value(args, "--account").ok_or_else(|| misuse("setup needs --account"))?;
            app.config
                .mutate(move |config| {
                    config.hooks.enabled = true;
                    config.hooks.gmail.account = Some(account);
                })
                .await?;
            print_success("Gmail hook configured.");
            Ok(())
        }
        Some("run") => {
            let account = app
                .config
                .get()
                .hooks
                .gmail
                .account
                .clone()
                .ok_or_else(|| anyhow!("no gmail account configured; run setup first"))?;
            let key = SessionKey::named(&format!("agent:{DEFAULT_AGENT_ID}:hook:gmail"));
            let turn = app
                .dispatcher
                .prepare(
                    &key,
                    &format!("Check the {account} inbox and summarize anything new."),
                    None,
                )
                .await?;
            let report = app.dispatcher.run_and_wait(turn).await?;
            match report.error {
                Some(error) => Err(anyhow!("{error}")),
                None => {
                    println!("{}", report.final_text);
                    Ok(())
                }
            }
        }
        _ => Err(misuse("usage: clawdbot hooks gmail setup|run")),
    }
}

async fn models_cmd(state_dir: &Path, args: &[String]) -> Result<()> {
    let app = daemon::build_app(state_dir).await?;
    match args.get(2).map(String::as_str) {
        Some("scan") => {
            let auth = crate::core::agent::auth::AuthRotator::open(state_dir)?;
            let mut section = Section::new("Models With Ready Credentials");
            let mut any = false;
            for model in app.registry.list() {
                let profiles = auth.profile_order(&model.provider, None, &[]);
                if !profiles.is_empty() {
                    any = true;
                    section = section.status(
                        &model.id,
                        &format!("{} ({} profile(s))", model.provider, profiles.len()),
                    );
                }
            }
            if any {
                section.print();
            } else {
                print_info("No models have ready credentials; add an auth profile first.");
            }
            Ok(())
        }
        Some("list") | None => {
            let primary = app.config.get().agent.model.primary.clone();
            let mut section = Section::new("Models");
            for model in app.registry.list() {
                let marker = if primary.as_deref() == Some(model.id.as_str()) {
                    " (primary)"
                } else {
                    ""
                };
                section = section.status(&model.id, &format!("{}{marker}", model.provider));
            }
            section.print();
            Ok(())
        }
        Some("set") => {
            let model = args
                .get(3)
                .ok_or_else(|| misuse("models set needs a model id"))?
                .clone();
            if app.registry.resolve(&model).is_none() {
                return Err(anyhow!("unknown-model: {model}"));
            }
            app.config
                .mutate(move |config| config.agent.model.primary = Some(model))
                .await?;
            print_success("Primary model updated.");
            Ok(())
        }
        Some(other) => Err(misuse(format!("unknown models subcommand '{other}'"))),
    }
}
