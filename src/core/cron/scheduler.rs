use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::TimeZone;
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::{info, warn};

use super::{CronEvent, CronFile, CronJob, CronSchedule};
use crate::core::now_ms;
use crate::core::store::JsonStore;

/// Executes a job body. The scheduler never holds its lock across this
/// call, so `list`/`status` stay responsive during long runs.
#[async_trait]
pub trait CronExecutor: Send + Sync {
    async fn execute(&self, job: &CronJob) -> Result<CronRunOutcome>;
}

#[derive(Debug, Default)]
pub struct CronRunOutcome {
    pub delivery_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Due,
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ran: bool,
    pub reason: Option<String>,
}

impl RunSummary {
    fn skipped(reason: &str) -> Self {
        Self {
            ran: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Single-writer scheduler over a per-agent job store.
///
/// All store mutations happen under the cron lock; job bodies run outside
/// it. A reserved run is marked with `runningAtMs` before the lock is
/// released, which is what makes concurrent `run` calls single-fire and
/// lets a restart detect runs that died mid-flight.
pub struct CronScheduler {
    store: Arc<JsonStore<CronFile>>,
    lock: Mutex<()>,
    events: broadcast::Sender<CronEvent>,
    rearm: Notify,
    skip_once: StdMutex<HashSet<String>>,
    executor: Arc<dyn CronExecutor>,
}

impl CronScheduler {
    pub fn new(store: Arc<JsonStore<CronFile>>, executor: Arc<dyn CronExecutor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            lock: Mutex::new(()),
            events,
            rearm: Notify::new(),
            skip_once: StdMutex::new(HashSet::new()),
            executor,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CronEvent) {
        let _ = self.events.send(event);
    }

    /// Startup: clear stale running markers, replay missed runs (skipping
    /// the stale ones once), reload, recompute, and arm the timer loop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.store.reload().await?;
        let stale = self.clear_stale_markers().await?;
        if !stale.is_empty() {
            info!("[cron] cleared {} stale running marker(s)", stale.len());
        }
        self.run_missed_jobs().await?;
        {
            let _guard = self.lock.lock().await;
            self.store.reload().await?;
            let now = now_ms();
            self.store
                .mutate(|file| recompute_next_runs(file, now))
                .await?;
        }
        let me = self.clone();
        tokio::spawn(async move { me.run_loop().await });
        Ok(())
    }

    async fn clear_stale_markers(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        self.store
            .mutate(|file| {
                let mut cleared = Vec::new();
                for job in &mut file.jobs {
                    if job.state.running_at_ms.is_some() {
                        job.state.running_at_ms = None;
                        cleared.push(job.id.clone());
                    }
                }
                cleared
            })
            .await
            .inspect(|cleared| {
                let mut skip = self.skip_once.lock().expect("skip set poisoned");
                for id in cleared {
                    skip.insert(id.clone());
                }
            })
    }

    /// Fire any job whose slot was missed while the process was down.
    pub async fn run_missed_jobs(&self) -> Result<()> {
        let now = now_ms();
        let due: Vec<String> = {
            let snapshot = self.store.get();
            let mut skip = self.skip_once.lock().expect("skip set poisoned");
            snapshot
                .jobs
                .iter()
                .filter(|j| j.enabled && j.state.running_at_ms.is_none())
                .filter(|j| j.state.next_run_at_ms.map(|n| n <= now).unwrap_or(false))
                .filter(|j| !skip.remove(&j.id))
                .map(|j| j.id.clone())
                .collect()
        };
        for id in due {
            info!("[cron] replaying missed job {id}");
            if let Err(e) = self.run(&id, RunMode::Due).await {
                warn!("[cron] missed-run replay for {id} failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn add(&self, mut job: CronJob) -> Result<CronJob> {
        let _guard = self.lock.lock().await;
        let now = now_ms();
        job.created_at_ms = now;
        job.updated_at_ms = now;
        job.state.next_run_at_ms = if job.enabled {
            compute_next_run_at_ms(&job.schedule, now)
        } else {
            None
        };
        let stored = job.clone();
        self.store.mutate(move |file| file.jobs.push(stored)).await?;
        self.emit(CronEvent::Added {
            job_id: job.id.clone(),
            next_run_at_ms: job.state.next_run_at_ms,
        });
        self.rearm.notify_waiters();
        Ok(job)
    }

    pub async fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut CronJob) + Send,
    ) -> Result<Option<CronJob>> {
        let _guard = self.lock.lock().await;
        let now = now_ms();
        let updated = self
            .store
            .mutate(|file| {
                let job = file.jobs.iter_mut().find(|j| j.id == id)?;
                apply(job);
                job.updated_at_ms = now;
                if job.enabled {
                    job.state.next_run_at_ms = compute_next_run_at_ms(&job.schedule, now);
                } else {
                    job.state.next_run_at_ms = None;
                    job.state.running_at_ms = None;
                }
                Some(job.clone())
            })
            .await?;
        if let Some(job) = &updated {
            self.emit(CronEvent::Updated {
                job_id: job.id.clone(),
                next_run_at_ms: job.state.next_run_at_ms,
            });
            self.rearm.notify_waiters();
        }
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let removed = self
            .store
            .mutate(|file| {
                let before = file.jobs.len();
                file.jobs.retain(|j| j.id != id);
                file.jobs.len() != before
            })
            .await?;
        if removed {
            self.emit(CronEvent::Removed {
                job_id: id.to_string(),
            });
            self.rearm.notify_waiters();
        }
        Ok(removed)
    }

    /// Read-side listing. Past-due slots are shown as-is; this never
    /// advances them.
    pub async fn list(&self) -> Vec<CronJob> {
        let _guard = self.lock.lock().await;
        let mut snapshot = (*self.store.get()).clone();
        recompute_next_runs_for_maintenance(&mut snapshot, now_ms());
        snapshot.jobs
    }

    pub async fn status(&self, id: &str) -> Option<CronJob> {
        let _guard = self.lock.lock().await;
        self.store.get().jobs.iter().find(|j| j.id == id).cloned()
    }

    /// Execute one job. Reserves the slot under the lock, runs the body
    /// outside it, then applies the result. Concurrent calls on the same
    /// job yield exactly one execution.
    pub async fn run(&self, id: &str, mode: RunMode) -> Result<RunSummary> {
        let reserved_at = now_ms();
        let reserved: Option<CronJob> = {
            let _guard = self.lock.lock().await;
            let mut reserved = None;
            let summary = self
                .store
                .mutate(|file| {
                    let Some(job) = file.jobs.iter_mut().find(|j| j.id == id) else {
                        return RunSummary::skipped("not-found");
                    };
                    if job.state.running_at_ms.is_some() {
                        return RunSummary::skipped("already-running");
                    }
                    if !job.enabled && mode != RunMode::Force {
                        return RunSummary::skipped("disabled");
                    }
                    let due = job
                        .state
                        .next_run_at_ms
                        .map(|n| n <= reserved_at)
                        .unwrap_or(false);
                    if !due && mode != RunMode::Force {
                        return RunSummary::skipped("not-due");
                    }
                    job.state.running_at_ms = Some(reserved_at);
                    reserved = Some(job.clone());
                    RunSummary {
                        ran: true,
                        reason: None,
                    }
                })
                .await?;
            if !summary.ran {
                return Ok(summary);
            }
            reserved
        };

        let job = reserved.expect("reserved job present when summary.ran");
        self.emit(CronEvent::Started {
            job_id: job.id.clone(),
        });

        let started = Instant::now();
        let outcome = self.executor.execute(&job).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let next_run = {
            let _guard = self.lock.lock().await;
            let one_shot = matches!(job.schedule, CronSchedule::At { .. });
            self.store
                .mutate(|file| {
                    let Some(stored) = file.jobs.iter_mut().find(|j| j.id == id) else {
                        return None;
                    };
                    stored.state.running_at_ms = None;
                    stored.state.last_run_at_ms = Some(reserved_at);
                    stored.state.last_duration_ms = Some(duration_ms);
                    match &outcome {
                        Ok(result) => {
                            stored.state.last_error = None;
                            stored.state.last_delivery_status = result.delivery_status.clone();
                        }
                        Err(e) => {
                            stored.state.last_error = Some(e.to_string());
                        }
                    }
                    if one_shot {
                        let id = stored.id.clone();
                        file.jobs.retain(|j| j.id != id);
                        None
                    } else {
                        stored.state.next_run_at_ms =
                            compute_next_run_after_ms(&stored.schedule, reserved_at);
                        stored.state.next_run_at_ms
                    }
                })
                .await?
        };

        self.emit(CronEvent::Finished {
            job_id: job.id.clone(),
            next_run_at_ms: next_run,
        });
        self.rearm.notify_waiters();
        Ok(RunSummary {
            ran: true,
            reason: None,
        })
    }

    /// Timer loop: wake at the earliest `nextRunAtMs`, fire due jobs, and
    /// rearm. External store edits become visible through the reload at the
    /// top of each pass.
    async fn run_loop(self: Arc<Self>) {
        loop {
            let earliest = {
                let _guard = self.lock.lock().await;
                if let Err(e) = self.store.reload().await {
                    warn!("[cron] store reload failed: {e}");
                }
                let now = now_ms();
                if let Err(e) = self
                    .store
                    .mutate(|file| recompute_next_runs(file, now))
                    .await
                {
                    warn!("[cron] recompute failed: {e}");
                }
                self.store
                    .get()
                    .jobs
                    .iter()
                    .filter(|j| j.enabled && j.state.running_at_ms.is_none())
                    .filter_map(|j| j.state.next_run_at_ms)
                    .min()
            };

            let now = now_ms();
            match earliest {
                Some(at) if at <= now => {
                    let due: Vec<String> = self
                        .store
                        .get()
                        .jobs
                        .iter()
                        .filter(|j| j.enabled && j.state.running_at_ms.is_none())
                        .filter(|j| j.state.next_run_at_ms.map(|n| n <= now).unwrap_or(false))
                        .map(|j| j.id.clone())
                        .collect();
                    for id in due {
                        if let Err(e) = self.run(&id, RunMode::Due).await {
                            warn!("[cron] scheduled run of {id} failed: {e}");
                        }
                    }
                }
                Some(at) => {
                    let wait = Duration::from_millis(at - now);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.rearm.notified() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                        _ = self.rearm.notified() => {}
                    }
                }
            }
        }
    }
}

/// Earliest fire time at or after `now_ms`, or `None` for schedules with
/// nothing left to do.
pub fn compute_next_run_at_ms(schedule: &CronSchedule, now_ms: u64) -> Option<u64> {
    match schedule {
        CronSchedule::Every { every_ms, anchor_ms } => {
            let every = (*every_ms).max(1);
            if now_ms <= *anchor_ms {
                Some(*anchor_ms)
            } else {
                let elapsed = now_ms - anchor_ms;
                let k = elapsed.div_ceil(every);
                Some(anchor_ms + k * every)
            }
        }
        CronSchedule::Cron { expr, tz } => next_cron_tick(expr, tz.as_deref(), now_ms, false),
        CronSchedule::At { at_ms } => (*at_ms > now_ms).then_some(*at_ms),
    }
}

/// Earliest fire time strictly after `after_ms`. Used when applying a run
/// result so the executed slot is not handed back.
pub fn compute_next_run_after_ms(schedule: &CronSchedule, after_ms: u64) -> Option<u64> {
    match schedule {
        CronSchedule::Every { every_ms, anchor_ms } => {
            let every = (*every_ms).max(1);
            if after_ms < *anchor_ms {
                Some(*anchor_ms)
            } else {
                let elapsed = after_ms - anchor_ms;
                let k = elapsed / every + 1;
                Some(anchor_ms + k * every)
            }
        }
        CronSchedule::Cron { expr, tz } => next_cron_tick(expr, tz.as_deref(), after_ms, true),
        CronSchedule::At { .. } => None,
    }
}

/// Parse a 5/6-field cron expression (normalized to the 7-field form the
/// `cron` crate expects) and return the next tick in `tz`.
fn next_cron_tick(expr: &str, tz: Option<&str>, from_ms: u64, exclusive: bool) -> Option<u64> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let seven_field = match fields {
        5 => format!("0 {trimmed} *"),
        6 => format!("{trimmed} *"),
        _ => trimmed.to_string(),
    };
    let schedule = match seven_field.parse::<cron::Schedule>() {
        Ok(s) => s,
        Err(e) => {
            warn!("[cron] failed to parse expression '{expr}': {e}");
            return None;
        }
    };

    let from_ms = if exclusive { from_ms } else { from_ms.saturating_sub(1) };
    match tz {
        Some(name) => {
            let zone: chrono_tz::Tz = match name.parse() {
                Ok(z) => z,
                Err(_) => {
                    warn!("[cron] unknown timezone '{name}', falling back to UTC");
                    return next_cron_tick(expr, None, from_ms, true);
                }
            };
            let from = zone.timestamp_millis_opt(from_ms as i64).single()?;
            schedule
                .after(&from)
                .next()
                .map(|t| t.timestamp_millis() as u64)
        }
        None => {
            let from = chrono::Utc.timestamp_millis_opt(from_ms as i64).single()?;
            schedule
                .after(&from)
                .next()
                .map(|t| t.timestamp_millis() as u64)
        }
    }
}

/// Recompute `nextRunAtMs` for all enabled jobs.
///
/// A past-due slot is preserved when the job has never executed for it
/// (`lastRunAtMs < nextRunAtMs`, `runningAtMs` unset). Advancing such a
/// slot here would race the missed-run replay out of its work.
pub fn recompute_next_runs(file: &mut CronFile, now_ms: u64) {
    for job in &mut file.jobs {
        if !job.enabled {
            job.state.next_run_at_ms = None;
            job.state.running_at_ms = None;
            continue;
        }
        if let Some(next) = job.state.next_run_at_ms {
            let unexecuted = job
                .state
                .last_run_at_ms
                .map(|last| last < next)
                .unwrap_or(true);
            if next <= now_ms && unexecuted && job.state.running_at_ms.is_none() {
                continue;
            }
        }
        job.state.next_run_at_ms = compute_next_run_at_ms(&job.schedule, now_ms);
    }
}

/// Read-side variant: fills in missing slots but never advances a past-due
/// one.
pub fn recompute_next_runs_for_maintenance(file: &mut CronFile, now_ms: u64) {
    for job in &mut file.jobs {
        if !job.enabled {
            job.state.next_run_at_ms = None;
            continue;
        }
        if let Some(next) = job.state.next_run_at_ms {
            if next <= now_ms {
                continue;
            }
        }
        if job.state.next_run_at_ms.is_none() {
            job.state.next_run_at_ms = compute_next_run_at_ms(&job.schedule, now_ms);
        }
    }
}
