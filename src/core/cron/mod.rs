pub mod scheduler;

use serde::{Deserialize, Serialize};

pub use scheduler::{CronExecutor, CronRunOutcome, CronScheduler, RunMode, RunSummary};

/// A scheduled job. `state` is runtime bookkeeping the scheduler owns;
/// everything else is operator-supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub schedule: CronSchedule,
    pub session_target: SessionTarget,
    pub payload: CronPayload,
    pub delivery: CronDelivery,
    #[serde(default)]
    pub state: CronJobState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    /// Fixed interval anchored at a point in time; fires at
    /// `anchorMs + k * everyMs`.
    #[serde(rename_all = "camelCase")]
    Every { every_ms: u64, anchor_ms: u64 },
    /// Cron expression evaluated in `tz` (UTC when unset).
    Cron { expr: String, tz: Option<String> },
    /// One-shot; the job is deleted after it runs.
    #[serde(rename_all = "camelCase")]
    At { at_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionTarget {
    Main,
    Isolated,
    Named { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronPayload {
    AgentTurn { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CronDeliveryMode {
    #[default]
    Silent,
    Announce,
    Direct,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronDelivery {
    pub mode: CronDeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<u64>,
    /// Set only while a run is reserved; cleared when its result is applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_delivery_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<u64>,
}

/// On-disk shape of `cron/<agentId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronFile {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for CronFile {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronEvent {
    #[serde(rename_all = "camelCase")]
    Added {
        job_id: String,
        next_run_at_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Removed { job_id: String },
    #[serde(rename_all = "camelCase")]
    Updated {
        job_id: String,
        next_run_at_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Started { job_id: String },
    #[serde(rename_all = "camelCase")]
    Finished {
        job_id: String,
        next_run_at_ms: Option<u64>,
    },
}

impl CronJob {
    /// A new disabled-state-free job with a fresh id and stamps.
    pub fn new(name: &str, schedule: CronSchedule, message: &str) -> Self {
        let now = crate::core::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            enabled: true,
            created_at_ms: now,
            updated_at_ms: now,
            schedule,
            session_target: SessionTarget::Isolated,
            payload: CronPayload::AgentTurn {
                message: message.to_string(),
            },
            delivery: CronDelivery::default(),
            state: CronJobState::default(),
        }
    }
}
