pub mod agent;
pub mod archive;
pub mod cron;
pub mod delivery;
pub mod dispatch;
pub mod hooks;
pub mod policy;
pub mod process;
pub mod session;
pub mod statedir;
pub mod store;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
