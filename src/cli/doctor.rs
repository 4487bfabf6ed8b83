use std::path::Path;

use anyhow::Result;

use crate::cli::output::Section;
use crate::config::Config;

/// Health checks for the install: state dir ownership/permissions,
/// quarantined store files, config parseability, daemon liveness.
pub fn run(state_dir: &Path) -> Result<()> {
    let mut findings: Vec<(String, String)> = Vec::new();

    findings.push(("State dir".to_string(), state_dir.display().to_string()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(state_dir) {
            Ok(meta) => {
                let uid = crate::core::statedir::current_uid();
                if meta.uid() != uid {
                    findings.push((
                        "Ownership".to_string(),
                        format!("WARN: owned by uid {} (you are {uid})", meta.uid()),
                    ));
                } else {
                    findings.push(("Ownership".to_string(), "ok".to_string()));
                }
                if meta.permissions().mode() & 0o077 != 0 {
                    findings.push((
                        "Permissions".to_string(),
                        "WARN: state dir is readable by other users".to_string(),
                    ));
                } else {
                    findings.push(("Permissions".to_string(), "ok (0700)".to_string()));
                }
            }
            Err(e) => findings.push(("Ownership".to_string(), format!("ERROR: {e}"))),
        }
    }

    let quarantined = count_quarantined(state_dir);
    if quarantined > 0 {
        findings.push((
            "Stores".to_string(),
            format!("WARN: {quarantined} quarantined store file(s); a store was malformed and rebuilt empty"),
        ));
    } else {
        findings.push(("Stores".to_string(), "ok".to_string()));
    }

    let config_path = state_dir.join("config.json");
    let config_status = if !config_path.exists() {
        "not created yet (run 'clawdbot onboard')".to_string()
    } else {
        match std::fs::read_to_string(&config_path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<Config>(&raw).map_err(Into::into))
        {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("ERROR: {e}"),
        }
    };
    findings.push(("Config".to_string(), config_status));

    let pid_path = state_dir.join("run").join("gateway.pid");
    let daemon_status = match std::fs::read_to_string(&pid_path) {
        Ok(raw) => match raw.trim().parse::<i32>() {
            Ok(pid) if unsafe { libc::kill(pid, 0) == 0 } => format!("running (pid {pid})"),
            Ok(pid) => format!("WARN: stale pid file (pid {pid} is gone)"),
            Err(_) => "WARN: unreadable pid file".to_string(),
        },
        Err(_) => "stopped".to_string(),
    };
    findings.push(("Gateway".to_string(), daemon_status));

    let mut section = Section::new("Doctor");
    for (label, value) in findings {
        section = section.status(&label, &value);
    }
    section.print();
    Ok(())
}

fn count_quarantined(state_dir: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![state_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                // Workspace contents are user files, not ours to scan.
                if path.file_name().map(|n| n == "workspace").unwrap_or(false) {
                    continue;
                }
                stack.push(path);
            } else if path
                .extension()
                .map(|e| e.to_string_lossy().starts_with("corrupt"))
                .unwrap_or(false)
                || path
                    .file_name()
                    .map(|n| n.to_string_lossy().contains(".corrupt."))
                    .unwrap_or(false)
            {
                count += 1;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarantine_count_finds_marked_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sessions")).unwrap();
        std::fs::write(tmp.path().join("sessions/main.json"), "{}").unwrap();
        std::fs::write(
            tmp.path().join("sessions/main.corrupt.1700000000"),
            "{broken",
        )
        .unwrap();
        assert_eq!(count_quarantined(tmp.path()), 1);
    }

    #[test]
    fn doctor_runs_against_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        run(tmp.path()).unwrap();
    }
}
