use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Resolve the durable state directory.
///
/// Resolution order: `$OPENCLAW_STATE_DIR`, then `$OPENCLAW_HOME/.openclaw`,
/// then `$HOME/.openclaw`. When none of those can be determined, a
/// uid-suffixed temp subdirectory is used, but only if it passes the trust
/// checks in [`ensure_trusted_dir`].
pub fn resolve_state_dir() -> Result<PathBuf> {
    resolve_state_dir_from(&|name| std::env::var(name).ok())
}

pub fn resolve_state_dir_from(env: &dyn Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(dir) = env("OPENCLAW_STATE_DIR") {
        let path = PathBuf::from(dir);
        ensure_private_dir(&path)?;
        return Ok(path);
    }
    if let Some(home) = env("OPENCLAW_HOME") {
        let path = PathBuf::from(home).join(".openclaw");
        ensure_private_dir(&path)?;
        return Ok(path);
    }
    if let Some(home) = env("HOME").map(PathBuf::from).or_else(dirs::home_dir) {
        let path = home.join(".openclaw");
        ensure_private_dir(&path)?;
        return Ok(path);
    }

    let tmp = env("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let fallback = tmp.join(format!("openclaw-{}", current_uid()));
    ensure_trusted_dir(&fallback)?;
    Ok(fallback)
}

pub fn current_uid() -> u32 {
    // Safety: geteuid has no failure modes.
    unsafe { libc::geteuid() }
}

/// Create `path` if missing and clamp its permissions to 0700.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create state dir {}", path.display()))?;
    }
    restrict_dir_permissions(path);
    Ok(())
}

/// Validate a world-visible fallback directory before trusting it.
///
/// The directory must not be a symlink, must be owned by the current uid,
/// and must not be group- or other-writable. A dir failing those checks is
/// removed and recreated; if removal fails, the fallback is refused.
pub fn ensure_trusted_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create temp state dir {}", path.display()))?;
        restrict_dir_permissions(path);
        return Ok(());
    }

    let meta = std::fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        replace_untrusted(path, "is a symlink")?;
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        use std::os::unix::fs::PermissionsExt;
        if meta.uid() != current_uid() {
            replace_untrusted(path, "is owned by another user")?;
            return Ok(());
        }
        if meta.permissions().mode() & 0o022 != 0 {
            replace_untrusted(path, "is group/other-writable")?;
            return Ok(());
        }
    }
    Ok(())
}

fn replace_untrusted(path: &Path, reason: &str) -> Result<()> {
    tracing::warn!(
        "temp state dir {} {}; replacing it",
        path.display(),
        reason
    );
    if std::fs::remove_dir_all(path)
        .or_else(|_| std::fs::remove_file(path))
        .is_err()
    {
        bail!(
            "refusing temp state dir {}: it {} and could not be removed",
            path.display(),
            reason
        );
    }
    std::fs::create_dir_all(path)?;
    restrict_dir_permissions(path);
    Ok(())
}

pub fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }
}

pub fn restrict_file_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
}
