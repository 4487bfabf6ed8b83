use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;

/// Extract a `.tar.gz` stream into `target_dir`.
///
/// Refuses any entry whose resolved path would land outside the target:
/// absolute paths, `..` traversal (including traversal that only appears
/// after `strip_components`), and symlink/hardlink entries. Returns the
/// number of files written.
pub fn extract_tar_gz(
    reader: impl Read,
    target_dir: &Path,
    strip_components: usize,
) -> Result<usize> {
    let decoder = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);
    let mut written = 0usize;

    for entry in archive.entries().context("failed to read archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            bail!(
                "refusing archive entry '{}': links are not allowed",
                entry.path().unwrap_or_default().display()
            );
        }

        let raw_path = entry.path().context("entry has an unreadable path")?;
        let Some(relative) = sanitize_entry_path(&raw_path, strip_components)? else {
            // The whole path was consumed by strip_components.
            continue;
        };

        let dest = target_dir.join(&relative);
        // Belt over braces: even a sanitized path must stay inside.
        if !dest.starts_with(target_dir) {
            bail!("refusing archive entry escaping '{}'", target_dir.display());
        }

        if entry_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if !entry_type.is_file() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        std::io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}

/// Normalize one entry path: reject absolute paths and any upward
/// traversal, then drop the first `strip_components` components.
fn sanitize_entry_path(raw: &Path, strip_components: usize) -> Result<Option<PathBuf>> {
    let mut components = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => components.push(part.to_os_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                bail!("refusing archive entry '{}': path traversal", raw.display())
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("refusing archive entry '{}': absolute path", raw.display())
            }
        }
    }
    if components.len() <= strip_components {
        return Ok(None);
    }
    let mut out = PathBuf::new();
    for part in components.into_iter().skip(strip_components) {
        out.push(part);
    }
    Ok(Some(out))
}

/// Resolve a path inside an installed skill root (`tools/<skill>/…`).
/// Relative escapes out of the skill's own directory are refused.
pub fn resolve_skill_target(tools_root: &Path, skill: &str, relative: &str) -> Result<PathBuf> {
    if skill.is_empty() || skill.contains('/') || skill.contains("..") {
        bail!("invalid skill name '{skill}'");
    }
    let skill_root = tools_root.join(skill);
    let mut resolved = skill_root.clone();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => bail!("target '{relative}' escapes the skill root"),
        }
    }
    if !resolved.starts_with(&skill_root) {
        bail!("target '{relative}' escapes the skill root");
    }
    Ok(resolved)
}
