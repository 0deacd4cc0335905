use crate::error::{IoContext, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).at(path)
}

/// Path of the sibling file an atomic write stages into before renaming.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts))
}

/// Writes `bytes` to a staging file next to `path` and fsyncs it. The caller
/// decides when (and whether) to rename it into place.
pub(crate) fn stage_bytes(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = staging_path(path);
    let mut file = fs::File::create(&tmp).at(&tmp)?;
    file.write_all(bytes).at(&tmp)?;
    file.sync_all().at(&tmp)?;
    Ok(tmp)
}

pub(crate) fn commit_staged(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).at(path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = stage_bytes(path, bytes)?;
    commit_staged(&tmp, path)
}

/// Adds the execute bits for everyone who can read the file.
#[cfg(unix)]
pub(crate) fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).at(path)?.permissions();
    let mode = perms.mode();
    perms.set_mode(mode | ((mode & 0o444) >> 2));
    fs::set_permissions(path, perms).at(path)
}

#[cfg(not(unix))]
pub(crate) fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Resolves `path` against the current directory without touching the
/// filesystem, so paths that do not exist yet still become absolute.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(normalize_path(path));
    }
    let cwd = std::env::current_dir().at(".")?;
    Ok(normalize_path(&cwd.join(path)))
}

pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Single-quotes `s` for a POSIX shell when it contains anything beyond a
/// conservative set of path characters.
pub(crate) fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
