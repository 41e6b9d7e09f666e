// Descriptor persistence
//
// Backup-then-replace:
// 1) copy the existing file to `<name>.backup.<YYYYmmdd-HHMMSS>[-n]` (0600)
// 2) write the new content to a temp file in the same directory (0600) and fsync
// 3) rename over the target
// 4) prune backups beyond the retention count

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::EnvironmentDescriptor;
use crate::security::crypto::content_digest;

#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub pruned: Vec<PathBuf>,
    pub digest: String,
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("Descriptor path has no file name: {}", path.display()))
}

fn backup_prefix(name: &str) -> String {
    format!("{}.backup.", name)
}

/// Sort key for a backup file name: its stamp, then the numeric collision suffix.
fn backup_order(entry_name: &str, prefix: &str) -> (String, u32) {
    let rest = entry_name.strip_prefix(prefix).unwrap_or(entry_name);
    match rest.rsplit_once('-') {
        // The stamp itself has one dash (`%Y%m%d-%H%M%S`); a second one starts the suffix.
        Some((stamp, n)) if stamp.contains('-') => {
            (stamp.to_string(), n.parse().unwrap_or(0))
        }
        _ => (rest.to_string(), 0),
    }
}

/// Backup path for `path` at `now`. Within one second, each backup takes the suffix after the
/// highest one already present, so pruned names are never reused.
pub async fn backup_path_for(path: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    let name = file_name(path)?;
    let prefix = backup_prefix(&name);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stamp = now.format("%Y%m%d-%H%M%S").to_string();
    let base = format!("{}{}", prefix, stamp);

    let highest = list_backups(path)
        .await?
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .map(|n| backup_order(&n, &prefix))
        .filter(|(s, _)| *s == stamp)
        .map(|(_, n)| n)
        .max();

    Ok(match highest {
        None => dir.join(base),
        Some(n) => dir.join(format!("{}-{}", base, n + 1)),
    })
}

#[cfg(unix)]
async fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
async fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

/// Write `bytes` to `path` atomically with owner-only permissions.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let name = file_name(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let tmp = dir.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()));

    let result = async {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);

        let mut file = opts
            .open(&tmp)
            .await
            .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync temp file {}", tmp.display()))?;
        drop(file);

        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;
        restrict_to_owner(path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Existing backups of `path`, oldest first.
pub async fn list_backups(path: &Path) -> Result<Vec<PathBuf>> {
    let name = file_name(path)?;
    let prefix = backup_prefix(&name);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut backups = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(backups),
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to list {}", dir.display()))
        }
    };
    while let Some(entry) = entries.next_entry().await? {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if entry_name.starts_with(&prefix) {
            backups.push(entry.path());
        }
    }
    backups.sort_by_cached_key(|p| {
        let entry_name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        backup_order(&entry_name, &prefix)
    });
    Ok(backups)
}

/// Delete all but the newest `keep` backups (at least one is always kept).
pub async fn prune_backups(path: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let backups = list_backups(path).await?;
    let keep = keep.max(1);
    if backups.len() <= keep {
        return Ok(Vec::new());
    }
    let excess = backups.len() - keep;
    let mut pruned = Vec::with_capacity(excess);
    for old in backups.into_iter().take(excess) {
        match tokio::fs::remove_file(&old).await {
            Ok(()) => pruned.push(old),
            Err(e) => warn!(
                "[PHASE: descriptor] [STEP: prune] Failed to remove old backup {}: {}",
                old.display(),
                e
            ),
        }
    }
    Ok(pruned)
}

pub async fn write_descriptor(
    path: &Path,
    descriptor: &EnvironmentDescriptor,
    keep_backups: usize,
    now: DateTime<Local>,
) -> Result<WriteReceipt> {
    let content = descriptor.render();
    let digest = content_digest(content.as_bytes());

    let backup_path = if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let backup = backup_path_for(path, now).await?;
        tokio::fs::copy(path, &backup).await.with_context(|| {
            format!(
                "Failed to back up {} to {}",
                path.display(),
                backup.display()
            )
        })?;
        restrict_to_owner(&backup).await?;
        info!(
            "[PHASE: descriptor] [STEP: backup] Backed up existing descriptor to {}",
            backup.display()
        );
        Some(backup)
    } else {
        None
    };

    write_atomic(path, content.as_bytes()).await?;
    info!(
        "[PHASE: descriptor] [STEP: write] Wrote descriptor {} (entries={}, digest={})",
        path.display(),
        descriptor.len(),
        digest
    );

    let pruned = if backup_path.is_some() {
        prune_backups(path, keep_backups).await?
    } else {
        Vec::new()
    };
    if !pruned.is_empty() {
        debug!(
            "[PHASE: descriptor] [STEP: prune] Pruned {} old backup(s)",
            pruned.len()
        );
    }

    Ok(WriteReceipt {
        path: path.to_path_buf(),
        backup_path,
        pruned,
        digest,
    })
}
