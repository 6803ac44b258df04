use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::ConfigError;

/// Snapshot of the target taken before anything is mutated.
#[derive(Debug)]
pub struct Backup {
    /// The live target (directory or single file).
    target: PathBuf,
    /// Directory holding the snapshot.
    location: PathBuf,
    is_dir: bool,
    keep: bool,
}

impl Backup {
    /// Copy `target` into `<out_dir>/backup`, replacing any stale snapshot.
    pub fn create(target: &Path, out_dir: &Path, keep: bool) -> Result<Self> {
        let is_dir = target.is_dir();
        let out_dir = resolve(out_dir)
            .with_context(|| format!("failed to resolve output dir {:?}", out_dir))?;
        let real_target = fs::canonicalize(target)
            .with_context(|| format!("failed to resolve target {:?}", target))?;
        if is_dir && out_dir.starts_with(&real_target) {
            return Err(ConfigError::Invalid(format!(
                "output dir {:?} must not be inside the target {:?}",
                out_dir, target
            ))
            .into());
        }

        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create output dir {:?}", out_dir))?;

        let location = out_dir.join("backup");
        if location.exists() {
            fs::remove_dir_all(&location)
                .with_context(|| format!("failed to remove stale backup {:?}", location))?;
        }

        if is_dir {
            copy_dir_recursive(target, &location)?;
        } else {
            fs::create_dir_all(&location)
                .with_context(|| format!("failed to create dir {:?}", location))?;
            fs::copy(target, location.join(file_name(target)?))
                .with_context(|| format!("failed to back up {:?}", target))?;
        }

        Ok(Self {
            target: target.to_path_buf(),
            location,
            is_dir,
            keep,
        })
    }

    #[cfg(test)]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Make the target equal to the snapshot again.
    ///
    /// Only files whose contents differ are rewritten, and anything created
    /// since the snapshot (`__pycache__`, stray files) is removed. Calling it
    /// repeatedly is harmless.
    pub fn restore(&self) -> Result<()> {
        if self.is_dir {
            sync_dir(&self.location, &self.target)
        } else {
            sync_file(&self.location.join(file_name(&self.target)?), &self.target)
        }
    }

    /// Remove the snapshot unless it was asked to be kept.
    fn discard(&self) -> Result<()> {
        if self.keep {
            return Ok(());
        }
        fs::remove_dir_all(&self.location)
            .with_context(|| format!("failed to remove backup {:?}", self.location))
    }
}

/// Restores the target when dropped, covering early returns and panics.
#[derive(Debug)]
pub struct RestoreGuard {
    backup: Option<Backup>,
}

impl RestoreGuard {
    pub fn new(backup: Backup) -> Self {
        Self {
            backup: Some(backup),
        }
    }

    pub fn restore(&self) -> Result<()> {
        match &self.backup {
            Some(b) => b.restore(),
            None => Ok(()),
        }
    }

    /// Final restore, then drop the snapshot (unless kept).
    pub fn finish(mut self) -> Result<()> {
        let Some(backup) = self.backup.take() else {
            return Ok(());
        };
        backup.restore()?;
        backup.discard()
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            if let Err(e) = backup.restore() {
                eprintln!("failed to restore {:?} from backup: {e:#}", backup.target);
                return;
            }
            let _ = backup.discard();
        }
    }
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .with_context(|| format!("{:?} has no file name", path))
}

/// Recursively copy all files and directories from `src` into `dst`.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create dir {:?}", dst))?;

    for entry in fs::read_dir(src).with_context(|| format!("failed to read dir {:?}", src))? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());

        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target)
                .with_context(|| format!("failed to copy file {:?} to {:?}", path, target))?;
        }
    }

    Ok(())
}

fn sync_file(snapshot: &Path, live: &Path) -> Result<()> {
    if live.is_dir() {
        fs::remove_dir_all(live).with_context(|| format!("failed to remove {:?}", live))?;
    }

    let wanted = fs::read(snapshot).with_context(|| format!("failed to read {:?}", snapshot))?;
    if fs::read(live).ok().as_deref() == Some(wanted.as_slice()) {
        return Ok(());
    }

    fs::write(live, wanted).with_context(|| format!("failed to restore {:?}", live))
}

fn sync_dir(snapshot: &Path, live: &Path) -> Result<()> {
    if live.is_file() {
        fs::remove_file(live).with_context(|| format!("failed to remove {:?}", live))?;
    }
    fs::create_dir_all(live).with_context(|| format!("failed to create dir {:?}", live))?;

    for entry in fs::read_dir(live).with_context(|| format!("failed to read dir {:?}", live))? {
        let entry = entry?;
        let path = entry.path();
        if snapshot.join(entry.file_name()).exists() {
            continue;
        }

        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("failed to remove {:?}", path))?;
    }

    for entry in fs::read_dir(snapshot).with_context(|| format!("failed to read dir {:?}", snapshot))? {
        let entry = entry?;
        let path = entry.path();
        let target = live.join(entry.file_name());

        if path.is_dir() {
            sync_dir(&path, &target)?;
        } else {
            sync_file(&path, &target)?;
        }
    }

    Ok(())
}

/// Absolute form of `path` with symlinks resolved up to its deepest
/// existing ancestor; the missing tail is appended unchanged.
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)?;

    let mut existing = absolute.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return Ok(absolute.clone()),
        }
    }

    let mut resolved = fs::canonicalize(existing)?;
    resolved.extend(tail.iter().rev());
    Ok(resolved)
}
