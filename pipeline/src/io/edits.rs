//! Writing drafted edits into a working tree.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::types::DraftEdit;

/// Resolve an edit path under `repo`, rejecting anything that could escape it.
pub fn edit_target(repo: &Path, path: &str) -> Result<PathBuf> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        bail!("edit path is empty");
    }
    let relative = Path::new(trimmed);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("edit path '{trimmed}' must be relative and stay inside the repository"),
        }
    }
    let first = relative.components().find(|c| matches!(c, Component::Normal(_)));
    if first.is_some_and(|c| c.as_os_str() == ".git") {
        bail!("edit path '{trimmed}' points into .git");
    }
    Ok(repo.join(relative))
}

/// Check every path of an edit set without touching the disk.
pub fn validate_edit_paths(edits: &[DraftEdit]) -> Result<()> {
    for edit in edits {
        edit_target(Path::new("."), &edit.path)?;
    }
    Ok(())
}

/// Overwrite (or create) each file with its full new content.
pub fn apply_edits(repo: &Path, edits: &[DraftEdit]) -> Result<()> {
    for edit in edits {
        let target = edit_target(repo, &edit.path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&target, &edit.content)
            .with_context(|| format!("write {}", target.display()))?;
        debug!(path = %edit.path, bytes = edit.content.len(), "applied edit");
    }
    Ok(())
}
