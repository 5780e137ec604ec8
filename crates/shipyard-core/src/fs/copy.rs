//! Scratch copies of an application's source subtree.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

/// Dot-prefixed entries (`.git`, `.env`, editor state) never leave the
/// operator's machine.
pub fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Copy `root/folder` into `scratch/folder`, skipping hidden entries at any
/// depth. Returns the number of files copied.
pub fn copy_source_tree(root: &Path, folder: &Path, scratch: &Path) -> anyhow::Result<usize> {
    let from = root.join(folder);
    let to = scratch.join(folder);
    if !from.is_dir() {
        anyhow::bail!("application folder {} does not exist", from.display());
    }
    let copied = copy_dir(&from, &to)?;
    debug!(from = %from.display(), to = %to.display(), files = copied, "copied sources");
    Ok(copied)
}

fn copy_dir(from: &Path, to: &Path) -> anyhow::Result<usize> {
    fs::create_dir_all(to).with_context(|| format!("failed to create {}", to.display()))?;
    let mut copied = 0;
    for entry in fs::read_dir(from).with_context(|| format!("failed to read {}", from.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if is_hidden(&name) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        // Follows symlinks so the copy holds plain files only.
        let meta = fs::metadata(&src).with_context(|| format!("failed to stat {}", src.display()))?;
        if meta.is_dir() {
            copied += copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst)
                .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
