//! Content digest of a prepared scratch tree.
//!
//! The digest identifies exactly what was shipped to the servers: two runs
//! over the same sources produce the same value regardless of the order in
//! which files were created.

use std::fs;
use std::path::Path;

use anyhow::Context;

/// Hex blake3 digest over every file and directory under `path`.
///
/// Entries are visited in name order. A file contributes
/// `relative_path || 0x00 || content`, a directory `relative_path || 0xFF`.
/// Symlinks are rejected: the scratch copy never creates them.
pub fn digest_tree(path: &Path) -> anyhow::Result<String> {
    let mut hasher = blake3::Hasher::new();
    walk(&mut hasher, path, "")?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn walk(hasher: &mut blake3::Hasher, dir: &Path, base: &str) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel = if base.is_empty() {
            name.to_string_lossy().to_string()
        } else {
            format!("{}/{}", base, name.to_string_lossy())
        };
        let ty = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;

        if ty.is_dir() {
            hasher.update(rel.as_bytes());
            hasher.update(&[0xFF]);
            walk(hasher, &entry.path(), &rel)?;
        } else if ty.is_file() {
            hasher.update(rel.as_bytes());
            hasher.update(&[0x00]);
            let content = fs::read(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            hasher.update(&content);
        } else {
            anyhow::bail!("unsupported entry in build tree: {}", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn digest_ignores_creation_order() {
        let a = TempDir::new().unwrap();
        write(a.path(), "main.go", "package main");
        write(a.path(), "static/app.css", "body{}");

        let b = TempDir::new().unwrap();
        write(b.path(), "static/app.css", "body{}");
        write(b.path(), "main.go", "package main");

        let digest = digest_tree(a.path()).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, digest_tree(b.path()).unwrap());
    }

    #[test]
    fn digest_tracks_content_and_names() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "main.go", "package main");
        let first = digest_tree(tmp.path()).unwrap();

        write(tmp.path(), "main.go", "package main // v2");
        let second = digest_tree(tmp.path()).unwrap();
        assert_ne!(first, second);

        fs::rename(tmp.path().join("main.go"), tmp.path().join("app.go")).unwrap();
        assert_ne!(second, digest_tree(tmp.path()).unwrap());
    }

    #[test]
    fn empty_directories_count() {
        let tmp = TempDir::new().unwrap();
        let before = digest_tree(tmp.path()).unwrap();
        fs::create_dir(tmp.path().join("assets")).unwrap();
        assert_ne!(before, digest_tree(tmp.path()).unwrap());
    }
}
