//! Whitelist-rooted filesystem adapter.
//!
//! Every operation resolves inside the root provided at construction;
//! lexical `..` escapes and symlink escapes are both rejected. Writes are
//! atomic: temp file in the target directory, fsync, rename. Failure paths
//! clean up the temp file via its drop guard.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ApexError, Result};

pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn read(&self, rel_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(rel_path)?;
        Ok(tokio::fs::read(path).await?)
    }

    pub async fn read_to_string(&self, rel_path: &str) -> Result<String> {
        let path = self.resolve(rel_path)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Atomic write: temp file beside the target, fsync, rename.
    pub async fn write_atomic(&self, rel_path: &str, data: Vec<u8>) -> Result<()> {
        let path = self.resolve(rel_path)?;
        let parent = path
            .parent()
            .ok_or_else(|| ApexError::PathEscapesRoot(path.clone()))?
            .to_path_buf();

        tokio::fs::create_dir_all(&parent).await?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;

            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)
                .map_err(|e| ApexError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| ApexError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Apply a simplified unified diff: exactly one `- ` line (old
    /// substring) and one `+ ` line (new substring), replaced once.
    pub async fn apply_patch(&self, rel_path: &str, diff: &str) -> Result<()> {
        let mut old_sub = None;
        let mut new_sub = None;
        for line in diff.lines() {
            if let Some(rest) = line.strip_prefix("- ") {
                old_sub = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("+ ") {
                new_sub = Some(rest.to_string());
            }
        }
        let (old_sub, new_sub) = match (old_sub, new_sub) {
            (Some(old), Some(new)) => (old, new),
            _ => {
                return Err(ApexError::PatchFormat(
                    "need one '-' and one '+' line".into(),
                ))
            }
        };

        let text = self.read_to_string(rel_path).await?;
        if !text.contains(&old_sub) {
            return Err(ApexError::PatchTargetMissing(old_sub));
        }
        let patched = text.replacen(&old_sub, &new_sub, 1);
        self.write_atomic(rel_path, patched.into_bytes()).await
    }

    /// Regex search over file contents under the root; returns relative
    /// paths of matching files, sorted.
    pub async fn search(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = Regex::new(pattern).map_err(|e| ApexError::Config(e.to_string()))?;
        let root = self.root.clone();

        let matches = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for entry in WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if let Ok(content) = std::fs::read_to_string(entry.path()) {
                    if regex.is_match(&content) {
                        if let Ok(rel) = entry.path().strip_prefix(&root) {
                            matches.push(rel.to_string_lossy().into_owned());
                        }
                    }
                }
            }
            matches.sort();
            matches
        })
        .await
        .map_err(|e| ApexError::Io(std::io::Error::other(e)))?;
        Ok(matches)
    }

    /// Resolve a relative path inside the root. Rejects absolute paths,
    /// `..` traversal, and symlinks whose targets leave the root.
    fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let rel = Path::new(rel_path);
        if rel.is_absolute() {
            return Err(ApexError::PathEscapesRoot(rel.to_path_buf()));
        }
        for component in rel.components() {
            if matches!(component, Component::ParentDir) {
                return Err(ApexError::PathEscapesRoot(rel.to_path_buf()));
            }
        }

        let joined = self.root.join(rel);

        // Canonicalize the deepest existing ancestor so symlinked segments
        // cannot smuggle the path outside the root.
        let mut existing = joined.clone();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent.to_path_buf(),
                None => return Err(ApexError::PathEscapesRoot(joined)),
            }
        }
        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            debug!(path = %joined.display(), "resolved outside whitelist root");
            return Err(ApexError::PathEscapesRoot(joined));
        }
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, LocalFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path()).unwrap();
        (dir, fs)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_dir, fs) = fixture().await;
        fs.write_atomic("a/b/file.txt", b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(fs.read("a/b/file.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_absolute_path_rejected() {
        let (_dir, fs) = fixture().await;
        assert!(matches!(
            fs.read("/etc/hostname").await,
            Err(ApexError::PathEscapesRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_dotdot_traversal_rejected() {
        let (_dir, fs) = fixture().await;
        assert!(matches!(
            fs.read("../outside.txt").await,
            Err(ApexError::PathEscapesRoot(_))
        ));
        assert!(matches!(
            fs.write_atomic("a/../../escape.txt", vec![]).await,
            Err(ApexError::PathEscapesRoot(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (_dir, fs) = fixture().await;
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), fs.root().join("link")).unwrap();

        assert!(matches!(
            fs.write_atomic("link/file.txt", b"x".to_vec()).await,
            Err(ApexError::PathEscapesRoot(_))
        ));
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_content() {
        let (_dir, fs) = fixture().await;
        fs.write_atomic("f.txt", b"one".to_vec()).await.unwrap();
        fs.write_atomic("f.txt", b"two".to_vec()).await.unwrap();
        assert_eq!(fs.read_to_string("f.txt").await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_apply_patch_single_replacement() {
        let (_dir, fs) = fixture().await;
        fs.write_atomic("hello.txt", b"hello world\n".to_vec())
            .await
            .unwrap();

        let diff = "--- a/hello.txt\n+++ b/hello.txt\n@@\n- world\n+ apex\n@@\n";
        fs.apply_patch("hello.txt", diff).await.unwrap();
        assert_eq!(fs.read_to_string("hello.txt").await.unwrap(), "hello apex\n");
    }

    #[tokio::test]
    async fn test_apply_patch_missing_target() {
        let (_dir, fs) = fixture().await;
        fs.write_atomic("hello.txt", b"hello\n".to_vec())
            .await
            .unwrap();

        let diff = "- absent\n+ replacement\n";
        assert!(matches!(
            fs.apply_patch("hello.txt", diff).await,
            Err(ApexError::PatchTargetMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_patch_bad_format() {
        let (_dir, fs) = fixture().await;
        fs.write_atomic("hello.txt", b"hello\n".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            fs.apply_patch("hello.txt", "no hunks here").await,
            Err(ApexError::PatchFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_search_returns_sorted_relative_paths() {
        let (_dir, fs) = fixture().await;
        fs.write_atomic("b.txt", b"needle here".to_vec()).await.unwrap();
        fs.write_atomic("a.txt", b"needle there".to_vec()).await.unwrap();
        fs.write_atomic("c.txt", b"nothing".to_vec()).await.unwrap();

        let found = fs.search("needle").await.unwrap();
        assert_eq!(found, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }
}
