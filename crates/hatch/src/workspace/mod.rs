//! Sandboxed access to session workspace files.
//!
//! Every session owns a `workspace/` directory inside its volume. All
//! paths arriving from callers are relative to that directory and are
//! validated lexically before any filesystem call, then checked again
//! against the canonicalized root so symlinks cannot escape.

use std::path::{Component, Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// A single entry in a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    /// Workspace-relative path of the entry.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
}

/// A directory listing.
///
/// A missing directory is reported with `exists: false` rather than an
/// error, so callers can render an empty workspace before the first
/// write.
#[derive(Debug, Clone, Serialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<DirEntry>,
    pub exists: bool,
}

/// File content with its transfer encoding.
///
/// Text files are returned as UTF-8; anything else falls back to
/// base64 so binary content survives JSON transport.
#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub content: String,
    pub encoding: String,
    pub size: u64,
    pub modified: Option<String>,
}

/// Content encoding accepted on writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Path-sandboxed view of one session's workspace directory.
#[derive(Debug, Clone)]
pub struct WorkspaceSandbox {
    root: PathBuf,
}

impl WorkspaceSandbox {
    pub fn new(volume_root: &Path, session_id: &str) -> Self {
        Self {
            root: volume_root.join(session_id).join("workspace"),
        }
    }

    /// The workspace root on the host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to an absolute path inside the
    /// workspace.
    ///
    /// A leading `/` is treated as the workspace root. Any `..`
    /// component is rejected before touching the filesystem. The deepest
    /// existing ancestor of the resolved path is then canonicalized and
    /// must still sit under the workspace root, so a symlinked
    /// intermediate directory cannot redirect a write (or rename, or
    /// mkdir) outside the workspace. A dangling symlink anywhere on the
    /// path is rejected outright: following it on write would create the
    /// target wherever it points.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative.trim_start_matches('/'));

        let mut resolved = self.root.clone();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "path escapes the workspace: {}",
                        relative
                    )));
                }
            }
        }

        self.check_containment(&resolved, relative)?;
        Ok(resolved)
    }

    /// Verify that the filesystem view of `resolved` stays under the
    /// workspace root.
    fn check_containment(&self, resolved: &Path, relative: &str) -> Result<()> {
        // An absent root has no symlinks beneath it to follow.
        if !self.root.exists() {
            return Ok(());
        }
        let canonical_root = self.root.canonicalize()?;

        let mut probe = resolved.to_path_buf();
        loop {
            if probe.exists() {
                let canonical = probe.canonicalize()?;
                if !canonical.starts_with(&canonical_root) {
                    return Err(Error::Validation(format!(
                        "path escapes the workspace: {}",
                        relative
                    )));
                }
                return Ok(());
            }
            // exists() follows symlinks, so a dangling link reports false
            // while still redirecting any write made through it.
            if probe.symlink_metadata().is_ok() {
                return Err(Error::Validation(format!(
                    "path crosses a dangling symlink: {}",
                    relative
                )));
            }
            if probe == self.root {
                return Ok(());
            }
            match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => return Ok(()),
            }
        }
    }

    fn is_root(&self, resolved: &Path) -> bool {
        resolved == self.root
    }

    /// List a directory inside the workspace.
    pub async fn list(&self, relative: &str) -> Result<DirListing> {
        let path = self.resolve(relative)?;

        if !path.exists() {
            return Ok(DirListing {
                path: relative.to_string(),
                entries: Vec::new(),
                exists: false,
            });
        }
        if !path.is_dir() {
            return Err(Error::Validation(format!(
                "not a directory: {}",
                relative
            )));
        }

        let prefix = relative.trim_matches('/');
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            entries.push(DirEntry {
                name,
                path: entry_path,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified: modified_timestamp(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DirListing {
            path: relative.to_string(),
            entries,
            exists: true,
        })
    }

    /// Read a file, returning UTF-8 text or base64 for binary content.
    pub async fn read(&self, relative: &str) -> Result<FileContent> {
        let path = self.resolve(relative)?;

        if path.is_dir() {
            return Err(Error::Validation(format!(
                "is a directory: {}",
                relative
            )));
        }
        if !path.is_file() {
            return Err(Error::NotFound(format!("file not found: {}", relative)));
        }

        let metadata = tokio::fs::metadata(&path).await?;
        let bytes = tokio::fs::read(&path).await?;
        let size = bytes.len() as u64;

        let (content, encoding) = match String::from_utf8(bytes) {
            Ok(text) => (text, "utf-8".to_string()),
            Err(e) => (BASE64.encode(e.into_bytes()), "base64".to_string()),
        };

        Ok(FileContent {
            content,
            encoding,
            size,
            modified: modified_timestamp(&metadata),
        })
    }

    /// Write a file, creating parent directories as needed.
    pub async fn write(
        &self,
        relative: &str,
        content: &str,
        encoding: WriteEncoding,
    ) -> Result<()> {
        let path = self.resolve(relative)?;
        if self.is_root(&path) {
            return Err(Error::Validation("cannot write the workspace root".to_string()));
        }

        let bytes = match encoding {
            WriteEncoding::Utf8 => content.as_bytes().to_vec(),
            WriteEncoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| Error::Validation(format!("invalid base64 content: {}", e)))?,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    /// Delete a file. Directories must go through `rmdir`.
    pub async fn delete(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;

        if !path.exists() {
            return Err(Error::NotFound(format!("file not found: {}", relative)));
        }
        if path.is_dir() {
            return Err(Error::Validation(format!(
                "is a directory, use rmdir: {}",
                relative
            )));
        }

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    /// Create a directory. Idempotent.
    pub async fn mkdir(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Remove a directory.
    ///
    /// A non-empty directory is refused unless `recursive` is set.
    pub async fn rmdir(&self, relative: &str, recursive: bool) -> Result<()> {
        let path = self.resolve(relative)?;
        if self.is_root(&path) {
            return Err(Error::Validation(
                "cannot remove the workspace root".to_string(),
            ));
        }

        if !path.exists() {
            return Err(Error::NotFound(format!(
                "directory not found: {}",
                relative
            )));
        }
        if !path.is_dir() {
            return Err(Error::Validation(format!("not a directory: {}", relative)));
        }

        if recursive {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            let mut reader = tokio::fs::read_dir(&path).await?;
            if reader.next_entry().await?.is_some() {
                return Err(Error::DirectoryNotEmpty(relative.to_string()));
            }
            tokio::fs::remove_dir(&path).await?;
        }
        Ok(())
    }

    /// Rename or move a file or directory within the workspace.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if self.is_root(&source) || self.is_root(&target) {
            return Err(Error::Validation(
                "cannot rename the workspace root".to_string(),
            ));
        }

        if !source.exists() {
            return Err(Error::NotFound(format!("path not found: {}", from)));
        }
        if target.exists() {
            return Err(Error::Conflict(format!("path already exists: {}", to)));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }
}

fn modified_timestamp(metadata: &std::fs::Metadata) -> Option<String> {
    metadata
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
}
