//! Directory-backed SCM.
//!
//! The location is a directory on the master's filesystem and the only
//! revision it can serve is the current one, identified by a digest of the
//! tree's paths and contents.

use async_trait::async_trait;
use keel_core::ScmError;
use keel_core::ports::{FileInfo, ScmClient};
use keel_core::project::ScmConfig;
use keel_core::revision::Revision;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const KIND: &str = "local";

/// Length of the hex revision ids.
const REVISION_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalScm;

impl LocalScm {
    pub fn new() -> Self {
        Self
    }
}

fn root(config: &ScmConfig) -> Result<PathBuf, ScmError> {
    if config.kind != KIND {
        return Err(ScmError::Other(format!(
            "unsupported SCM type '{}', expected '{}'",
            config.kind, KIND
        )));
    }
    let root = PathBuf::from(&config.location);
    if !root.is_dir() {
        return Err(ScmError::Unreachable {
            location: config.location.clone(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(root)
}

fn short_digest(hasher: Sha256) -> String {
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(REVISION_LEN);
    digest
}

fn unreachable(root: &Path, err: impl std::fmt::Display) -> ScmError {
    ScmError::Unreachable {
        location: root.display().to_string(),
        reason: err.to_string(),
    }
}

struct Entry {
    relative: String,
    path: PathBuf,
    directory: bool,
}

/// Every entry below `root` in a stable order.
fn entries(root: &Path) -> Result<Vec<Entry>, ScmError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| unreachable(root, e))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| unreachable(root, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(Entry {
            relative,
            path: entry.path().to_path_buf(),
            directory: entry.file_type().is_dir(),
        });
    }
    Ok(entries)
}

/// Revision of the tree plus each file's own digest.
fn scan(root: &Path) -> Result<(Revision, Vec<FileInfo>), ScmError> {
    let mut tree = Sha256::new();
    let mut files = Vec::new();

    for entry in entries(root)? {
        tree.update(entry.relative.as_bytes());
        if entry.directory {
            files.push(FileInfo {
                path: entry.relative,
                revision: None,
                directory: true,
            });
            continue;
        }

        let contents = std::fs::read(&entry.path).map_err(|e| unreachable(root, e))?;
        tree.update(&contents);
        let mut file = Sha256::new();
        file.update(&contents);
        files.push(FileInfo {
            path: entry.relative,
            revision: Some(Revision::new(short_digest(file))),
            directory: false,
        });
    }

    Ok((Revision::new(short_digest(tree)), files))
}

fn require_current(
    config: &ScmConfig,
    current: &Revision,
    requested: &Revision,
) -> Result<(), ScmError> {
    if current != requested {
        return Err(ScmError::UnknownRevision {
            location: config.location.clone(),
            revision: requested.to_string(),
        });
    }
    Ok(())
}

fn copy_tree(root: &Path, destination: &Path) -> Result<(), ScmError> {
    for entry in entries(root)? {
        let target = destination.join(&entry.relative);
        let result = if entry.directory {
            std::fs::create_dir_all(&target)
        } else {
            std::fs::copy(&entry.path, &target).map(|_| ())
        };
        result.map_err(|e| ScmError::Other(format!("copy to {}: {}", target.display(), e)))?;
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, ScmError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ScmError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ScmError::Other(format!("scan task failed: {}", e)))?
}

#[async_trait]
impl ScmClient for LocalScm {
    async fn check_connectivity(&self, config: &ScmConfig) -> Result<(), ScmError> {
        root(config).map(|_| ())
    }

    async fn latest_revision(&self, config: &ScmConfig) -> Result<Revision, ScmError> {
        let root = root(config)?;
        let (revision, _) = blocking(move || scan(&root)).await?;
        Ok(revision)
    }

    async fn retrieve(
        &self,
        config: &ScmConfig,
        revision: &Revision,
        destination: &Path,
    ) -> Result<(), ScmError> {
        let root = root(config)?;
        let config = config.clone();
        let revision = revision.clone();
        let destination = destination.to_path_buf();
        debug!(location = %config.location, %revision, destination = %destination.display(), "Retrieving");

        blocking(move || {
            let (current, _) = scan(&root)?;
            require_current(&config, &current, &revision)?;
            copy_tree(&root, &destination)
        })
        .await
    }

    async fn browse(&self, config: &ScmConfig, revision: &Revision) -> Result<Vec<FileInfo>, ScmError> {
        let root = root(config)?;
        let config = config.clone();
        let revision = revision.clone();

        blocking(move || {
            let (current, files) = scan(&root)?;
            require_current(&config, &current, &revision)?;
            Ok(files)
        })
        .await
    }
}
