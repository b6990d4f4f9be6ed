//! Port traits for the collaborators the core calls into.
//!
//! Persistence, configuration and source control live outside the core;
//! these traits are the whole contract.

use crate::error::ScmError;
use crate::ids::{BuildId, ProjectId};
use crate::project::{ProjectConfig, ScmConfig};
use crate::resource::Resource;
use crate::result::BuildResult;
use crate::revision::Revision;
use crate::trigger::TriggerConfig;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File metadata reported by an SCM at a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the repository root, `/` separated.
    pub path: String,
    /// Revision at which the file last changed, if the SCM tracks it.
    pub revision: Option<Revision>,
    pub directory: bool,
}

/// Source control client. Vendor protocols are implemented behind this
/// trait; the core never talks to a repository directly.
#[async_trait]
pub trait ScmClient: Send + Sync {
    async fn check_connectivity(&self, config: &ScmConfig) -> std::result::Result<(), ScmError>;

    async fn latest_revision(&self, config: &ScmConfig) -> std::result::Result<Revision, ScmError>;

    /// Check out `revision` into `destination`, which must exist.
    async fn retrieve(
        &self,
        config: &ScmConfig,
        revision: &Revision,
        destination: &Path,
    ) -> std::result::Result<(), ScmError>;

    /// List files and their revisions.
    async fn browse(
        &self,
        config: &ScmConfig,
        revision: &Revision,
    ) -> std::result::Result<Vec<FileInfo>, ScmError>;
}

#[async_trait]
pub trait BuildResultStore: Send + Sync {
    async fn save_build_result(&self, build: &BuildResult) -> Result<()>;

    async fn build_result(&self, id: BuildId) -> Result<Option<BuildResult>>;

    /// Most recent first.
    async fn builds_for_project(&self, project: &ProjectId, limit: usize)
    -> Result<Vec<BuildResult>>;
}

#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn load_triggers(&self, project: &ProjectId) -> Result<Vec<TriggerConfig>>;
}

#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn load_resources(&self) -> Result<Vec<Resource>>;

    async fn resource(&self, name: &str) -> Result<Option<Resource>>;
}

#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn project(&self, id: &ProjectId) -> Result<Option<ProjectConfig>>;

    async fn projects(&self) -> Result<Vec<ProjectConfig>>;
}
