use crate::cache::CacheItem;
use async_trait::async_trait;
use keel_core::ScmError;
use keel_core::ports::ScmClient;
use keel_core::project::ScmConfig;
use keel_core::revision::Revision;
use std::sync::Arc;
use tracing::debug;

/// Fills cache items for one repository.
#[async_trait]
pub trait CachePopulator: Send + Sync {
    /// Key of the repository this populator serves.
    fn unique_location(&self) -> String;

    /// Cheap, side-effect free check whether `item` must be refreshed to
    /// answer for `revision`.
    fn requires_refresh(&self, item: &CacheItem, revision: &Revision) -> bool {
        item.revision() != Some(revision)
    }

    /// Query the repository and fill `item` for `revision`. On error the
    /// cache discards whatever was written to `item`.
    async fn populate(&self, item: &mut CacheItem, revision: &Revision) -> Result<(), ScmError>;
}

/// Populator backed by an [`ScmClient`].
pub struct ScmPopulator {
    client: Arc<dyn ScmClient>,
    config: ScmConfig,
}

impl ScmPopulator {
    pub fn new(client: Arc<dyn ScmClient>, config: ScmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl CachePopulator for ScmPopulator {
    fn unique_location(&self) -> String {
        self.config.unique_location()
    }

    async fn populate(&self, item: &mut CacheItem, revision: &Revision) -> Result<(), ScmError> {
        debug!(location = %self.config.unique_location(), %revision, "Browsing repository");
        let files = self.client.browse(&self.config, revision).await?;
        item.update(revision.clone(), files);
        Ok(())
    }
}
