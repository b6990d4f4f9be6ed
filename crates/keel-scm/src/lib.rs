//! Source control support for Keel CI.
//!
//! - [`ScmRevisionCache`]: per-repository snapshots of file/revision
//!   metadata, refreshed on demand with at most one population in flight per
//!   location.
//! - [`ScmMonitor`]: polls project repositories and publishes change events.
//! - [`LocalScm`]: an [`ScmClient`](keel_core::ports::ScmClient) over a plain
//!   directory.

mod cache;
mod local;
mod monitor;
mod populator;

pub use cache::{CacheItem, CacheStats, ScmRevisionCache};
pub use local::{KIND as LOCAL_SCM_KIND, LocalScm};
pub use monitor::ScmMonitor;
pub use populator::{CachePopulator, ScmPopulator};
