//! Build agent for Keel CI.
//!
//! An agent receives recipe requests from the master, runs each recipe's
//! commands in order with the resolved resource properties, and reports
//! progress and a single terminal result back.

pub mod config;
pub mod context;
pub mod executor;
mod metrics;
pub mod postprocess;
pub mod runner;
mod service;

pub use config::AgentConfig;
pub use context::ExecutionContext;
pub use executor::{RecipeDirs, RecipeExecutor};
pub use metrics::MetricsSampler;
pub use postprocess::{ArtifactCollector, PostProcessor, PostProcessorConfig, RegexPostProcessor};
pub use runner::{CommandRunner, ShellRunner};
pub use service::AgentService;
