//! End-to-end test infrastructure for Keel CI.
//!
//! [`TestContext`] runs a master with an in-memory store and a
//! directory-backed repository, and attaches local agents over channels.
//!
//! # Usage
//!
//! ```ignore
//! use keel_tests::{ProjectFixture, TestContext};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await.unwrap();
//!     ctx.add_project(ProjectFixture::single_stage(ctx.repo(), "make"), vec![]).await.unwrap();
//!     ctx.start_agent(&["linux"]);
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,keel_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
