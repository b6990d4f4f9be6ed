//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Check a system definition without starting anything
    Validate {
        /// Path to the system definition (defaults to the user config dir)
        path: Option<PathBuf>,
    },

    /// Run a master with its local agents until interrupted
    Run {
        /// Path to the system definition
        path: Option<PathBuf>,
    },

    /// Run a single build and wait for its result
    Build {
        /// Project to build
        project: String,

        /// Path to the system definition
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Revision to build (latest if omitted)
        #[arg(short, long)]
        revision: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,

        /// Print the build result as JSON
        #[arg(long)]
        json: bool,
    },
}
