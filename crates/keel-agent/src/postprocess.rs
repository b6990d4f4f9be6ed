//! Post-processors: inspect what a command left behind and annotate its
//! result.

use async_trait::async_trait;
use keel_core::result::{CommandResult, ResultState};
use keel_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

/// File name of a command's captured output inside its output directory.
pub const OUTPUT_FILE: &str = "output.txt";

/// What a post-processor gets to look at for one command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Directory holding the captured output and any artifacts the command
    /// wrote.
    pub dir: PathBuf,
}

impl CommandOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn output_file(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }
}

#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    /// Annotate `result`. The output may be partial or missing if the
    /// command failed early.
    async fn process(&self, output: &CommandOutput, result: &mut CommandResult) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostProcessorConfig {
    Regex {
        #[serde(default = "default_regex_name")]
        name: String,
        patterns: Vec<String>,
        /// Turn a successful command into a failure when a pattern matches.
        #[serde(default)]
        fail_on_match: bool,
    },
    Artifacts,
}

fn default_regex_name() -> String {
    "regex".to_string()
}

impl PostProcessorConfig {
    pub fn build(&self) -> Result<Arc<dyn PostProcessor>> {
        Ok(match self {
            PostProcessorConfig::Regex {
                name,
                patterns,
                fail_on_match,
            } => Arc::new(RegexPostProcessor::new(name, patterns, *fail_on_match)?),
            PostProcessorConfig::Artifacts => Arc::new(ArtifactCollector),
        })
    }
}

/// Records every output line matching one of its patterns as a feature.
pub struct RegexPostProcessor {
    name: String,
    patterns: Vec<Regex>,
    fail_on_match: bool,
}

impl RegexPostProcessor {
    pub fn new(name: &str, patterns: &[String], fail_on_match: bool) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    Error::InvalidConfiguration(format!("post-processor '{}': {}", name, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            patterns,
            fail_on_match,
        })
    }
}

#[async_trait]
impl PostProcessor for RegexPostProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, output: &CommandOutput, result: &mut CommandResult) -> Result<()> {
        let text = match tokio::fs::read_to_string(output.output_file()).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let before = result.features.len();
        result.features.extend(
            text.lines()
                .filter(|line| self.patterns.iter().any(|p| p.is_match(line)))
                .map(str::to_string),
        );
        let matched = result.features.len() - before;
        debug!(processor = %self.name, command = %result.name, matched, "Scanned output");

        if matched > 0 && self.fail_on_match && result.state == ResultState::Success {
            result.state = ResultState::Failure;
            result.message = Some(format!("{} line(s) matched '{}'", matched, self.name));
        }
        Ok(())
    }
}

/// Lists the files a command left in its output directory.
pub struct ArtifactCollector;

#[async_trait]
impl PostProcessor for ArtifactCollector {
    fn name(&self) -> &str {
        "artifacts"
    }

    async fn process(&self, output: &CommandOutput, result: &mut CommandResult) -> Result<()> {
        let dir = output.dir.clone();
        let found = tokio::task::spawn_blocking(move || collect(&dir))
            .await
            .map_err(|e| Error::Internal(format!("artifact scan panicked: {}", e)))??;
        result.artifacts.extend(found);
        Ok(())
    }
}

fn collect(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if relative == Path::new(OUTPUT_FILE) {
            continue;
        }
        found.push(relative.to_string_lossy().replace('\\', "/"));
    }
    Ok(found)
}
