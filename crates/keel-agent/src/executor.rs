//! Recipe execution.
//!
//! A recipe moves through bootstrapping, its commands in order,
//! post-processing and a terminal result. Bootstrap failures are fatal and
//! no command runs. A failing command stops the recipe unless it continues
//! on error, but post-processors still see every command that ran.

use crate::config::AgentConfig;
use crate::context::ExecutionContext;
use crate::postprocess::{CommandOutput, OUTPUT_FILE, PostProcessor};
use crate::runner::{CommandContext, CommandRunner, ShellRunner, working_dir};
use keel_core::ports::ScmClient;
use keel_core::protocol::{AgentMessage, RecipeRequest};
use keel_core::result::{RecipeResult, ResultState};
use keel_core::{Error, RecipeId, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Variables set for every command.
pub const BASE_DIR_VAR: &str = "KEEL_BASE_DIR";
pub const OUTPUT_DIR_VAR: &str = "KEEL_OUTPUT_DIR";

/// Directory layout of one recipe.
#[derive(Debug, Clone)]
pub struct RecipeDirs {
    pub root: PathBuf,
    /// Source checkout and working directory.
    pub base: PathBuf,
    /// Per-command output directories.
    pub output: PathBuf,
}

impl RecipeDirs {
    pub fn new(work_dir: &Path, recipe: RecipeId) -> Self {
        let root = work_dir.join(recipe.to_string());
        Self {
            base: root.join("base"),
            output: root.join("output"),
            root,
        }
    }

    pub fn command_output(&self, index: usize, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.output.join(format!("{:02}-{}", index, safe))
    }
}

pub struct RecipeExecutor {
    work_dir: PathBuf,
    cleanup: bool,
    runner: Arc<dyn CommandRunner>,
    post_processors: Vec<Arc<dyn PostProcessor>>,
    scm: Option<Arc<dyn ScmClient>>,
}

impl RecipeExecutor {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let post_processors = config
            .post_processors
            .iter()
            .map(|p| p.build())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            work_dir: config.work_dir.clone(),
            cleanup: config.cleanup,
            runner: Arc::new(ShellRunner::new()),
            post_processors,
            scm: None,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Check sources out through `scm` when a request carries an SCM
    /// configuration.
    pub fn with_scm(mut self, scm: Arc<dyn ScmClient>) -> Self {
        self.scm = Some(scm);
        self
    }

    /// Run `request` to a terminal result. Progress and the final result are
    /// sent on `outbound`; the result is also returned.
    pub async fn execute(
        &self,
        request: RecipeRequest,
        outbound: &mpsc::Sender<AgentMessage>,
        cancel: watch::Receiver<bool>,
    ) -> RecipeResult {
        let mut result = RecipeResult::new(
            request.recipe_id,
            request.project.clone(),
            &request.recipe.name,
            request.revision.clone(),
            &request.recipe.command_names(),
        );
        result.start();
        let dirs = RecipeDirs::new(&self.work_dir, request.recipe_id);

        info!(
            recipe_id = %request.recipe_id,
            project = %request.project,
            recipe = %request.recipe.name,
            revision = %request.revision,
            "Starting recipe"
        );

        match self.bootstrap(&request, &dirs).await {
            Ok(context) => {
                send(outbound, progress(request.recipe_id, None, ResultState::InProgress)).await;
                let (outputs, cancelled) = self
                    .run_commands(&request, &dirs, &context, &mut result, outbound, cancel)
                    .await;
                self.post_process(&mut result, &outputs).await;
                if cancelled {
                    result.error = Some(Error::Cancelled.to_string());
                }
                result.complete();
            }
            Err(e) => {
                error!(recipe_id = %request.recipe_id, error = %e, "Bootstrap failed");
                result.terminate(Error::Bootstrap(e.to_string()).to_string());
            }
        }

        info!(recipe_id = %request.recipe_id, state = %result.state, "Recipe finished");
        send(
            outbound,
            AgentMessage::RecipeResult {
                recipe_id: request.recipe_id,
                status: result.state,
                commands: result.commands.clone(),
                error: result.error.clone(),
            },
        )
        .await;

        if self.cleanup {
            self.cleanup(&dirs).await;
        }
        result
    }

    async fn bootstrap(&self, request: &RecipeRequest, dirs: &RecipeDirs) -> Result<ExecutionContext> {
        fs::create_dir_all(&dirs.base).await?;
        fs::create_dir_all(&dirs.output).await?;

        if let (Some(scm), Some(config)) = (&self.scm, &request.scm) {
            debug!(location = %config.unique_location(), revision = %request.revision, "Checking out sources");
            scm.retrieve(config, &request.revision, &dirs.base).await?;
        }

        ExecutionContext::from_process(&request.resource_properties)
    }

    /// Returns each command's output directory (if it ran) and whether the
    /// recipe was cancelled.
    async fn run_commands(
        &self,
        request: &RecipeRequest,
        dirs: &RecipeDirs,
        context: &ExecutionContext,
        result: &mut RecipeResult,
        outbound: &mpsc::Sender<AgentMessage>,
        cancel: watch::Receiver<bool>,
    ) -> (Vec<Option<PathBuf>>, bool) {
        let recipe_id = request.recipe_id;
        let mut outputs = vec![None; request.recipe.commands.len()];
        let mut cancelled = false;

        for (index, definition) in request.recipe.commands.iter().enumerate() {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }

            result.commands[index].start();
            send(outbound, progress(recipe_id, Some(index), ResultState::InProgress)).await;

            let output_dir = dirs.command_output(index, &definition.name);
            outputs[index] = Some(output_dir.clone());
            let outcome = match fs::create_dir_all(&output_dir).await {
                Ok(()) => {
                    let ctx = CommandContext {
                        working_dir: working_dir(&dirs.base, definition),
                        output_file: output_dir.join(OUTPUT_FILE),
                        execution: context.with_vars([
                            (BASE_DIR_VAR, dirs.base.as_path()),
                            (OUTPUT_DIR_VAR, output_dir.as_path()),
                        ]),
                    };
                    self.runner.run(definition, &ctx, cancel.clone()).await
                }
                Err(e) => Err(e.into()),
            };

            let command = &mut result.commands[index];
            match outcome {
                Ok(outcome) if outcome.cancelled => {
                    command.complete(ResultState::Error, None);
                    command.message = Some(Error::Cancelled.to_string());
                    cancelled = true;
                }
                Ok(outcome) => {
                    let state = if outcome.success() {
                        ResultState::Success
                    } else {
                        ResultState::Failure
                    };
                    command.complete(state, outcome.exit_code);
                }
                Err(e) => {
                    warn!(command = %definition.name, error = %e, "Command could not run");
                    command.complete(ResultState::Error, None);
                    command.message = Some(e.to_string());
                }
            }
            let state = command.state;
            send(outbound, progress(recipe_id, Some(index), state)).await;

            if cancelled {
                break;
            }
            if state.is_broken() && !request.recipe.continue_on_error {
                info!(command = %definition.name, %state, "Command failed, skipping the rest");
                break;
            }
        }

        for command in &mut result.commands {
            if command.state == ResultState::Pending {
                command.state = ResultState::NotRun;
            }
        }
        (outputs, cancelled)
    }

    async fn post_process(&self, result: &mut RecipeResult, outputs: &[Option<PathBuf>]) {
        for (command, dir) in result.commands.iter_mut().zip(outputs) {
            let Some(dir) = dir else {
                continue;
            };
            let output = CommandOutput::new(dir);
            for processor in &self.post_processors {
                if let Err(e) = processor.process(&output, command).await {
                    warn!(
                        processor = %processor.name(),
                        command = %command.name,
                        error = %e,
                        "Post-processor failed"
                    );
                }
            }
        }
    }

    /// Advisory; a directory that cannot be removed is only logged.
    async fn cleanup(&self, dirs: &RecipeDirs) {
        if let Err(e) = fs::remove_dir_all(&dirs.root).await {
            warn!(path = %dirs.root.display(), error = %e, "Failed to clean up recipe directory");
        }
    }
}

fn progress(recipe_id: RecipeId, command_index: Option<usize>, status: ResultState) -> AgentMessage {
    AgentMessage::RecipeProgress {
        recipe_id,
        command_index,
        status,
    }
}

async fn send(outbound: &mpsc::Sender<AgentMessage>, message: AgentMessage) {
    if outbound.send(message).await.is_err() {
        debug!("Master link closed, message dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::PostProcessorConfig;
    use keel_core::ids::{BuildId, ProjectId};
    use keel_core::project::{CommandDefinition, RecipeDefinition};
    use keel_core::resource::ResourceProperty;
    use keel_core::revision::Revision;
    use pretty_assertions::assert_eq;

    fn config(dir: &Path) -> AgentConfig {
        AgentConfig {
            name: "test".to_string(),
            work_dir: dir.to_path_buf(),
            cleanup: false,
            post_processors: vec![PostProcessorConfig::Regex {
                name: "errors".to_string(),
                patterns: vec!["^error".to_string()],
                fail_on_match: false,
            }],
            ..AgentConfig::default()
        }
    }

    fn request(commands: Vec<CommandDefinition>, continue_on_error: bool) -> RecipeRequest {
        RecipeRequest {
            recipe_id: RecipeId::new(),
            build_id: BuildId::new(),
            project: ProjectId::new("demo"),
            stage: "default".to_string(),
            recipe: RecipeDefinition {
                name: "build".to_string(),
                commands,
                continue_on_error,
            },
            revision: Revision::new("r1"),
            resource_properties: vec![],
            scm: None,
        }
    }

    async fn run(
        executor: &RecipeExecutor,
        request: RecipeRequest,
    ) -> (RecipeResult, Vec<AgentMessage>) {
        let (tx, mut rx) = mpsc::channel(64);
        let (_cancel_tx, cancel) = watch::channel(false);
        let result = executor.execute(request, &tx, cancel).await;
        drop(tx);
        let mut messages = Vec::new();
        while let Some(m) = rx.recv().await {
            messages.push(m);
        }
        (result, messages)
    }

    #[tokio::test]
    async fn test_failure_skips_rest_but_post_processes() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecipeExecutor::new(&config(dir.path())).unwrap();
        let request = request(
            vec![
                CommandDefinition::shell("compile", "echo 'error: boom'; exit 2"),
                CommandDefinition::shell("test", "echo never"),
            ],
            false,
        );

        let (result, messages) = run(&executor, request).await;

        assert_eq!(result.state, ResultState::Failure);
        assert_eq!(result.commands[0].state, ResultState::Failure);
        assert_eq!(result.commands[0].exit_code, Some(2));
        assert_eq!(result.commands[1].state, ResultState::NotRun);
        assert_eq!(result.commands[0].features, vec!["error: boom".to_string()]);
        assert!(matches!(
            messages.last(),
            Some(AgentMessage::RecipeResult { status: ResultState::Failure, .. })
        ));
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_every_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecipeExecutor::new(&config(dir.path())).unwrap();
        let request = request(
            vec![
                CommandDefinition::shell("lint", "exit 1"),
                CommandDefinition::shell("test", "true"),
            ],
            true,
        );

        let (result, _) = run(&executor, request).await;

        assert_eq!(result.commands[1].state, ResultState::Success);
        assert_eq!(result.state, ResultState::Failure);
    }

    #[tokio::test]
    async fn test_unresolved_property_fails_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecipeExecutor::new(&config(dir.path())).unwrap();
        let mut request = request(vec![CommandDefinition::shell("compile", "true")], false);
        request.resource_properties =
            vec![ResourceProperty::new("X", "${NOPE}").unwrap().with_resolve_variables(true)];

        let (result, messages) = run(&executor, request).await;

        assert_eq!(result.state, ResultState::Error);
        assert_eq!(result.commands[0].state, ResultState::NotRun);
        assert!(result.error.unwrap().contains("NOPE"));
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_properties_reach_command_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.post_processors = vec![PostProcessorConfig::Regex {
            name: "value".to_string(),
            patterns: vec!["^value=".to_string()],
            fail_on_match: false,
        }];
        let executor = RecipeExecutor::new(&config).unwrap();
        let mut request = request(
            vec![CommandDefinition::shell("show", "echo value=$TOOL_HOME")],
            false,
        );
        request.resource_properties = vec![
            ResourceProperty::new("ROOT", "/opt").unwrap(),
            ResourceProperty::new("TOOL_HOME", "${ROOT}/tool")
                .unwrap()
                .with_resolve_variables(true)
                .with_add_to_environment(true),
        ];

        let (result, _) = run(&executor, request).await;

        assert_eq!(result.state, ResultState::Success);
        assert_eq!(result.commands[0].features, vec!["value=/opt/tool".to_string()]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_recipe_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cleanup = true;
        let executor = RecipeExecutor::new(&config).unwrap();
        let request = request(vec![CommandDefinition::shell("touch", "touch file")], false);
        let root = RecipeDirs::new(dir.path(), request.recipe_id).root;

        let (result, _) = run(&executor, request).await;

        assert_eq!(result.state, ResultState::Success);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecipeExecutor::new(&config(dir.path())).unwrap();
        let request = request(vec![CommandDefinition::shell("compile", "true")], false);
        let (tx, _rx) = mpsc::channel(64);
        let (_cancel_tx, cancel) = watch::channel(true);

        let result = executor.execute(request, &tx, cancel).await;

        assert_eq!(result.state, ResultState::Error);
        assert_eq!(result.commands[0].state, ResultState::NotRun);
        assert_eq!(result.error.as_deref(), Some("Recipe cancelled"));
    }
}
