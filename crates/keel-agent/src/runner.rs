//! Command execution on the host.

use crate::context::ExecutionContext;
use async_trait::async_trait;
use keel_core::project::{CommandDefinition, CommandSpec};
use keel_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Output line from a running command.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Where a command runs and where its output goes.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub working_dir: PathBuf,
    /// Combined stdout and stderr are written here, one line at a time.
    pub output_file: PathBuf,
    pub execution: ExecutionContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` if the process was killed by a signal or cancelled.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub cancelled: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion, or until `cancel` turns true, in which
    /// case the process is killed.
    ///
    /// A non-zero exit is an `Ok` outcome; `Err` means the command could
    /// not be run at all.
    async fn run(
        &self,
        command: &CommandDefinition,
        ctx: &CommandContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<CommandOutcome>;
}

/// Runs shell scripts through `sh -c` and programs directly.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(spec: &CommandSpec) -> Command {
        match spec {
            CommandSpec::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            CommandSpec::Exec { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

async fn write_output(path: PathBuf, mut lines: mpsc::Receiver<OutputLine>) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(&path).await?);
    while let Some(line) = lines.recv().await {
        if line.stream == OutputStream::Stderr {
            out.write_all(b"[stderr] ").await?;
        }
        out.write_all(line.content.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    out.flush().await
}

fn stream_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(content)) = lines.next_line().await {
            if tx.send(OutputLine { stream, content }).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &CommandDefinition,
        ctx: &CommandContext,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<CommandOutcome> {
        let start = std::time::Instant::now();
        info!(
            command = %command.name,
            working_dir = %ctx.working_dir.display(),
            "Executing command"
        );

        let mut child = Self::command(&command.run)
            .current_dir(&ctx.working_dir)
            .env_clear()
            .envs(ctx.execution.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: command.name.clone(),
                message: format!("failed to spawn: {}", e),
            })?;

        let (tx, rx) = mpsc::channel(256);
        let writer = tokio::spawn(write_output(ctx.output_file.clone(), rx));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(stream_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(stream_lines(stderr, OutputStream::Stderr, tx));
        }

        let mut cancelled = *cancel.borrow();
        let status = if cancelled {
            None
        } else {
            loop {
                tokio::select! {
                    status = child.wait() => break Some(status),
                    changed = cancel.changed() => {
                        // A dropped sender can no longer cancel.
                        if changed.is_ok() && *cancel.borrow() {
                            cancelled = true;
                            break None;
                        }
                        if changed.is_err() {
                            break Some(child.wait().await);
                        }
                    }
                }
            }
        };

        if cancelled {
            warn!(command = %command.name, "Command cancelled, killing process");
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Process already exited");
            }
        }

        for reader in readers {
            // Grandchildren of a killed shell may still hold the pipes open.
            if cancelled {
                reader.abort();
            }
            let _ = reader.await;
        }
        match writer.await {
            Ok(Err(e)) => warn!(path = %ctx.output_file.display(), error = %e, "Failed to write command output"),
            Err(e) => warn!(error = %e, "Output writer task failed"),
            Ok(Ok(())) => {}
        }

        let exit_code = match status {
            Some(status) => status
                .map_err(|e| Error::CommandFailed {
                    command: command.name.clone(),
                    message: format!("failed to wait for process: {}", e),
                })?
                .code(),
            None => None,
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(command = %command.name, ?exit_code, duration_ms, "Command finished");

        Ok(CommandOutcome {
            exit_code,
            duration_ms,
            cancelled,
        })
    }
}

/// Resolve a command's working directory against the recipe base.
pub fn working_dir(base: &Path, command: &CommandDefinition) -> PathBuf {
    match &command.working_dir {
        Some(dir) => base.join(dir),
        None => base.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(dir: &Path) -> CommandContext {
        CommandContext {
            working_dir: dir.to_path_buf(),
            output_file: dir.join("output.txt"),
            execution: ExecutionContext::from_process(&[]).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_output_captured_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (_tx, rx) = watch::channel(false);

        let outcome = ShellRunner::new()
            .run(&CommandDefinition::shell("hello", "echo hello"), &ctx, rx)
            .await
            .unwrap();

        assert!(outcome.success());
        let output = std::fs::read_to_string(&ctx.output_file).unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_outcome_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);

        let outcome = ShellRunner::new()
            .run(&CommandDefinition::shell("fail", "exit 3"), &context(dir.path()), rx)
            .await
            .unwrap();

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (tx, rx) = watch::channel(false);

        let run = tokio::spawn(async move {
            ShellRunner::new()
                .run(&CommandDefinition::shell("sleep", "sleep 30"), &ctx, rx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        let command = CommandDefinition {
            name: "missing".to_string(),
            run: CommandSpec::Exec {
                program: "definitely-not-a-real-program".to_string(),
                args: vec![],
            },
            working_dir: None,
        };

        let err = ShellRunner::new()
            .run(&command, &context(dir.path()), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }
}
