/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! External-process plumbing
//!
//! Two entry points: [`run_command`] for single tool invocations (sqlite3,
//! psql, pg_restore) and [`run_pipeline_to_file`] for the two-stage
//! `dump | compressor > file` pipeline. Both stages of a pipeline are
//! awaited at a single combined point so a failure of either half is
//! observed deterministically, with stderr captured from both. Every
//! invocation carries its own timeout.

use crate::error::{BackupError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

/// One external command: program, arguments and private environment.
#[derive(Debug, Clone)]
pub struct Stage {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl Stage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Environment passed to the child only, never echoed into argv.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line for error reporting. Environment
    /// values (passwords) are not included.
    pub fn describe(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Captured output of a successful single-command run.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// stderr from both halves of a completed pipeline.
#[derive(Debug)]
pub struct PipelineOutput {
    pub producer_stderr: String,
    pub consumer_stderr: String,
    pub output_bytes: u64,
}

/// Run one external command to completion, enforcing `timeout`.
/// Non-zero exit surfaces the captured stderr verbatim.
pub async fn run_command(stage: &Stage, timeout: Duration) -> Result<CommandOutput> {
    debug!(command = %stage.describe(), "spawning external process");

    let mut cmd = stage.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = cmd.spawn().map_err(|e| BackupError::ExternalProcess {
        command: stage.describe(),
        stderr: format!("failed to spawn: {e}"),
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| BackupError::Timeout {
            command: stage.describe(),
            seconds: timeout.as_secs(),
        })??;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(BackupError::ExternalProcess {
            command: stage.describe(),
            stderr,
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

/// Run `producer | consumer > output_path` as one unit of work.
///
/// The producer's stdout is streamed into the consumer through a bounded
/// in-process copy; the consumer's stdout goes straight to the output
/// file. Failure of either stage, a transport error on the pipe, a
/// timeout, or an empty/missing output file all abort the operation.
pub async fn run_pipeline_to_file(
    producer: &Stage,
    consumer: &Stage,
    output_path: &Path,
    timeout: Duration,
) -> Result<PipelineOutput> {
    debug!(
        producer = %producer.describe(),
        consumer = %consumer.describe(),
        output = %output_path.display(),
        "spawning pipeline"
    );

    let output_file = std::fs::File::create(output_path)?;

    let mut producer_cmd = producer.command();
    producer_cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut producer_child = producer_cmd.spawn().map_err(|e| BackupError::ExternalProcess {
        command: producer.describe(),
        stderr: format!("failed to spawn: {e}"),
    })?;

    let mut consumer_cmd = consumer.command();
    consumer_cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::from(output_file))
        .stderr(Stdio::piped());
    let mut consumer_child = consumer_cmd.spawn().map_err(|e| BackupError::ExternalProcess {
        command: consumer.describe(),
        stderr: format!("failed to spawn: {e}"),
    })?;

    let pipe_missing = |what: &str| BackupError::ExternalProcess {
        command: format!("{} | {}", producer.describe(), consumer.describe()),
        stderr: format!("{what} pipe was not attached"),
    };
    let mut producer_stdout = producer_child
        .stdout
        .take()
        .ok_or_else(|| pipe_missing("producer stdout"))?;
    let mut consumer_stdin = consumer_child
        .stdin
        .take()
        .ok_or_else(|| pipe_missing("consumer stdin"))?;
    let mut producer_stderr = producer_child
        .stderr
        .take()
        .ok_or_else(|| pipe_missing("producer stderr"))?;
    let mut consumer_stderr = consumer_child
        .stderr
        .take()
        .ok_or_else(|| pipe_missing("consumer stderr"))?;

    // Single combined wait point: transport copy, both exits, both stderr
    // streams, all raced against one timeout.
    let joined = async {
        let copy = async {
            let copied = tokio::io::copy(&mut producer_stdout, &mut consumer_stdin).await;
            // Close the consumer's stdin so it can finish and flush.
            let _ = consumer_stdin.shutdown().await;
            drop(consumer_stdin);
            copied
        };
        let producer_err = async {
            let mut buf = String::new();
            let _ = producer_stderr.read_to_string(&mut buf).await;
            buf
        };
        let consumer_err = async {
            let mut buf = String::new();
            let _ = consumer_stderr.read_to_string(&mut buf).await;
            buf
        };
        let (copied, producer_stderr_text, consumer_stderr_text) =
            tokio::join!(copy, producer_err, consumer_err);
        let producer_status = producer_child.wait().await;
        let consumer_status = consumer_child.wait().await;
        (
            copied,
            producer_status,
            consumer_status,
            producer_stderr_text,
            consumer_stderr_text,
        )
    };

    let (copied, producer_status, consumer_status, producer_stderr_text, consumer_stderr_text) =
        tokio::time::timeout(timeout, joined)
            .await
            .map_err(|_| BackupError::Timeout {
                command: format!("{} | {}", producer.describe(), consumer.describe()),
                seconds: timeout.as_secs(),
            })?;

    let producer_status = producer_status?;
    let consumer_status = consumer_status?;

    if !producer_status.success() {
        return Err(BackupError::ExternalProcess {
            command: producer.describe(),
            stderr: producer_stderr_text,
        });
    }
    if !consumer_status.success() {
        return Err(BackupError::ExternalProcess {
            command: consumer.describe(),
            stderr: consumer_stderr_text,
        });
    }
    if let Err(e) = copied {
        return Err(BackupError::ExternalProcess {
            command: format!("{} | {}", producer.describe(), consumer.describe()),
            stderr: format!("pipe transport error: {e}"),
        });
    }

    // A clean exit with no bytes written is still a failure.
    let output_bytes = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);
    if output_bytes == 0 {
        let _ = std::fs::remove_file(output_path);
        return Err(BackupError::TruncatedOutput {
            path: output_path.to_path_buf(),
        });
    }

    Ok(PipelineOutput {
        producer_stderr: producer_stderr_text,
        consumer_stderr: consumer_stderr_text,
        output_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn short() -> Duration {
        Duration::from_secs(10)
    }

    #[tokio::test]
    async fn run_command_captures_stdout() {
        let stage = Stage::new("echo").arg("hello");
        let out = run_command(&stage, short()).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_command_surfaces_nonzero_exit() {
        let stage = Stage::new("sh").arg("-c").arg("echo boom >&2; exit 3");
        match run_command(&stage, short()).await {
            Err(BackupError::ExternalProcess { stderr, .. }) => {
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected ExternalProcess, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let stage = Stage::new("sleep").arg("30");
        match run_command(&stage, Duration::from_millis(100)).await {
            Err(BackupError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pipeline_writes_compressed_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.gz");
        let producer = Stage::new("echo").arg("pipeline payload");
        let consumer = Stage::new("gzip").arg("-9");
        let result = run_pipeline_to_file(&producer, &consumer, &out, short())
            .await
            .unwrap();
        assert!(result.output_bytes > 0);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn pipeline_fails_when_producer_fails() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.gz");
        let producer = Stage::new("sh").arg("-c").arg("echo dumpfail >&2; exit 1");
        let consumer = Stage::new("gzip").arg("-1");
        match run_pipeline_to_file(&producer, &consumer, &out, short()).await {
            Err(BackupError::ExternalProcess { stderr, .. }) => {
                assert!(stderr.contains("dumpfail"));
            }
            other => panic!("expected ExternalProcess, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pipeline_fails_when_consumer_fails() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.gz");
        let producer = Stage::new("echo").arg("data");
        let consumer = Stage::new("sh").arg("-c").arg("cat >/dev/null; echo zipfail >&2; exit 2");
        match run_pipeline_to_file(&producer, &consumer, &out, short()).await {
            Err(BackupError::ExternalProcess { stderr, .. }) => {
                assert!(stderr.contains("zipfail"));
            }
            other => panic!("expected ExternalProcess, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_output_is_a_failure_even_on_clean_exit() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.gz");
        let producer = Stage::new("true");
        let consumer = Stage::new("cat");
        match run_pipeline_to_file(&producer, &consumer, &out, short()).await {
            Err(BackupError::TruncatedOutput { .. }) => {}
            other => panic!("expected TruncatedOutput, got {other:?}"),
        }
        assert!(!out.exists());
    }
}
