use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::ProcessError;

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// A fully specified command to execute without a shell, unless the
/// workflow explicitly enabled one.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    /// Per-stream capture limit in bytes.
    pub output_limit: usize,
}

impl ProcessCommand {
    /// Build from an authored command line.
    ///
    /// Without `allow_shell` the line is split by a safe tokenizer and run
    /// directly; with it, the line is handed to `sh -c` and shell features
    /// (pipes, globs) work.
    pub fn from_command_line(line: &str, allow_shell: bool) -> Result<Self, ProcessError> {
        let (program, args) = if allow_shell {
            ("sh".to_string(), vec!["-c".to_string(), line.to_string()])
        } else {
            let mut tokens =
                shell_words::split(line).map_err(|e| ProcessError::Tokenize(e.to_string()))?;
            if tokens.is_empty() {
                return Err(ProcessError::Tokenize("empty command".into()));
            }
            let program = tokens.remove(0);
            (program, tokens)
        };
        Ok(Self {
            program,
            args,
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
            stdin: None,
            output_limit: crate::workflow::DEFAULT_OUTPUT_LIMIT,
        })
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Cap a captured stream at `limit` bytes on a char boundary, marking the
/// cut explicitly.
pub fn truncate_stream(text: &str, limit: usize) -> (String, bool) {
    if text.len() <= limit {
        return (text.to_string(), false);
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (format!("{}{}", &text[..cut], TRUNCATION_MARKER), true)
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;
}

pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();
        debug!("executing subprocess: {}", command.display());

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        if command.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Dropping the wait future on timeout must not leak the child.
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.program.clone())
            } else {
                ProcessError::Io(e)
            }
        })?;

        if let Some(stdin_data) = &command.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                stdin
                    .write_all(stdin_data.as_bytes())
                    .await
                    .map_err(ProcessError::Io)?;
                stdin.shutdown().await.map_err(ProcessError::Io)?;
            }
        }

        let output = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result.map_err(ProcessError::Io)?,
                Err(_) => {
                    warn!(
                        "subprocess timed out after {:?}: {}",
                        limit,
                        command.display()
                    );
                    return Err(ProcessError::Timeout(limit));
                }
            },
            None => child.wait_with_output().await.map_err(ProcessError::Io)?,
        };

        let duration = start.elapsed();
        let status = if output.status.success() {
            ExitStatus::Success
        } else if let Some(code) = output.status.code() {
            ExitStatus::Error(code)
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match output.status.signal() {
                    Some(signal) => ExitStatus::Signal(signal),
                    None => ExitStatus::Error(1),
                }
            }
            #[cfg(not(unix))]
            {
                ExitStatus::Error(1)
            }
        };

        let (stdout, stdout_truncated) = truncate_stream(
            &String::from_utf8_lossy(&output.stdout),
            command.output_limit,
        );
        let (stderr, stderr_truncated) = truncate_stream(
            &String::from_utf8_lossy(&output.stderr),
            command.output_limit,
        );

        match &status {
            ExitStatus::Success => {
                debug!(
                    "subprocess completed in {:?}: {}",
                    duration,
                    command.display()
                )
            }
            ExitStatus::Error(code) => {
                warn!(
                    "subprocess failed with exit code {code} in {:?}: {}",
                    duration,
                    command.display()
                )
            }
            ExitStatus::Signal(signal) => {
                warn!("subprocess terminated by signal {signal}: {}", command.display())
            }
            ExitStatus::Timeout => {}
        }

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            duration,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenized_command_line() {
        let cmd = ProcessCommand::from_command_line("cargo test --lib", false).unwrap();
        assert_eq!(cmd.program, "cargo");
        assert_eq!(cmd.args, vec!["test", "--lib"]);
    }

    #[test]
    fn test_quoted_arguments_survive_tokenization() {
        let cmd = ProcessCommand::from_command_line("/bin/echo \"ok then\"", false).unwrap();
        assert_eq!(cmd.args, vec!["ok then"]);
    }

    #[test]
    fn test_shell_mode_wraps_in_sh() {
        let cmd = ProcessCommand::from_command_line("ls | wc -l", true).unwrap();
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c", "ls | wc -l"]);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(ProcessCommand::from_command_line("  ", false).is_err());
    }

    #[test]
    fn test_truncation_marker() {
        let (text, truncated) = truncate_stream("abcdefgh", 4);
        assert!(truncated);
        assert_eq!(text, format!("abcd{TRUNCATION_MARKER}"));
        let (text, truncated) = truncate_stream("short", 100);
        assert!(!truncated);
        assert_eq!(text, "short");
    }

    #[tokio::test]
    async fn test_run_success() {
        let runner = TokioProcessRunner;
        let cmd = ProcessCommand::from_command_line("/bin/echo ok", false).unwrap();
        let output = runner.run(cmd).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_run_failure_code() {
        let runner = TokioProcessRunner;
        let cmd = ProcessCommand::from_command_line("/bin/false", false).unwrap();
        let output = runner.run(cmd).await.unwrap();
        assert_eq!(output.status, ExitStatus::Error(1));
    }

    #[tokio::test]
    async fn test_run_timeout_kills_child() {
        let runner = TokioProcessRunner;
        let mut cmd = ProcessCommand::from_command_line("/bin/sleep 30", false).unwrap();
        cmd.timeout = Some(Duration::from_millis(50));
        let err = runner.run(cmd).await.unwrap_err();
        assert!(matches!(err, ProcessError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let runner = TokioProcessRunner;
        let cmd =
            ProcessCommand::from_command_line("/definitely/not/a/real/binary", false).unwrap();
        assert!(matches!(
            runner.run(cmd).await.unwrap_err(),
            ProcessError::CommandNotFound(_)
        ));
    }
}
