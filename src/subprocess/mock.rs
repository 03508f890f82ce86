//! In-memory process runner for tests.

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// A scripted result the mock runner will hand back, in order.
#[derive(Debug, Clone)]
pub struct MockProcessResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl MockProcessResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::Success,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: ExitStatus::Error(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Default)]
pub struct MockProcessRunner {
    script: Mutex<VecDeque<MockProcessResult>>,
    commands: Mutex<Vec<String>>,
}

impl MockProcessRunner {
    pub fn with_script(results: impl IntoIterator<Item = MockProcessResult>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.commands.lock().expect("mock runner lock").clone()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.commands
            .lock()
            .expect("mock runner lock")
            .push(command.display());
        let next = self
            .script
            .lock()
            .expect("mock runner lock")
            .pop_front()
            .unwrap_or_else(|| MockProcessResult::ok(""));
        Ok(ProcessOutput {
            status: next.status,
            stdout: next.stdout,
            stderr: next.stderr,
            duration: Duration::from_millis(1),
            stdout_truncated: false,
            stderr_truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_results_in_order() {
        let runner = MockProcessRunner::with_script([
            MockProcessResult::fail(1, "boom"),
            MockProcessResult::ok("fine"),
        ]);
        let cmd = ProcessCommand::from_command_line("/bin/x", false).unwrap();
        let first = runner.run(cmd.clone()).await.unwrap();
        assert!(!first.success());
        assert_eq!(first.stderr, "boom");
        let second = runner.run(cmd).await.unwrap();
        assert!(second.success());
        assert_eq!(runner.commands_run().len(), 2);
    }
}
