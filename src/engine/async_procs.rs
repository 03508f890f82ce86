//! Registry of RUN-ASYNC child processes.
//!
//! Async runs execute out-of-band; RUN-WAIT reaps one by handle, and
//! session teardown reaps everything still pending so no child outlives
//! the engine.

use crate::error::{Error, Result};
use crate::subprocess::{ProcessError, ProcessOutput};
use crate::workflow::{OutputPolicy, RunStep};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::warn;

pub struct AsyncProcess {
    pub command: String,
    pub output_policy: OutputPolicy,
    join: JoinHandle<std::result::Result<ProcessOutput, ProcessError>>,
}

#[derive(Default)]
pub struct AsyncRegistry {
    pending: HashMap<String, AsyncProcess>,
}

impl AsyncRegistry {
    /// Derive the handle name for an async RUN at a step position.
    pub fn handle_name(run: &RunStep, step_index: usize) -> String {
        run.handle
            .clone()
            .unwrap_or_else(|| format!("run-{step_index}"))
    }

    pub fn register(
        &mut self,
        name: String,
        command: String,
        output_policy: OutputPolicy,
        join: JoinHandle<std::result::Result<ProcessOutput, ProcessError>>,
    ) -> Result<()> {
        if self.pending.contains_key(&name) {
            return Err(Error::Validation(format!(
                "async handle {name:?} is already in use"
            )));
        }
        self.pending.insert(
            name,
            AsyncProcess {
                command,
                output_policy,
                join,
            },
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Block until the named process finishes.
    pub async fn wait(
        &mut self,
        name: &str,
    ) -> Result<(AsyncProcessInfo, std::result::Result<ProcessOutput, ProcessError>)> {
        let process = self
            .pending
            .remove(name)
            .ok_or_else(|| Error::Validation(format!("no async run with handle {name:?}")))?;
        let info = AsyncProcessInfo {
            command: process.command,
            output_policy: process.output_policy,
        };
        let result = process
            .join
            .await
            .map_err(|e| Error::Internal(format!("async run task panicked: {e}")))?;
        Ok((info, result))
    }

    /// Teardown: abort everything still pending. `kill_on_drop` on the
    /// spawned children ensures the processes die with their tasks.
    pub fn reap_all(&mut self) -> usize {
        let count = self.pending.len();
        for (name, process) in self.pending.drain() {
            warn!("reaping unwaited async run {name:?} ({})", process.command);
            process.join.abort();
        }
        count
    }
}

#[derive(Debug, Clone)]
pub struct AsyncProcessInfo {
    pub command: String,
    pub output_policy: OutputPolicy,
}

impl Drop for AsyncRegistry {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.reap_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::{ProcessCommand, ProcessRunner, TokioProcessRunner};

    fn spawn(command: &str) -> JoinHandle<std::result::Result<ProcessOutput, ProcessError>> {
        let cmd = ProcessCommand::from_command_line(command, false).unwrap();
        tokio::spawn(async move { TokioProcessRunner.run(cmd).await })
    }

    #[test]
    fn test_handle_name_default() {
        let run = RunStep::new("/bin/true");
        assert_eq!(AsyncRegistry::handle_name(&run, 4), "run-4");
        let named = RunStep {
            handle: Some("bg".into()),
            ..RunStep::new("/bin/true")
        };
        assert_eq!(AsyncRegistry::handle_name(&named, 4), "bg");
    }

    #[tokio::test]
    async fn test_register_and_wait() {
        let mut registry = AsyncRegistry::default();
        registry
            .register(
                "bg".into(),
                "/bin/echo done".into(),
                OutputPolicy::Always,
                spawn("/bin/echo done"),
            )
            .unwrap();
        let (info, result) = registry.wait("bg").await.unwrap();
        assert_eq!(info.command, "/bin/echo done");
        assert!(result.unwrap().success());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_handle_rejected() {
        let mut registry = AsyncRegistry::default();
        registry
            .register("bg".into(), "a".into(), OutputPolicy::Never, spawn("/bin/true"))
            .unwrap();
        assert!(registry
            .register("bg".into(), "b".into(), OutputPolicy::Never, spawn("/bin/true"))
            .is_err());
        registry.reap_all();
    }

    #[tokio::test]
    async fn test_wait_unknown_handle() {
        let mut registry = AsyncRegistry::default();
        assert!(registry.wait("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_reap_all_aborts_pending() {
        let mut registry = AsyncRegistry::default();
        registry
            .register(
                "slow".into(),
                "/bin/sleep 60".into(),
                OutputPolicy::Never,
                spawn("/bin/sleep 60"),
            )
            .unwrap();
        assert_eq!(registry.reap_all(), 1);
        assert!(registry.is_empty());
    }
}
