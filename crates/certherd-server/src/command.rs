//! Narrow subprocess capability used for every remote operation (host key
//! scans, transfers, remote execution, the renewal tool). Trait-object so
//! tests never spawn real processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::Error;

/// Exit status plus captured stdout+stderr of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, bounded by `timeout`.
    ///
    /// A non-zero exit is reported as `Ok` with `success == false`; `Err` is
    /// reserved for spawn failures and timeouts.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, Error>;
}

/// Production runner over `tokio::process`.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, Error> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Err(_) => Err(Error::CommandTimeout {
                program: program.to_owned(),
                seconds: timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(Error::CommandSpawn {
                program: program.to_owned(),
                source: e,
            }),
            Ok(Ok(output)) => {
                let combined = String::from_utf8_lossy(&output.stdout).to_string()
                    + &String::from_utf8_lossy(&output.stderr);
                Ok(CommandOutput {
                    success: output.status.success(),
                    output: combined.trim().to_string(),
                })
            }
        }
    }
}
