use core::fmt::Debug;
use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use eyre::Result;
use itertools::Itertools;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::error::ExecError;

/// A fully resolved external process run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// `args[0]` is the program.
    pub args: Vec<String>,
    /// Replaces the inherited environment entirely.
    pub env: BTreeMap<String, String>,
    pub dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Shell-like rendering, for logs and `print`.
    pub fn command_line(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(self.args.iter().cloned())
            .join(" ")
    }
}

/// Runs an [`Invocation`] to completion and hands back its standard output.
///
/// Exit codes are not inspected; output that does not parse is the caller's error.
#[async_trait::async_trait]
pub trait Executor: Debug + Send + Sync {
    async fn exec(&self, invocation: &Invocation) -> Result<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait::async_trait]
impl Executor for SystemExecutor {
    async fn exec(&self, invocation: &Invocation) -> Result<String> {
        simple_command_with_output(invocation).await
    }
}

pub async fn simple_command_with_output(invocation: &Invocation) -> Result<String> {
    let (program, args) = invocation
        .args
        .split_first()
        .ok_or(ExecError::EmptyCommand)?;
    debug!("dir={:?} cmd={}", invocation.dir, invocation.command_line());

    let child = Command::new(program)
        .args(args)
        .env_clear()
        .envs(&invocation.env)
        .current_dir(&invocation.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    let output = match invocation.timeout {
        Some(limit) => timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                program: program.clone(),
                timeout: limit,
            })??,
        None => child.wait_with_output().await?,
    };
    debug!("{program} exited with {}", output.status);
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
