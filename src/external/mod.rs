//! Collaborators the daemon drives but does not own: the process manager,
//! version control and the shell used for pre/post hooks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::error::Result;
use crate::registry::WebhookEnv;

pub mod git;
pub mod pm2;
pub mod shell;

pub use git::GitCli;
pub use pm2::Pm2;
pub use shell::SystemShell;

/// One managed process as reported by the process manager
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessInfo {
    pub name: String,
    pub status: String,
    pub cwd: Option<PathBuf>,
    /// Branch the working copy is checked out on.
    pub branch: Option<String>,
    pub webhook: Option<WebhookEnv>,
}

impl ProcessInfo {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Online,
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub name: String,
    pub kind: LifecycleKind,
    pub webhook: Option<WebhookEnv>,
}

#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Fails with `ApplicationNotFound` when no process has this name.
    async fn describe(&self, name: &str) -> Result<ProcessInfo>;

    /// Fails with `Restart` when the manager reports an error.
    async fn restart(&self, name: &str) -> Result<()>;

    fn subscribe_lifecycle_events(&self) -> ReceiverStream<LifecycleEvent>;
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Brings the working copy at `cwd` up to date with its remote branch.
    async fn update(&self, cwd: &Path) -> Result<()>;
}

/// Captured result of a shell command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Runs `command` through a shell in `cwd`. Only spawn failures are errors.
    async fn run(&self, command: &str, cwd: &Path) -> Result<ShellOutput>;
}

/// Spawns `program args..` and waits for it, logging the invocation.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> std::io::Result<Output> {
    match cwd {
        Some(dir) => info!("Running (cwd = '{}'): {} {}", dir.display(), program, args.join(" ")),
        None => info!("Running: {} {}", program, args.join(" ")),
    }

    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.output().await
}
