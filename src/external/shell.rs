use async_trait::async_trait;
use std::path::Path;

use super::{ShellOutput, ShellRunner, run_command};
use crate::error::Result;

/// Runs hook commands through `<shell> -c`.
#[derive(Debug, Clone)]
pub struct SystemShell {
    shell: String,
}

impl SystemShell {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for SystemShell {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl ShellRunner for SystemShell {
    async fn run(&self, command: &str, cwd: &Path) -> Result<ShellOutput> {
        let output = run_command(&self.shell, &["-c", command], Some(cwd)).await?;
        Ok(ShellOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
