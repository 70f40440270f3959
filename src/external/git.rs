use async_trait::async_trait;
use std::path::Path;
use tracing::{error, info};

use super::{VersionControl, run_command};
use crate::error::{HookError, Result};

/// Updates working copies with the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    bin: String,
}

impl GitCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn update(&self, cwd: &Path) -> Result<()> {
        let fetch_error = |message: String| HookError::Fetch {
            cwd: cwd.display().to_string(),
            message,
        };

        let pull = run_command(&self.bin, &["pull"], Some(cwd))
            .await
            .map_err(|e| {
                error!("git pull failed to start: {}", e);
                fetch_error(format!("git pull failed to start: {}", e))
            })?;

        if !pull.status.success() {
            let msg = format!("git pull failed: {}", String::from_utf8_lossy(&pull.stderr));
            error!("{}", msg);
            return Err(fetch_error(msg));
        }

        info!("git pull output:\n{}", String::from_utf8_lossy(&pull.stdout));
        Ok(())
    }
}
