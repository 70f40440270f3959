//! pm2 adapter built on the `pm2` command line.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::{LifecycleEvent, LifecycleKind, ProcessInfo, ProcessManager, run_command};
use crate::error::{HookError, Result};
use crate::registry::WebhookEnv;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
}

#[derive(Debug, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    pm_cwd: Option<PathBuf>,
    #[serde(default)]
    versioning: Option<JlistVersioning>,
    /// Validated per process by [`webhook_env`].
    #[serde(default)]
    env_webhook: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JlistVersioning {
    #[serde(default)]
    branch: Option<String>,
}

impl From<JlistEntry> for ProcessInfo {
    fn from(entry: JlistEntry) -> Self {
        let env = entry.pm2_env;
        let (status, cwd, branch, webhook) = match env {
            Some(env) => (
                env.status.unwrap_or_default(),
                env.pm_cwd,
                env.versioning.and_then(|v| v.branch),
                env.env_webhook.and_then(|raw| webhook_env(&entry.name, raw)),
            ),
            None => (String::new(), None, None, None),
        };

        ProcessInfo {
            name: entry.name,
            status,
            cwd,
            branch,
            webhook,
        }
    }
}

fn webhook_env(name: &str, raw: Value) -> Option<WebhookEnv> {
    match serde_json::from_value(raw) {
        Ok(env) => Some(env),
        Err(e) => {
            warn!(app = %name, "Ignoring malformed env_webhook: {}", e);
            None
        }
    }
}

/// Parses the JSON printed by `pm2 jlist`.
///
/// Only output that is not a JSON array is an error. Entries that do not
/// have the expected shape are logged and skipped.
pub fn parse_jlist(raw: &[u8]) -> Result<Vec<ProcessInfo>> {
    let entries: Vec<Value> = serde_json::from_slice(raw)
        .map_err(|e| HookError::ProcessManager(format!("could not parse pm2 jlist: {}", e)))?;

    let processes = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<JlistEntry>(entry) {
            Ok(entry) => Some(ProcessInfo::from(entry)),
            Err(e) => {
                warn!("Skipping malformed pm2 process entry: {}", e);
                None
            }
        })
        .collect();
    Ok(processes)
}

/// Computes lifecycle events between two polls of the process list.
///
/// `online` holds the names seen online at the previous poll and is updated in place.
pub fn diff_online(online: &mut HashSet<String>, processes: &[ProcessInfo]) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    let mut now_online = HashSet::new();

    for proc in processes.iter().filter(|p| p.is_online()) {
        now_online.insert(proc.name.clone());
        if !online.contains(&proc.name) {
            events.push(LifecycleEvent {
                name: proc.name.clone(),
                kind: LifecycleKind::Online,
                webhook: proc.webhook.clone(),
            });
        }
    }

    let mut gone: Vec<_> = online.difference(&now_online).cloned().collect();
    gone.sort();
    events.extend(gone.into_iter().map(|name| LifecycleEvent {
        name,
        kind: LifecycleKind::Exit,
        webhook: None,
    }));

    *online = now_online;
    events
}

/// Process manager backed by the pm2 CLI.
///
/// Lifecycle events are produced by polling `pm2 jlist`.
#[derive(Debug, Clone)]
pub struct Pm2 {
    bin: String,
    poll_interval: Duration,
}

impl Pm2 {
    pub fn new(bin: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            bin: bin.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl ProcessManager for Pm2 {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let output = run_command(&self.bin, &["jlist"], None)
            .await
            .map_err(|e| HookError::ProcessManager(format!("pm2 jlist failed to start: {}", e)))?;

        if !output.status.success() {
            return Err(HookError::ProcessManager(format!(
                "pm2 jlist failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        parse_jlist(&output.stdout)
    }

    async fn describe(&self, name: &str) -> Result<ProcessInfo> {
        self.list_processes()
            .await?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| HookError::ApplicationNotFound(name.to_string()))
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let output = run_command(&self.bin, &["restart", name], None)
            .await
            .map_err(|e| HookError::Restart {
                name: name.to_string(),
                message: format!("pm2 failed to start: {}", e),
            })?;

        if !output.status.success() {
            return Err(HookError::Restart {
                name: name.to_string(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    fn subscribe_lifecycle_events(&self) -> ReceiverStream<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pm2 = self.clone();

        tokio::spawn(async move {
            info!("Polling pm2 every {:?} for lifecycle events", pm2.poll_interval);
            let mut online = HashSet::new();
            let mut ticker = tokio::time::interval(pm2.poll_interval);

            loop {
                ticker.tick().await;
                let processes = match pm2.list_processes().await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Could not poll pm2: {}", e);
                        continue;
                    }
                };

                for event in diff_online(&mut online, &processes) {
                    debug!("pm2 lifecycle event: {:?} {}", event.kind, event.name);
                    if tx.send(event).await.is_err() {
                        error!("Lifecycle subscriber dropped, stopping pm2 poller");
                        return;
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }
}
