//! In-memory collaborators that record every call, in order, to one shared log.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{HookError, Result};
use crate::external::{
    LifecycleEvent, ProcessInfo, ProcessManager, ShellOutput, ShellRunner, VersionControl,
};
use crate::registry::WebhookEnv;

pub type CallLog = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Default)]
pub struct FakeProcessManager {
    pub calls: CallLog,
    processes: Arc<Mutex<HashMap<String, ProcessInfo>>>,
    failing_restarts: Arc<Mutex<HashSet<String>>>,
    events: Arc<Mutex<Option<mpsc::Sender<LifecycleEvent>>>>,
}

impl FakeProcessManager {
    pub fn new(calls: CallLog) -> Self {
        Self {
            calls,
            ..Default::default()
        }
    }

    pub fn add_process(&self, name: &str, cwd: &str, branch: &str, webhook: Option<WebhookEnv>) {
        self.processes.lock().unwrap().insert(
            name.to_string(),
            ProcessInfo {
                name: name.to_string(),
                status: "online".to_string(),
                cwd: Some(PathBuf::from(cwd)),
                branch: Some(branch.to_string()),
                webhook,
            },
        );
    }

    pub fn insert(&self, info: ProcessInfo) {
        self.processes.lock().unwrap().insert(info.name.clone(), info);
    }

    pub fn fail_restart_of(&self, name: &str) {
        self.failing_restarts.lock().unwrap().insert(name.to_string());
    }

    /// Waits for a subscriber, then delivers `event`.
    pub async fn emit(&self, event: LifecycleEvent) {
        for _ in 0..200 {
            let tx = self.events.lock().unwrap().clone();
            if let Some(tx) = tx {
                tx.send(event).await.unwrap();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no lifecycle subscriber");
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut procs: Vec<_> = self.processes.lock().unwrap().values().cloned().collect();
        procs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(procs)
    }

    async fn describe(&self, name: &str) -> Result<ProcessInfo> {
        self.record(format!("describe {}", name));
        self.processes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| HookError::ApplicationNotFound(name.to_string()))
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.record(format!("restart {}", name));
        let known = self.processes.lock().unwrap().contains_key(name);
        if !known || self.failing_restarts.lock().unwrap().contains(name) {
            return Err(HookError::Restart {
                name: name.to_string(),
                message: "process name not found".to_string(),
            });
        }
        Ok(())
    }

    fn subscribe_lifecycle_events(&self) -> ReceiverStream<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(16);
        *self.events.lock().unwrap() = Some(tx);
        ReceiverStream::new(rx)
    }
}

#[derive(Clone, Default)]
pub struct FakeVcs {
    pub calls: CallLog,
    pub fail: bool,
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn update(&self, cwd: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("update {}", cwd.display()));
        if self.fail {
            return Err(HookError::Fetch {
                cwd: cwd.display().to_string(),
                message: "CONFLICT (content): merge conflict".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeShell {
    pub calls: CallLog,
    /// Commands that exit with status 1.
    pub failing: HashSet<String>,
}

#[async_trait]
impl ShellRunner for FakeShell {
    async fn run(&self, command: &str, cwd: &Path) -> Result<ShellOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("shell {} in {}", command, cwd.display()));
        let exit_code = if self.failing.contains(command) { 1 } else { 0 };
        Ok(ShellOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "command failed".to_string()
            },
        })
    }
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}
