//! Deployment pipeline: an ordered list of stages run over one
//! [`DeploymentContext`], stopping at the first failure.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{HookError, Result};
use crate::external::{ProcessManager, ShellRunner, VersionControl};
use crate::registry::{DeployType, HookRegistration};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_ADMIN_SEGMENT: &str = "admin";

/// Derives the administrative counterpart of an application.
///
/// `segment` goes right after the first `-` separated component:
/// `myapp-api` becomes `myapp-admin-api`, `svc` becomes `svc-admin`.
pub fn admin_name(app_name: &str, segment: &str) -> String {
    let mut parts: Vec<&str> = app_name.split('-').collect();
    parts.insert(1, segment);
    parts.join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ResolveWorkingDirectory,
    Fetch,
    PreHook,
    RestartPrimary,
    Settle,
    RestartAdmin,
    PostHook,
    Complete,
}

/// Every run walks these in order.
pub const STAGES: [Stage; 8] = [
    Stage::ResolveWorkingDirectory,
    Stage::Fetch,
    Stage::PreHook,
    Stage::RestartPrimary,
    Stage::Settle,
    Stage::RestartAdmin,
    Stage::PostHook,
    Stage::Complete,
];

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolveWorkingDirectory => "resolve_cwd",
            Stage::Fetch => "fetch",
            Stage::PreHook => "pre_hook",
            Stage::RestartPrimary => "restart_primary",
            Stage::Settle => "settle",
            Stage::RestartAdmin => "restart_admin",
            Stage::PostHook => "post_hook",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum PipelineState {
    Pending,
    Running(Stage),
    Succeeded,
    Failed { stage: Stage, error: HookError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Done,
    /// Conditional stage with nothing configured.
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub duration: Duration,
}

/// Per-run values. Built when a request is accepted, dropped when the run ends.
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    pub app_name: String,
    pub admin_name: String,
    /// Resolved by the first stage of every run.
    pub working_directory: Option<PathBuf>,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
}

impl DeploymentContext {
    pub fn new(registration: &HookRegistration, admin_segment: &str) -> Self {
        Self {
            app_name: registration.name.clone(),
            admin_name: admin_name(&registration.name, admin_segment),
            working_directory: None,
            pre_hook: registration.pre_hook.clone(),
            post_hook: registration.post_hook.clone(),
        }
    }

    fn cwd(&self) -> Result<&Path> {
        self.working_directory.as_deref().ok_or_else(|| {
            HookError::ApplicationNotFound(format!(
                "working directory of '{}' is not resolved",
                self.app_name
            ))
        })
    }
}

/// Outcome of one pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub app_name: String,
    pub state: PipelineState,
    pub stages: Vec<StageRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineReport {
    fn new(app_name: &str) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            app_name: app_name.to_string(),
            state: PipelineState::Pending,
            stages: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn mark_running(&mut self, stage: Stage) {
        self.state = PipelineState::Running(stage);
    }

    fn record(&mut self, stage: Stage, outcome: StageOutcome, duration: Duration) {
        self.stages.push(StageRecord {
            stage,
            outcome,
            duration,
        });
    }

    fn mark_success(&mut self) {
        self.state = PipelineState::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    fn mark_failed(&mut self, stage: Stage, error: HookError) {
        self.state = PipelineState::Failed { stage, error };
        self.completed_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state, PipelineState::Succeeded)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self.state {
            PipelineState::Failed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&HookError> {
        match &self.state {
            PipelineState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Runs pipelines against the external collaborators.
pub struct Deployer {
    processes: Arc<dyn ProcessManager>,
    vcs: Arc<dyn VersionControl>,
    shell: Arc<dyn ShellRunner>,
    settle_delay: Duration,
    admin_segment: String,
    /// Present when runs of the same application must not overlap.
    run_locks: Option<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Deployer {
    pub fn new(
        processes: Arc<dyn ProcessManager>,
        vcs: Arc<dyn VersionControl>,
        shell: Arc<dyn ShellRunner>,
    ) -> Self {
        Self {
            processes,
            vcs,
            shell,
            settle_delay: DEFAULT_SETTLE_DELAY,
            admin_segment: DEFAULT_ADMIN_SEGMENT.to_string(),
            run_locks: None,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_admin_segment(mut self, segment: impl Into<String>) -> Self {
        self.admin_segment = segment.into();
        self
    }

    pub fn with_serialized_runs(mut self, serialize: bool) -> Self {
        self.run_locks = serialize.then(|| Mutex::new(HashMap::new()));
        self
    }

    /// Dispatches on the registration's deploy type.
    ///
    /// Unknown types are refused without running any stage.
    pub async fn deploy(&self, registration: &HookRegistration) -> Result<PipelineReport> {
        match &registration.deploy_type {
            DeployType::PullAndRestart => {}
            DeployType::Unknown(raw) => {
                warn!(
                    app = %registration.name,
                    "Deploy type '{}' is not supported, ignoring webhook", raw
                );
                return Err(HookError::UnsupportedDeployType(raw.clone()));
            }
        }

        let app_lock = match &self.run_locks {
            Some(locks) => Some(
                locks
                    .lock()
                    .await
                    .entry(registration.name.clone())
                    .or_default()
                    .clone(),
            ),
            None => None,
        };
        let _guard = match &app_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut ctx = DeploymentContext::new(registration, &self.admin_segment);
        Ok(self.run(&mut ctx).await)
    }

    /// Walks [`STAGES`] in order over `ctx`.
    pub async fn run(&self, ctx: &mut DeploymentContext) -> PipelineReport {
        let mut report = PipelineReport::new(&ctx.app_name);
        info!(app = %ctx.app_name, run_id = %report.run_id, "Starting deployment pipeline");

        for stage in STAGES {
            report.mark_running(stage);
            let started = Instant::now();

            match self.run_stage(stage, ctx).await {
                Ok(outcome) => {
                    let elapsed = started.elapsed();
                    info!(
                        app = %ctx.app_name,
                        %stage,
                        ?outcome,
                        duration_ms = elapsed.as_millis() as u64,
                        "Stage finished"
                    );
                    report.record(stage, outcome, elapsed);
                }
                Err(e) => {
                    let elapsed = started.elapsed();
                    error!(
                        app = %ctx.app_name,
                        %stage,
                        duration_ms = elapsed.as_millis() as u64,
                        "Deployment failed: {}", e
                    );
                    report.record(stage, StageOutcome::Failed, elapsed);
                    report.mark_failed(stage, e);
                    return report;
                }
            }
        }

        report.mark_success();
        report
    }

    async fn run_stage(&self, stage: Stage, ctx: &mut DeploymentContext) -> Result<StageOutcome> {
        match stage {
            Stage::ResolveWorkingDirectory => {
                let info = self.processes.describe(&ctx.app_name).await?;
                let cwd = info.cwd.ok_or_else(|| {
                    HookError::ApplicationNotFound(format!(
                        "'{}' has no working directory",
                        ctx.app_name
                    ))
                })?;
                info!(app = %ctx.app_name, "Working directory {}", cwd.display());
                ctx.working_directory = Some(cwd);
                Ok(StageOutcome::Done)
            }
            Stage::Fetch => {
                self.vcs.update(ctx.cwd()?).await?;
                info!(app = %ctx.app_name, "Pulled latest source");
                Ok(StageOutcome::Done)
            }
            Stage::PreHook => self.run_hook(ctx.pre_hook.as_deref(), ctx).await,
            Stage::RestartPrimary => {
                self.processes.restart(&ctx.app_name).await?;
                info!(app = %ctx.app_name, "Restarted application");
                Ok(StageOutcome::Done)
            }
            Stage::Settle => {
                tokio::time::sleep(self.settle_delay).await;
                Ok(StageOutcome::Done)
            }
            Stage::RestartAdmin => {
                self.processes.restart(&ctx.admin_name).await?;
                info!(app = %ctx.app_name, "Restarted admin counterpart '{}'", ctx.admin_name);
                Ok(StageOutcome::Done)
            }
            Stage::PostHook => self.run_hook(ctx.post_hook.as_deref(), ctx).await,
            Stage::Complete => {
                info!(app = %ctx.app_name, "Deployment completed, waiting for new webhook");
                Ok(StageOutcome::Done)
            }
        }
    }

    async fn run_hook(&self, command: Option<&str>, ctx: &DeploymentContext) -> Result<StageOutcome> {
        let Some(command) = command else {
            return Ok(StageOutcome::Skipped);
        };

        let hook_error = |message: String| HookError::HookExecution {
            command: command.to_string(),
            message,
        };

        let output = self
            .shell
            .run(command, ctx.cwd()?)
            .await
            .map_err(|e| hook_error(format!("failed to start: {}", e)))?;

        if !output.success() {
            return Err(hook_error(format!(
                "exit code {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        info!(app = %ctx.app_name, "Hook '{}' executed", command);
        Ok(StageOutcome::Done)
    }
}
