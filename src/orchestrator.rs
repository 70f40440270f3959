//! Owns the registry and the listener pool and keeps them in step with
//! process lifecycle events.

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::external::{
    LifecycleEvent, LifecycleKind, ProcessInfo, ProcessManager, ShellRunner, VersionControl,
};
use crate::listener::ListenerPool;
use crate::matcher::{InboundRequest, MatchOutcome, match_request};
use crate::pipeline::{Deployer, PipelineReport};
use crate::registry::{HookRegistration, HookRegistry};
use crate::{DaemonConfig, SharedState};

/// What happened to one inbound request
pub struct RequestReport {
    pub outcomes: Vec<(String, MatchOutcome)>,
    /// One pipeline run per accepted registration.
    pub runs: Vec<JoinHandle<Option<PipelineReport>>>,
}

pub struct Orchestrator {
    pub config: DaemonConfig,
    registry: RwLock<HookRegistry>,
    listeners: Mutex<ListenerPool>,
    processes: Arc<dyn ProcessManager>,
    deployer: Arc<Deployer>,
}

impl Orchestrator {
    pub fn new(
        config: DaemonConfig,
        processes: Arc<dyn ProcessManager>,
        vcs: Arc<dyn VersionControl>,
        shell: Arc<dyn ShellRunner>,
    ) -> Self {
        let deployer = Deployer::new(processes.clone(), vcs, shell)
            .with_settle_delay(config.settle_delay())
            .with_admin_segment(config.admin_segment.clone())
            .with_serialized_runs(config.serialize_deploys);

        Self {
            listeners: Mutex::new(ListenerPool::new(config.bind_host.clone())),
            registry: RwLock::new(HookRegistry::new()),
            processes,
            deployer: Arc::new(deployer),
            config,
        }
    }

    /// Stores `registration` and makes sure its port is served.
    ///
    /// A listener that fails to bind is logged; the registration is kept.
    pub async fn register(self: &Arc<Self>, registration: HookRegistration) -> Result<()> {
        let name = registration.name.clone();
        let registered = self.registry.write().await.register(registration)?;

        let mut listeners = self.listeners.lock().await;
        if let Some(old) = registered.released_port {
            listeners.close_server(old);
        }
        if let Err(e) = listeners.ensure_server(registered.port, self.clone()).await {
            error!(app = %name, "Error occurred while creating server: {}", e);
        }

        info!(app = %name, port = registered.port, "Webhook registered");
        Ok(())
    }

    /// Drops the registration and closes its port once nothing else uses it.
    pub async fn unregister(&self, name: &str) -> bool {
        let Some(removed) = self.registry.write().await.unregister(name) else {
            return false;
        };

        if removed.last_reference {
            self.listeners.lock().await.close_server(removed.port);
        }
        info!(app = %name, port = removed.port, "Webhook removed");
        true
    }

    /// Registers every process of a startup snapshot that carries a usable
    /// webhook configuration. Returns how many were registered.
    pub async fn bulk_load(self: &Arc<Self>, processes: Vec<ProcessInfo>) -> usize {
        info!("Found {} processes", processes.len());
        let mut loaded = 0;

        for proc in processes {
            let Some(env) = proc.webhook.as_ref() else {
                info!(app = %proc.name, "No webhook configuration, skipping");
                continue;
            };

            let registration = match HookRegistration::from_env(&proc.name, env) {
                Ok(r) => r,
                Err(e) => {
                    warn!(app = %proc.name, "Skipping webhook: {}", e);
                    continue;
                }
            };

            match self.register(registration).await {
                Ok(()) => loaded += 1,
                Err(e) => warn!(app = %proc.name, "Skipping webhook: {}", e),
            }
        }

        loaded
    }

    pub async fn handle_lifecycle_event(self: &Arc<Self>, event: LifecycleEvent) {
        match event.kind {
            LifecycleKind::Online => {
                if self.registry.read().await.contains(&event.name) {
                    return;
                }
                let Some(env) = event.webhook.as_ref() else {
                    return;
                };
                let result = match HookRegistration::from_env(&event.name, env) {
                    Ok(registration) => self.register(registration).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(app = %event.name, "Webhook not registered: {}", e);
                }
            }
            LifecycleKind::Exit => {
                self.unregister(&event.name).await;
            }
        }
    }

    /// Loads the current process list, then follows lifecycle events until the
    /// process manager stops sending them.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let snapshot = self.processes.list_processes().await?;
        let loaded = self.bulk_load(snapshot).await;
        info!("Start webhook! {} application(s) registered", loaded);

        let mut events = self.processes.subscribe_lifecycle_events();
        while let Some(event) = events.next().await {
            self.handle_lifecycle_event(event).await;
        }

        warn!("Lifecycle event stream ended");
        Ok(())
    }

    /// Matches `request` against the registrations on its port and starts a
    /// pipeline for every accepted one.
    pub async fn process_request(self: &Arc<Self>, request: InboundRequest) -> RequestReport {
        let candidates = self.registry.read().await.on_port(request.port);
        let matched = match_request(&candidates, self.processes.as_ref(), &request).await;

        let mut outcomes = Vec::with_capacity(matched.len());
        let mut runs = Vec::new();

        for (registration, outcome) in matched {
            if outcome.is_accepted() {
                runs.push(self.dispatch(registration.clone()));
            }
            outcomes.push((registration.name, outcome));
        }

        RequestReport { outcomes, runs }
    }

    fn dispatch(&self, registration: HookRegistration) -> JoinHandle<Option<PipelineReport>> {
        let deployer = self.deployer.clone();
        tokio::spawn(async move {
            match deployer.deploy(&registration).await {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(app = %registration.name, "Deployment not started: {}", e);
                    None
                }
            }
        })
    }

    pub async fn registration(&self, name: &str) -> Option<HookRegistration> {
        self.registry.read().await.get(name).cloned()
    }

    pub async fn registrations(&self) -> Vec<HookRegistration> {
        self.registry.read().await.iter().cloned().collect()
    }

    pub async fn listening_ports(&self) -> Vec<u16> {
        self.listeners.lock().await.ports()
    }

    pub async fn shutdown(&self) {
        self.listeners.lock().await.close_all();
    }
}

/// Spawns [`Orchestrator::run`] and returns its handle.
pub fn spawn(state: SharedState) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { state.run().await })
}
