use git_deploy_hook::external::{GitCli, Pm2, SystemShell};
use git_deploy_hook::logging::{FileLogger, setup_logging};
use git_deploy_hook::{DaemonConfig, Orchestrator, load_config, orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "deploy_hook.toml";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenv::dotenv().ok();

    let config_path = PathBuf::from(
        std::env::var("HOOK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );

    let config: DaemonConfig = match load_config(&config_path) {
        Ok(cfg) => cfg.with_overrides(|key| std::env::var(key).ok()),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let file_logger = config
        .log_dir
        .clone()
        .map(|dir| FileLogger::new(dir).with_max_files(config.max_log_files));
    let _log_guard = match setup_logging(file_logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging error: {}", e);
            std::process::exit(1);
        }
    };

    info!("Using config at {:?}", config_path);

    let state = Arc::new(Orchestrator::new(
        config.clone(),
        Arc::new(Pm2::new(config.pm2_bin.clone(), config.poll_interval())),
        Arc::new(GitCli::new(config.git_bin.clone())),
        Arc::new(SystemShell::new(config.shell.clone())),
    ));

    let mut lifecycle = orchestrator::spawn(state.clone());

    tokio::select! {
        result = &mut lifecycle => match result {
            Ok(Ok(())) => info!("Process manager stream closed"),
            Ok(Err(e)) => error!("Could not follow process manager: {}", e),
            Err(e) => error!("Lifecycle task panicked: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    state.shutdown().await;
}
