use std::io;

/// Error type for git_deploy_hook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authentication mismatch: {0}")]
    AuthenticationMismatch(String),

    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Fetch failed in '{cwd}'\n{message}")]
    Fetch { cwd: String, message: String },

    #[error("Hook command '{command}' failed\n{message}")]
    HookExecution { command: String, message: String },

    #[error("Restart of '{name}' failed\n{message}")]
    Restart { name: String, message: String },

    #[error("Unsupported deploy type '{0}'")]
    UnsupportedDeployType(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Process manager error: {0}")]
    ProcessManager(String),

    #[error("Could not bind listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Helper type for Results that use HookError
pub type Result<T> = std::result::Result<T, HookError>;
