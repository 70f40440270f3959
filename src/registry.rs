//! Webhook registrations keyed by application name

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{HookError, Result};

/// Ports at or below this value are privileged and rejected.
pub const MIN_PORT_EXCLUSIVE: u16 = 1024;

const DEFAULT_DEPLOY_TYPE: &str = "pullAndRestart";

/// Raw webhook settings as found in a process's `env_webhook` metadata.
///
/// Every field is optional here; validation happens in
/// [`HookRegistration::from_env`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WebhookEnv {
    /// Either a JSON number or a numeric string.
    pub port: Option<Value>,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub deploy_type: Option<String>,
    pub secret: Option<String>,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
}

impl WebhookEnv {
    /// Reads the port the same way for numbers and strings ("9000", " 9000 ").
    pub fn parse_port(&self) -> Result<u16> {
        let raw = self
            .port
            .as_ref()
            .ok_or_else(|| HookError::InvalidConfiguration("missing webhook port".to_string()))?;

        let parsed = match raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };

        let port = parsed.ok_or_else(|| {
            HookError::InvalidConfiguration(format!("malformed webhook port {}", raw))
        })?;

        if port <= MIN_PORT_EXCLUSIVE as u64 {
            return Err(HookError::InvalidConfiguration(format!(
                "port must be greater than {}, got {}",
                MIN_PORT_EXCLUSIVE, port
            )));
        }

        u16::try_from(port).map_err(|_| {
            HookError::InvalidConfiguration(format!("port {} is out of range", port))
        })
    }
}

/// Deployment strategy of a registration.
///
/// Unrecognised values are kept verbatim so they can be reported at dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeployType {
    #[default]
    PullAndRestart,
    Unknown(String),
}

impl DeployType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" | DEFAULT_DEPLOY_TYPE => DeployType::PullAndRestart,
            other => DeployType::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for DeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployType::PullAndRestart => f.write_str(DEFAULT_DEPLOY_TYPE),
            DeployType::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Stored webhook configuration for one managed application.
#[derive(Debug, Clone, PartialEq)]
pub struct HookRegistration {
    pub name: String,
    pub port: u16,
    /// Empty matches any request path.
    pub path: String,
    /// Empty disables signature verification.
    pub secret: String,
    pub deploy_type: DeployType,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

impl HookRegistration {
    /// Validates raw webhook settings and fills in defaults.
    pub fn from_env(name: &str, env: &WebhookEnv) -> Result<Self> {
        let port = env.parse_port()?;

        Ok(Self {
            name: name.to_string(),
            port,
            path: env.path.clone().unwrap_or_default(),
            secret: env.secret.clone().unwrap_or_default(),
            deploy_type: DeployType::parse(env.deploy_type.as_deref().unwrap_or_default()),
            pre_hook: non_empty(&env.pre_hook),
            post_hook: non_empty(&env.post_hook),
        })
    }

    pub fn requires_signature(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn matches_path(&self, request_path: &str) -> bool {
        self.path.is_empty() || self.path == request_path
    }
}

/// Result of storing a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    /// Port that now needs a listener.
    pub port: u16,
    /// Port left without any registration after an overwrite moved the app.
    pub released_port: Option<u16>,
}

/// Result of removing a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistered {
    pub port: u16,
    /// True when no other registration still references `port`.
    pub last_reference: bool,
}

/// At most one registration per application name.
///
/// Iteration order is by application name.
#[derive(Debug, Default, Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<String, HookRegistration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or overwrites the registration for `registration.name`.
    pub fn register(&mut self, registration: HookRegistration) -> Result<Registered> {
        if registration.port <= MIN_PORT_EXCLUSIVE {
            return Err(HookError::InvalidConfiguration(format!(
                "port must be greater than {}, got {}",
                MIN_PORT_EXCLUSIVE, registration.port
            )));
        }

        let port = registration.port;
        let previous = self.hooks.insert(registration.name.clone(), registration);

        let released_port = previous
            .map(|p| p.port)
            .filter(|old| *old != port && !self.is_port_referenced(*old));

        Ok(Registered {
            port,
            released_port,
        })
    }

    pub fn unregister(&mut self, name: &str) -> Option<Unregistered> {
        let removed = self.hooks.remove(name)?;
        Some(Unregistered {
            port: removed.port,
            last_reference: !self.is_port_referenced(removed.port),
        })
    }

    pub fn get(&self, name: &str) -> Option<&HookRegistration> {
        self.hooks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn is_port_referenced(&self, port: u16) -> bool {
        self.hooks.values().any(|h| h.port == port)
    }

    /// Registrations listening on `port`, cloned so callers can drop any lock.
    pub fn on_port(&self, port: u16) -> Vec<HookRegistration> {
        self.hooks
            .values()
            .filter(|h| h.port == port)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HookRegistration> {
        self.hooks.values()
    }
}
