//! One HTTP listener per port referenced by a registration.

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State as AxumState, rejection::BytesRejection},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::IntoResponse,
};
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::error::{HookError, Result};
use crate::matcher::InboundRequest;

pub const ACKNOWLEDGMENT: &str = concat!("Received by ", env!("CARGO_PKG_NAME"));

#[derive(Clone)]
struct ListenerState {
    state: SharedState,
    port: u16,
}

/// Router served on `port`: every method and path gets the same acknowledgment.
pub fn router(state: SharedState, port: u16) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .fallback(acknowledge)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ListenerState { state, port })
}

fn acknowledgment() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        ACKNOWLEDGMENT,
    )
}

/// Answers 200 straight away and hands POST requests to the matcher in the background.
async fn acknowledge(
    AxumState(listener): AxumState<ListenerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> impl IntoResponse {
    if method != Method::POST {
        debug!(port = listener.port, "Ignoring {} {}", method, uri);
        return acknowledgment();
    }

    let body = match body {
        Ok(body) => body,
        Err(e) => {
            warn!(port = listener.port, "Dropping {} {}: {}", method, uri, e);
            return acknowledgment();
        }
    };

    // Registration paths are compared against the path alone, without the query.
    let request = InboundRequest {
        port: listener.port,
        path: uri.path().to_string(),
        headers,
        body,
    };
    let state = listener.state.clone();
    tokio::spawn(async move {
        state.process_request(request).await;
    });

    acknowledgment()
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Live listeners keyed by port
pub struct ListenerPool {
    bind_host: String,
    servers: HashMap<u16, ServerHandle>,
}

impl ListenerPool {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            servers: HashMap::new(),
        }
    }

    /// Binds `port` unless a listener already runs there. Returns true when a
    /// new listener was started.
    ///
    /// The server task is detached and never keeps the daemon from exiting.
    pub async fn ensure_server(&mut self, port: u16, state: SharedState) -> Result<bool> {
        if self.is_listening(port) {
            return Ok(false);
        }

        let listener = TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|source| HookError::Bind { port, source })?;
        info!("Create server on {}:{}", self.bind_host, port);

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = router(state, port);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    signal.await.ok();
                })
                .await;
            if let Err(e) = served {
                error!(port, "Server stopped with error: {}", e);
            }
        });

        self.servers.insert(port, ServerHandle { shutdown, task });
        Ok(true)
    }

    /// Stops the listener on `port` if there is one. Failures are only logged.
    pub fn close_server(&mut self, port: u16) -> bool {
        let Some(handle) = self.servers.remove(&port) else {
            return false;
        };

        info!("Remove server on port {}", port);
        if handle.task.is_finished() || handle.shutdown.send(()).is_err() {
            warn!(port, "Error occurred while removing server: listener already stopped");
        }
        true
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.servers.contains_key(&port)
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<_> = self.servers.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn close_all(&mut self) {
        for port in self.ports() {
            self.close_server(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CallLog, FakeProcessManager, FakeShell, FakeVcs, calls};
    use crate::registry::{DeployType, HookRegistration};
    use crate::signature::{SIGNATURE_HEADER, expected_signature};
    use crate::{DaemonConfig, Orchestrator};
    use serde_json::json;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(log: &CallLog) -> SharedState {
        state_with(
            log,
            DaemonConfig {
                bind_host: "127.0.0.1".to_string(),
                ..Default::default()
            },
        )
    }

    fn state_with(log: &CallLog, config: DaemonConfig) -> SharedState {
        let pm = FakeProcessManager::new(log.clone());
        pm.add_process("app-web", "/srv/app-web", "main", None);
        pm.add_process("app-admin-web", "/srv/app-web", "main", None);
        Arc::new(Orchestrator::new(
            config,
            Arc::new(pm),
            Arc::new(FakeVcs {
                calls: log.clone(),
                fail: false,
            }),
            Arc::new(FakeShell {
                calls: log.clone(),
                ..Default::default()
            }),
        ))
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn get_is_acknowledged_and_ignored() {
        let log = CallLog::default();
        let app = router(state(&log), 9000);

        let response = app
            .oneshot(Request::get("/whatever").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], ACKNOWLEDGMENT.as_bytes());

        tokio::task::yield_now().await;
        assert!(calls(&log).is_empty());
    }

    #[tokio::test]
    async fn post_with_garbage_is_still_acknowledged() {
        let log = CallLog::default();
        let app = router(state(&log), 9000);

        let response = app
            .oneshot(
                Request::post("/hook")
                    .body(Body::from("not json at all"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], ACKNOWLEDGMENT.as_bytes());
    }

    fn push_body(branch: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "push": { "changes": [ { "new": { "name": branch } } ] }
        }))
        .unwrap()
    }

    async fn wait_for_calls(log: &CallLog, expected: &[&str]) -> Vec<String> {
        for _ in 0..100 {
            let seen = calls(log);
            if expected.iter().all(|e| seen.iter().any(|c| c == e)) {
                return seen;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        calls(log)
    }

    #[tokio::test(start_paused = true)]
    async fn signed_post_starts_a_deployment() {
        let log = CallLog::default();
        let state = state(&log);
        let port = free_port();
        state
            .register(HookRegistration {
                name: "app-web".to_string(),
                port,
                path: "/hook".to_string(),
                secret: "s3cr3t".to_string(),
                deploy_type: DeployType::PullAndRestart,
                pre_hook: None,
                post_hook: None,
            })
            .await
            .unwrap();

        let body = push_body("main");
        let response = router(state.clone(), port)
            .oneshot(
                Request::post("/hook?source=bitbucket")
                    .header(SIGNATURE_HEADER, expected_signature("s3cr3t", &body))
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = wait_for_calls(&log, &["restart app-web", "restart app-admin-web"]).await;
        assert!(seen.contains(&"update /srv/app-web".to_string()));
        assert!(seen.contains(&"restart app-web".to_string()));
        assert!(seen.contains(&"restart app-admin-web".to_string()));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn large_post_is_acknowledged() {
        let log = CallLog::default();
        let app = router(state(&log), 9000);

        let response = app
            .oneshot(
                Request::post("/hook")
                    .body(Body::from(vec![b'x'; 3 * 1024 * 1024]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], ACKNOWLEDGMENT.as_bytes());
    }

    #[tokio::test]
    async fn body_over_limit_is_acknowledged_and_dropped() {
        let log = CallLog::default();
        let app = router(
            state_with(
                &log,
                DaemonConfig {
                    bind_host: "127.0.0.1".to_string(),
                    max_body_bytes: 1024,
                    ..Default::default()
                },
            ),
            9000,
        );

        for request in [
            Request::post("/hook").body(Body::from(vec![b'x'; 4096])),
            Request::get("/hook").body(Body::from(vec![b'x'; 4096])),
        ] {
            let response = app.clone().oneshot(request.unwrap()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], ACKNOWLEDGMENT.as_bytes());
        }

        tokio::task::yield_now().await;
        assert!(calls(&log).is_empty());
    }

    #[tokio::test]
    async fn ensure_and_close_are_idempotent() {
        let log = CallLog::default();
        let state = state(&log);
        let port = free_port();
        let mut pool = ListenerPool::new("127.0.0.1");

        assert!(pool.ensure_server(port, state.clone()).await.unwrap());
        assert!(!pool.ensure_server(port, state.clone()).await.unwrap());
        assert_eq!(pool.ports(), vec![port]);

        assert!(pool.close_server(port));
        assert!(!pool.close_server(port));
        assert!(!pool.is_listening(port));
    }

    #[tokio::test]
    async fn closed_port_can_be_bound_again() {
        let log = CallLog::default();
        let state = state(&log);
        let port = free_port();
        let mut pool = ListenerPool::new("127.0.0.1");

        pool.ensure_server(port, state.clone()).await.unwrap();
        pool.close_server(port);

        let mut rebound = false;
        for _ in 0..50 {
            if pool.ensure_server(port, state.clone()).await.is_ok() {
                rebound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(rebound);
        pool.close_all();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let log = CallLog::default();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let mut pool = ListenerPool::new("127.0.0.1");

        let err = pool.ensure_server(port, state(&log)).await.unwrap_err();
        assert!(matches!(err, HookError::Bind { port: p, .. } if p == port));
        assert!(!pool.is_listening(port));
    }
}
