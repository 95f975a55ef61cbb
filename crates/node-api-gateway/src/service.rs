//! Gateway service: owns the listeners and their shutdown.

use crate::domain::config::GatewayConfig;
use crate::domain::error::ServiceError;
use crate::middleware::GatewayMetrics;
use crate::node::{NodeConnector, SessionManager};
use crate::rest::{self, AppState};
use crate::rpc;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use jsonrpsee::server::{Server, ServerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// How long `shutdown` waits for each HTTP server to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct HttpServer {
    name: &'static str,
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Addresses the running service is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub api: Option<SocketAddr>,
    pub metrics: Option<SocketAddr>,
    pub rpc: Option<SocketAddr>,
}

pub struct GatewayService {
    config: GatewayConfig,
    state: AppState,
    http: Vec<HttpServer>,
    rpc: Option<(SocketAddr, ServerHandle)>,
}

impl GatewayService {
    /// Validate `config` and resolve the node target. Nothing is bound yet.
    pub fn new(config: GatewayConfig, connector: Arc<dyn NodeConnector>) -> Result<Self, ServiceError> {
        config.validate()?;
        let metrics = Arc::new(GatewayMetrics::new());
        let sessions = Arc::new(SessionManager::new(&config.node, connector, metrics)?);
        info!(node = %sessions.target(), "gateway configured");

        Ok(Self {
            config,
            state: AppState::new(sessions),
            http: Vec::new(),
            rpc: None,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.state.metrics)
    }

    /// The REST router with its middleware, for in-process use.
    pub fn router(&self) -> Router {
        rest::router(self.state.clone(), &self.config)
    }

    /// Bind every enabled listener and serve in the background.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<BoundAddrs, ServiceError> {
        if !self.http.is_empty() || self.rpc.is_some() {
            return Err(ServiceError::Server("gateway already started".into()));
        }

        let api = spawn_http("api", self.config.api_addr(), self.router()).await?;
        let mut bound = BoundAddrs {
            api: Some(api.addr),
            ..BoundAddrs::default()
        };
        self.http.push(api);

        if self.config.metrics.enabled {
            let router = metrics_router(self.metrics());
            let server = spawn_http("metrics", self.config.metrics_addr(), router).await?;
            bound.metrics = Some(server.addr);
            self.http.push(server);
        }

        if self.config.rpc.enabled {
            let module = rpc::rpc_module(&self.state, &self.config.rpc)?;
            let addr = self.config.rpc_addr();
            let server = Server::builder()
                .max_connections(self.config.rpc.max_connections)
                .build(addr)
                .await
                .map_err(|e| ServiceError::Bind(format!("rpc on {addr}: {e}")))?;
            let local = server
                .local_addr()
                .map_err(|e| ServiceError::Bind(format!("rpc on {addr}: {e}")))?;
            info!(addr = %local, "rpc server listening");
            self.rpc = Some((local, server.start(module)));
            bound.rpc = Some(local);
        }

        info!(?bound, "gateway started");
        Ok(bound)
    }

    /// Stop every server and wait for it to finish.
    pub async fn shutdown(&mut self) {
        if let Some((addr, handle)) = self.rpc.take() {
            if handle.stop().is_ok() {
                handle.stopped().await;
            }
            info!(addr = %addr, "rpc server stopped");
        }

        for server in self.http.drain(..) {
            let _ = server.stop.send(());
            match tokio::time::timeout(SHUTDOWN_GRACE, server.task).await {
                Ok(Ok(())) => info!(server = server.name, addr = %server.addr, "server stopped"),
                Ok(Err(e)) => error!(server = server.name, error = %e, "server task failed"),
                Err(_) => warn!(server = server.name, "server did not drain in time"),
            }
        }
    }
}

async fn spawn_http(name: &'static str, addr: SocketAddr, router: Router) -> Result<HttpServer, ServiceError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServiceError::Bind(format!("{name} on {addr}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| ServiceError::Bind(format!("{name} on {addr}: {e}")))?;
    let (stop, stopped) = oneshot::channel::<()>();

    info!(server = name, addr = %addr, "listening");
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await;
        if let Err(e) = served {
            error!(server = name, error = %e, "server error");
        }
    });

    Ok(HttpServer {
        name,
        addr,
        stop,
        task,
    })
}

/// `/metrics`, `/metrics/json` and `/healthz`.
pub fn metrics_router(metrics: Arc<GatewayMetrics>) -> Router {
    let prometheus = Arc::clone(&metrics);
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&prometheus);
                async move {
                    (
                        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                        metrics.to_prometheus(),
                    )
                        .into_response()
                }
            }),
        )
        .route(
            "/metrics/json",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { Json(metrics.to_json()) }
            }),
        )
        .route("/healthz", get(health_check))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}
