//! Health check HTTP server
//!
//! - `GET /health`  overall status with per-check details
//! - `GET /ready`   200 only while the consumer is consuming
//! - `GET /live`    always 200 while the process runs
//! - `GET /metrics` JSON metrics snapshot

use crate::consumer::ConsumerState;
use crate::observability::metrics::{MetricsCollector, MetricsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub struct HealthServer {
    app_name: String,
    port: u16,
    state: watch::Receiver<ConsumerState>,
    metrics: Arc<MetricsCollector>,
}

impl HealthServer {
    pub fn new(
        app_name: impl Into<String>,
        port: u16,
        state: watch::Receiver<ConsumerState>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            port,
            state,
            metrics,
        }
    }

    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);
        let metrics_server = Arc::clone(&self);

        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&ready_server);
                async move {
                    let state = server.current_state();
                    let response = ReadinessResponse {
                        ready: state == ConsumerState::Consuming,
                        state: state.to_string(),
                        timestamp: current_timestamp(),
                    };
                    let code = if response.ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
                }
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&metrics_server.metrics.snapshot()));

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        tracing::info!("Starting health server on {addr}");
        warp::serve(Arc::clone(&self).routes()).run(addr).await;
    }

    fn current_state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn health_status(&self) -> HealthStatus {
        let state = self.current_state();
        let snapshot = self.metrics.snapshot();

        let mut checks = BTreeMap::new();
        checks.insert("broker".to_string(), broker_check(state, &snapshot));
        checks.insert("acknowledgments".to_string(), settle_check(&snapshot));

        let status = if state == ConsumerState::ShuttingDown {
            "shutting_down"
        } else if checks.values().all(|check| check.status == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            app_name: self.app_name.clone(),
            state: state.to_string(),
            uptime_seconds: snapshot.uptime_seconds,
            in_flight: snapshot.messages.in_flight,
            checks,
            timestamp: snapshot.timestamp,
        }
    }
}

fn broker_check(state: ConsumerState, snapshot: &MetricsSnapshot) -> HealthCheck {
    match state {
        ConsumerState::Consuming => HealthCheck::healthy(format!(
            "Consuming, connected for {}s",
            snapshot.connection.connection_duration_seconds
        )),
        other => HealthCheck::unhealthy(format!(
            "Not consuming ({other}), {} connection attempts so far",
            snapshot.connection.attempts
        )),
    }
}

fn settle_check(snapshot: &MetricsSnapshot) -> HealthCheck {
    if snapshot.messages.settle_failures == 0 {
        HealthCheck::healthy("All dispositions delivered".to_string())
    } else {
        HealthCheck::unhealthy(format!(
            "{} dispositions could not be delivered to the broker",
            snapshot.messages.settle_failures
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub app_name: String,
    pub state: String,
    pub uptime_seconds: u64,
    pub in_flight: u64,
    pub checks: BTreeMap<String, HealthCheck>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: String,
}

impl HealthCheck {
    fn healthy(message: String) -> Self {
        Self {
            status: "healthy".to_string(),
            message,
        }
    }

    fn unhealthy(message: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    state: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
