//! Readiness and liveness aggregation
//!
//! Components register under a fixed name and publish [`HealthReport`]s. The
//! aggregate is ready (or live) only when every registered reporter is. It can
//! be served over HTTP for kubelet probes.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
}

impl HealthReport {
    pub const fn ready() -> Self {
        Self {
            live: true,
            ready: true,
        }
    }

    pub const fn not_ready() -> Self {
        Self {
            live: true,
            ready: false,
        }
    }
}

/// Aggregate view returned by [`HealthAggregator::summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub live: bool,
    pub ready: bool,
    pub reporters: BTreeMap<String, HealthReport>,
}

/// Registry of named health reporters. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct HealthAggregator {
    reports: Arc<RwLock<BTreeMap<String, HealthReport>>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_reporter(&self, name: &str, initial: HealthReport) {
        debug!(reporter = name, ready = initial.ready, "Health reporter registered");
        self.reports.write().insert(name.to_string(), initial);
    }

    /// Updates a reporter. Reports for unregistered names are ignored.
    pub fn report(&self, name: &str, report: HealthReport) {
        let mut reports = self.reports.write();
        match reports.get_mut(name) {
            Some(current) => {
                if *current != report {
                    info!(reporter = name, live = report.live, ready = report.ready, "Health changed");
                }
                *current = report;
            }
            None => debug!(reporter = name, "Report from unregistered reporter ignored"),
        }
    }

    pub fn summary(&self) -> HealthSummary {
        let reports = self.reports.read();
        HealthSummary {
            live: reports.values().all(|r| r.live),
            ready: reports.values().all(|r| r.ready),
            reporters: reports.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.summary().ready
    }

    pub fn is_live(&self) -> bool {
        self.summary().live
    }
}

fn router(aggregator: HealthAggregator) -> Router {
    Router::new()
        .route("/readiness", get(readiness_handler))
        .route("/liveness", get(liveness_handler))
        .with_state(aggregator)
}

async fn readiness_handler(
    State(aggregator): State<HealthAggregator>,
) -> (StatusCode, Json<HealthSummary>) {
    let summary = aggregator.summary();
    (status_for(summary.ready), Json(summary))
}

async fn liveness_handler(
    State(aggregator): State<HealthAggregator>,
) -> (StatusCode, Json<HealthSummary>) {
    let summary = aggregator.summary();
    (status_for(summary.live), Json(summary))
}

fn status_for(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serves `/readiness` and `/liveness` until `cancel` fires.
pub async fn serve(
    aggregator: HealthAggregator,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Health server listening");

    axum::serve(listener, router(aggregator))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
