//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tokio::sync::watch;

use crate::sniper::{SessionState, SupervisorStats};

/// Application state shared with handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Whether start-up finished.
    pub ready: Arc<AtomicBool>,
    /// Supervisor totals.
    pub stats: watch::Receiver<SupervisorStats>,
    /// Active session state.
    pub session: watch::Receiver<SessionState>,
    /// Dry-run mode.
    pub dry_run: bool,
}

impl AppState {
    /// State backed by a supervisor's channels.
    pub fn new(
        stats: watch::Receiver<SupervisorStats>,
        session: watch::Receiver<SessionState>,
        dry_run: bool,
    ) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            stats,
            session,
            dry_run,
        }
    }

    /// State with no supervisor behind it.
    pub fn detached() -> Self {
        let (_, stats) = watch::channel(SupervisorStats::default());
        let (_, session) = watch::channel(SessionState::Init);
        Self::new(stats, session, true)
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Market of the active session, if any.
    pub market: Option<String>,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// "dry_run" or "live".
    pub mode: &'static str,
    /// Active session state.
    pub session_state: String,
    /// Supervisor totals.
    pub stats: SupervisorStats,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = state.is_ready();
    let market = state.stats.borrow().current_market.clone();

    let response = ReadyResponse { ready: is_ready, market };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - returns supervisor totals and the active session state.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.stats.borrow().clone();
    let session_state = state.session.borrow().to_string();

    let status = match (state.is_ready(), stats.running) {
        (false, _) => "starting",
        (true, true) => "running",
        (true, false) => "stopped",
    };

    Json(StatusResponse {
        status,
        mode: if state.dry_run { "dry_run" } else { "live" },
        session_state,
        stats,
    })
}
