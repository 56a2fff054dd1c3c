use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::feedback::FeedbackError;
use crate::support::SupportError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
}

/// Liveness. 503 once the last probe found a broken dependency.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let latest = state.health.latest();
    let healthy = latest.as_ref().map_or(true, |r| r.healthy);
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "last_check": latest.map(|r| r.checked_at),
        })),
    )
}

async fn status(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let services = &state.services;
    let tickets = services.tickets.stats().await.map_err(support_error)?;
    let feedback = services.feedback.stats().await.map_err(feedback_error)?;
    let uptime = (services.clock.now() - state.started_at).num_seconds();

    Ok(Json(json!({
        "festival": services.config.festival.name,
        "uptime_secs": uptime,
        "active_sessions": services.sessions.len().await,
        "health": state.health.latest(),
        "tickets": {
            "total": tickets.tickets.total,
            "open": tickets.tickets.open,
            "closed": tickets.tickets.closed,
            "today": tickets.tickets.today,
            "avg_response_minutes": tickets.avg_response_minutes,
        },
        "feedback": {
            "total": feedback.total,
            "average_rating": feedback.average_rating,
            "critical_open": feedback.critical_open,
        },
        "data_dir": state.data_dir.display().to_string(),
    })))
}

fn support_error(e: SupportError) -> AppError {
    match e {
        SupportError::Repository(e) => e.into(),
        other => AppError::Unavailable(other.to_string()),
    }
}

fn feedback_error(e: FeedbackError) -> AppError {
    match e {
        FeedbackError::Repository(e) => e.into(),
        other => AppError::Unavailable(other.to_string()),
    }
}
