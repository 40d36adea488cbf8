use crate::error::ErrorReport;
use crate::loans::types::PollerState;
use crate::state::AppState;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub poller: PollerState,
    pub last_success_ms: Option<i64>,
    pub fetch_error: Option<ErrorReport>,
}

async fn database_status(pool: &SqlitePool) -> &'static str {
    match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    }
}

pub async fn build_health_response(state: &AppState) -> HealthResponse {
    let db = database_status(&state.db_pool).await;
    let poll = state.desk.poller().snapshot();
    let status = if db == "ok" && poll.error.is_none() {
        "ok"
    } else {
        "degraded"
    };

    HealthResponse {
        status,
        uptime_ms: state.started_at.elapsed().as_millis(),
        db,
        poller: poll.state,
        last_success_ms: poll.last_success_ms,
        fetch_error: poll.error,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    build_health_response(state).await
}
