use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::error;

use crate::state::AppState;

/// A dependency that does not answer within this long counts as down.
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

fn verdict<E: std::fmt::Display>(
    name: &str,
    result: Result<Result<(), E>, tokio::time::error::Elapsed>,
) -> &'static str {
    match result {
        Ok(Ok(())) => "healthy",
        Ok(Err(e)) => {
            error!(service = name, error = %e, "Health check failed");
            "unhealthy"
        }
        Err(_) => {
            error!(
                service = name,
                timeout_secs = CHECK_TIMEOUT.as_secs(),
                "Health check timed out"
            );
            "unhealthy"
        }
    }
}

/// GET /health
/// Checks the database and the queue backend concurrently.
/// 503 when either is down. The LLM provider is only reported, never called.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_check = tokio::time::timeout(CHECK_TIMEOUT, async {
        sqlx::query("SELECT 1").execute(&state.db).await.map(|_| ())
    });
    let redis_check = tokio::time::timeout(CHECK_TIMEOUT, state.queue.ping());
    let (db, redis) = tokio::join!(db_check, redis_check);

    let db = verdict("db", db);
    let redis = verdict("redis", redis);
    let openai = if state.config.openai_api_key.is_some() {
        "configured"
    } else {
        "skipped"
    };

    let healthy = db == "healthy" && redis == "healthy";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "overall": if healthy { "healthy" } else { "unhealthy" },
            "service": "cvimprover-api",
            "version": env!("CARGO_PKG_VERSION"),
            "services": {
                "db": db,
                "redis": redis,
                "openai": openai
            }
        })),
    )
}
