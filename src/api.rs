use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreakerRegistry, health::HealthChecker, lookup::CORRELATION_HEADER,
        store::StatusStore,
    },
    dispatcher::Dispatcher,
    error::{IntakeError, StatusError},
    models::{
        circuit_breaker::CircuitStats,
        health::HealthStatus,
        notification::{NotificationRequest, SubmitOutcome},
        response::ApiResponse,
        status::{StatusRecord, StatusUpdate},
    },
    status::StatusTracker,
    utils::check_rate_limit,
};

pub const CALLER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: i64,
    pub window: Duration,
}

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub tracker: StatusTracker,
    pub store: Arc<dyn StatusStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub health_checker: HealthChecker,
    pub rate_limit: RateLimit,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/notifications", post(submit_notification))
        .route(
            "/api/v1/notifications/{notification_id}/status",
            get(get_status),
        )
        .route("/api/v1/notifications/status", post(update_status))
        .route("/api/v1/circuit-breakers", get(list_breakers))
        .route("/api/v1/circuit-breakers/{name}/reset", post(reset_breaker))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    info!(address = %listener.local_addr()?, "HTTP server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self
            .status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string();

        (
            self.status,
            Json(ApiResponse::<()>::error(self.message, reason)),
        )
            .into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        let status = match &err {
            IntakeError::Validation(_) => StatusCode::BAD_REQUEST,
            IntakeError::NotFound { .. } => StatusCode::NOT_FOUND,
            IntakeError::Authorization(_) => StatusCode::FORBIDDEN,
            IntakeError::ChannelDisabled { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            IntakeError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            IntakeError::DependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        Self::new(status, err.to_string())
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        let status = match &err {
            StatusError::NotFound(_) => StatusCode::NOT_FOUND,
            StatusError::InvalidTransition { .. } | StatusError::Contention(_) => {
                StatusCode::CONFLICT
            }
            StatusError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        Self::new(status, err.to_string())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn ok<T: Serialize>(status: StatusCode, data: T, message: &str) -> Response {
    (status, Json(ApiResponse::success(data, message))).into_response()
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn submit_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<NotificationRequest>,
) -> Result<Response, ApiError> {
    let caller_id = header_value(&headers, CALLER_HEADER).ok_or_else(|| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            format!("missing {} header", CALLER_HEADER),
        )
    })?;
    let correlation_id = header_value(&headers, CORRELATION_HEADER);

    // Replays are answered from the marker and do not spend the caller's budget.
    if !state.dispatcher.is_known_request(&request.request_id).await {
        match check_rate_limit(
            state.store.as_ref(),
            &caller_id,
            state.rate_limit.max,
            state.rate_limit.window,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => return Err(IntakeError::RateLimited(caller_id).into()),
            Err(e) => warn!(error = %e, "Rate limiter unavailable, allowing request"),
        }
    }

    let outcome: SubmitOutcome = state
        .dispatcher
        .submit(request, &caller_id, correlation_id)
        .await?;

    let (status, message) = if outcome.duplicate {
        (StatusCode::OK, "Duplicate request, returning original notification")
    } else {
        (StatusCode::ACCEPTED, "Notification queued")
    };

    let correlation = HeaderValue::from_str(&outcome.correlation_id).ok();
    let mut response = ok(status, outcome, message);
    if let Some(value) = correlation {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    Ok(response)
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<String>,
) -> Result<Response, ApiError> {
    let record: StatusRecord = state
        .tracker
        .get(&notification_id)
        .await?
        .ok_or(StatusError::NotFound(notification_id))?;

    Ok(ok(StatusCode::OK, record, "Status retrieved"))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Json(update): Json<StatusUpdate>,
) -> Result<Response, ApiError> {
    let record = state.tracker.apply(update).await?;

    Ok(ok(StatusCode::OK, record, "Status updated"))
}

async fn list_breakers(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<CircuitStats>>> {
    Json(ApiResponse::success(
        state.breakers.all_stats(),
        "Circuit breakers retrieved",
    ))
}

async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let breaker = state.breakers.get(&name).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Circuit breaker not found: {}", name),
        )
    })?;

    breaker.reset();

    Ok(ok(StatusCode::OK, breaker.stats(), "Circuit breaker reset"))
}
