use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use taskdesk_storage::Database;
use tracing::warn;

use crate::problem::ProblemResponse;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database) -> Self {
        Self { metrics, storage }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> Result<StatusCode, ProblemResponse> {
    match state.storage().ping().await {
        Ok(()) => {
            counter!("api_readyz_requests_total", "result" => "ok").increment(1);
            Ok(StatusCode::OK)
        }
        Err(err) => {
            counter!("api_readyz_requests_total", "result" => "unavailable").increment(1);
            warn!(stage = "app", error = %err, "readiness probe failed");
            Err(ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "database_unavailable",
                "database did not answer the readiness probe",
            ))
        }
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn setup_state() -> (TempDir, AppState) {
        let metrics = telemetry::init_metrics().expect("metrics init");

        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("taskdesk.db").display());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");

        (dir, AppState::new(metrics, database))
    }

    async fn request(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect("handler should respond")
    }

    async fn body_text(response: Response) -> String {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (_dir, state) = setup_state().await;
        let response = request(app_router(state), "/healthz").await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_returns_ok_when_database_answers() {
        let (_dir, state) = setup_state().await;
        let response = request(app_router(state), "/readyz").await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reports_problem_when_pool_is_closed() {
        let (_dir, state) = setup_state().await;
        state.storage().pool().close().await;

        let response = request(app_router(state), "/readyz").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let body: Value = serde_json::from_str(&body_text(response).await).expect("json body");
        assert_eq!(body["type"], "database_unavailable");
        assert_eq!(body["title"], "Service Unavailable");
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let (_dir, state) = setup_state().await;
        let response = request(app_router(state), "/metrics").await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }
}
