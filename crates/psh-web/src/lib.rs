//! Thin JSON API over the scrape pipeline: trigger scrapes and report
//! session state. All scraping logic lives in psh-pipeline; handlers here
//! are pass-through callers.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use psh_pipeline::ScrapePipeline;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "psh-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ScrapePipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<ScrapePipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/scrape/year/{year}", post(scrape_year_handler))
        .route("/scrape/start", post(scrape_start_handler))
        .route("/scrape/status", get(scrape_status_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving scrape api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn scrape_year_handler(
    State(state): State<AppState>,
    AxumPath(year): AxumPath<i32>,
) -> Response {
    match state.pipeline.scrape_year(year).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

/// Kicks off a full campaign in the background and returns immediately;
/// progress is visible through `/scrape/status`.
async fn scrape_start_handler(State(state): State<AppState>) -> Response {
    let years = state.pipeline.config().years.clone();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let summary = pipeline.scrape_all_years().await;
        info!(run_id = %summary.run_id, years = summary.outcomes.len(), "campaign finished");
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "message": "scraping started", "years": years })),
    )
        .into_response()
}

async fn scrape_status_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.session_status().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use psh_pipeline::ScrapeConfig;
    use psh_storage::{FetchError, MemoryRepository, PageFetcher};
    use std::time::Duration;
    use tower::ServiceExt;

    struct TableFetcher;

    #[async_trait]
    impl PageFetcher for TableFetcher {
        async fn fetch_listing(&self, _url: &str) -> Result<String, FetchError> {
            Ok(r#"
                <html><body><table>
                  <tr><th>S.No</th><th>Title</th><th>Desc</th></tr>
                  <tr><td>1</td><td>AI Health Monitor</td><td>predicts disease risk using ML models</td></tr>
                  <tr><td>2</td><td>Farm Sensor Net</td><td>IoT soil moisture sensing for agriculture</td></tr>
                </table></body></html>
            "#
            .to_string())
        }
    }

    fn test_state() -> AppState {
        let config = ScrapeConfig {
            years: vec![2024],
            candidate_delay: Duration::ZERO,
            year_delay: Duration::ZERO,
            min_valid_count: 2,
            ..ScrapeConfig::default()
        };
        let pipeline = ScrapePipeline::new(
            config,
            Arc::new(MemoryRepository::default()),
            Arc::new(TableFetcher),
        );
        AppState::new(Arc::new(pipeline))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn scrape_year_returns_completed_outcome() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/scrape/year/2024")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["year"], 2024);
        assert_eq!(json["status"], "completed");
        assert_eq!(json["count"], 2);
    }

    #[tokio::test]
    async fn status_lists_sessions_after_a_scrape() {
        let state = test_state();
        let app = app(state.clone());

        let scrape = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/scrape/year/2024")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(scrape.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/scrape/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let sessions = json.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["year"], 2024);
        assert_eq!(sessions[0]["status"], "completed");
        assert_eq!(sessions[0]["successCount"], 2);
    }

    #[tokio::test]
    async fn campaign_start_is_accepted_immediately() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/scrape/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["message"], "scraping started");
        assert_eq!(json["years"], serde_json::json!([2024]));
    }
}
