//! Axum JSON surface for jobtrawl.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobtrawl_core::Posting;
use jobtrawl_store::{QueryError, QueryService};
use jobtrawl_sync::{maybe_build_scheduler, services_from_env, RunState, SyncServices, TriggerOutcome};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobtrawl-web";

pub const DEFAULT_PER_PAGE: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub services: SyncServices,
    pub query: QueryService,
}

impl AppState {
    pub fn new(services: SyncServices) -> Self {
        let query = QueryService::new(Arc::clone(&services.repo));
        Self { services, query }
    }
}

#[derive(Debug, Serialize)]
struct ScrapeResponse {
    status: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<Posting>,
    pub page: u32,
    pub per_page: u32,
    pub total_jobs: u64,
    pub total_pages: u64,
}

/// `page` and `limit` arrive as numbers or numeric strings.
#[derive(Debug, Default, Deserialize)]
struct JobsRequest {
    #[serde(default)]
    search: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    page: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32")]
    limit: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match Option::<NumberOrText>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(NumberOrText::Number(n)) => u32::try_from(n).ok(),
        Some(NumberOrText::Text(text)) if text.trim().is_empty() => return Ok(None),
        Some(NumberOrText::Text(text)) => text.trim().parse::<u32>().ok(),
    };
    parsed
        .map(Some)
        .ok_or_else(|| de::Error::custom("expected a non-negative integer"))
}

fn parse_jobs_request(body: &[u8]) -> Result<JobsRequest, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JobsRequest::default());
    }
    serde_json::from_slice(body)
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/scrape", post(scrape_handler))
        .route("/api/jobs", post(jobs_handler))
        .route("/scrape-jobs", post(scrape_details_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOBTRAWL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);
    let (config, services) = services_from_env().await?;

    let scheduler = maybe_build_scheduler(&services, &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, scheduler = scheduler.is_some(), "http server listening");
    axum::serve(listener, app(AppState::new(services)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for ctrl-c; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.scheduler.trigger().await {
        Ok(TriggerOutcome::Completed(summary)) => {
            let mut message = format!(
                "Scraping completed: {} new postings, {} duplicates skipped, {} of {} targets failed",
                summary.inserted, summary.skipped_duplicates, summary.targets_failed, summary.targets
            );
            if summary.timed_out {
                message.push_str(" (cycle deadline reached)");
            }
            (StatusCode::OK, Json(ScrapeResponse { status: "success", message })).into_response()
        }
        Ok(TriggerOutcome::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(ScrapeResponse {
                status: "busy",
                message: "a scrape cycle is already running".to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!("manual scrape failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ScrapeResponse {
                    status: "error",
                    message: format!("{err:#}"),
                }),
            )
                .into_response()
        }
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match parse_jobs_request(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")),
    };
    let filter = request.search.as_deref().map(str::trim).unwrap_or_default();
    let page = request.page.unwrap_or(1);
    let limit = request.limit.unwrap_or(DEFAULT_PER_PAGE);

    match state.query.search(filter, page, limit).await {
        Ok(result) => Json(JobsResponse {
            jobs: result.rows,
            page: result.page,
            per_page: result.limit,
            total_jobs: result.total_count,
            total_pages: result.total_pages,
        })
        .into_response(),
        Err(err @ QueryError::InvalidPaging { .. }) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
        Err(QueryError::Store(err)) => {
            error!(error = %err, filter, page, limit, "job search failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn scrape_details_handler(State(state): State<Arc<AppState>>) -> Response {
    let services = &state.services;
    match services.enricher.enrich_all(services.enrich_page_size).await {
        Ok(TriggerOutcome::Completed(summary)) => Json(json!({
            "message": format!(
                "Detail scraping completed: {} postings updated, {} unchanged, {} failed",
                summary.enriched, summary.unchanged, summary.failed
            )
        }))
        .into_response(),
        Ok(TriggerOutcome::AlreadyRunning) => {
            error_response(StatusCode::CONFLICT, "detail scraping is already running".to_string())
        }
        Err(err) => {
            error!("detail scraping failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    cycle: RunState,
    enrichment: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let services = &state.services;
    let (status, code, error) = match services.repo.ping().await {
        Ok(()) => ("ok", StatusCode::OK, None),
        Err(err) => ("unavailable", StatusCode::SERVICE_UNAVAILABLE, Some(err.to_string())),
    };
    let body = HealthResponse {
        status,
        cycle: services.scheduler.state(),
        enrichment: services.enricher.state(),
        error,
    };
    (code, Json(body)).into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
