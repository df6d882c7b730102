//! JSON HTTP surface over the profile query, quality and pipeline-trigger operations.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use profq_core::Record;
use profq_pipeline::{evaluate_selection, trigger_pipeline, AppContext};
use profq_quality::QualityReport;
use profq_query::{BadUrlRow, GroupColumn, GroupCount, QueryError, RowLimit, SearchFilter, TopN};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "profq-web";

/// Default number of groups returned for schools; every other grouping uses `TopN::default()`.
const SCHOOL_TOP_N: i64 = 4;
const BAD_URL_SAMPLE: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize, Default)]
struct FilterQuery {
    name: Option<String>,
    city: Option<String>,
    limit: Option<i64>,
}

impl FilterQuery {
    fn filter(&self) -> SearchFilter {
        SearchFilter {
            name_contains: self.name.clone(),
            city_query: self.city.clone(),
        }
    }
}

#[derive(Serialize)]
struct ProfilesResponse<'a> {
    version: Option<&'a str>,
    count: usize,
    rows: Vec<&'a Record>,
}

#[derive(Serialize)]
struct TopResponse {
    column: GroupColumn,
    groups: Vec<GroupCount>,
}

#[derive(Serialize)]
struct QualityResponse {
    report: QualityReport,
    bad_url_sample: Vec<BadUrlRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/profiles", get(profiles_handler))
        .route("/profiles/{id}", get(profile_detail_handler))
        .route("/profiles/{id}/network", get(profile_network_handler))
        .route("/top/{column}", get(top_handler))
        .route("/quality", get(quality_handler))
        .route("/alerts", get(alerts_handler))
        .route("/pipeline/run", post(pipeline_run_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PROFQ_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

/// Serves until ctrl-c. The caller owns `ctx` and shuts it down afterwards.
pub async fn serve(ctx: Arc<AppContext>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(AppState::new(ctx)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
            }
        })
        .await?;
    Ok(())
}

async fn profiles_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let limit = match query.limit.map(RowLimit::new).transpose() {
        Ok(limit) => limit.unwrap_or_default(),
        Err(err) => return query_error(err),
    };
    let dataset = state.ctx.dataset();
    let rows = dataset.search(&query.filter(), limit);
    Json(ProfilesResponse {
        version: dataset.version(),
        count: rows.len(),
        rows,
    })
    .into_response()
}

async fn profile_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let dataset = state.ctx.dataset();
    match dataset.lookup_by_key(&id) {
        Some(record) => Json(record).into_response(),
        None => not_found(&id),
    }
}

async fn profile_network_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.ctx.dataset().network(&id) {
        Some(network) => Json(network).into_response(),
        None => not_found(&id),
    }
}

async fn top_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(column): AxumPath<String>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let column = match column.parse::<GroupColumn>() {
        Ok(column) => column,
        Err(err) => return query_error(err),
    };
    let requested = query.limit.unwrap_or(match column {
        GroupColumn::School => SCHOOL_TOP_N,
        GroupColumn::City | GroupColumn::Company => TopN::default().get() as i64,
    });
    let top_n = match TopN::new(requested) {
        Ok(top_n) => top_n,
        Err(err) => return query_error(err),
    };
    let groups = state.ctx.dataset().top_by(column, &query.filter(), top_n);
    Json(TopResponse { column, groups }).into_response()
}

async fn quality_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let sample = match RowLimit::new(query.limit.unwrap_or(BAD_URL_SAMPLE)) {
        Ok(sample) => sample,
        Err(err) => return query_error(err),
    };
    let filter = query.filter();
    let report = evaluate_selection(&state.ctx, &filter);
    let bad_url_sample = state
        .ctx
        .dataset()
        .bad_url_sample(&filter, &state.ctx.rules().url, sample);
    Json(QualityResponse {
        report,
        bad_url_sample,
    })
    .into_response()
}

async fn alerts_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.ctx.dispatcher().history()).into_response()
}

async fn pipeline_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match trigger_pipeline(&state.ctx).await {
        Ok(outcome) if outcome.command.success => Json(outcome).into_response(),
        Ok(outcome) => (StatusCode::INTERNAL_SERVER_ERROR, Json(outcome)).into_response(),
        Err(err) => server_error(err),
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn query_error(err: QueryError) -> Response {
    let status = match err {
        QueryError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        QueryError::InvalidLimit { .. }
        | QueryError::InvalidTopN { .. }
        | QueryError::UnknownGroupColumn(_)
        | QueryError::InvalidSchoolAlias(_) => StatusCode::BAD_REQUEST,
    };
    error_body(status, err.to_string())
}

fn not_found(id: &str) -> Response {
    error_body(StatusCode::NOT_FOUND, format!("profile {id} not found"))
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}
