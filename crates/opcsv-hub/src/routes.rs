use crate::render::{self, InputEntry};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use opcsv_core::StatusCode as TriageStatus;
use opcsv_storage::{ReviewError, Session, SessionView};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

pub struct AppState {
    session: Mutex<Session>,
}

impl AppState {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/csv/next", get(next_row))
        .route("/csv/commit", post(commit))
        .route("/csv/close", post(close))
        .route("/csv/status/:code", post(set_status))
        .route("/csv/:name", get(open_csv))
        .route("/api/inputs", get(api_inputs))
        .route("/api/csv/:name", get(api_open_csv))
        .route("/api/current", get(api_current))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct InputSummary {
    name: String,
    has_derived: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

/// Renders a failed review operation as an HTML error page.
struct PageError(ReviewError);

/// Renders a failed review operation as a JSON error body.
struct ApiError(ReviewError);

impl From<ReviewError> for PageError {
    fn from(err: ReviewError) -> Self {
        Self(err)
    }
}

impl From<ReviewError> for ApiError {
    fn from(err: ReviewError) -> Self {
        Self(err)
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        log_failure(status, &self.0);
        (status, Html(render::error_page(&self.0))).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        log_failure(status, &self.0);
        let body = ErrorBody {
            kind: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn http_status(err: &ReviewError) -> StatusCode {
    match err {
        ReviewError::SourceNotFound { .. }
        | ReviewError::DerivedNotFound { .. }
        | ReviewError::NoActiveSession => StatusCode::NOT_FOUND,
        ReviewError::DerivedAlreadyExists { .. } | ReviewError::RowCountMismatch { .. } => {
            StatusCode::CONFLICT
        }
        ReviewError::EndOfData => StatusCode::GONE,
        ReviewError::MalformedRow { .. }
        | ReviewError::MissingField { .. }
        | ReviewError::EmptyDataset => StatusCode::UNPROCESSABLE_ENTITY,
        ReviewError::Io(_) | ReviewError::Csv(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn log_failure(status: StatusCode, err: &ReviewError) {
    if status.is_server_error() {
        warn!(event = "request_error", kind = err.kind(), error = %err);
    } else {
        info!(event = "request_rejected", kind = err.kind(), error = %err);
    }
}

/// Path of the detail view for `name`, percent-encoded as one segment.
fn csv_href(name: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/csv/") else {
        return "/".to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(name);
    }
    url.path().to_string()
}

async fn index(State(state): State<Arc<AppState>>) -> Result<Html<String>, PageError> {
    let session = state.session.lock().await;
    let service = session.service();
    let names = service.list_inputs()?;
    let hrefs: Vec<String> = names.iter().map(|name| csv_href(name)).collect();
    let entries: Vec<InputEntry<'_>> = names
        .iter()
        .zip(&hrefs)
        .map(|(name, href)| InputEntry {
            name,
            href,
            has_derived: service.has_derived(name),
        })
        .collect();
    Ok(Html(render::index_page(&entries)))
}

async fn open_csv(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Html<String>, PageError> {
    let view = state.session.lock().await.open(&name)?;
    Ok(Html(render::record_page(&view)))
}

async fn next_row(State(state): State<Arc<AppState>>) -> Result<Redirect, PageError> {
    let result = state.session.lock().await.advance();
    match result {
        Ok(view) => Ok(Redirect::to(&csv_href(&view.name))),
        Err(ReviewError::NoActiveSession) => Ok(Redirect::to("/")),
        Err(err) => Err(err.into()),
    }
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Redirect, PageError> {
    let status: TriageStatus = code.parse().map_err(|reason| ReviewError::MalformedRow { reason })?;
    let view = state.session.lock().await.set_status(status)?;
    Ok(Redirect::to(&csv_href(&view.name)))
}

async fn commit(State(state): State<Arc<AppState>>) -> Result<Redirect, PageError> {
    state.session.lock().await.commit()?;
    Ok(Redirect::to("/"))
}

async fn close(State(state): State<Arc<AppState>>) -> Redirect {
    state.session.lock().await.close();
    Redirect::to("/")
}

async fn api_inputs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InputSummary>>, ApiError> {
    let session = state.session.lock().await;
    let service = session.service();
    let inputs = service
        .list_inputs()?
        .into_iter()
        .map(|name| InputSummary {
            has_derived: service.has_derived(&name),
            name,
        })
        .collect();
    Ok(Json(inputs))
}

async fn api_open_csv(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let view = state.session.lock().await.open(&name)?;
    Ok(Json(view))
}

/// Current row of the open dataset without reopening or advancing it.
async fn api_current(State(state): State<Arc<AppState>>) -> Result<Json<SessionView>, ApiError> {
    let view = state.session.lock().await.current()?;
    Ok(Json(view))
}
