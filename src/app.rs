//! HTTP API of the relay.

use crate::app_state::{AppState, SharedAppState};
use crate::cli::CommandLineArgs;
use crate::error::RelayError;
use crate::metrics;
use crate::models::Dataset;
use crate::oplog::OperationLog;
use crate::streaming::{csv_chunks, json_lines, YearWindow};
use crate::validated_query::ValidatedQuery;

use axum::{
    body::{BoxBody, StreamBody},
    extract::{Path, State},
    http::header,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::TraceLayer;
use validator::Validate;

/// Longest validity accepted for a presigned URL, one week.
const MAX_PRESIGN_EXPIRY: u64 = 7 * 24 * 60 * 60;

/// Query parameters of the dataset streaming endpoint.
#[derive(Debug, Deserialize, Validate)]
struct DataParams {
    /// Only stream records created in the current or previous year
    #[serde(default)]
    recent: bool,
}

/// Query parameters of the dataset download endpoint.
#[derive(Debug, Deserialize, Validate)]
struct DownloadParams {
    /// Validity of the presigned URL in seconds
    #[validate(range(min = 1, max = "MAX_PRESIGN_EXPIRY"))]
    expires_in: Option<u64>,
}

/// Application service, with trailing slashes trimmed before routing.
pub type Service = NormalizePath<Router>;

/// Prepare the local cache directory.
///
/// # Arguments
///
/// * `args`: Command line arguments
pub fn init(args: &CommandLineArgs) {
    std::fs::create_dir_all(args.cache_dir_path()).expect("failed to create cache directory");
}

/// Returns a [axum::Router] for the relay API.
///
/// # Arguments
///
/// * `state`: Shared application state
pub fn router(state: SharedAppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/memory", get(memory))
        .route("/memory/reset", get(reset_memory))
        .route("/api/data/:dataset", get(stream_dataset))
        .route("/api/data/:dataset/download", get(download_dataset))
        .route("/api/csv/measurements", get(stream_csv))
        .route("/api/cache/reset", get(reset_cache))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(
            TraceLayer::new_for_http()
                .on_request(metrics::request_counter)
                .on_response(metrics::record_response_metrics::<BoxBody>),
        )
        .with_state(state)
}

/// Returns a [crate::app::Service] for the relay API.
///
/// The service is suitable for serving with [axum_server].
///
/// # Arguments
///
/// * `args`: Command line arguments
pub fn service(args: &CommandLineArgs) -> Service {
    let state = Arc::new(AppState::new(args));
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

async fn welcome() -> &'static str {
    "Welcome to the OpenRadiation relay"
}

/// Memory usage of the server and the operations log.
///
/// Every visit records the current reading in the log.
async fn memory(State(state): State<SharedAppState>) -> Result<Html<String>, RelayError> {
    let resident = metrics::resident_memory_bytes()
        .map(metrics::human_bytes)
        .unwrap_or_else(|| "unavailable".to_string());
    state.log.record(&format!("Memory check: {}", metrics::memory_summary()));
    let log = state.log.contents().await?;
    Ok(Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Memory usage</title></head>\n<body>\n\
         <h1>Memory usage</h1>\n<p>Resident memory: {}</p>\n\
         <h2>Operations log</h2>\n<pre>{}</pre>\n</body>\n</html>\n",
        resident,
        escape_html(&log)
    )))
}

async fn reset_memory(State(state): State<SharedAppState>) -> Result<&'static str, RelayError> {
    if state.log.clear().await? {
        Ok("Operations log cleared")
    } else {
        Ok("Operations log already empty")
    }
}

/// Stream a dataset as JSON lines.
async fn stream_dataset(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
    ValidatedQuery(params): ValidatedQuery<DataParams>,
) -> Result<Response, RelayError> {
    let dataset = dataset(&name)?;
    if params.recent && !dataset.has_creation_time() {
        return Err(RelayError::FilterUnsupported { dataset: name });
    }
    let reader = state.open_dataset(dataset).await?;
    let filter = params.recent.then(YearWindow::current);
    Ok((
        [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
        StreamBody::new(json_lines(reader, filter)),
    )
        .into_response())
}

/// Redirect to a presigned URL of a dataset's object.
async fn download_dataset(
    State(state): State<SharedAppState>,
    Path(name): Path<String>,
    ValidatedQuery(params): ValidatedQuery<DownloadParams>,
) -> Result<Redirect, RelayError> {
    let dataset = dataset(&name)?;
    let store = state
        .store
        .as_ref()
        .ok_or(RelayError::ObjectStoreNotConfigured)?;
    state.ensure_fresh(&state.paths().dataset(dataset)).await?;
    let expires_in = params.expires_in.unwrap_or(state.args.presign_expiry);
    let url = store
        .presign_dataset(dataset, Duration::from_secs(expires_in))
        .await?;
    Ok(Redirect::temporary(&url))
}

/// Stream the extracted measurements file.
async fn stream_csv(State(state): State<SharedAppState>) -> Result<Response, RelayError> {
    let reader = state.open_csv().await?;
    Ok((
        [(&header::CONTENT_TYPE, mime::TEXT_CSV.to_string())],
        StreamBody::new(csv_chunks(reader, state.args.csv_chunk_lines)),
    )
        .into_response())
}

async fn reset_cache(State(state): State<SharedAppState>) -> Result<String, RelayError> {
    let removed = state.reset_cache().await?;
    Ok(format!("Cache reset: {} files removed", removed))
}

fn dataset(name: &str) -> Result<Dataset, RelayError> {
    Dataset::from_str(name).map_err(|_| RelayError::DatasetMissing {
        dataset: name.to_string(),
    })
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
