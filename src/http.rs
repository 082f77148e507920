//! The HTTP surface: a thin `axum` router translating query parameters
//! one-to-one into store commands or query-evaluator calls, with manual
//! query-string parsing via the `url` crate so repeated `key=`
//! parameters behave like Go's `url.ParseQuery`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::error::Error;
use crate::query::{self, Query, QueryResult};
use crate::store::{Command, StoreHandle};

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    shutdown: Arc<tokio::sync::Notify>,
}

impl AppState {
    pub fn new(store: StoreHandle, shutdown: Arc<tokio::sync::Notify>) -> Self {
        AppState { store, shutdown }
    }
}

/// Builds the full router: one route per supported operation.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get", get(get_handler))
        .route("/delete", get(delete_handler))
        .route("/cardinality", get(cardinality_handler))
        .route("/add", get(add_handler))
        .route("/addhash", get(addhash_handler))
        .route("/jaccard", get(jaccard_handler))
        .route("/correlation", get(correlation_handler))
        .route("/query", get(query_handler))
        .route("/resize", get(resize_handler))
        .route("/exit", get(exit_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// A handler-local error: every failure renders as HTTP 500 plus a
/// short JSON token. Argument-validation failures carry their own
/// explicit token; failures bubbling up from the store or evaluator
/// fall back to `Error::token()`.
struct ApiError(String);

impl ApiError {
    fn token(token: &str) -> Self {
        ApiError(token.to_string())
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e.token().to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0 })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Rejects a raw query string containing a malformed percent-escape
/// (a `%` not followed by two hex digits), mirroring Go's
/// `url.ParseQuery`, which errors on the same input instead of the
/// lossy best-effort decoding `url::form_urlencoded` does by default.
fn validate_uri(raw_query: Option<&str>) -> Result<(), ApiError> {
    let bytes = raw_query.unwrap_or("").as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit);
            if !valid {
                return Err(ApiError::token("INVALID_URI"));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Returns every value bound to `name`, preserving repetition order —
/// the behavior `/jaccard` and `/correlation` rely on for their
/// multi-`key` parameters.
fn params_all(raw_query: Option<&str>, name: &str) -> Vec<String> {
    url::form_urlencoded::parse(raw_query.unwrap_or("").as_bytes())
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .collect()
}

fn param_one(raw_query: Option<&str>, name: &str) -> Option<String> {
    params_all(raw_query, name).into_iter().next()
}

fn require_key(raw_query: Option<&str>) -> Result<String, ApiError> {
    match param_one(raw_query, "key") {
        Some(k) if !k.is_empty() => Ok(k),
        _ => Err(ApiError::token("MISSING_ARG_KEY")),
    }
}

#[derive(Serialize)]
struct SketchResponse {
    key: String,
    k: usize,
    values: Vec<u64>,
}

async fn get_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<SketchResponse> {
    validate_uri(raw.as_deref())?;
    let key = require_key(raw.as_deref())?;
    info!(path = "/get", %key);
    let sketch = state.store.get(&key).await?;
    Ok(Json(SketchResponse {
        key,
        k: sketch.capacity(),
        values: sketch.values().to_vec(),
    }))
}

async fn delete_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<serde_json::Value> {
    validate_uri(raw.as_deref())?;
    let key = require_key(raw.as_deref())?;
    info!(path = "/delete", %key);
    state.store.submit(Command::Delete { key }).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn cardinality_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> Result<Json<f64>, ApiError> {
    validate_uri(raw.as_deref())?;
    let key = require_key(raw.as_deref())?;
    info!(path = "/cardinality", %key);
    let sketch = state.store.get(&key).await?;
    Ok(Json(sketch.cardinality()))
}

async fn add_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<serde_json::Value> {
    validate_uri(raw.as_deref())?;
    let key = require_key(raw.as_deref())?;
    let value = param_one(raw.as_deref(), "value")
        .ok_or_else(|| ApiError::token("MISSING_ARG_VALUE"))?;
    let hash = crate::hash::hash_str(&value);
    info!(path = "/add", %key);
    state
        .store
        .submit(Command::AddHash { key, hash })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn addhash_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<serde_json::Value> {
    validate_uri(raw.as_deref())?;
    let key = require_key(raw.as_deref())?;
    let hash_raw = param_one(raw.as_deref(), "hash")
        .ok_or_else(|| ApiError::token("MISSING_ARG_HASH"))?;
    let hash: u64 = hash_raw
        .parse()
        .map_err(|_| ApiError::token("INVALID_ARG_HASH"))?;
    info!(path = "/addhash", %key);
    state
        .store
        .submit(Command::AddHash { key, hash })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Serialize)]
struct ScalarResponse {
    num: f64,
}

async fn jaccard_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<ScalarResponse> {
    validate_uri(raw.as_deref())?;
    let keys = params_all(raw.as_deref(), "key");
    if keys.len() != 2 {
        return Err(ApiError::token("MUST_PROVIDE_2_KEYS"));
    }
    info!(path = "/jaccard", a = %keys[0], b = %keys[1]);
    let q = Query {
        method: "jaccard".into(),
        keys: Some(keys),
        set: None,
    };
    let result = query::evaluate(&state.store, &q).await?;
    Ok(Json(ScalarResponse {
        num: result.num.unwrap_or(0.0),
    }))
}

async fn correlation_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<Vec<query::Pairing>> {
    validate_uri(raw.as_deref())?;
    let keys = params_all(raw.as_deref(), "key");
    if keys.len() < 2 {
        return Err(ApiError::token("MUST_PROVIDE_2+_KEYS"));
    }
    info!(path = "/correlation", n = keys.len());
    let q = Query {
        method: "correlation".into(),
        keys: Some(keys),
        set: None,
    };
    let result = query::evaluate(&state.store, &q).await?;
    Ok(Json(result.multi.unwrap_or_default()))
}

async fn query_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<QueryResult> {
    validate_uri(raw.as_deref())?;
    let q_raw = param_one(raw.as_deref(), "q")
        .ok_or_else(|| ApiError::token("MISSING_ARG_Q"))?;
    let query: Query = serde_json::from_str(&q_raw).map_err(|_| ApiError::token("INVALID_QUERY"))?;
    info!(path = "/query", method = %query.method);
    let result = query::evaluate(&state.store, &query).await?;
    Ok(Json(result))
}

async fn resize_handler(
    State(state): State<AppState>,
    axum::extract::RawQuery(raw): axum::extract::RawQuery,
) -> ApiResult<serde_json::Value> {
    validate_uri(raw.as_deref())?;
    let key = require_key(raw.as_deref())?;
    let size_raw = param_one(raw.as_deref(), "size")
        .ok_or_else(|| ApiError::token("MISSING_ARG_SIZE"))?;
    let new_k: usize = size_raw
        .parse()
        .map_err(|_| ApiError::token("INVALID_ARG_SIZE"))?;
    info!(path = "/resize", %key, new_k);
    state
        .store
        .submit(Command::Resize { key, new_k })
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn exit_handler(State(state): State<AppState>) -> &'static str {
    info!(path = "/exit", "graceful shutdown requested");
    state.shutdown.notify_one();
    "OK"
}

async fn healthz_handler() -> &'static str {
    r#"{"status":"ok"}"#
}
