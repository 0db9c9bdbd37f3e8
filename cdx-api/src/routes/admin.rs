//! Collection listing, stats and raw record dumps

use axum::extract::{Path, RawQuery, State};
use axum::Json;

use cdx_core::{Alias, Capture};

use crate::dto::{FeatureFlagsResponse, StatsResponse};
use crate::error::{ApiError, ApiResult};
use crate::params::Params;
use crate::state::AppState;

pub async fn list_collections(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.store.list_collections()?))
}

pub async fn feature_flags(State(state): State<AppState>) -> Json<FeatureFlagsResponse> {
    let config = state.config();
    Json(FeatureFlagsResponse {
        experimental_access_control: config.experimental_access_control,
        is_secondary: config.is_secondary,
        accepts_writes: config.accepts_writes,
    })
}

pub async fn stats(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Json<StatsResponse>> {
    let index = state.index(&collection)?;
    let estimated_record_count = tokio::task::spawn_blocking(move || index.estimated_record_count())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(StatsResponse {
        estimated_record_count,
    }))
}

/// Raw dump of capture records in key order after `key`.
pub async fn captures(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Json<Vec<Capture>>> {
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let key = params.get_or("key", "").to_string();
    let limit = parse_limit(&params)?;
    let index = state.index(&collection)?;
    let results = tokio::task::spawn_blocking(move || {
        index.captures_after(&key).take(limit).collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(results))
}

/// Raw dump of alias records in key order after `key`.
pub async fn aliases(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Json<Vec<Alias>>> {
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let key = params.get_or("key", "").to_string();
    let limit = parse_limit(&params)?;
    let index = state.index(&collection)?;
    let results = tokio::task::spawn_blocking(move || {
        index.list_aliases(&key).take(limit).collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(results))
}

fn parse_limit(params: &Params) -> ApiResult<usize> {
    let raw = params.get_or("limit", "1000");
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("bad limit: {}", raw)))
}
