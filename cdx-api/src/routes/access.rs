//! Access control endpoints
//!
//! CRUD for rules and policies plus the check endpoints that evaluate a
//! URL and timestamp against the rule set from a given access point.

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use cdx_core::access::{capture_datetime, AccessDecision, AccessPolicy, AccessRule};
use cdx_core::capture::parse_timestamp;

use crate::dto::{AccessQuery, CreatedResponse};
use crate::error::{ApiError, ApiResult};
use crate::params::Params;
use crate::state::AppState;

/// List rules, optionally filtered by `search` and ordered by `sort`
/// (`id` or `surt`, prefix `-` to reverse).
pub async fn list_rules(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Json<Vec<AccessRule>>> {
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let index = state.index(&collection)?;

    let mut rules = index.list_rules();
    if let Some(search) = params.get("search") {
        rules.retain(|rule| rule.contains_text(search));
    }

    let sort = params.get_or("sort", "id");
    if sort.trim_start_matches('-') == "surt" {
        rules.sort_by(|a, b| {
            let a_prefix = a.url_patterns.first().cloned().unwrap_or_default();
            let b_prefix = b.url_patterns.first().cloned().unwrap_or_default();
            b.pinned
                .cmp(&a.pinned)
                .then(a_prefix.cmp(&b_prefix))
                .then(a.id.cmp(&b.id))
        });
    }
    if sort.starts_with('-') {
        rules.reverse();
    }
    Ok(Json(rules))
}

/// Create or replace rules. Accepts a single rule object or an array;
/// invalid rules fail the whole request with the full error list.
pub async fn post_rules(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    state.require_write_access()?;
    let index = state.index(&collection)?;

    let single = !body.is_array();
    let rules: Vec<AccessRule> = if single {
        vec![serde_json::from_value(body).map_err(bad_json)?]
    } else {
        serde_json::from_value(body).map_err(bad_json)?
    };

    let errors: Vec<String> = rules.iter().flat_map(|rule| rule.validate()).collect();
    if !errors.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, Json(errors)).into_response());
    }

    let mut ids = Vec::with_capacity(rules.len());
    for rule in rules {
        ids.push(index.put_rule(rule)?);
    }

    if single {
        Ok(created_or_ok(ids[0]))
    } else {
        let ids: Vec<Option<String>> = ids
            .into_iter()
            .map(|id| id.map(|id| id.to_string()))
            .collect();
        Ok(Json(ids).into_response())
    }
}

/// A blank rule template for dashboard forms.
pub async fn new_rule() -> Json<AccessRule> {
    Json(AccessRule::default())
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path((collection, rule_id)): Path<(String, u64)>,
) -> ApiResult<Json<AccessRule>> {
    let index = state.index(&collection)?;
    index
        .get_rule(rule_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no such rule: {}", rule_id)))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path((collection, rule_id)): Path<(String, u64)>,
) -> ApiResult<Response> {
    state.require_write_access()?;
    let index = state.index(&collection)?;
    if index.delete_rule(rule_id)? {
        Ok(StatusCode::OK.into_response())
    } else {
        Err(ApiError::NotFound(format!("no such rule: {}", rule_id)))
    }
}

pub async fn list_policies(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Json<Vec<AccessPolicy>>> {
    Ok(Json(state.index(&collection)?.list_policies()))
}

pub async fn post_policy(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(policy): Json<AccessPolicy>,
) -> ApiResult<Response> {
    state.require_write_access()?;
    let index = state.index(&collection)?;
    Ok(created_or_ok(index.put_policy(policy)?))
}

pub async fn get_policy(
    State(state): State<AppState>,
    Path((collection, policy_id)): Path<(String, u64)>,
) -> ApiResult<Json<AccessPolicy>> {
    let index = state.index(&collection)?;
    index
        .get_policy(policy_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no such policy: {}", policy_id)))
}

/// Evaluate access for one URL at one capture time, as of now.
pub async fn check(
    State(state): State<AppState>,
    Path((collection, accesspoint)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Json<AccessDecision>> {
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let url = params
        .get("url")
        .ok_or_else(|| ApiError::BadRequest("missing url parameter".to_string()))?;
    let timestamp = params
        .get("timestamp")
        .ok_or_else(|| ApiError::BadRequest("missing timestamp parameter".to_string()))?;
    let capture_time = capture_datetime(parse_timestamp(timestamp)?)?;

    let index = state.index(&collection)?;
    let decision = index.check_access(&accesspoint, url, capture_time, Utc::now())?;
    Ok(Json(decision))
}

/// Evaluate access for an array of `{url, timestamp}` queries.
pub async fn check_bulk(
    State(state): State<AppState>,
    Path((collection, accesspoint)): Path<(String, String)>,
    Json(queries): Json<Vec<AccessQuery>>,
) -> ApiResult<Json<Vec<AccessDecision>>> {
    let index = state.index(&collection)?;
    let queries: Vec<(String, u64)> = queries
        .into_iter()
        .map(|q| Ok((q.url, parse_timestamp(&q.timestamp)?)))
        .collect::<Result<_, cdx_core::CdxError>>()?;
    let decisions = index.check_access_bulk(&accesspoint, &queries, Utc::now())?;
    Ok(Json(decisions))
}

fn created_or_ok(id: Option<u64>) -> Response {
    match id {
        Some(id) => (
            StatusCode::CREATED,
            Json(CreatedResponse { id: id.to_string() }),
        )
            .into_response(),
        None => StatusCode::OK.into_response(),
    }
}

fn bad_json(e: serde_json::Error) -> ApiError {
    ApiError::BadRequest(format!("bad request body: {}", e))
}
