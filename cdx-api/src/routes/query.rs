//! Lookup endpoints
//!
//! `GET /{collection}` serves three shapes: `?url=` runs a WB-CDX query,
//! `?q=` runs an OpenWayback XML query, and a bare request renders an
//! HTML stats page. `GET /{collection}/ap/{accesspoint}` is the same
//! lookup evaluated through an access point.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::header;
use axum::response::Response;

use cdx_core::capture::parse_timestamp;
use cdx_core::ssurt;
use cdx_index::query::{Field, FieldFilter, MatchType, Query, Sort};
use cdx_index::Index;

use crate::error::{ApiError, ApiResult};
use crate::format::{self, CaptureFormatter, JsonFormat, TextFormat, XmlFormat};
use crate::params::Params;
use crate::state::AppState;

pub async fn query(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Response> {
    run_query(state, collection, None, raw).await
}

pub async fn query_access_point(
    State(state): State<AppState>,
    Path((collection, accesspoint)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Response> {
    run_query(state, collection, Some(accesspoint), raw).await
}

async fn run_query(
    state: AppState,
    collection: String,
    access_point: Option<String>,
    raw: Option<String>,
) -> ApiResult<Response> {
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let index = state.index(&collection)?;

    if params.contains("q") {
        xml_query(&state, &index, &params)
    } else if params.contains("url") {
        wb_cdx_query(&state, &index, access_point, &params)
    } else {
        collection_details(&index).await
    }
}

/// The WB-CDX API: `?url=` plus `matchType`, `from`, `to`, `limit`,
/// `sort`, `closest`, `output`, `fl` and repeatable `filter` parameters.
fn wb_cdx_query(
    state: &AppState,
    index: &Arc<Index>,
    access_point: Option<String>,
    params: &Params,
) -> ApiResult<Response> {
    let mut url = params.get("url").unwrap_or_default().to_string();
    let mut match_type = MatchType::parse(params.get_or("matchType", "exact"))?;

    // pywb-style wildcard sugar in the url itself
    if let Some(domain) = url.strip_prefix("*.") {
        match_type = MatchType::Domain;
        url = format!("http://{}/", domain);
    } else if let Some(stem) = url.strip_suffix('*') {
        match_type = MatchType::Prefix;
        url = stem.to_string();
    }

    let mut query = Query::new(url);
    query.match_type = match_type;
    query.access_point = access_point;
    query.from = params.get("from").map(parse_timestamp).transpose()?;
    query.to = params.get("to").map(parse_to_timestamp).transpose()?;
    query.limit = parse_limit(params, 10_000)?;
    query.sort = Sort::parse(params.get_or("sort", "default"))?;
    query.closest = params.get("closest").map(parse_timestamp).transpose()?;
    query.plugins = state.plugins.as_ref().clone();
    for spec in params.all("filter") {
        query.filters.push(FieldFilter::parse(spec)?);
    }

    let fields = parse_field_list(params)?;
    let formatter: Box<dyn CaptureFormatter> = match params.get_or("output", "text") {
        "json" => Box::new(JsonFormat::new(fields)),
        "text" => Box::new(TextFormat::new(fields)),
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown output format: {}",
                other
            )))
        }
    };

    let iter = index.query(query)?;
    streamed_response(iter, formatter)
}

/// The OpenWayback XML API: `?q=type:urlquery url:...`.
fn xml_query(state: &AppState, index: &Arc<Index>, params: &Params) -> ApiResult<Response> {
    let q = params.get("q").unwrap_or_default();
    let mut query_type = "urlquery";
    let mut url = None;
    for term in q.split_whitespace() {
        let Some((key, value)) = term.split_once(':') else {
            continue;
        };
        match key {
            "type" => {
                query_type = match value {
                    "urlquery" => "urlquery",
                    "prefixquery" => "prefixquery",
                    other => {
                        return Err(ApiError::BadRequest(format!(
                            "unknown query type: {}",
                            other
                        )))
                    }
                }
            }
            // the url term is percent-encoded a second time within q
            "url" => {
                url = Some(String::from_utf8_lossy(&ssurt::percent_decode(value)).into_owned())
            }
            _ => {}
        }
    }
    let url = url.ok_or_else(|| ApiError::BadRequest("q is missing a url term".to_string()))?;

    let limit = parse_limit(params, 10_000)?;
    let urlkey = ssurt::ssurt(&url)?;
    let mut query = Query::new(url);
    query.limit = limit;
    query.match_type = if query_type == "prefixquery" {
        MatchType::Prefix
    } else {
        MatchType::Exact
    };
    query.plugins = state.plugins.as_ref().clone();

    let iter = index.query(query)?;
    streamed_response(iter, Box::new(XmlFormat::new(query_type, urlkey, limit)))
}

/// Bare `GET /{collection}`: a small HTML page with collection stats.
async fn collection_details(index: &Arc<Index>) -> ApiResult<Response> {
    let index = Arc::clone(index);
    let (records, bytes) = tokio::task::spawn_blocking(move || {
        let records = index.estimated_record_count();
        let bytes = index.size_on_disk();
        (records, bytes)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    let page = format!(
        "<form>URL: <input name=url type=url><button type=submit>Query</button></form>\n\
         <pre>Estimated number of records: {}\nSize on disk: {} bytes</pre>",
        records,
        bytes.map(|b| b.to_string()).unwrap_or_else(|e| e.to_string()),
    );
    Response::builder()
        .header(header::CONTENT_TYPE, "text/html")
        .body(page.into())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn streamed_response<I>(iter: I, formatter: Box<dyn CaptureFormatter>) -> ApiResult<Response>
where
    I: Iterator<Item = cdx_index::IndexResult<cdx_core::Capture>> + Send + 'static,
{
    let content_type = formatter.content_type();
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(format::stream_captures(iter, formatter))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn parse_limit(params: &Params, default: usize) -> ApiResult<usize> {
    match params.get("limit") {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("bad limit: {}", raw))),
    }
}

fn parse_field_list(params: &Params) -> ApiResult<Vec<Field>> {
    match params.get("fl") {
        None => Ok(Field::ALL.to_vec()),
        Some(list) => list
            .split(',')
            .map(|name| Field::parse(name.trim()).map_err(ApiError::from))
            .collect(),
    }
}

/// An inclusive upper bound: short timestamps are padded with nines so
/// `to=2020` covers all of 2020.
fn parse_to_timestamp(s: &str) -> Result<u64, cdx_core::CdxError> {
    if s.is_empty() || s.len() > 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(cdx_core::CdxError::BadTimestamp(s.to_string()));
    }
    let mut padded = s.to_string();
    while padded.len() < 14 {
        padded.push('9');
    }
    padded
        .parse::<u64>()
        .map_err(|_| cdx_core::CdxError::BadTimestamp(s.to_string()))
}
