//! CDX ingest endpoints
//!
//! `POST /{collection}` adds captures and aliases, `POST
//! /{collection}/delete` removes captures. The request body is a stream
//! of newline-terminated CDX lines; the whole request commits as one
//! atomic batch. The first bad line aborts the batch with a 400 naming
//! the line, unless `badLines=skip` was given.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::response::Response;
use futures::StreamExt;

use cdx_core::{ssurt, Capture, CdxError, CdxResult};
use cdx_index::Batch;

use crate::error::{ApiError, ApiResult};
use crate::params::Params;
use crate::state::AppState;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Add,
    Delete,
}

pub async fn post(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
    body: Body,
) -> ApiResult<Response> {
    ingest(state, collection, raw, body, Mode::Add).await
}

pub async fn delete(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
    body: Body,
) -> ApiResult<Response> {
    ingest(state, collection, raw, body, Mode::Delete).await
}

async fn ingest(
    state: AppState,
    collection: String,
    raw: Option<String>,
    body: Body,
    mode: Mode,
) -> ApiResult<Response> {
    state.require_write_access()?;
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let skip_bad = params.get_or("badLines", "error") == "skip";

    let index = state.store.get_or_create_index(&collection)?;
    let mut batch = index.begin_update();
    let mut count = 0u64;

    let mut stream = body.into_data_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("body read failed: {}", e)))?;
        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            count += handle_line(&mut batch, &line[..newline], mode, skip_bad)? as u64;
        }
    }
    if !buffer.is_empty() {
        count += handle_line(&mut batch, &buffer, mode, skip_bad)? as u64;
    }

    let sequence = tokio::task::spawn_blocking(move || batch.commit())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    let verb = if mode == Mode::Delete { "Deleted" } else { "Added" };
    tracing::info!(
        collection = %collection,
        count,
        sequence,
        "{} records", verb.to_lowercase()
    );
    Response::builder()
        .header(axum::http::header::CONTENT_TYPE, "text/plain")
        .body(format!("{} {} records\n", verb, count).into())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Apply one CDX line to the batch. Returns whether a record was added.
fn handle_line(batch: &mut Batch, line: &[u8], mode: Mode, skip_bad: bool) -> ApiResult<bool> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ApiError::BadRequest("request body is not utf-8".to_string()))?
        .trim_end_matches('\r');
    if line.is_empty() || line.starts_with(" CDX") {
        return Ok(false);
    }

    let result = apply_line(batch, line, mode);
    match result {
        Ok(()) => Ok(true),
        Err(e) if skip_bad && mode == Mode::Add => {
            tracing::warn!(error = %e, line, "skipping bad cdx line");
            Ok(false)
        }
        Err(e) => Err(ApiError::BadRequest(format!("At line: {}\n{}", line, e))),
    }
}

fn apply_line(batch: &mut Batch, line: &str, mode: Mode) -> CdxResult<()> {
    if let Some(alias) = line.strip_prefix("@alias ") {
        if mode == Mode::Delete {
            return Err(CdxError::BadCdxLine(
                "deleting aliases is not supported".to_string(),
            ));
        }
        let mut fields = alias.split(' ').filter(|f| !f.is_empty());
        let (Some(alias_url), Some(target_url)) = (fields.next(), fields.next()) else {
            return Err(CdxError::BadCdxLine(
                "@alias requires an alias url and a target url".to_string(),
            ));
        };
        batch.put_alias(&ssurt::ssurt(alias_url)?, &ssurt::ssurt(target_url)?);
        return Ok(());
    }

    let capture = Capture::from_cdx_line(line)?;
    match mode {
        Mode::Add => batch.put_capture(&capture),
        Mode::Delete => batch.delete_capture(&capture),
    }
    Ok(())
}
