//! Replication endpoints
//!
//! A secondary polls `GET /{collection}/changes?since=N` for the batches
//! it has not yet applied, applies them verbatim, and remembers the last
//! sequence number it saw. `POST /{collection}/truncate_replication`
//! lets an operator discard the log once every follower has caught up.

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use tokio::sync::mpsc;

use crate::dto::TruncateResponse;
use crate::error::{ApiError, ApiResult};
use crate::params::Params;
use crate::state::AppState;

/// Latest committed sequence number.
pub async fn sequence(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Response> {
    let index = state.index(&collection)?;
    Response::builder()
        .header(header::CONTENT_TYPE, "text/html")
        .body(index.latest_sequence().to_string().into())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Stream every batch committed after the given sequence number as a
/// JSON array of `{sequenceNumber, writeBatch}` objects.
pub async fn changes(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    RawQuery(raw): RawQuery,
) -> ApiResult<Response> {
    let params = Params::parse(raw.as_deref().unwrap_or(""));
    let since: u64 = params
        .get("since")
        .ok_or_else(|| ApiError::BadRequest("missing since parameter".to_string()))?
        .parse()
        .map_err(|_| ApiError::BadRequest("bad since parameter".to_string()))?;
    let index = state.index(&collection)?;

    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(16);
    tokio::task::spawn_blocking(move || {
        let mut first = true;
        if tx.blocking_send(Ok(Bytes::from_static(b"["))).is_err() {
            return;
        }
        for entry in index.get_updates_since(since) {
            let chunk = match entry.and_then(|e| {
                serde_json::to_string(&e).map_err(|err| err.into())
            }) {
                Ok(json) => {
                    let mut chunk = String::new();
                    if !first {
                        chunk.push(',');
                    }
                    first = false;
                    chunk.push_str(&json);
                    chunk
                }
                Err(e) => {
                    tracing::error!(error = %e, "change feed halted");
                    return;
                }
            };
            if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                return;
            }
        }
        let _ = tx.blocking_send(Ok(Bytes::from_static(b"]")));
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Fsync and truncate the replication log.
pub async fn truncate(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Json<TruncateResponse>> {
    let index = state.index(&collection)?;
    tokio::task::spawn_blocking(move || index.flush_wal())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(TruncateResponse { success: true }))
}
