//! Change-feed polling for secondary mode
//!
//! Periodically asks the upstream primary for its collections, then for
//! each collection fetches every batch committed after our latest local
//! sequence number and applies them verbatim. At-least-once delivery:
//! re-applying a batch the secondary already has is a no-op.

use std::sync::Arc;
use std::time::Duration;

use cdx_index::replication::ChangeFeedEntry;
use cdx_index::DataStore;

pub async fn run(store: Arc<DataStore>, primary_url: String, interval: Duration) {
    let primary_url = primary_url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();
    tracing::info!(primary = %primary_url, "replication poller started");
    loop {
        if let Err(e) = poll_once(&store, &client, &primary_url).await {
            tracing::warn!(primary = %primary_url, error = %e, "replication poll failed");
        }
        tokio::time::sleep(interval).await;
    }
}

async fn poll_once(
    store: &Arc<DataStore>,
    client: &reqwest::Client,
    primary_url: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let collections: Vec<String> = client
        .get(format!("{}/api/collections", primary_url))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    for collection in collections {
        let index = store.get_or_create_index(&collection)?;
        let since = index.latest_sequence();
        let entries: Vec<ChangeFeedEntry> = client
            .get(format!(
                "{}/{}/changes?since={}",
                primary_url, collection, since
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if entries.is_empty() {
            continue;
        }

        let applied = entries.len();
        let last = entries.last().map(|e| e.sequence_number).unwrap_or(since);
        let apply_index = Arc::clone(&index);
        tokio::task::spawn_blocking(move || {
            for entry in &entries {
                apply_index.apply_replicated(entry)?;
            }
            Ok::<(), cdx_index::IndexError>(())
        })
        .await??;

        tracing::info!(
            collection = %collection,
            applied,
            sequence = last,
            "replicated batches from primary"
        );
    }
    Ok(())
}
