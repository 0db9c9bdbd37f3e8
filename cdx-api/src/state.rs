//! Application state for the API server

use std::sync::Arc;

use cdx_index::query::CaptureFilter;
use cdx_index::{Config, DataStore, Index};

use crate::error::{ApiError, ApiResult};

/// API server state
#[derive(Clone)]
pub struct AppState {
    /// Registry of open collections
    pub store: Arc<DataStore>,
    /// Filter plugins applied to every lookup
    pub plugins: Arc<Vec<Arc<dyn CaptureFilter>>>,
}

impl AppState {
    pub fn new(store: Arc<DataStore>) -> AppState {
        AppState {
            store,
            plugins: Arc::new(Vec::new()),
        }
    }

    pub fn with_plugins(store: Arc<DataStore>, plugins: Vec<Arc<dyn CaptureFilter>>) -> AppState {
        AppState {
            store,
            plugins: Arc::new(plugins),
        }
    }

    pub fn config(&self) -> &Config {
        self.store.config()
    }

    /// Fetch an existing collection or fail with 404.
    pub fn index(&self, collection: &str) -> ApiResult<Arc<Index>> {
        self.store
            .get_index(collection)?
            .ok_or_else(|| ApiError::NotFound("Collection does not exist".to_string()))
    }

    /// Reject mutations on secondaries that do not accept writes.
    pub fn require_write_access(&self) -> ApiResult<()> {
        if self.config().accepts_local_writes() {
            Ok(())
        } else {
            Err(ApiError::Unauthorized(
                "This node is running in secondary mode to an upstream primary, \
                 and will not accept writes."
                    .to_string(),
            ))
        }
    }
}
