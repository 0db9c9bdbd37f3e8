//! CDX API - the HTTP surface
//!
//! Routes, DTOs and output formatters for ingest, lookup, aliasing,
//! replication and access control. All business logic lives in
//! `cdx-index`; this crate translates between HTTP and the index.

pub mod dto;
pub mod error;
pub mod format;
pub mod params;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use server::{run_server, ApiConfig};
pub use state::AppState;
