//! CDX Index - the indexing engine
//!
//! One [`Index`] per collection, each an embedded sled database holding
//! captures, aliases, access rules and policies as logical column
//! families plus a replication changelog. The [`DataStore`] is the
//! process-wide registry of open collections. The [`query`] module turns
//! a lookup URL into a lazy stream of captures; the [`access`] module
//! evaluates access rules; the [`replication`] module encodes and applies
//! the change feed.

pub mod access;
pub mod config;
pub mod datastore;
pub mod error;
pub mod index;
pub mod query;
pub mod replication;

pub use config::Config;
pub use datastore::DataStore;
pub use error::{IndexError, IndexResult};
pub use index::{Batch, Index};
pub use query::{CaptureFilter, MatchType, Query, Sort};
