//! CDX Core - web archive index primitives
//!
//! This crate provides the building blocks shared by the index and API
//! layers:
//! - SSURT canonicalisation and the URL pattern grammar used for range
//!   scans and access-rule prefixes
//! - The binary key/value codecs for capture and alias records, with a
//!   byte-wise sort-order contract
//! - Legacy CDX line parsing for the ingest path
//! - Access rule and policy types with pure evaluation logic

pub mod access;
pub mod alias;
pub mod capture;
pub mod error;
pub mod ssurt;

pub use alias::Alias;
pub use capture::Capture;
pub use error::{CdxError, CdxResult};
