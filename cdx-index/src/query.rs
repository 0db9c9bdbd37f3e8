//! The query pipeline
//!
//! Turns a lookup URL into a lazy stream of captures: canonicalise,
//! resolve aliases one hop, compute the scan prefix for the match type,
//! then decode, rewrite, filter and bound the range scan. The pipeline is
//! fully streaming except for `sort=closest`, which merges a forward and
//! a backward scan around the requested timestamp.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;

use cdx_core::access::capture_datetime;
use cdx_core::{ssurt, Capture};

use crate::error::{IndexError, IndexResult};
use crate::index::Index;
use crate::replication::{cf_key, Cf};

/// How much of the key space a lookup URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchType {
    /// Captures of exactly this URL
    #[default]
    Exact,
    /// Captures whose SSURT starts with this URL's SSURT
    Prefix,
    /// Every capture on this host
    Host,
    /// Every capture on this domain and its subdomains
    Domain,
}

impl MatchType {
    pub fn parse(s: &str) -> IndexResult<MatchType> {
        match s {
            "exact" => Ok(MatchType::Exact),
            "prefix" => Ok(MatchType::Prefix),
            "host" => Ok(MatchType::Host),
            "domain" => Ok(MatchType::Domain),
            _ => Err(IndexError::BadQuery(format!("unknown matchType: {}", s))),
        }
    }
}

/// Result ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sort {
    /// Key order: urlkey ascending, timestamp ascending
    #[default]
    Default,
    /// Ascending distance from the `closest` timestamp; exact match only
    Closest,
    /// Reverse key order
    Reverse,
}

impl Sort {
    pub fn parse(s: &str) -> IndexResult<Sort> {
        match s {
            "default" => Ok(Sort::Default),
            "closest" => Ok(Sort::Closest),
            "reverse" => Ok(Sort::Reverse),
            _ => Err(IndexError::BadQuery(format!("unknown sort: {}", s))),
        }
    }
}

/// The CDX fields a capture can be projected onto or filtered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Urlkey,
    Timestamp,
    Original,
    Mimetype,
    Statuscode,
    Digest,
    Redirecturl,
    Robotflags,
    Length,
    Offset,
    Filename,
}

impl Field {
    pub const ALL: [Field; 11] = [
        Field::Urlkey,
        Field::Timestamp,
        Field::Original,
        Field::Mimetype,
        Field::Statuscode,
        Field::Digest,
        Field::Redirecturl,
        Field::Robotflags,
        Field::Length,
        Field::Offset,
        Field::Filename,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Urlkey => "urlkey",
            Field::Timestamp => "timestamp",
            Field::Original => "original",
            Field::Mimetype => "mimetype",
            Field::Statuscode => "statuscode",
            Field::Digest => "digest",
            Field::Redirecturl => "redirecturl",
            Field::Robotflags => "robotflags",
            Field::Length => "length",
            Field::Offset => "offset",
            Field::Filename => "filename",
        }
    }

    pub fn parse(s: &str) -> IndexResult<Field> {
        Field::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| IndexError::BadQuery(format!("unknown field: {}", s)))
    }

    pub fn string_value(self, capture: &Capture) -> String {
        match self {
            Field::Urlkey => capture.urlkey.clone(),
            Field::Timestamp => format!("{:014}", capture.timestamp),
            Field::Original => capture.original.clone(),
            Field::Mimetype => capture.mimetype.clone(),
            Field::Statuscode => capture.status.to_string(),
            Field::Digest => capture.digest.clone(),
            Field::Redirecturl => capture.redirecturl.clone(),
            Field::Robotflags => capture.robotflags.clone(),
            Field::Length => capture.length.to_string(),
            Field::Offset => capture.offset.to_string(),
            Field::Filename => capture.file.clone(),
        }
    }

    pub fn json_value(self, capture: &Capture) -> serde_json::Value {
        match self {
            Field::Timestamp => capture.timestamp.into(),
            Field::Statuscode => capture.status.into(),
            Field::Length => capture.length.into(),
            Field::Offset => capture.offset.into(),
            _ => self.string_value(capture).into(),
        }
    }
}

/// A server-side `filter=[!]field:regex` predicate. The regex must match
/// the whole field value.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    field: Field,
    pattern: Regex,
    negate: bool,
}

impl FieldFilter {
    pub fn parse(spec: &str) -> IndexResult<FieldFilter> {
        let (negate, spec) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let (field, expr) = spec
            .split_once(':')
            .ok_or_else(|| IndexError::BadQuery(format!("bad filter: {}", spec)))?;
        let field = Field::parse(field)?;
        let pattern = Regex::new(&format!("^(?:{})$", expr))
            .map_err(|e| IndexError::BadQuery(format!("bad filter regex: {}", e)))?;
        Ok(FieldFilter {
            field,
            pattern,
            negate,
        })
    }

    pub fn accepts(&self, capture: &Capture) -> bool {
        self.pattern.is_match(&self.field.string_value(capture)) != self.negate
    }
}

/// A pluggable predicate over captures, applied after access filtering.
pub trait CaptureFilter: Send + Sync {
    fn accepts(&self, capture: &Capture) -> bool;
}

/// A fully parsed lookup.
pub struct Query {
    pub url: String,
    pub match_type: MatchType,
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub limit: usize,
    pub sort: Sort,
    pub closest: Option<u64>,
    pub access_point: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub plugins: Vec<Arc<dyn CaptureFilter>>,
}

impl Query {
    pub fn new(url: impl Into<String>) -> Query {
        Query {
            url: url.into(),
            match_type: MatchType::Exact,
            from: None,
            to: None,
            limit: 10_000,
            sort: Sort::Default,
            closest: None,
            access_point: None,
            filters: Vec::new(),
            plugins: Vec::new(),
        }
    }
}

impl Index {
    /// Run the lookup pipeline. The returned iterator holds a live range
    /// scan; dropping it releases the scan.
    pub fn query(
        self: &Arc<Self>,
        query: Query,
    ) -> IndexResult<Box<dyn Iterator<Item = IndexResult<Capture>> + Send>> {
        let now = Utc::now();
        let surt = ssurt::ssurt(&query.url)?;

        let (resolved, aliased) = match self.resolve_alias(&surt)? {
            Some(target) => (target, true),
            None => (surt, false),
        };

        let base: Box<dyn Iterator<Item = IndexResult<Capture>> + Send> = match query.sort {
            Sort::Default => Box::new(self.scan(scan_prefix(&query, &resolved)?)),
            Sort::Reverse => Box::new(self.scan_reverse(scan_prefix(&query, &resolved)?)),
            Sort::Closest => {
                if query.match_type != MatchType::Exact {
                    return Err(IndexError::BadQuery(
                        "sort=closest requires matchType=exact".into(),
                    ));
                }
                let closest = query.closest.ok_or_else(|| {
                    IndexError::BadQuery("sort=closest requires a closest timestamp".into())
                })?;
                Box::new(self.scan_closest(&resolved, closest))
            }
        };

        let index = Arc::clone(self);
        let requested_url = query.url.clone();
        let Query {
            from,
            to,
            limit,
            access_point,
            filters,
            plugins,
            ..
        } = query;

        let iter = base
            .map(move |item| {
                item.map(|mut capture| {
                    if aliased {
                        capture.original = requested_url.clone();
                    }
                    capture
                })
            })
            .filter(move |item| {
                let Ok(capture) = item else { return true };
                if from.is_some_and(|from| capture.timestamp < from)
                    || to.is_some_and(|to| capture.timestamp > to)
                {
                    return false;
                }
                if !filters.iter().all(|f| f.accepts(capture))
                    || !plugins.iter().all(|p| p.accepts(capture))
                {
                    return false;
                }
                match &access_point {
                    None => true,
                    Some(ap) => allowed(&index, ap, capture, now),
                }
            })
            .take(limit);
        Ok(Box::new(iter))
    }

    fn scan(&self, prefix: Vec<u8>) -> impl Iterator<Item = IndexResult<Capture>> + Send + 'static {
        self.db
            .range(prefix.clone()..)
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            })
            .map(decode_capture)
    }

    fn scan_reverse(
        &self,
        prefix: Vec<u8>,
    ) -> impl Iterator<Item = IndexResult<Capture>> + Send + 'static {
        let iter = match upper_bound(&prefix) {
            Some(upper) => self.db.range(prefix..upper),
            None => self.db.range(prefix..),
        };
        iter.rev().map(decode_capture)
    }

    /// Merge a forward and a backward scan of one urlkey, always yielding
    /// the capture whose timestamp is numerically nearest to `closest`.
    fn scan_closest(
        &self,
        urlkey: &str,
        closest: u64,
    ) -> impl Iterator<Item = IndexResult<Capture>> + Send + 'static {
        let prefix = exact_prefix(urlkey);
        let center = cf_key(Cf::Default, &cdx_core::capture::encode_key(urlkey, closest));
        let forward = self
            .db
            .range(center.clone()..)
            .take_while({
                let prefix = prefix.clone();
                move |item| match item {
                    Ok((key, _)) => key.starts_with(&prefix),
                    Err(_) => true,
                }
            })
            .map(decode_capture);
        let backward = self.db.range(prefix..center).rev().map(decode_capture);
        ClosestIter {
            forward: forward.peekable(),
            backward: backward.peekable(),
            closest,
        }
    }
}

fn decode_capture(item: Result<(sled::IVec, sled::IVec), sled::Error>) -> IndexResult<Capture> {
    let (key, value) = item?;
    Ok(Capture::decode(&key[1..], &value)?)
}

fn allowed(index: &Index, access_point: &str, capture: &Capture, now: DateTime<Utc>) -> bool {
    let Ok(capture_time) = capture_datetime(capture.timestamp) else {
        return false;
    };
    match index.check_access(access_point, &capture.original, capture_time, now) {
        Ok(decision) => decision.allowed,
        Err(e) => {
            tracing::warn!(error = %e, url = %capture.original, "access check failed, denying");
            false
        }
    }
}

fn exact_prefix(urlkey: &str) -> Vec<u8> {
    let mut prefix = cf_key(Cf::Default, urlkey.as_bytes());
    prefix.push(cdx_core::capture::KEY_SEPARATOR);
    prefix
}

fn scan_prefix(query: &Query, resolved_surt: &str) -> IndexResult<Vec<u8>> {
    Ok(match query.match_type {
        MatchType::Exact => exact_prefix(resolved_surt),
        MatchType::Prefix => cf_key(Cf::Default, resolved_surt.as_bytes()),
        MatchType::Host => cf_key(Cf::Default, host_scan_prefix(resolved_surt)?.as_bytes()),
        MatchType::Domain => cf_key(Cf::Default, domain_scan_prefix(resolved_surt)?.as_bytes()),
    })
}

/// The sshost portion of an SSURT plus the following `:`, matching every
/// port, scheme and userinfo on that host.
fn host_scan_prefix(surt: &str) -> IndexResult<String> {
    let host_end = sshost_end(surt)?;
    Ok(format!("{}:", &surt[..host_end]))
}

/// The reversed-domain stem, matching the domain and all its subdomains.
/// IP hosts have no subdomains, so the prefix closes with `:`.
fn domain_scan_prefix(surt: &str) -> IndexResult<String> {
    let host_end = sshost_end(surt)?;
    let host = &surt[..host_end];
    if host.ends_with(',') {
        Ok(host.to_string())
    } else {
        Ok(format!("{}:", host))
    }
}

fn sshost_end(surt: &str) -> IndexResult<usize> {
    let corrupt = || IndexError::Storage(format!("not a valid ssurt: {}", surt));
    if surt.starts_with('[') {
        surt.find(']').map(|i| i + 1).ok_or_else(corrupt)
    } else {
        surt.find(':').ok_or_else(corrupt)
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or `None` when the prefix is all `0xff`.
fn upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xff {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

struct ClosestIter<F: Iterator, B: Iterator> {
    forward: std::iter::Peekable<F>,
    backward: std::iter::Peekable<B>,
    closest: u64,
}

impl<F, B> Iterator for ClosestIter<F, B>
where
    F: Iterator<Item = IndexResult<Capture>>,
    B: Iterator<Item = IndexResult<Capture>>,
{
    type Item = IndexResult<Capture>;

    fn next(&mut self) -> Option<Self::Item> {
        let closest = self.closest;
        match (self.forward.peek(), self.backward.peek()) {
            (None, None) => None,
            (Some(_), None) => self.forward.next(),
            (None, Some(_)) => self.backward.next(),
            (Some(Err(_)), _) => self.forward.next(),
            (_, Some(Err(_))) => self.backward.next(),
            (Some(Ok(ahead)), Some(Ok(behind))) => {
                if ahead.timestamp.abs_diff(closest) <= behind.timestamp.abs_diff(closest) {
                    self.forward.next()
                } else {
                    self.backward.next()
                }
            }
        }
    }
}
