//! Access rule and policy types
//!
//! Rules select captures by SSURT prefix and by capture-time and
//! access-time windows; policies name the access points allowed to see
//! the captures a rule matched. Everything here is pure data and pure
//! functions; storage and id allocation live in the index layer.

use chrono::{DateTime, Days, Months, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CdxError, CdxResult};
use crate::ssurt;

/// An inclusive time window. Either bound may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| s <= time) && self.end.map_or(true, |e| time <= e)
    }

    /// A window whose bounds have crossed can never match anything.
    pub fn is_empty(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }
}

/// A calendar span measured from capture time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    #[serde(default)]
    pub years: u32,
    #[serde(default)]
    pub months: u32,
    #[serde(default)]
    pub days: u32,
}

impl Period {
    pub fn is_zero(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0
    }

    /// The instant this period ends when measured from `capture`.
    pub fn end_from(&self, capture: DateTime<Utc>) -> DateTime<Utc> {
        capture
            .checked_add_months(Months::new(self.years * 12 + self.months))
            .and_then(|t| t.checked_add_days(Days::new(self.days as u64)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Selects captures and binds them to a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub policy_id: u64,
    pub name: String,
    /// URL patterns in the grammar of [`ssurt::to_ssurt_prefix`]. Empty
    /// means the rule is global.
    pub url_patterns: Vec<String>,
    /// Window the capture time must fall within
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured: Option<DateRange>,
    /// Window the access time must fall within
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessed: Option<DateRange>,
    /// Embargo measured from capture time: the rule applies until
    /// capture + period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
    /// Pinned rules take precedence over any non-pinned rule
    pub pinned: bool,
}

impl AccessRule {
    /// The SSURT prefixes this rule is indexed under.
    pub fn ssurt_prefixes(&self) -> CdxResult<Vec<String>> {
        self.url_patterns
            .iter()
            .map(|p| ssurt::to_ssurt_prefix(p))
            .collect()
    }

    /// Check well-formedness, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for pattern in &self.url_patterns {
            if let Err(e) = ssurt::to_ssurt_prefix(pattern) {
                errors.push(format!("url pattern {:?}: {}", pattern, e));
            }
        }
        if self.captured.as_ref().is_some_and(DateRange::is_empty) {
            errors.push("captured date range is empty".to_string());
        }
        if self.accessed.as_ref().is_some_and(DateRange::is_empty) {
            errors.push("accessed date range is empty".to_string());
        }
        errors
    }

    /// Whether the rule's time constraints hold for the given capture and
    /// access times.
    pub fn time_windows_contain(
        &self,
        capture_time: DateTime<Utc>,
        access_time: DateTime<Utc>,
    ) -> bool {
        if let Some(captured) = &self.captured {
            if !captured.contains(capture_time) {
                return false;
            }
        }
        if let Some(accessed) = &self.accessed {
            if !accessed.contains(access_time) {
                return false;
            }
        }
        if let Some(period) = &self.period {
            if !period.is_zero() && access_time > period.end_from(capture_time) {
                return false;
            }
        }
        true
    }

    /// Substring search across the rule's text fields, for the listing
    /// endpoint's `search` parameter.
    pub fn contains_text(&self, search: &str) -> bool {
        let search = search.to_lowercase();
        self.name.to_lowercase().contains(&search)
            || self
                .url_patterns
                .iter()
                .any(|p| p.to_lowercase().contains(&search))
    }
}

/// Names the access points permitted to view matched captures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    pub access_points: Vec<String>,
}

impl AccessPolicy {
    pub fn permits(&self, access_point: &str) -> bool {
        self.access_points.iter().any(|ap| ap == access_point)
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<u64>,
}

impl AccessDecision {
    pub fn unruled(allowed: bool) -> AccessDecision {
        AccessDecision {
            allowed,
            rule_id: None,
            policy_id: None,
        }
    }
}

/// Pick the winning rule from candidates paired with the byte length of
/// the prefix that matched (0 for global rules): pinned first, then most
/// specific prefix, then lowest id.
pub fn select_rule<'a>(
    mut candidates: Vec<(usize, &'a AccessRule)>,
) -> Option<&'a AccessRule> {
    candidates.sort_by(|(len_a, a), (len_b, b)| {
        b.pinned
            .cmp(&a.pinned)
            .then(len_b.cmp(len_a))
            .then(a.id.cmp(&b.id))
    });
    candidates.first().map(|(_, rule)| *rule)
}

/// Convert a 14-digit capture timestamp to a UTC instant.
pub fn capture_datetime(timestamp: u64) -> CdxResult<DateTime<Utc>> {
    let text = format!("{:014}", timestamp);
    NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| CdxError::BadTimestamp(text))
}
