//! Access rule and policy storage
//!
//! Rules and policies live in their own column families keyed by
//! monotonic 64-bit ids. The full rule set is cached in memory and
//! indexed by SSURT prefix so an access check is a bounded number of map
//! probes over the ancestor prefixes of the query URL. Id counters are
//! persisted in the same atomic commit that uses them, so ids are never
//! reused across restarts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use cdx_core::access::{
    capture_datetime, select_rule, AccessDecision, AccessPolicy, AccessRule,
};
use cdx_core::ssurt;

use crate::error::{IndexError, IndexResult};
use crate::index::{decode_u64, Index, META_NEXT_POLICY_ID, META_NEXT_RULE_ID};
use crate::replication::{cf_key, BatchOp, Cf};

/// In-memory view of a collection's rules and policies.
#[derive(Debug)]
pub struct AccessControl {
    rules: RwLock<BTreeMap<u64, AccessRule>>,
    policies: RwLock<BTreeMap<u64, AccessPolicy>>,
    /// Rule ids grouped by SSURT prefix; the empty prefix holds global
    /// rules (no URL patterns).
    rules_by_prefix: RwLock<BTreeMap<String, Vec<u64>>>,
    next_rule_id: AtomicU64,
    next_policy_id: AtomicU64,
    /// Serialises id allocation with the commit that persists it.
    write_lock: Mutex<()>,
}

impl AccessControl {
    /// Load the rule and policy column families into memory.
    pub(crate) fn load(db: &sled::Db) -> IndexResult<AccessControl> {
        let control = AccessControl {
            rules: RwLock::new(BTreeMap::new()),
            policies: RwLock::new(BTreeMap::new()),
            rules_by_prefix: RwLock::new(BTreeMap::new()),
            next_rule_id: AtomicU64::new(1),
            next_policy_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        };
        control.reload(db)?;
        Ok(control)
    }

    /// Rebuild every cache from the database.
    pub(crate) fn reload(&self, db: &sled::Db) -> IndexResult<()> {
        let mut rules = BTreeMap::new();
        for item in db.scan_prefix([Cf::AccessRule.prefix()]) {
            let (_, value) = item?;
            let rule: AccessRule = serde_json::from_slice(&value)
                .map_err(|e| IndexError::Storage(format!("corrupt access rule: {}", e)))?;
            let id = rule
                .id
                .ok_or_else(|| IndexError::Storage("stored access rule without id".into()))?;
            rules.insert(id, rule);
        }

        let mut policies = BTreeMap::new();
        for item in db.scan_prefix([Cf::AccessPolicy.prefix()]) {
            let (_, value) = item?;
            let policy: AccessPolicy = serde_json::from_slice(&value)
                .map_err(|e| IndexError::Storage(format!("corrupt access policy: {}", e)))?;
            let id = policy
                .id
                .ok_or_else(|| IndexError::Storage("stored access policy without id".into()))?;
            policies.insert(id, policy);
        }

        let mut by_prefix: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (id, rule) in &rules {
            index_rule(&mut by_prefix, *id, rule)?;
        }

        let next_rule = match db.get(cf_key(Cf::Meta, META_NEXT_RULE_ID))? {
            Some(bytes) => decode_u64(&bytes)?,
            None => rules.keys().next_back().map_or(1, |max| max + 1),
        };
        let next_policy = match db.get(cf_key(Cf::Meta, META_NEXT_POLICY_ID))? {
            Some(bytes) => decode_u64(&bytes)?,
            None => policies.keys().next_back().map_or(1, |max| max + 1),
        };

        *self.rules.write() = rules;
        *self.policies.write() = policies;
        *self.rules_by_prefix.write() = by_prefix;
        self.next_rule_id.store(next_rule, Ordering::Release);
        self.next_policy_id.store(next_policy, Ordering::Release);
        Ok(())
    }

    fn rules_matching(
        &self,
        padded_ssurt: &str,
        capture_time: DateTime<Utc>,
        access_time: DateTime<Utc>,
    ) -> Vec<(usize, AccessRule)> {
        let rules = self.rules.read();
        let by_prefix = self.rules_by_prefix.read();
        let mut matched = Vec::new();
        for end in 0..=padded_ssurt.len() {
            let Some(ids) = by_prefix.get(&padded_ssurt[..end]) else {
                continue;
            };
            for id in ids {
                if let Some(rule) = rules.get(id) {
                    if rule.time_windows_contain(capture_time, access_time) {
                        matched.push((end, rule.clone()));
                    }
                }
            }
        }
        matched
    }

    fn decide(
        &self,
        access_point: &str,
        url: &str,
        capture_time: DateTime<Utc>,
        access_time: DateTime<Utc>,
        default_deny: bool,
    ) -> IndexResult<AccessDecision> {
        let padded = format!("{}{}", ssurt::ssurt(url)?, ssurt::EXACT_SENTINEL);
        let matched = self.rules_matching(&padded, capture_time, access_time);
        let candidates: Vec<(usize, &AccessRule)> =
            matched.iter().map(|(len, rule)| (*len, rule)).collect();

        let Some(rule) = select_rule(candidates) else {
            return Ok(AccessDecision::unruled(!default_deny));
        };

        // a dangling policy id denies rather than falling open
        let allowed = self
            .policies
            .read()
            .get(&rule.policy_id)
            .is_some_and(|policy| policy.permits(access_point));
        Ok(AccessDecision {
            allowed,
            rule_id: rule.id,
            policy_id: Some(rule.policy_id),
        })
    }
}

fn index_rule(
    by_prefix: &mut BTreeMap<String, Vec<u64>>,
    id: u64,
    rule: &AccessRule,
) -> IndexResult<()> {
    let prefixes = rule
        .ssurt_prefixes()
        .map_err(|e| IndexError::Storage(format!("stored access rule {}: {}", id, e)))?;
    if prefixes.is_empty() {
        by_prefix.entry(String::new()).or_default().push(id);
    } else {
        for prefix in prefixes {
            by_prefix.entry(prefix).or_default().push(id);
        }
    }
    Ok(())
}

fn unindex_rule(by_prefix: &mut BTreeMap<String, Vec<u64>>, id: u64) {
    by_prefix.retain(|_, ids| {
        ids.retain(|other| *other != id);
        !ids.is_empty()
    });
}

impl Index {
    /// Evaluate access for one URL. Pure with respect to the stored rules
    /// and policies: the same inputs always produce the same decision.
    pub fn check_access(
        &self,
        access_point: &str,
        url: &str,
        capture_time: DateTime<Utc>,
        access_time: DateTime<Utc>,
    ) -> IndexResult<AccessDecision> {
        self.access
            .decide(access_point, url, capture_time, access_time, self.default_deny)
    }

    /// Evaluate access for many `(url, timestamp)` pairs independently.
    pub fn check_access_bulk(
        &self,
        access_point: &str,
        queries: &[(String, u64)],
        access_time: DateTime<Utc>,
    ) -> IndexResult<Vec<AccessDecision>> {
        queries
            .iter()
            .map(|(url, timestamp)| {
                let capture_time = capture_datetime(*timestamp)?;
                self.check_access(access_point, url, capture_time, access_time)
            })
            .collect()
    }

    /// Create or replace a rule. Returns the allocated id when the rule
    /// was posted without one.
    pub fn put_rule(&self, mut rule: AccessRule) -> IndexResult<Option<u64>> {
        let errors = rule.validate();
        if !errors.is_empty() {
            return Err(IndexError::Storage(format!(
                "invalid access rule: {}",
                errors.join("; ")
            )));
        }

        let _guard = self.access.write_lock.lock();
        let created = rule.id.is_none();
        let id = match rule.id {
            Some(id) => id,
            None => self.access.next_rule_id.load(Ordering::Acquire),
        };
        rule.id = Some(id);

        let next = self
            .access
            .next_rule_id
            .load(Ordering::Acquire)
            .max(id + 1);
        let ops = vec![
            BatchOp::Put {
                cf: Cf::AccessRule,
                key: id.to_be_bytes().to_vec(),
                value: serde_json::to_vec(&rule)?,
            },
            BatchOp::Put {
                cf: Cf::Meta,
                key: META_NEXT_RULE_ID.to_vec(),
                value: next.to_be_bytes().to_vec(),
            },
        ];
        self.commit(ops)?;
        self.access.next_rule_id.store(next, Ordering::Release);

        let mut by_prefix = self.access.rules_by_prefix.write();
        unindex_rule(&mut by_prefix, id);
        index_rule(&mut by_prefix, id, &rule)?;
        self.access.rules.write().insert(id, rule);
        tracing::info!(collection = %self.name, rule = id, "access rule stored");
        Ok(created.then_some(id))
    }

    /// Delete a rule by id. Returns whether it existed.
    pub fn delete_rule(&self, id: u64) -> IndexResult<bool> {
        let _guard = self.access.write_lock.lock();
        if !self.access.rules.read().contains_key(&id) {
            return Ok(false);
        }
        let ops = vec![BatchOp::Delete {
            cf: Cf::AccessRule,
            key: id.to_be_bytes().to_vec(),
        }];
        self.commit(ops)?;
        self.access.rules.write().remove(&id);
        unindex_rule(&mut self.access.rules_by_prefix.write(), id);
        tracing::info!(collection = %self.name, rule = id, "access rule deleted");
        Ok(true)
    }

    pub fn get_rule(&self, id: u64) -> Option<AccessRule> {
        self.access.rules.read().get(&id).cloned()
    }

    /// All rules in ascending id order.
    pub fn list_rules(&self) -> Vec<AccessRule> {
        self.access.rules.read().values().cloned().collect()
    }

    /// Create or replace a policy. Returns the allocated id when the
    /// policy was posted without one.
    pub fn put_policy(&self, mut policy: AccessPolicy) -> IndexResult<Option<u64>> {
        let _guard = self.access.write_lock.lock();
        let created = policy.id.is_none();
        let id = match policy.id {
            Some(id) => id,
            None => self.access.next_policy_id.load(Ordering::Acquire),
        };
        policy.id = Some(id);

        let next = self
            .access
            .next_policy_id
            .load(Ordering::Acquire)
            .max(id + 1);
        let ops = vec![
            BatchOp::Put {
                cf: Cf::AccessPolicy,
                key: id.to_be_bytes().to_vec(),
                value: serde_json::to_vec(&policy)?,
            },
            BatchOp::Put {
                cf: Cf::Meta,
                key: META_NEXT_POLICY_ID.to_vec(),
                value: next.to_be_bytes().to_vec(),
            },
        ];
        self.commit(ops)?;
        self.access.next_policy_id.store(next, Ordering::Release);
        self.access.policies.write().insert(id, policy);
        tracing::info!(collection = %self.name, policy = id, "access policy stored");
        Ok(created.then_some(id))
    }

    pub fn get_policy(&self, id: u64) -> Option<AccessPolicy> {
        self.access.policies.read().get(&id).cloned()
    }

    /// All policies in ascending id order.
    pub fn list_policies(&self) -> Vec<AccessPolicy> {
        self.access.policies.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    use cdx_core::access::{DateRange, Period};

    fn open_index(dir: &std::path::Path, default_deny: bool) -> Arc<Index> {
        Arc::new(Index::open(dir, "test", default_deny).unwrap())
    }

    fn utc(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn public_policy(index: &Index) -> u64 {
        index
            .put_policy(AccessPolicy {
                id: None,
                name: "public".to_string(),
                access_points: vec!["public".to_string()],
            })
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_rule_matching_with_capture_window() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let policy_id = public_policy(&index);

        let rule_id = index
            .put_rule(AccessRule {
                policy_id,
                url_patterns: vec!["*.example.com".to_string()],
                captured: Some(DateRange {
                    start: Some(utc("2020-01-01 00:00:00")),
                    end: Some(utc("2020-12-31 23:59:59")),
                }),
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        let access_time = utc("2024-01-01 00:00:00");
        let inside = index
            .check_access(
                "public",
                "http://www.example.com/page",
                utc("2020-06-01 00:00:00"),
                access_time,
            )
            .unwrap();
        assert!(inside.allowed);
        assert_eq!(Some(rule_id), inside.rule_id);
        assert_eq!(Some(policy_id), inside.policy_id);

        let staff = index
            .check_access(
                "staff",
                "http://www.example.com/page",
                utc("2020-06-01 00:00:00"),
                access_time,
            )
            .unwrap();
        assert!(!staff.allowed);

        // outside the capture window the rule does not match, default applies
        let outside = index
            .check_access(
                "public",
                "http://www.example.com/page",
                utc("2021-01-01 00:00:00"),
                access_time,
            )
            .unwrap();
        assert!(outside.allowed);
        assert_eq!(None, outside.rule_id);
    }

    #[test]
    fn test_default_deny() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), true);
        let decision = index
            .check_access(
                "public",
                "http://example.com/",
                utc("2020-01-01 00:00:00"),
                utc("2024-01-01 00:00:00"),
            )
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(None, decision.rule_id);
    }

    #[test]
    fn test_dangling_policy_denies() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        index
            .put_rule(AccessRule {
                policy_id: 999,
                url_patterns: vec!["*.example.com".to_string()],
                ..Default::default()
            })
            .unwrap();
        let decision = index
            .check_access(
                "public",
                "http://www.example.com/",
                utc("2020-01-01 00:00:00"),
                utc("2024-01-01 00:00:00"),
            )
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(Some(999), decision.policy_id);
    }

    #[test]
    fn test_most_specific_prefix_wins() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let open_policy = public_policy(&index);
        let closed_policy = index
            .put_policy(AccessPolicy {
                id: None,
                name: "closed".to_string(),
                access_points: vec![],
            })
            .unwrap()
            .unwrap();

        let broad = index
            .put_rule(AccessRule {
                policy_id: open_policy,
                url_patterns: vec!["*.example.com".to_string()],
                ..Default::default()
            })
            .unwrap()
            .unwrap();
        let narrow = index
            .put_rule(AccessRule {
                policy_id: closed_policy,
                url_patterns: vec!["http://www.example.com/secret/*".to_string()],
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        let t = utc("2020-01-01 00:00:00");
        let decision = index
            .check_access("public", "http://www.example.com/secret/file", t, t)
            .unwrap();
        assert_eq!(Some(narrow), decision.rule_id);
        assert!(!decision.allowed);

        let decision = index
            .check_access("public", "http://www.example.com/open", t, t)
            .unwrap();
        assert_eq!(Some(broad), decision.rule_id);
        assert!(decision.allowed);
    }

    #[test]
    fn test_pinned_rule_beats_specific_rule() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let policy_id = public_policy(&index);

        index
            .put_rule(AccessRule {
                policy_id,
                url_patterns: vec!["http://example.com/a/b/*".to_string()],
                ..Default::default()
            })
            .unwrap();
        let pinned = index
            .put_rule(AccessRule {
                policy_id,
                url_patterns: vec!["*.example.com".to_string()],
                pinned: true,
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        let t = utc("2020-01-01 00:00:00");
        let decision = index
            .check_access("public", "http://example.com/a/b/c", t, t)
            .unwrap();
        assert_eq!(Some(pinned), decision.rule_id);
    }

    #[test]
    fn test_global_rule_matches_everything() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let policy_id = public_policy(&index);
        let global = index
            .put_rule(AccessRule {
                policy_id,
                period: Some(Period {
                    years: 1,
                    months: 0,
                    days: 0,
                }),
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        let capture = utc("2020-01-01 00:00:00");
        let decision = index
            .check_access("public", "http://anything.org/", capture, utc("2020-06-01 00:00:00"))
            .unwrap();
        assert_eq!(Some(global), decision.rule_id);

        // past the embargo the rule stops matching
        let decision = index
            .check_access("public", "http://anything.org/", capture, utc("2022-01-01 00:00:00"))
            .unwrap();
        assert_eq!(None, decision.rule_id);
    }

    #[test]
    fn test_exact_pattern_does_not_match_children() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let policy_id = public_policy(&index);
        let exact = index
            .put_rule(AccessRule {
                policy_id,
                url_patterns: vec!["http://example.com/foo/".to_string()],
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        let t = utc("2020-01-01 00:00:00");
        let hit = index
            .check_access("public", "http://example.com/foo/", t, t)
            .unwrap();
        assert_eq!(Some(exact), hit.rule_id);

        let miss = index
            .check_access("public", "http://example.com/foo/bar", t, t)
            .unwrap();
        assert_eq!(None, miss.rule_id);
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let dir = tempdir().unwrap();
        let first;
        {
            let index = open_index(dir.path(), false);
            let policy_id = public_policy(&index);
            first = index
                .put_rule(AccessRule {
                    policy_id,
                    ..Default::default()
                })
                .unwrap()
                .unwrap();
            assert!(index.delete_rule(first).unwrap());
            index.flush().unwrap();
        }
        let index = open_index(dir.path(), false);
        let policy_id = index.list_policies()[0].id.unwrap();
        let second = index
            .put_rule(AccessRule {
                policy_id,
                ..Default::default()
            })
            .unwrap()
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_put_rule_rejects_invalid() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let result = index.put_rule(AccessRule {
            policy_id: 1,
            url_patterns: vec!["*.example.com/with/path".to_string()],
            ..Default::default()
        });
        assert!(result.is_err());
        assert!(index.list_rules().is_empty());
    }

    #[test]
    fn test_replace_rule_keeps_id_and_reindexes() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path(), false);
        let policy_id = public_policy(&index);
        let id = index
            .put_rule(AccessRule {
                policy_id,
                url_patterns: vec!["*.example.com".to_string()],
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        let replaced = index.put_rule(AccessRule {
            id: Some(id),
            policy_id,
            url_patterns: vec!["*.example.org".to_string()],
            ..Default::default()
        });
        assert_eq!(None, replaced.unwrap());

        let t = utc("2020-01-01 00:00:00");
        let miss = index
            .check_access("public", "http://www.example.com/", t, t)
            .unwrap();
        assert_eq!(None, miss.rule_id);
        let hit = index
            .check_access("public", "http://www.example.org/", t, t)
            .unwrap();
        assert_eq!(Some(id), hit.rule_id);
    }
}
