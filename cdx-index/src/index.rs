//! One index per collection
//!
//! An [`Index`] owns a sled database whose keyspace is partitioned into
//! logical column families by a one-byte prefix (captures, aliases,
//! access rules, access policies, metadata) plus an internal changelog.
//! All mutations flow through [`Batch`]: a batch commits atomically as a
//! single sled batch covering every column family it touched, and each
//! commit appends exactly one numbered entry to the changelog for
//! replication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use cdx_core::{Alias, Capture};

use crate::access::AccessControl;
use crate::error::{IndexError, IndexResult};
use crate::replication::{self, cf_key, BatchOp, Cf, ChangeFeedEntry};

/// Key prefix of the changelog entries. Not a column family: changelog
/// entries are written by the commit path itself, never by batch ops.
const CHANGELOG_PREFIX: u8 = 0x06;

/// Metadata keys
pub(crate) const META_SEQUENCE: &[u8] = b"sequence";
pub(crate) const META_NEXT_RULE_ID: &[u8] = b"next_rule_id";
pub(crate) const META_NEXT_POLICY_ID: &[u8] = b"next_policy_id";

fn changelog_key(sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(CHANGELOG_PREFIX);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// A single collection's index.
#[derive(Debug)]
pub struct Index {
    pub name: String,
    pub(crate) db: sled::Db,
    pub(crate) access: AccessControl,
    sequence: AtomicU64,
    commit_lock: Mutex<()>,
    pub(crate) default_deny: bool,
}

impl Index {
    /// Open or create the index at `path`.
    pub fn open(path: &std::path::Path, name: &str, default_deny: bool) -> IndexResult<Index> {
        let db = sled::open(path)
            .map_err(|e| IndexError::Storage(format!("failed to open {}: {}", name, e)))?;

        let sequence = match db.get(cf_key(Cf::Meta, META_SEQUENCE))? {
            Some(bytes) => decode_u64(&bytes)?,
            None => last_changelog_sequence(&db)?,
        };
        let access = AccessControl::load(&db)?;

        Ok(Index {
            name: name.to_string(),
            db,
            access,
            sequence: AtomicU64::new(sequence),
            commit_lock: Mutex::new(()),
            default_deny,
        })
    }

    /// Begin a batched update. The batch is discarded unless committed.
    pub fn begin_update(self: &Arc<Self>) -> Batch {
        Batch {
            index: Arc::clone(self),
            ops: Vec::new(),
        }
    }

    /// Captures in key order starting at the given urlkey.
    pub fn captures_after(
        &self,
        start: &str,
    ) -> impl Iterator<Item = IndexResult<Capture>> + Send + 'static {
        self.db
            .range(cf_key(Cf::Default, start.as_bytes())..)
            .take_while(|item| match item {
                Ok((key, _)) => key.first() == Some(&Cf::Default.prefix()),
                Err(_) => true,
            })
            .map(|item| {
                let (key, value) = item?;
                Ok(Capture::decode(&key[1..], &value)?)
            })
    }

    /// Aliases in key order starting at the given SSURT.
    pub fn list_aliases(
        &self,
        start: &str,
    ) -> impl Iterator<Item = IndexResult<Alias>> + Send + 'static {
        self.db
            .range(cf_key(Cf::Alias, start.as_bytes())..)
            .take_while(|item| match item {
                Ok((key, _)) => key.first() == Some(&Cf::Alias.prefix()),
                Err(_) => true,
            })
            .map(|item| {
                let (key, value) = item?;
                Ok(Alias::decode(&key[1..], &value)?)
            })
    }

    /// Resolve an alias one hop. Aliases of aliases are not chased.
    pub fn resolve_alias(&self, surt: &str) -> IndexResult<Option<String>> {
        match self.db.get(cf_key(Cf::Alias, surt.as_bytes()))? {
            Some(target) => Ok(Some(
                String::from_utf8(target.to_vec())
                    .map_err(|_| IndexError::Storage("alias target is not utf-8".into()))?,
            )),
            None => Ok(None),
        }
    }

    /// Approximate number of capture records.
    pub fn estimated_record_count(&self) -> u64 {
        self.db.scan_prefix([Cf::Default.prefix()]).count() as u64
    }

    /// Bytes used on disk by the whole collection.
    pub fn size_on_disk(&self) -> IndexResult<u64> {
        Ok(self.db.size_on_disk()?)
    }

    /// Sequence number of the most recent commit.
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Changelog entries with sequence numbers after `since`.
    pub fn get_updates_since(
        &self,
        since: u64,
    ) -> impl Iterator<Item = IndexResult<ChangeFeedEntry>> + Send + 'static {
        self.db
            .range(changelog_key(since.saturating_add(1))..)
            .take_while(|item| match item {
                Ok((key, _)) => key.first() == Some(&CHANGELOG_PREFIX),
                Err(_) => true,
            })
            .map(|item| {
                let (key, value) = item?;
                if key.len() != 9 {
                    return Err(IndexError::Storage("corrupt changelog key".into()));
                }
                Ok(ChangeFeedEntry {
                    sequence_number: u64::from_be_bytes(key[1..9].try_into().unwrap()),
                    write_batch: value.to_vec(),
                })
            })
    }

    /// Fsync and truncate the changelog so a secondary can request a fresh
    /// baseline. The sequence counter is preserved.
    pub fn flush_wal(&self) -> IndexResult<()> {
        let _guard = self.commit_lock.lock();
        let keys: Vec<_> = self
            .db
            .scan_prefix([CHANGELOG_PREFIX])
            .keys()
            .collect::<Result<_, _>>()?;
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key);
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        tracing::info!(collection = %self.name, "replication log truncated");
        Ok(())
    }

    /// Apply a batch received from an upstream primary. Idempotent: ops
    /// address absolute keys and the entry is recorded under the
    /// primary's sequence number.
    pub fn apply_replicated(&self, entry: &ChangeFeedEntry) -> IndexResult<()> {
        let ops = replication::decode_ops(&entry.write_batch)?;
        let _guard = self.commit_lock.lock();

        let sequence = self.latest_sequence().max(entry.sequence_number);
        let mut batch = sled::Batch::default();
        apply_ops(&mut batch, &ops);
        batch.insert(cf_key(Cf::Meta, META_SEQUENCE), &sequence.to_be_bytes()[..]);
        batch.insert(
            changelog_key(entry.sequence_number),
            entry.write_batch.clone(),
        );
        self.db.apply_batch(batch)?;
        self.sequence.store(sequence, Ordering::Release);

        if ops
            .iter()
            .any(|op| matches!(op.cf(), Cf::AccessRule | Cf::AccessPolicy | Cf::Meta))
        {
            self.access.reload(&self.db)?;
        }
        Ok(())
    }

    /// Commit a list of operations atomically, appending one changelog
    /// entry. Returns the new sequence number.
    pub(crate) fn commit(&self, ops: Vec<BatchOp>) -> IndexResult<u64> {
        let payload = replication::encode_ops(&ops)?;
        let _guard = self.commit_lock.lock();

        let sequence = self.latest_sequence() + 1;
        let mut batch = sled::Batch::default();
        apply_ops(&mut batch, &ops);
        batch.insert(cf_key(Cf::Meta, META_SEQUENCE), &sequence.to_be_bytes()[..]);
        batch.insert(changelog_key(sequence), payload);
        self.db.apply_batch(batch)?;
        self.sequence.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    /// Flush outstanding writes to disk.
    pub fn flush(&self) -> IndexResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn apply_ops(batch: &mut sled::Batch, ops: &[BatchOp]) {
    for op in ops {
        match op {
            BatchOp::Put { cf, key, value } => batch.insert(cf_key(*cf, key), value.clone()),
            BatchOp::Delete { cf, key } => batch.remove(cf_key(*cf, key)),
        }
    }
}

fn last_changelog_sequence(db: &sled::Db) -> IndexResult<u64> {
    match db.scan_prefix([CHANGELOG_PREFIX]).keys().next_back() {
        Some(key) => {
            let key = key?;
            if key.len() != 9 {
                return Err(IndexError::Storage("corrupt changelog key".into()));
            }
            Ok(u64::from_be_bytes(key[1..9].try_into().unwrap()))
        }
        None => Ok(0),
    }
}

pub(crate) fn decode_u64(bytes: &[u8]) -> IndexResult<u64> {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| IndexError::Storage("corrupt metadata value".into()))
}

/// A pending update. Operations are buffered and applied atomically on
/// [`Batch::commit`]; dropping the batch discards them.
pub struct Batch {
    index: Arc<Index>,
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn put_capture(&mut self, capture: &Capture) {
        self.ops.push(BatchOp::Put {
            cf: Cf::Default,
            key: capture.encode_key(),
            value: capture.encode_value(),
        });
    }

    pub fn delete_capture(&mut self, capture: &Capture) {
        self.ops.push(BatchOp::Delete {
            cf: Cf::Default,
            key: capture.encode_key(),
        });
    }

    pub fn put_alias(&mut self, alias_surt: &str, target_surt: &str) {
        self.ops.push(BatchOp::Put {
            cf: Cf::Alias,
            key: alias_surt.as_bytes().to_vec(),
            value: target_surt.as_bytes().to_vec(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Commit atomically. Readers see either every operation or none.
    pub fn commit(self) -> IndexResult<u64> {
        self.index.commit(self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_index(dir: &std::path::Path) -> Arc<Index> {
        Arc::new(Index::open(dir, "test", false).unwrap())
    }

    fn capture(url: &str, timestamp: u64) -> Capture {
        Capture::from_cdx_line(&format!(
            "- {} {} text/html 200 DIGEST - - 1024 2048 test.warc.gz",
            timestamp, url
        ))
        .unwrap()
    }

    #[test]
    fn test_batch_commit_and_scan() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());

        let mut batch = index.begin_update();
        batch.put_capture(&capture("http://example.com/b", 20200101000000));
        batch.put_capture(&capture("http://example.com/a", 20210101000000));
        batch.put_capture(&capture("http://example.com/a", 20200101000000));
        batch.commit().unwrap();

        let results: Vec<Capture> = index
            .captures_after("")
            .collect::<IndexResult<_>>()
            .unwrap();
        assert_eq!(3, results.len());
        // urlkey ascending, then timestamp ascending
        assert_eq!("com,example,:80:http:/a", results[0].urlkey);
        assert_eq!(20200101000000, results[0].timestamp);
        assert_eq!(20210101000000, results[1].timestamp);
        assert_eq!("com,example,:80:http:/b", results[2].urlkey);
    }

    #[test]
    fn test_dropped_batch_is_discarded() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());

        {
            let mut batch = index.begin_update();
            batch.put_capture(&capture("http://example.com/", 20200101000000));
        }
        assert_eq!(0, index.estimated_record_count());
        assert_eq!(0, index.latest_sequence());
    }

    #[test]
    fn test_delete_capture() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        let c = capture("http://example.com/", 20200101000000);

        let mut batch = index.begin_update();
        batch.put_capture(&c);
        batch.commit().unwrap();
        assert_eq!(1, index.estimated_record_count());

        let mut batch = index.begin_update();
        batch.delete_capture(&c);
        batch.commit().unwrap();
        assert_eq!(0, index.estimated_record_count());
    }

    #[test]
    fn test_aliases() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());

        let mut batch = index.begin_update();
        batch.put_alias("com,example,www,:80:http:/", "com,example,:80:http:/");
        batch.commit().unwrap();

        assert_eq!(
            Some("com,example,:80:http:/".to_string()),
            index.resolve_alias("com,example,www,:80:http:/").unwrap()
        );
        assert_eq!(None, index.resolve_alias("com,example,:80:http:/").unwrap());

        let aliases: Vec<Alias> = index.list_aliases("").collect::<IndexResult<_>>().unwrap();
        assert_eq!(1, aliases.len());
        assert_eq!("com,example,www,:80:http:/", aliases[0].alias);
    }

    #[test]
    fn test_sequence_numbers_are_monotonic_and_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = open_index(dir.path());
            for i in 0..3 {
                let mut batch = index.begin_update();
                batch.put_capture(&capture("http://example.com/", 20200101000000 + i));
                batch.commit().unwrap();
            }
            assert_eq!(3, index.latest_sequence());
            index.flush().unwrap();
        }
        let index = open_index(dir.path());
        assert_eq!(3, index.latest_sequence());
    }

    #[test]
    fn test_change_feed_and_replication() {
        let primary_dir = tempdir().unwrap();
        let secondary_dir = tempdir().unwrap();
        let primary = open_index(primary_dir.path());
        let secondary = open_index(secondary_dir.path());

        let mut batch = primary.begin_update();
        batch.put_capture(&capture("http://example.com/", 20200101000000));
        batch.put_alias("com,example,www,:80:http:/", "com,example,:80:http:/");
        batch.commit().unwrap();

        let mut batch = primary.begin_update();
        batch.put_capture(&capture("http://example.com/two", 20200101000000));
        batch.commit().unwrap();

        let entries: Vec<ChangeFeedEntry> = primary
            .get_updates_since(0)
            .collect::<IndexResult<_>>()
            .unwrap();
        assert_eq!(vec![1, 2], entries.iter().map(|e| e.sequence_number).collect::<Vec<_>>());

        for entry in &entries {
            secondary.apply_replicated(entry).unwrap();
        }
        // re-application is idempotent
        secondary.apply_replicated(&entries[1]).unwrap();

        assert_eq!(secondary.latest_sequence(), primary.latest_sequence());
        let primary_caps: Vec<Capture> = primary
            .captures_after("")
            .collect::<IndexResult<_>>()
            .unwrap();
        let secondary_caps: Vec<Capture> = secondary
            .captures_after("")
            .collect::<IndexResult<_>>()
            .unwrap();
        assert_eq!(primary_caps, secondary_caps);
        assert_eq!(
            Some("com,example,:80:http:/".to_string()),
            secondary.resolve_alias("com,example,www,:80:http:/").unwrap()
        );
    }

    #[test]
    fn test_updates_since_skips_earlier_batches() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        for i in 0..3 {
            let mut batch = index.begin_update();
            batch.put_capture(&capture("http://example.com/", 20200101000000 + i));
            batch.commit().unwrap();
        }
        let entries: Vec<ChangeFeedEntry> = index
            .get_updates_since(2)
            .collect::<IndexResult<_>>()
            .unwrap();
        assert_eq!(1, entries.len());
        assert_eq!(3, entries[0].sequence_number);
    }

    #[test]
    fn test_flush_wal_truncates_but_keeps_sequence() {
        let dir = tempdir().unwrap();
        let index = open_index(dir.path());
        let mut batch = index.begin_update();
        batch.put_capture(&capture("http://example.com/", 20200101000000));
        batch.commit().unwrap();

        index.flush_wal().unwrap();
        assert_eq!(0, index.get_updates_since(0).count());
        assert_eq!(1, index.latest_sequence());

        // the next commit resumes numbering after the truncated entries
        let mut batch = index.begin_update();
        batch.put_capture(&capture("http://example.com/x", 20200101000000));
        batch.commit().unwrap();
        assert_eq!(2, index.latest_sequence());
    }
}
