//! Committing resolutions back to storage
//!
//! Resolution is stateless and may run concurrently, but commits for one
//! entity are serialized. A resolution computed against a state that has
//! since moved on is rejected rather than written over it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::record::{RecordVersion, VersionPair};
use super::resolver::{ConflictRecord, ManualChoice, Resolution};
use super::store::ConflictStore;
use crate::clock::Clock;
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::write_atomic;

/// Storage collaborator holding the committed version of each entity
pub trait RecordSink: Send + Sync {
    fn current(&self, entity_id: &str) -> VaultResult<Option<RecordVersion>>;
    fn commit(&self, version: &RecordVersion) -> VaultResult<()>;
}

/// What a commit did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New version written
    Committed { version_id: String },
    /// Storage already holds this outcome
    AlreadyCommitted,
    /// Conflict record stored for review
    Deferred { conflict_id: Uuid },
}

/// Serializes commits per entity
pub struct ResolutionCommitter {
    sink: Arc<dyn RecordSink>,
    conflicts: Arc<ConflictStore>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResolutionCommitter {
    pub fn new(sink: Arc<dyn RecordSink>, conflicts: Arc<ConflictStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sink,
            conflicts,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` holding the entity's commit lock. The lock entry is dropped
    /// from the map once no other caller holds or waits on it.
    fn with_entity_lock<T>(&self, entity_id: &str, f: impl FnOnce() -> VaultResult<T>) -> VaultResult<T> {
        let lock = self.locks.lock().entry(entity_id.to_string()).or_default().clone();

        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.locks.lock();
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(entity_id);
        }
        result
    }

    /// Commit an automatic outcome or park a pending conflict
    pub fn commit(&self, pair: &VersionPair, resolution: &Resolution) -> VaultResult<CommitOutcome> {
        self.with_entity_lock(pair.entity_id(), || match resolution {
            Resolution::ManualPending(record) => self.defer(record),
            Resolution::Unchanged(winner)
            | Resolution::AutomaticLocal(winner)
            | Resolution::AutomaticRemote(winner)
            | Resolution::AutomaticMerge(winner) => self.write_if_current(&pair.local, winner),
        })
    }

    /// Store a pending record unless the same pair was already reviewed,
    /// is already queued, or no longer matches storage
    fn defer(&self, record: &ConflictRecord) -> VaultResult<CommitOutcome> {
        let same_pair = |r: &ConflictRecord| r.local == record.local && r.remote == record.remote;

        if self
            .conflicts
            .resolved_for_entity(&record.entity_id)?
            .iter()
            .any(|r| same_pair(r))
        {
            log::debug!("Conflict for {} was already resolved", record.entity_id);
            return Ok(CommitOutcome::AlreadyCommitted);
        }

        if let Some(current) = self.sink.current(&record.entity_id)? {
            let digest = current.digest();
            if digest == record.remote.digest() {
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            if digest != record.local.digest() {
                log::warn!("Rejected stale conflict for {}", record.entity_id);
                return Err(VaultError::StaleResolution(record.entity_id.clone()));
            }
        }

        let queued = self
            .conflicts
            .pending_for_entity(&record.entity_id)?
            .into_iter()
            .find(|r| same_pair(r));

        let conflict_id = match queued {
            Some(existing) => existing.id,
            None => {
                self.conflicts.save(record)?;
                record.id
            }
        };
        Ok(CommitOutcome::Deferred { conflict_id })
    }

    /// Apply a reviewer's choice and commit the chosen version. The record
    /// is marked resolved only after storage holds the winner, so a failed
    /// write leaves it pending. Repeating the call returns `AlreadyCommitted`
    /// and leaves storage untouched.
    pub fn commit_manual(&self, conflict_id: &Uuid, choice: ManualChoice) -> VaultResult<CommitOutcome> {
        let entity_id = self.conflicts.get(conflict_id)?.entity_id;

        self.with_entity_lock(&entity_id, || {
            let record = self.conflicts.get(conflict_id)?;
            let choice = match record.choice {
                Some(prior) if record.resolved => {
                    if prior != choice {
                        log::info!("Conflict {} already resolved as {:?}", conflict_id, prior);
                    }
                    prior
                }
                _ => choice,
            };

            let outcome = self.write_if_current(&record.local, record.version(choice))?;

            let now = self.clock.now();
            if !record.resolved {
                self.conflicts.resolve(conflict_id, choice, now)?;
            }
            self.conflicts.archive(conflict_id, now)?;
            Ok(outcome)
        })
    }

    /// Write `winner` only if storage still holds `basis` (or nothing yet)
    fn write_if_current(&self, basis: &RecordVersion, winner: &RecordVersion) -> VaultResult<CommitOutcome> {
        let winner_digest = winner.digest();
        let current = self.sink.current(&winner.entity_id)?;

        match current.map(|c| c.digest()) {
            Some(digest) if digest == winner_digest => Ok(CommitOutcome::AlreadyCommitted),
            Some(digest) if digest != basis.digest() => {
                log::warn!("Rejected stale resolution for {}", winner.entity_id);
                Err(VaultError::StaleResolution(winner.entity_id.clone()))
            }
            _ => {
                self.sink.commit(winner)?;
                log::info!("Committed {} for {}", winner.version_id, winner.entity_id);
                Ok(CommitOutcome::Committed {
                    version_id: winner.version_id.clone(),
                })
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SINKS
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory sink
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<HashMap<String, RecordVersion>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordSink for MemoryRecordSink {
    fn current(&self, entity_id: &str) -> VaultResult<Option<RecordVersion>> {
        Ok(self.records.lock().get(entity_id).cloned())
    }

    fn commit(&self, version: &RecordVersion) -> VaultResult<()> {
        self.records
            .lock()
            .insert(version.entity_id.clone(), version.clone());
        Ok(())
    }
}

/// One JSON file per entity, named by the hex-encoded entity id
pub struct JsonRecordSink {
    dir: PathBuf,
}

impl JsonRecordSink {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(entity_id.as_bytes())))
    }
}

impl RecordSink for JsonRecordSink {
    fn current(&self, entity_id: &str) -> VaultResult<Option<RecordVersion>> {
        let path = self.path(entity_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn commit(&self, version: &RecordVersion) -> VaultResult<()> {
        let json = serde_json::to_vec_pretty(version)?;
        write_atomic(&self.path(&version.entity_id), &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sync::record::{Attribute, EntityType};
    use crate::sync::resolver::ConflictResolver;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn version(id: &str, title: &str, entity_type: EntityType) -> RecordVersion {
        RecordVersion {
            entity_id: "lease".into(),
            entity_type,
            version_id: id.into(),
            modified_at: at(100),
            content: None,
            attributes: BTreeMap::from([("title".to_string(), Attribute::new(json!(title), at(100)))]),
        }
    }

    struct Fixture {
        sink: Arc<MemoryRecordSink>,
        store: Arc<ConflictStore>,
        committer: ResolutionCommitter,
        resolver: ConflictResolver,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(1_000)));
        let sink = Arc::new(MemoryRecordSink::new());
        let store = Arc::new(ConflictStore::in_memory().unwrap());
        Fixture {
            committer: ResolutionCommitter::new(sink.clone(), store.clone(), clock.clone()),
            resolver: ConflictResolver::new(clock),
            sink,
            store,
        }
    }

    #[test]
    fn test_commit_is_idempotent() {
        let f = fixture();
        let base = version("v0", "Lease", EntityType::Document);
        f.sink.commit(&base).unwrap();

        let pair = VersionPair::new(base.clone(), version("v1", "Lease 2025", EntityType::Document), Some(base));
        let resolution = f.resolver.resolve(&pair).unwrap();

        assert_eq!(
            f.committer.commit(&pair, &resolution).unwrap(),
            CommitOutcome::Committed { version_id: "v1".into() }
        );
        assert_eq!(f.committer.commit(&pair, &resolution).unwrap(), CommitOutcome::AlreadyCommitted);
    }

    #[test]
    fn test_stale_resolution_rejected() {
        let f = fixture();
        let base = version("v0", "Lease", EntityType::Document);
        f.sink.commit(&base).unwrap();

        let stale_pair = VersionPair::new(
            base.clone(),
            version("v1", "Lease A", EntityType::Document),
            Some(base.clone()),
        );
        let stale = f.resolver.resolve(&stale_pair).unwrap();

        // storage moved on before the stale result was committed
        f.sink.commit(&version("v2", "Lease B", EntityType::Document)).unwrap();

        assert!(matches!(
            f.committer.commit(&stale_pair, &stale),
            Err(VaultError::StaleResolution(_))
        ));
        assert_eq!(f.sink.current("lease").unwrap().unwrap().version_id, "v2");
    }

    #[test]
    fn test_manual_flow_is_idempotent() {
        let f = fixture();
        let local = version("v-local", "Mine", EntityType::Attachment);
        let remote = version("v-remote", "Theirs", EntityType::Attachment);
        f.sink.commit(&local).unwrap();

        let pair = VersionPair::new(local, remote, None);
        let resolution = f.resolver.resolve(&pair).unwrap();

        let CommitOutcome::Deferred { conflict_id } = f.committer.commit(&pair, &resolution).unwrap() else {
            panic!("expected deferral");
        };
        // resubmitting the same pair does not duplicate the record
        assert_eq!(
            f.committer.commit(&pair, &f.resolver.resolve(&pair).unwrap()).unwrap(),
            CommitOutcome::Deferred { conflict_id }
        );
        assert_eq!(f.store.pending_count().unwrap(), 1);

        assert_eq!(
            f.committer.commit_manual(&conflict_id, ManualChoice::Remote).unwrap(),
            CommitOutcome::Committed { version_id: "v-remote".into() }
        );
        assert_eq!(
            f.committer.commit_manual(&conflict_id, ManualChoice::Local).unwrap(),
            CommitOutcome::AlreadyCommitted
        );
        assert_eq!(f.sink.current("lease").unwrap().unwrap().version_id, "v-remote");
        assert_eq!(f.store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_redelivered_pair_after_review_stays_resolved() {
        let f = fixture();
        let local = version("v-local", "Mine", EntityType::Attachment);
        let remote = version("v-remote", "Theirs", EntityType::Attachment);
        f.sink.commit(&local).unwrap();

        let pair = VersionPair::new(local.clone(), remote.clone(), None);
        let CommitOutcome::Deferred { conflict_id } =
            f.committer.commit(&pair, &f.resolver.resolve(&pair).unwrap()).unwrap()
        else {
            panic!("expected deferral");
        };
        f.committer.commit_manual(&conflict_id, ManualChoice::Local).unwrap();

        // the transport delivers the same pair again
        let again = f.resolver.resolve(&pair).unwrap();
        assert_eq!(f.committer.commit(&pair, &again).unwrap(), CommitOutcome::AlreadyCommitted);
        assert_eq!(f.store.pending_count().unwrap(), 0);
        assert_eq!(f.sink.current("lease").unwrap(), Some(local));
    }

    #[test]
    fn test_stale_pair_is_not_queued() {
        let f = fixture();
        let local = version("v-local", "Mine", EntityType::Attachment);
        let pair = VersionPair::new(local, version("v-remote", "Theirs", EntityType::Attachment), None);
        let resolution = f.resolver.resolve(&pair).unwrap();

        f.sink.commit(&version("v-newer", "Newer", EntityType::Attachment)).unwrap();

        assert!(matches!(
            f.committer.commit(&pair, &resolution),
            Err(VaultError::StaleResolution(_))
        ));
        assert_eq!(f.store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_failed_manual_commit_keeps_record_pending() {
        let f = fixture();
        let local = version("v-local", "Mine", EntityType::Attachment);
        f.sink.commit(&local).unwrap();

        let pair = VersionPair::new(local, version("v-remote", "Theirs", EntityType::Attachment), None);
        let CommitOutcome::Deferred { conflict_id } =
            f.committer.commit(&pair, &f.resolver.resolve(&pair).unwrap()).unwrap()
        else {
            panic!("expected deferral");
        };

        let newer = version("v-newer", "Newer", EntityType::Attachment);
        f.sink.commit(&newer).unwrap();

        assert!(matches!(
            f.committer.commit_manual(&conflict_id, ManualChoice::Remote),
            Err(VaultError::StaleResolution(_))
        ));
        let record = f.store.get(&conflict_id).unwrap();
        assert!(!record.resolved);
        assert_eq!(record.choice, None);
        assert_eq!(f.store.pending_count().unwrap(), 1);
        assert_eq!(f.sink.current("lease").unwrap(), Some(newer));
    }

    #[test]
    fn test_entity_locks_are_released() {
        let f = fixture();
        let base = version("v0", "Lease", EntityType::Document);
        let pair = VersionPair::new(base.clone(), version("v1", "Lease 2025", EntityType::Document), Some(base));
        let resolution = f.resolver.resolve(&pair).unwrap();

        f.committer.commit(&pair, &resolution).unwrap();
        assert!(f.committer.commit(&pair, &resolution).is_ok());
        assert!(f.committer.locks.lock().is_empty());
    }

    #[test]
    fn test_concurrent_commits_serialize() {
        let f = Arc::new(fixture());
        let base = version("v0", "Lease", EntityType::Document);
        f.sink.commit(&base).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let f = f.clone();
                let base = base.clone();
                std::thread::spawn(move || {
                    let pair = VersionPair::new(
                        base.clone(),
                        version(&format!("v{}", i + 1), &format!("Lease {}", i), EntityType::Document),
                        Some(base),
                    );
                    let resolution = f.resolver.resolve(&pair).unwrap();
                    f.committer.commit(&pair, &resolution)
                })
            })
            .collect();

        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| matches!(r, Ok(CommitOutcome::Committed { .. })))
            .count();

        // every result was computed against v0; only the first may land
        assert_eq!(committed, 1);
        assert!(f.committer.locks.lock().is_empty());
    }

    #[test]
    fn test_json_sink() {
        let dir = tempdir().unwrap();
        let sink = JsonRecordSink::new(dir.path());
        assert!(sink.current("a/b").unwrap().is_none());

        let v = version("v1", "Lease", EntityType::Folder);
        sink.commit(&v).unwrap();
        assert_eq!(sink.current("lease").unwrap(), Some(v));
    }
}
