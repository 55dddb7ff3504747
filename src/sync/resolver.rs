//! ALFA Docs Vault - Conflict Resolver
//!
//! Reconciles a local and a remote snapshot of one entity:
//!
//! 1. identical digests: nothing to do
//! 2. only one side moved away from the last synced state: that side wins
//! 3. both moved, entity allows field merge: content is taken whole from the
//!    side that changed it, attributes merge by latest edit time
//! 4. anything else: a pending conflict record holding both versions
//!
//! Ciphertext is never merged. Two divergent content edits always end in 4.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{Attribute, ContentRef, EntityType, RecordVersion, VersionPair};
use crate::clock::Clock;
use crate::error::VaultResult;

/// How a conflict was (or will be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    AutomaticLocal,
    AutomaticRemote,
    AutomaticMerge,
    ManualPending,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::AutomaticLocal => "automatic-local",
            ResolutionStrategy::AutomaticRemote => "automatic-remote",
            ResolutionStrategy::AutomaticMerge => "automatic-merge",
            ResolutionStrategy::ManualPending => "manual-pending",
        }
    }
}

/// Reviewer's pick for a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    Local,
    Remote,
}

/// Divergent versions awaiting review; both stay intact until a choice is made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub local: RecordVersion,
    pub remote: RecordVersion,
    pub detected_at: DateTime<Utc>,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    pub choice: Option<ManualChoice>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn pending(local: RecordVersion, remote: RecordVersion, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: local.entity_id.clone(),
            entity_type: local.entity_type,
            local,
            remote,
            detected_at,
            strategy: ResolutionStrategy::ManualPending,
            resolved: false,
            choice: None,
            resolved_at: None,
        }
    }

    pub fn version(&self, choice: ManualChoice) -> &RecordVersion {
        match choice {
            ManualChoice::Local => &self.local,
            ManualChoice::Remote => &self.remote,
        }
    }

    /// Version picked by the reviewer, once resolved
    pub fn chosen(&self) -> Option<&RecordVersion> {
        self.choice.map(|c| self.version(c))
    }

    /// Record the reviewer's choice. A second call leaves the first outcome
    /// in place and returns it.
    pub fn apply_choice(&mut self, choice: ManualChoice, now: DateTime<Utc>) -> &RecordVersion {
        match self.choice {
            Some(existing) if self.resolved => {
                if existing != choice {
                    log::info!(
                        "Conflict {} already resolved as {:?}; ignoring {:?}",
                        self.id,
                        existing,
                        choice
                    );
                }
                self.version(existing)
            }
            _ => {
                self.resolved = true;
                self.choice = Some(choice);
                self.resolved_at = Some(now);
                log::info!("Conflict {} on {} resolved: {:?}", self.id, self.entity_id, choice);
                self.version(choice)
            }
        }
    }
}

/// Outcome for one version pair
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Both sides identical; one copy is discarded
    Unchanged(RecordVersion),
    AutomaticLocal(RecordVersion),
    AutomaticRemote(RecordVersion),
    AutomaticMerge(RecordVersion),
    ManualPending(ConflictRecord),
}

impl Resolution {
    pub fn strategy(&self) -> Option<ResolutionStrategy> {
        match self {
            Resolution::Unchanged(_) => None,
            Resolution::AutomaticLocal(_) => Some(ResolutionStrategy::AutomaticLocal),
            Resolution::AutomaticRemote(_) => Some(ResolutionStrategy::AutomaticRemote),
            Resolution::AutomaticMerge(_) => Some(ResolutionStrategy::AutomaticMerge),
            Resolution::ManualPending(_) => Some(ResolutionStrategy::ManualPending),
        }
    }

    /// Version to commit, unless review is pending
    pub fn winner(&self) -> Option<&RecordVersion> {
        match self {
            Resolution::Unchanged(v)
            | Resolution::AutomaticLocal(v)
            | Resolution::AutomaticRemote(v)
            | Resolution::AutomaticMerge(v) => Some(v),
            Resolution::ManualPending(_) => None,
        }
    }
}

/// Stateless resolver; safe to share across threads
pub struct ConflictResolver {
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn resolve(&self, pair: &VersionPair) -> VaultResult<Resolution> {
        pair.validate()?;
        let local = &pair.local;
        let remote = &pair.remote;

        let local_digest = local.digest();
        let remote_digest = remote.digest();

        if local_digest == remote_digest {
            return Ok(Resolution::Unchanged(preferred(local, remote).clone()));
        }

        if let Some(base) = &pair.base {
            let base_digest = base.digest();
            if local_digest == base_digest {
                log::debug!("{}: only remote changed", local.entity_id);
                return Ok(Resolution::AutomaticRemote(remote.clone()));
            }
            if remote_digest == base_digest {
                log::debug!("{}: only local changed", local.entity_id);
                return Ok(Resolution::AutomaticLocal(local.clone()));
            }
        }

        if local.entity_type.allows_field_merge() {
            if let Some(merged) = merge(local, remote, pair.base.as_ref()) {
                log::debug!("{}: merged field by field", local.entity_id);
                return Ok(Resolution::AutomaticMerge(merged));
            }
        }

        let record = ConflictRecord::pending(local.clone(), remote.clone(), self.clock.now());
        log::warn!(
            "Conflict {} on {} {} needs review",
            record.id,
            record.entity_type.as_str(),
            record.entity_id
        );
        Ok(Resolution::ManualPending(record))
    }
}

/// Deterministic tie-break: later edit wins, equal times go to the lower id
fn preferred<'a>(local: &'a RecordVersion, remote: &'a RecordVersion) -> &'a RecordVersion {
    match pick(local.modified_at, &local.version_id, remote.modified_at, &remote.version_id) {
        Ordering::Less => remote,
        _ => local,
    }
}

/// `Greater` when the local side wins
fn pick(local_at: DateTime<Utc>, local_id: &str, remote_at: DateTime<Utc>, remote_id: &str) -> Ordering {
    local_at
        .cmp(&remote_at)
        .then_with(|| remote_id.cmp(local_id))
}

fn merge(local: &RecordVersion, remote: &RecordVersion, base: Option<&RecordVersion>) -> Option<RecordVersion> {
    let content = merge_content(local, remote, base)?;
    let attributes = merge_attributes(local, remote, base);

    let mut merged = RecordVersion {
        entity_id: local.entity_id.clone(),
        entity_type: local.entity_type,
        version_id: String::new(),
        modified_at: local.modified_at.max(remote.modified_at),
        content,
        attributes,
    };
    let digest = merged.digest();
    merged.version_id = format!("merge:{}", &digest[..16]);
    Some(merged)
}

/// `None` means both sides edited the payload
fn merge_content(
    local: &RecordVersion,
    remote: &RecordVersion,
    base: Option<&RecordVersion>,
) -> Option<Option<ContentRef>> {
    if local.same_content(remote) {
        return Some(pick_content(local, remote));
    }

    let base = base?;
    match (local.same_content(base), remote.same_content(base)) {
        (true, false) => Some(remote.content.clone()),
        (false, true) => Some(local.content.clone()),
        _ => None,
    }
}

/// Same payload on both sides; keep the newer handle
fn pick_content(local: &RecordVersion, remote: &RecordVersion) -> Option<ContentRef> {
    preferred(local, remote).content.clone()
}

fn merge_attributes(
    local: &RecordVersion,
    remote: &RecordVersion,
    base: Option<&RecordVersion>,
) -> BTreeMap<String, Attribute> {
    let names: BTreeSet<&String> = local.attributes.keys().chain(remote.attributes.keys()).collect();
    let base_attr = |name: &str| base.and_then(|b| b.attributes.get(name));

    let mut merged = BTreeMap::new();
    for name in names {
        let chosen = match (local.attributes.get(name), remote.attributes.get(name)) {
            (Some(l), Some(r)) => {
                match pick(l.modified_at, &local.version_id, r.modified_at, &remote.version_id) {
                    Ordering::Less => Some(r),
                    _ => Some(l),
                }
            }
            // present on one side only: a deletion if the survivor is untouched since base
            (Some(only), None) | (None, Some(only)) => match base_attr(name.as_str()) {
                Some(b) if b.value == only.value => None,
                _ => Some(only),
            },
            (None, None) => None,
        };

        if let Some(attr) = chosen {
            merged.insert(name.clone(), attr.clone());
        }
    }
    merged
}
