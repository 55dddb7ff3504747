//! ALFA Docs Vault - Sync Conflict Handling
//!
//! Version pairs come in from the sync transport; resolutions go back out
//! through a [`RecordSink`]. Nothing here touches plaintext.

pub mod commit;
pub mod record;
pub mod resolver;
pub mod store;

pub use commit::{CommitOutcome, JsonRecordSink, MemoryRecordSink, RecordSink, ResolutionCommitter};
pub use record::{Attribute, ContentRef, EntityType, RecordVersion, VersionPair};
pub use resolver::{ConflictRecord, ConflictResolver, ManualChoice, Resolution, ResolutionStrategy};
pub use store::ConflictStore;
