//! Gate persistence
//!
//! Lockout counters and the PIN hash survive restarts; tokens do not.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::lockout::LockoutState;
use crate::error::VaultResult;
use crate::secure_fs::write_atomic;

/// Everything the gate persists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub lockout: LockoutState,
    /// Argon2id PHC string
    pub pin_hash: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Durable storage for the gate record
pub trait GateStore: Send + Sync {
    fn load(&self) -> VaultResult<Option<GateRecord>>;
    fn save(&self, record: &GateRecord) -> VaultResult<()>;
}

/// JSON file, replaced atomically on every save
pub struct JsonGateStore {
    path: PathBuf,
}

impl JsonGateStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl GateStore for JsonGateStore {
    fn load(&self) -> VaultResult<Option<GateRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&self.path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn save(&self, record: &GateRecord) -> VaultResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.path, &json)
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryGateStore {
    record: Mutex<Option<GateRecord>>,
}

impl MemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GateStore for MemoryGateStore {
    fn load(&self) -> VaultResult<Option<GateRecord>> {
        Ok(self.record.lock().clone())
    }

    fn save(&self, record: &GateRecord) -> VaultResult<()> {
        *self.record.lock() = Some(record.clone());
        Ok(())
    }
}
