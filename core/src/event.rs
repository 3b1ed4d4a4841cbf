//! Key lifecycle events and the audit log row they are persisted as.
//!
//! Every key decision a run makes beyond plain reuse is recorded: a new key,
//! a merge, a split, a retirement. The audit log is append-only.

use crate::types::{AccountId, KeyId, Mode, RunId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Lost a merge to an older key.
    Merged,
    /// No account holding the key is left in the universe.
    Vanished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyEvent {
    Minted {
        key_id:        KeyId,
        first_account: AccountId,
        accounts:      usize,
    },
    Merged {
        key_id:        KeyId,
        absorbed:      Vec<KeyId>,
        first_account: AccountId,
        accounts:      usize,
    },
    Split {
        key_id:    KeyId,
        kept_by:   AccountId,
        fragments: usize,
    },
    Retired {
        key_id:    KeyId,
        reason:    RetireReason,
        successor: Option<KeyId>,
    },
}

impl KeyEvent {
    pub fn key_id(&self) -> &KeyId {
        match self {
            KeyEvent::Minted { key_id, .. }
            | KeyEvent::Merged { key_id, .. }
            | KeyEvent::Split { key_id, .. }
            | KeyEvent::Retired { key_id, .. } => key_id,
        }
    }

    /// Stable name for the `event_type` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            KeyEvent::Minted { .. }  => "minted",
            KeyEvent::Merged { .. }  => "merged",
            KeyEvent::Split { .. }   => "split",
            KeyEvent::Retired { .. } => "retired",
        }
    }
}

/// One row of `key_audit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id:         Option<i64>,
    pub run_id:     RunId,
    pub mode:       Mode,
    pub as_of:      String,
    pub event_type: String,
    pub key_id:     KeyId,
    pub payload:    String,
}

impl AuditEntry {
    pub fn event(&self) -> serde_json::Result<KeyEvent> {
        serde_json::from_str(&self.payload)
    }
}
