//! Key persistence port.
//!
//! RULE: the engine only reaches persisted keys through `KeyStore`.
//! Nothing else reads or writes the current/historical tables.
//!
//! A commit covers every enabled mode of a run and is all-or-nothing: either
//! every current table is replaced and every historical snapshot appended,
//! or nothing changes and the previous run stays authoritative.

mod memory;
mod sqlite;

pub use memory::MemoryKeyStore;
pub use sqlite::SqliteKeyStore;

use crate::{
    error::R360Result,
    event::AuditEntry,
    reconcile::{KeyPlan, PriorSnapshot},
    types::{KeyAssignment, Mode, RunId},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Everything a successful run writes.
#[derive(Debug, Clone)]
pub struct RunCommit {
    pub run_id: RunId,
    pub as_of:  NaiveDateTime,
    pub plans:  Vec<KeyPlan>,
}

/// One row of `run_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogRow {
    pub run_id:     RunId,
    pub mode:       Mode,
    pub as_of:      String,
    pub accounts:   usize,
    pub components: usize,
    pub minted:     usize,
    pub retained:   usize,
    pub merged:     usize,
    pub split:      usize,
    pub retired:    usize,
}

impl RunLogRow {
    pub fn from_plan(commit: &RunCommit, plan: &KeyPlan) -> Self {
        Self {
            run_id:     commit.run_id.clone(),
            mode:       plan.mode,
            as_of:      commit.as_of.format(crate::types::AS_OF_FORMAT).to_string(),
            accounts:   plan.stats.accounts,
            components: plan.stats.components,
            minted:     plan.stats.minted,
            retained:   plan.stats.retained,
            merged:     plan.stats.merged,
            split:      plan.stats.split,
            retired:    plan.stats.retired,
        }
    }
}

pub trait KeyStore {
    /// The previous run's current table, or `None` on cold start.
    fn load_prior(&self, mode: Mode) -> R360Result<Option<PriorSnapshot>>;

    /// Largest key ever minted for `mode`, 0 if none.
    fn key_high_water(&self, mode: Mode) -> R360Result<u64>;

    /// Atomically replace current tables and append history for every plan.
    fn commit_run(&mut self, commit: &RunCommit) -> R360Result<()>;

    /// Current table in natural account order.
    fn current(&self, mode: Mode) -> R360Result<Vec<KeyAssignment>>;

    /// Latest historical snapshot stamped at or before `as_of`.
    fn historical_as_of(
        &self,
        mode: Mode,
        as_of: NaiveDateTime,
    ) -> R360Result<Option<(NaiveDateTime, Vec<KeyAssignment>)>>;

    /// Audit log for `mode`, oldest first.
    fn audit_entries(&self, mode: Mode) -> R360Result<Vec<AuditEntry>>;

    /// Run log for `mode`, oldest first.
    fn runs(&self, mode: Mode) -> R360Result<Vec<RunLogRow>>;
}

impl<K: KeyStore + ?Sized> KeyStore for Box<K> {
    fn load_prior(&self, mode: Mode) -> R360Result<Option<PriorSnapshot>> {
        (**self).load_prior(mode)
    }

    fn key_high_water(&self, mode: Mode) -> R360Result<u64> {
        (**self).key_high_water(mode)
    }

    fn commit_run(&mut self, commit: &RunCommit) -> R360Result<()> {
        (**self).commit_run(commit)
    }

    fn current(&self, mode: Mode) -> R360Result<Vec<KeyAssignment>> {
        (**self).current(mode)
    }

    fn historical_as_of(
        &self,
        mode: Mode,
        as_of: NaiveDateTime,
    ) -> R360Result<Option<(NaiveDateTime, Vec<KeyAssignment>)>> {
        (**self).historical_as_of(mode, as_of)
    }

    fn audit_entries(&self, mode: Mode) -> R360Result<Vec<AuditEntry>> {
        (**self).audit_entries(mode)
    }

    fn runs(&self, mode: Mode) -> R360Result<Vec<RunLogRow>> {
        (**self).runs(mode)
    }
}

/// Audit rows a plan produces, in event order.
pub(crate) fn audit_rows(commit: &RunCommit, plan: &KeyPlan) -> R360Result<Vec<AuditEntry>> {
    let as_of = commit.as_of.format(crate::types::AS_OF_FORMAT).to_string();
    plan.events
        .iter()
        .map(|event| {
            Ok(AuditEntry {
                id:         None,
                run_id:     commit.run_id.clone(),
                mode:       plan.mode,
                as_of:      as_of.clone(),
                event_type: event.event_type().to_string(),
                key_id:     event.key_id().clone(),
                payload:    serde_json::to_string(event)?,
            })
        })
        .collect()
}
