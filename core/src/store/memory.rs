//! In-memory key store for tests and dry runs.

use super::{audit_rows, KeyStore, RunCommit, RunLogRow};
use crate::{
    error::R360Result,
    event::AuditEntry,
    reconcile::PriorSnapshot,
    types::{KeyAssignment, Mode},
};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct State {
    current:    BTreeMap<Mode, Vec<KeyAssignment>>,
    historical: BTreeMap<Mode, Vec<(NaiveDateTime, Vec<KeyAssignment>)>>,
    sequence:   BTreeMap<Mode, u64>,
    audit:      Vec<AuditEntry>,
    runs:       Vec<RunLogRow>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    state: State,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a current table directly, as if a previous run had written it.
    pub fn seed(&mut self, mode: Mode, rows: Vec<KeyAssignment>) {
        self.state.current.insert(mode, rows);
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_prior(&self, mode: Mode) -> R360Result<Option<PriorSnapshot>> {
        match self.state.current.get(&mode) {
            Some(rows) if !rows.is_empty() => PriorSnapshot::from_rows(mode, rows.clone()).map(Some),
            _ => Ok(None),
        }
    }

    fn key_high_water(&self, mode: Mode) -> R360Result<u64> {
        Ok(self.state.sequence.get(&mode).copied().unwrap_or(0))
    }

    fn commit_run(&mut self, commit: &RunCommit) -> R360Result<()> {
        // Build the next state aside and swap it in only when every plan fits.
        let mut next = self.state.clone();
        for plan in &commit.plans {
            next.current.insert(plan.mode, plan.assignments.clone());
            next.historical
                .entry(plan.mode)
                .or_default()
                .push((commit.as_of, plan.assignments.clone()));
            let last = next.sequence.entry(plan.mode).or_insert(0);
            *last = (*last).max(plan.last_key);
            next.audit.extend(audit_rows(commit, plan)?);
            next.runs.push(RunLogRow::from_plan(commit, plan));
        }
        let base = self.state.audit.len();
        for (i, entry) in next.audit.iter_mut().enumerate().skip(base) {
            entry.id = Some(i as i64 + 1);
        }
        self.state = next;
        Ok(())
    }

    fn current(&self, mode: Mode) -> R360Result<Vec<KeyAssignment>> {
        Ok(self.state.current.get(&mode).cloned().unwrap_or_default())
    }

    fn historical_as_of(
        &self,
        mode: Mode,
        as_of: NaiveDateTime,
    ) -> R360Result<Option<(NaiveDateTime, Vec<KeyAssignment>)>> {
        Ok(self
            .state
            .historical
            .get(&mode)
            .and_then(|snaps| snaps.iter().filter(|(ts, _)| *ts <= as_of).max_by_key(|(ts, _)| *ts))
            .cloned())
    }

    fn audit_entries(&self, mode: Mode) -> R360Result<Vec<AuditEntry>> {
        Ok(self.state.audit.iter().filter(|e| e.mode == mode).cloned().collect())
    }

    fn runs(&self, mode: Mode) -> R360Result<Vec<RunLogRow>> {
        Ok(self.state.runs.iter().filter(|r| r.mode == mode).cloned().collect())
    }
}
