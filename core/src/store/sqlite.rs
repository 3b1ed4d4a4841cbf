//! SQLite key store.

use super::{audit_rows, KeyStore, RunCommit, RunLogRow};
use crate::{
    error::{R360Error, R360Result},
    event::AuditEntry,
    ids::natural_cmp,
    reconcile::PriorSnapshot,
    types::{KeyAssignment, Mode, AS_OF_FORMAT},
};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};

pub struct SqliteKeyStore {
    conn: Connection,
}

impl SqliteKeyStore {
    pub fn open(path: &str) -> R360Result<Self> {
        let conn = Connection::open(path)?;
        // WAL only matters for real files; :memory: ignores it.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> R360Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> R360Result<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_key_store.sql"))?;
        Ok(())
    }

    fn assignments(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> R360Result<Vec<KeyAssignment>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt
            .query_map(args, |row| {
                Ok(KeyAssignment {
                    account_id: row.get(0)?,
                    key_id:     row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by(|a, b| natural_cmp(&a.account_id, &b.account_id));
        Ok(rows)
    }
}

impl KeyStore for SqliteKeyStore {
    fn load_prior(&self, mode: Mode) -> R360Result<Option<PriorSnapshot>> {
        let rows = self.current(mode)?;
        if rows.is_empty() {
            return Ok(None);
        }
        PriorSnapshot::from_rows(mode, rows).map(Some)
    }

    fn key_high_water(&self, mode: Mode) -> R360Result<u64> {
        let last: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_key FROM key_sequence WHERE mode = ?1",
                params![mode.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(last.unwrap_or(0).max(0) as u64)
    }

    fn commit_run(&mut self, commit: &RunCommit) -> R360Result<()> {
        let as_of = commit.as_of.format(AS_OF_FORMAT).to_string();
        let tx = self.conn.transaction()?;

        for plan in &commit.plans {
            let mode = plan.mode;
            tx.execute(&format!("DELETE FROM {}", mode.current_table()), [])?;
            {
                let mut current = tx.prepare(&format!(
                    "INSERT INTO {} (account_id, key_id) VALUES (?1, ?2)",
                    mode.current_table()
                ))?;
                let mut historical = tx.prepare(&format!(
                    "INSERT INTO {} (account_id, key_id, as_of, run_id) VALUES (?1, ?2, ?3, ?4)",
                    mode.historical_table()
                ))?;
                for a in &plan.assignments {
                    current.execute(params![a.account_id, a.key_id])?;
                    historical.execute(params![a.account_id, a.key_id, as_of, commit.run_id])?;
                }

                let mut audit = tx.prepare(
                    "INSERT INTO key_audit (run_id, mode, as_of, event_type, key_id, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for entry in audit_rows(commit, plan)? {
                    audit.execute(params![
                        entry.run_id,
                        mode.as_str(),
                        entry.as_of,
                        entry.event_type,
                        entry.key_id,
                        entry.payload,
                    ])?;
                }
            }

            let last_key = i64::try_from(plan.last_key).map_err(|_| {
                R360Error::integrity("key_sequence", format!("key {} overflows storage", plan.last_key))
            })?;
            tx.execute(
                "INSERT INTO key_sequence (mode, last_key) VALUES (?1, ?2)
                 ON CONFLICT(mode) DO UPDATE SET last_key = MAX(last_key, excluded.last_key)",
                params![mode.as_str(), last_key],
            )?;

            let log = RunLogRow::from_plan(commit, plan);
            tx.execute(
                "INSERT INTO run_log (run_id, mode, as_of, accounts, components, minted,
                                      retained, merged, split, retired)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    log.run_id,
                    mode.as_str(),
                    log.as_of,
                    log.accounts as i64,
                    log.components as i64,
                    log.minted as i64,
                    log.retained as i64,
                    log.merged as i64,
                    log.split as i64,
                    log.retired as i64,
                ],
            )?;
            log::debug!("{mode}: staged {} assignments for commit", plan.assignments.len());
        }

        tx.commit()?;
        log::info!("Committed run {} ({} mode(s)) as of {as_of}", commit.run_id, commit.plans.len());
        Ok(())
    }

    fn current(&self, mode: Mode) -> R360Result<Vec<KeyAssignment>> {
        self.assignments(
            &format!("SELECT account_id, key_id FROM {}", mode.current_table()),
            &[],
        )
    }

    fn historical_as_of(
        &self,
        mode: Mode,
        as_of: NaiveDateTime,
    ) -> R360Result<Option<(NaiveDateTime, Vec<KeyAssignment>)>> {
        let bound = as_of.format(AS_OF_FORMAT).to_string();
        // Several runs may share a stamp; the one written last is the snapshot.
        let latest: Option<(String, String)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT as_of, run_id FROM {} WHERE as_of <= ?1
                     ORDER BY as_of DESC, rowid DESC LIMIT 1",
                    mode.historical_table()
                ),
                params![bound],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((stamp, run_id)) = latest else { return Ok(None) };
        let rows = self.assignments(
            &format!(
                "SELECT account_id, key_id FROM {} WHERE as_of = ?1 AND run_id = ?2",
                mode.historical_table()
            ),
            &[&stamp, &run_id],
        )?;
        let ts = NaiveDateTime::parse_from_str(&stamp, AS_OF_FORMAT).map_err(|e| {
            R360Error::integrity(mode.historical_table(), format!("bad as_of '{stamp}': {e}"))
        })?;
        Ok(Some((ts, rows)))
    }

    fn audit_entries(&self, mode: Mode) -> R360Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, as_of, event_type, key_id, payload
             FROM key_audit WHERE mode = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![mode.as_str()], |row| {
                Ok(AuditEntry {
                    id:         Some(row.get(0)?),
                    run_id:     row.get(1)?,
                    mode,
                    as_of:      row.get(2)?,
                    event_type: row.get(3)?,
                    key_id:     row.get(4)?,
                    payload:    row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn runs(&self, mode: Mode) -> R360Result<Vec<RunLogRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, as_of, accounts, components, minted, retained, merged, split, retired
             FROM run_log WHERE mode = ?1
             ORDER BY as_of ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![mode.as_str()], |row| {
                Ok(RunLogRow {
                    run_id:     row.get(0)?,
                    mode,
                    as_of:      row.get(1)?,
                    accounts:   row.get::<_, i64>(2)? as usize,
                    components: row.get::<_, i64>(3)? as usize,
                    minted:     row.get::<_, i64>(4)? as usize,
                    retained:   row.get::<_, i64>(5)? as usize,
                    merged:     row.get::<_, i64>(6)? as usize,
                    split:      row.get::<_, i64>(7)? as usize,
                    retired:    row.get::<_, i64>(8)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
