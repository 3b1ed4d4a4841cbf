//! SQLite-backed `RecordSource` over a nightly warehouse extract.
//!
//! Each fetch opens its own read-only connection so the four queries can run
//! on separate threads. Any SQLite failure is reported as
//! `SourceUnavailable` and goes through the ingestion retry loop.

use crate::{
    error::{R360Error, R360Result},
    ids::RawValue,
    source::{PartyKind, RawAccount, RawAddress, RawAddressLink, RawRole, RecordSource},
    types::AS_OF_FORMAT,
};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params_from_iter, types::Value, Connection, OpenFlags};

pub struct WarehouseSource {
    path: String,
}

impl WarehouseSource {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string() }
    }

    /// Create the extract tables in a fresh database (tests and local fixtures).
    pub fn init_schema(conn: &Connection) -> R360Result<()> {
        conn.execute_batch(include_str!("../../migrations/warehouse.sql"))?;
        Ok(())
    }

    fn connect(&self, query: &str) -> R360Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| unavailable(query, e))
    }

    /// Run `sql` and return every row as raw values, `width` columns each.
    fn fetch(&self, query: &str, sql: &str, args: &[String], width: usize) -> R360Result<Vec<Vec<Value>>> {
        let conn = self.connect(query)?;
        let mut stmt = conn.prepare(sql).map_err(|e| unavailable(query, e))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                (0..width).map(|i| row.get::<_, Value>(i)).collect::<Result<Vec<_>, _>>()
            })
            .map_err(|e| unavailable(query, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| unavailable(query, e))?;
        log::debug!("{query}: fetched {} rows", rows.len());
        Ok(rows)
    }

    fn address_links(&self, kind: PartyKind, use_codes: &[String]) -> R360Result<Vec<RawAddressLink>> {
        let (query, table, party_col) = match kind {
            PartyKind::Person       => ("pers_addr_use", "pers_addr_use", "persnbr"),
            PartyKind::Organization => ("org_addr_use", "org_addr_use", "orgnbr"),
        };
        let sql = format!(
            "SELECT {party_col}, addrnbr, addrusecd, datelastmaint FROM {table}
             WHERE addrusecd IN ({})",
            placeholders(use_codes.len())
        );
        self.fetch(query, &sql, use_codes, 4)?
            .into_iter()
            .map(|mut cols| {
                let maint = cols.pop().unwrap_or(Value::Null);
                let use_code = RawValue::from(cols.pop().unwrap_or(Value::Null));
                let addrnbr = RawValue::from(cols.pop().unwrap_or(Value::Null));
                let party = RawValue::from(cols.pop().unwrap_or(Value::Null));
                Ok(RawAddressLink {
                    party_kind: kind,
                    party,
                    addrnbr,
                    use_code: use_code.as_text().unwrap_or_default(),
                    maintained_at: parse_maintained(query, maint)?,
                })
            })
            .collect()
    }
}

impl RecordSource for WarehouseSource {
    fn accounts(&self) -> R360Result<Vec<RawAccount>> {
        let rows = self.fetch(
            "acct_common",
            "SELECT acctnbr, curracctstatcd, mjaccttypcd, taxrptforpersnbr, taxrptfororgnbr
             FROM acct_common",
            &[],
            5,
        )?;
        Ok(rows
            .into_iter()
            .map(|cols| {
                let mut it = cols.into_iter().map(RawValue::from);
                let mut next = || it.next().unwrap_or(RawValue::Null);
                RawAccount {
                    acctnbr:     next(),
                    status_code: next(),
                    type_code:   next(),
                    tax_person:  next(),
                    tax_org:     next(),
                }
            })
            .collect())
    }

    fn primary_address_links(&self, use_codes: &[String]) -> R360Result<Vec<RawAddressLink>> {
        if use_codes.is_empty() {
            return Ok(Vec::new());
        }
        let mut links = self.address_links(PartyKind::Person, use_codes)?;
        links.extend(self.address_links(PartyKind::Organization, use_codes)?);
        Ok(links)
    }

    fn addresses(&self) -> R360Result<Vec<RawAddress>> {
        let rows = self.fetch(
            "wh_addr",
            "SELECT addrnbr, text1, text2, text3, cityname, statecd, zipcd FROM wh_addr",
            &[],
            7,
        )?;
        Ok(rows
            .into_iter()
            .map(|cols| {
                let mut it = cols.into_iter().map(RawValue::from);
                let mut next = || it.next().unwrap_or(RawValue::Null);
                RawAddress {
                    addrnbr: next(),
                    text1:   next(),
                    text2:   next(),
                    text3:   next(),
                    city:    next(),
                    state:   next(),
                    zip:     next(),
                }
            })
            .collect())
    }

    fn ownership_roles(&self, role_codes: &[String]) -> R360Result<Vec<RawRole>> {
        if role_codes.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT acctnbr, persnbr, orgnbr, acctrolecd FROM wh_allroles
             WHERE acctrolecd IN ({})",
            placeholders(role_codes.len())
        );
        let rows = self.fetch("wh_allroles", &sql, role_codes, 4)?;
        Ok(rows
            .into_iter()
            .map(|cols| {
                let mut it = cols.into_iter().map(RawValue::from);
                let mut next = || it.next().unwrap_or(RawValue::Null);
                RawRole {
                    acctnbr:   next(),
                    persnbr:   next(),
                    orgnbr:    next(),
                    role_code: next().as_text().unwrap_or_default(),
                }
            })
            .collect())
    }
}

fn unavailable(query: &str, e: rusqlite::Error) -> R360Error {
    R360Error::SourceUnavailable {
        query: query.to_string(),
        reason: e.to_string(),
    }
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

/// Maintenance stamps arrive as `YYYY-MM-DD HH:MM:SS` or a bare date.
fn parse_maintained(query: &str, v: Value) -> R360Result<Option<NaiveDateTime>> {
    let text = match RawValue::from(v).as_text() {
        Some(t) => t,
        None => return Ok(None),
    };
    if let Ok(ts) = NaiveDateTime::parse_from_str(&text, AS_OF_FORMAT) {
        return Ok(Some(ts));
    }
    if let Ok(d) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return Ok(d.and_hms_opt(0, 0, 0));
    }
    Err(R360Error::integrity(
        query,
        format!("column 'datelastmaint' holds unparseable timestamp '{text}'"),
    ))
}
