//! Key publisher: CSV exports and the `attach_key` left join.
//!
//! Exports are written next to their final path with a `.tmp` suffix and only
//! renamed into place once the run has committed. A staged export that is
//! dropped without `finalize` removes its file.

use crate::{
    error::{R360Error, R360Result},
    ids::natural_cmp,
    reconcile::KeyPlan,
    store::KeyStore,
    types::{AccountId, KeyAssignment, KeyId, Mode},
};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const EXPORT_HEADER: [&str; 2] = ["account_id", "key_id"];

/// `r360_<mode>_<YYYYMMDD>.csv`
pub fn export_file_name(mode: Mode, as_of: NaiveDateTime) -> String {
    format!("r360_{}_{}.csv", mode.as_str(), as_of.format("%Y%m%d"))
}

pub fn write_assignments<W: Write>(out: W, rows: &[KeyAssignment]) -> R360Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(out);
    wtr.write_record(EXPORT_HEADER)?;
    for row in rows {
        wtr.write_record([row.account_id.as_str(), row.key_id.as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

/// An export written to its `.tmp` path, waiting for the run to commit.
#[derive(Debug)]
pub struct StagedExport {
    pub mode: Mode,
    target:   PathBuf,
    staged:   Option<PathBuf>,
}

impl StagedExport {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the staged file onto its final name. On failure the staged
    /// file is removed when `self` drops.
    pub fn finalize(mut self) -> R360Result<PathBuf> {
        if let Some(staged) = self.staged.as_deref() {
            fs::rename(staged, &self.target)?;
            self.staged = None;
        }
        log::info!("{}: exported {}", self.mode, self.target.display());
        Ok(self.target.clone())
    }

    pub fn discard(mut self) {
        self.remove_staged();
    }

    fn remove_staged(&mut self) {
        if let Some(staged) = self.staged.take() {
            if let Err(e) = fs::remove_file(&staged) {
                log::warn!("Could not remove staged export {}: {e}", staged.display());
            }
        }
    }
}

impl Drop for StagedExport {
    fn drop(&mut self) {
        self.remove_staged();
    }
}

pub fn stage_export(dir: &Path, plan: &KeyPlan, as_of: NaiveDateTime) -> R360Result<StagedExport> {
    fs::create_dir_all(dir)?;
    let target = dir.join(export_file_name(plan.mode, as_of));
    let staged = target.with_extension("csv.tmp");
    let file = fs::File::create(&staged)?;
    let mut export = StagedExport { mode: plan.mode, target, staged: Some(staged) };
    if let Err(e) = write_assignments(file, &plan.assignments) {
        export.remove_staged();
        return Err(e);
    }
    log::debug!("{}: staged {} rows", plan.mode, plan.assignments.len());
    Ok(export)
}

/// Account → key lookup for one mode.
#[derive(Debug, Clone)]
pub struct KeyTable {
    pub mode: Mode,
    keys:     HashMap<AccountId, KeyId>,
}

impl KeyTable {
    pub fn from_assignments(mode: Mode, rows: impl IntoIterator<Item = KeyAssignment>) -> Self {
        Self {
            mode,
            keys: rows.into_iter().map(|r| (r.account_id, r.key_id)).collect(),
        }
    }

    pub fn from_store(store: &dyn KeyStore, mode: Mode) -> R360Result<Self> {
        Ok(Self::from_assignments(mode, store.current(mode)?))
    }

    /// Load an export written by `write_assignments`.
    pub fn from_csv<R: Read>(mode: Mode, input: R) -> R360Result<Self> {
        let dataset = Dataset::from_csv(input)?;
        let account = dataset.column_index(EXPORT_HEADER[0])?;
        let key = dataset.column_index(EXPORT_HEADER[1])?;
        let rows = dataset.rows.into_iter().filter_map(|row| {
            match (cell(&row, account), cell(&row, key)) {
                (Some(account_id), Some(key_id)) => Some(KeyAssignment {
                    account_id: account_id.to_string(),
                    key_id:     key_id.to_string(),
                }),
                _ => None,
            }
        });
        Ok(Self::from_assignments(mode, rows))
    }

    pub fn get(&self, account_id: &str) -> Option<&KeyId> {
        self.keys.get(account_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Rows in natural account order.
    pub fn assignments(&self) -> Vec<KeyAssignment> {
        let mut rows: Vec<KeyAssignment> = self
            .keys
            .iter()
            .map(|(a, k)| KeyAssignment { account_id: a.clone(), key_id: k.clone() })
            .collect();
        rows.sort_by(|a, b| natural_cmp(&a.account_id, &b.account_id));
        rows
    }
}

/// A small tabular dataset. Empty CSV cells read as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows:    Vec<Vec<Option<String>>>,
}

impl Dataset {
    pub fn from_csv<R: Read>(input: R) -> R360Result<Self> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(input);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                (0..columns.len())
                    .map(|i| record.get(i).filter(|v| !v.is_empty()).map(str::to_string))
                    .collect(),
            );
        }
        Ok(Self { columns, rows })
    }

    pub fn read_csv(path: &Path) -> R360Result<Self> {
        Self::from_csv(fs::File::open(path)?)
    }

    pub fn write_csv<W: Write>(&self, out: W) -> R360Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(out);
        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> R360Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| R360Error::MissingColumn { column: name.to_string() })
    }

    pub fn column(&self, name: &str) -> R360Result<Vec<Option<&str>>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| cell(r, idx)).collect())
    }
}

/// Rows built by hand may be shorter than `columns`; missing cells are null.
fn cell(row: &[Option<String>], idx: usize) -> Option<&str> {
    row.get(idx).and_then(|v| v.as_deref())
}

/// Left join: every row of `dataset` plus a `<mode>_key` column.
///
/// `column` must already hold canonical account ids; values are matched
/// verbatim. Rows with no match, or a null id, get a null key.
pub fn attach_key(dataset: &Dataset, column: &str, keys: &KeyTable) -> R360Result<Dataset> {
    let idx = dataset.column_index(column)?;
    let key_column = keys.mode.key_column();
    if dataset.columns.contains(&key_column) {
        return Err(R360Error::integrity(
            "dataset",
            format!("column '{key_column}' already present"),
        ));
    }

    let mut columns = dataset.columns.clone();
    columns.push(key_column);
    let mut unmatched = 0usize;
    let rows = dataset
        .rows
        .iter()
        .map(|row| {
            let key = cell(row, idx).and_then(|id| keys.get(id)).cloned();
            if key.is_none() {
                unmatched += 1;
            }
            let mut out = row.clone();
            out.resize(dataset.columns.len(), None);
            out.push(key);
            out
        })
        .collect();

    log::debug!(
        "attach_key({}): {} rows, {unmatched} without a key",
        keys.mode,
        dataset.rows.len()
    );
    Ok(Dataset { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> KeyTable {
        KeyTable::from_assignments(
            Mode::Portfolio,
            vec![
                KeyAssignment { account_id: "100".into(), key_id: "1".into() },
                KeyAssignment { account_id: "200".into(), key_id: "2".into() },
            ],
        )
    }

    #[test]
    fn export_file_name_uses_mode_and_date() {
        let as_of = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        assert_eq!(export_file_name(Mode::Ownership, as_of), "r360_ownership_20240309.csv");
    }

    #[test]
    fn short_rows_are_padded_before_the_key() {
        let data = Dataset {
            columns: vec!["region".into(), "acctnbr".into()],
            rows:    vec![vec![Some("east".into())], vec![Some("west".into()), Some("200".into())]],
        };
        let joined = attach_key(&data, "acctnbr", &table()).unwrap();
        assert_eq!(joined.column("acctnbr").unwrap(), vec![None, Some("200")]);
        assert_eq!(joined.column("portfolio_key").unwrap(), vec![None, Some("2")]);
        assert!(joined.rows.iter().all(|r| r.len() == 3));
    }

    #[test]
    fn attach_key_is_a_left_join() {
        let data = Dataset::from_csv("acctnbr,balance\n100,5\n999,7\n,1\n".as_bytes()).unwrap();
        let joined = attach_key(&data, "acctnbr", &table()).unwrap();
        assert_eq!(joined.columns, vec!["acctnbr", "balance", "portfolio_key"]);
        assert_eq!(
            joined.column("portfolio_key").unwrap(),
            vec![Some("1"), None, None]
        );
    }

    #[test]
    fn attach_key_rejects_missing_column() {
        let data = Dataset::from_csv("id\n100\n".as_bytes()).unwrap();
        let err = attach_key(&data, "acctnbr", &table()).unwrap_err();
        assert!(matches!(err, R360Error::MissingColumn { column } if column == "acctnbr"));
    }

    #[test]
    fn key_table_reads_its_own_export() {
        let mut buf = Vec::new();
        write_assignments(&mut buf, &table().assignments()).unwrap();
        assert_eq!(String::from_utf8(buf.clone()).unwrap(), "account_id,key_id\n100,1\n200,2\n");
        let back = KeyTable::from_csv(Mode::Portfolio, buf.as_slice()).unwrap();
        assert_eq!(back.get("200").map(String::as_str), Some("2"));
    }
}
