//! Exports and key attachment driven from real runs.

use chrono::{NaiveDate, NaiveDateTime};
use r360_core::{
    engine::KeyEngine,
    publish::{attach_key, Dataset, KeyTable},
    source::{MemorySource, PartyKind},
    store::KeyStore,
    types::Mode,
    MemoryKeyStore, R360Config, R360Error,
};
use std::fs;

fn at(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, day)
        .expect("date")
        .and_hms_opt(1, 0, 0)
        .expect("time")
}

fn source() -> MemorySource {
    let mut src = MemorySource::new();
    src.account(100, 1)
        .account(101, 2)
        .account(7, 3)
        .primary_address(PartyKind::Person, 1, 50, None)
        .primary_address(PartyKind::Person, 2, 50, None);
    src
}

#[test]
fn run_writes_one_export_per_mode() {
    let out = tempfile::tempdir().expect("tempdir");
    let mut config = R360Config::with_modes(&[Mode::Portfolio, Mode::Address]);
    config.output_dir = Some(out.path().to_string_lossy().into_owned());

    let mut engine = KeyEngine::new(config, MemoryKeyStore::new());
    let report = engine.run(&source(), at(17)).expect("run");

    let portfolio = out.path().join("r360_portfolio_20240517.csv");
    assert_eq!(report.modes[0].export.as_deref(), Some(portfolio.as_path()));
    assert!(out.path().join("r360_address_20240517.csv").exists());

    // Natural account order, header first.
    let text = fs::read_to_string(&portfolio).expect("export");
    assert_eq!(text, "account_id,key_id\n7,1\n100,2\n101,2\n");

    let leftovers = fs::read_dir(out.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn blocked_export_does_not_undo_a_committed_run() {
    let out = tempfile::tempdir().expect("tempdir");
    // A directory squatting on the portfolio file name makes its rename fail.
    fs::create_dir(out.path().join("r360_portfolio_20240518.csv")).expect("blocker");
    let mut config = R360Config::with_modes(&[Mode::Portfolio, Mode::Address]);
    config.output_dir = Some(out.path().to_string_lossy().into_owned());

    let mut engine = KeyEngine::new(config, MemoryKeyStore::new());
    let report = engine.run(&source(), at(18)).expect("run still succeeds");

    assert!(report.committed);
    let exports: Vec<_> = report.modes.iter().map(|m| (m.mode, m.export.is_some())).collect();
    assert_eq!(exports, vec![(Mode::Portfolio, false), (Mode::Address, true)]);
    assert_eq!(engine.store().current(Mode::Portfolio).expect("current").len(), 3);

    let leftovers = fs::read_dir(out.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn dry_run_exports_without_committing() {
    let out = tempfile::tempdir().expect("tempdir");
    let mut config = R360Config::with_modes(&[Mode::Portfolio]);
    config.output_dir = Some(out.path().to_string_lossy().into_owned());

    let engine = KeyEngine::new(config, MemoryKeyStore::new());
    let report = engine.dry_run(&source(), at(2)).expect("dry run");

    assert!(!report.committed);
    assert!(out.path().join("r360_portfolio_20240502.csv").exists());
    let table = KeyTable::from_store(engine.store(), Mode::Portfolio).expect("table");
    assert!(table.is_empty());
}

#[test]
fn attach_key_from_store_and_from_export_agree() {
    let out = tempfile::tempdir().expect("tempdir");
    let mut config = R360Config::with_modes(&[Mode::Portfolio]);
    config.output_dir = Some(out.path().to_string_lossy().into_owned());
    let mut engine = KeyEngine::new(config, MemoryKeyStore::new());
    let report = engine.run(&source(), at(3)).expect("run");

    let dataset = Dataset::from_csv("acctnbr,balance\n101,10.50\n555,3.00\n7,\n".as_bytes())
        .expect("dataset");

    let from_store = KeyTable::from_store(engine.store(), Mode::Portfolio).expect("store table");
    let export = report.modes[0].export.clone().expect("export path");
    let from_csv = KeyTable::from_csv(Mode::Portfolio, fs::File::open(export).expect("open"))
        .expect("csv table");

    let a = attach_key(&dataset, "acctnbr", &from_store).expect("attach");
    let b = attach_key(&dataset, "acctnbr", &from_csv).expect("attach");
    assert_eq!(a, b);
    assert_eq!(a.rows.len(), dataset.rows.len());
    assert_eq!(a.column("portfolio_key").expect("key column"), vec![Some("2"), None, Some("1")]);
    // Existing columns are untouched, nulls included.
    assert_eq!(a.column("balance").expect("balance"), vec![Some("10.50"), Some("3.00"), None]);

    let mut written = Vec::new();
    a.write_csv(&mut written).expect("write");
    assert_eq!(
        String::from_utf8(written).expect("utf-8"),
        "acctnbr,balance,portfolio_key\n101,10.50,2\n555,3.00,\n7,,1\n"
    );
}

#[test]
fn join_column_is_matched_verbatim() {
    let table = KeyTable::from_assignments(
        Mode::Ownership,
        vec![r360_core::types::KeyAssignment { account_id: "100".into(), key_id: "4".into() }],
    );
    let dataset = Dataset::from_csv("acct\n0100\n100\n".as_bytes()).expect("dataset");
    let joined = attach_key(&dataset, "acct", &table).expect("attach");
    assert_eq!(joined.column("ownership_key").expect("key"), vec![None, Some("4")]);

    let err = attach_key(&dataset, "acctnbr", &table).expect_err("missing column");
    assert!(matches!(err, R360Error::MissingColumn { .. }));
}
