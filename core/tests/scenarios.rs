//! End-to-end runs through the engine on small, hand-checked universes.

use chrono::{NaiveDate, NaiveDateTime};
use r360_core::{
    engine::KeyEngine,
    source::{MemorySource, PartyKind},
    store::KeyStore,
    types::{KeyAssignment, Mode},
    R360Config, SqliteKeyStore,
};

fn at(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, day)
        .expect("date")
        .and_hms_opt(0, 0, 0)
        .expect("time")
}

fn engine(config: R360Config) -> KeyEngine<SqliteKeyStore> {
    let store = SqliteKeyStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    KeyEngine::new(config, store)
}

fn key_of(rows: &[KeyAssignment], account: &str) -> String {
    rows.iter()
        .find(|r| r.account_id == account)
        .map(|r| r.key_id.clone())
        .unwrap_or_else(|| panic!("account {account} has no key"))
}

/// Accounts 100 and 101 report under people sharing address 1;
/// account 200 reports under someone at address 9.
fn scenario_a() -> MemorySource {
    let mut src = MemorySource::new();
    src.account(100, 1)
        .account(101, 2)
        .account(200, 3)
        .primary_address(PartyKind::Person, 1, 1, None)
        .primary_address(PartyKind::Person, 2, 1, None)
        .primary_address(PartyKind::Person, 3, 9, None)
        .address(1, "1 Main St", "02903")
        .address(9, "9 Elm St", "02904");
    src
}

#[test]
fn shared_address_shares_a_key_and_a_newcomer_inherits_it() {
    let mut engine = engine(R360Config::with_modes(&[Mode::Portfolio]));

    engine.run(&scenario_a(), at(1)).expect("first run");
    let first = engine.store().current(Mode::Portfolio).expect("current");
    let k1 = key_of(&first, "100");
    let k2 = key_of(&first, "200");
    assert_eq!(key_of(&first, "101"), k1);
    assert_ne!(k1, k2);

    let mut src = scenario_a();
    src.account(102, 4).primary_address(PartyKind::Person, 4, 1, None);
    let report = engine.run(&src, at(2)).expect("second run");

    let second = engine.store().current(Mode::Portfolio).expect("current");
    for account in ["100", "101", "102"] {
        assert_eq!(key_of(&second, account), k1, "account {account}");
    }
    assert_eq!(key_of(&second, "200"), k2);
    assert_eq!(report.modes[0].keys.minted, 0);
    assert_eq!(report.modes[0].keys.retained, 2);
}

#[test]
fn excluded_address_does_not_link_accounts() {
    let mut config = R360Config::with_modes(&[Mode::Portfolio]);
    config
        .modes
        .get_mut(&Mode::Portfolio)
        .expect("portfolio config")
        .excluded_addresses
        .insert("2".into());

    let mut src = MemorySource::new();
    for (acct, person) in [(300, 30), (301, 31), (302, 32)] {
        src.account(acct, person)
            .primary_address(PartyKind::Person, person, 2, None);
    }
    src.address(2, "PO Box 1", "00000");

    let mut engine = engine(config);
    let report = engine.run(&src, at(1)).expect("run");

    let rows = engine.store().current(Mode::Portfolio).expect("current");
    assert_eq!(rows.len(), 3);
    assert_eq!(report.modes[0].unique_keys, 3);
    assert_eq!(report.modes[0].graph.excluded_address_refs, 3);
}

#[test]
fn cold_start_mints_one_key_per_component_and_records_history() {
    let mut engine = engine(R360Config::with_modes(&[Mode::Portfolio]));
    let report = engine.run(&scenario_a(), at(5)).expect("run");

    let mode = &report.modes[0];
    assert_eq!(mode.keys.components, 2);
    assert_eq!(mode.keys.minted, 2);
    assert_eq!(mode.unique_keys, 2);

    let (stamp, history) = engine
        .store()
        .historical_as_of(Mode::Portfolio, at(5))
        .expect("historical")
        .expect("snapshot present");
    assert_eq!(stamp, at(5));
    assert_eq!(history.len(), 3);
    assert_eq!(history, engine.store().current(Mode::Portfolio).expect("current"));
}

#[test]
fn modes_keep_independent_key_sequences() {
    let mut src = scenario_a();
    src.role(100, PartyKind::Organization, 77, "OWN")
        .role(200, PartyKind::Organization, 77, "GUAR");

    let mut engine = engine(R360Config::with_modes(&Mode::ALL));
    let report = engine.run(&src, at(1)).expect("run");
    assert_eq!(report.modes.len(), 3);

    let portfolio = engine.store().current(Mode::Portfolio).expect("portfolio");
    let address = engine.store().current(Mode::Address).expect("address");
    let ownership = engine.store().current(Mode::Ownership).expect("ownership");

    // Portfolio joins everyone: 100~101 by address, 100~200 by owner O77.
    assert_eq!(key_of(&portfolio, "101"), key_of(&portfolio, "200"));
    // Address keeps 200 apart.
    assert_ne!(key_of(&address, "101"), key_of(&address, "200"));
    // Ownership: 101 has no owner and stands alone.
    assert_eq!(key_of(&ownership, "100"), key_of(&ownership, "200"));
    assert_ne!(key_of(&ownership, "100"), key_of(&ownership, "101"));
    // Each mode starts its own sequence at 1.
    assert_eq!(key_of(&portfolio, "100"), "1");
    assert_eq!(key_of(&address, "100"), "1");
    assert_eq!(key_of(&ownership, "100"), "1");
}
