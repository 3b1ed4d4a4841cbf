//! Ingestion adapter: fetches the four record sets and normalizes them.
//!
//! Fetches run concurrently on scoped threads, each with its own retry loop.
//! Normalization is single-threaded and fail-closed: any identifier that
//! cannot be canonicalized aborts the run.

use crate::{
    config::{R360Config, RetryPolicy},
    error::{R360Error, R360Result},
    ids::{canonical_id, natural_cmp, org_party, person_party, required_id},
    source::{PartyKind, RawAccount, RawAddress, RawAddressLink, RawRole, RecordSource},
    types::{AccountId, AddressId, PartyId},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id:          AccountId,
    pub status_code: Option<String>,
    pub type_code:   Option<String>,
    pub tax_person:  Option<PartyId>,
    pub tax_org:     Option<PartyId>,
    /// Parties holding an ownership role on the account, sorted, deduplicated.
    pub owners:      Vec<PartyId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id:    AddressId,
    pub text1: Option<String>,
    pub text2: Option<String>,
    pub text3: Option<String>,
    pub city:  Option<String>,
    pub state: Option<String>,
    pub zip:   Option<String>,
}

impl Address {
    /// Upper-cased, whitespace-collapsed `TEXT1, TEXT2, TEXT3, CITY, STATE, ZIP`
    /// with empty parts skipped. `None` when every part is empty.
    pub fn normalized_text(&self) -> Option<String> {
        let parts: Vec<String> = [&self.text1, &self.text2, &self.text3, &self.city, &self.state, &self.zip]
            .into_iter()
            .flatten()
            .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() { None } else { Some(parts.join(", ")) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRole {
    pub account_id: AccountId,
    pub party_id:   PartyId,
    pub role_code:  String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestStats {
    pub accounts:               usize,
    pub inactive_skipped:       usize,
    pub parties_with_address:   usize,
    pub superseded_links:       usize,
    pub roles:                  usize,
    pub roles_skipped:          usize,
}

/// The normalized input of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    /// Active accounts in natural id order.
    pub accounts:          Vec<Account>,
    /// Deduplicated primary address per party.
    pub primary_addresses: BTreeMap<PartyId, AddressId>,
    pub addresses:         BTreeMap<AddressId, Address>,
    pub roles:             Vec<OwnershipRole>,
    pub stats:             IngestStats,
}

impl RecordSet {
    /// The address an account groups on: its tax-reporting person's primary
    /// address, falling back to the tax-reporting organization's.
    pub fn account_address(&self, account: &Account) -> Option<&AddressId> {
        account
            .tax_person
            .iter()
            .chain(account.tax_org.iter())
            .find_map(|party| self.primary_addresses.get(party))
    }
}

/// Fetch and normalize all four record sets.
pub fn ingest(source: &dyn RecordSource, config: &R360Config) -> R360Result<RecordSet> {
    let retry = &config.retry;

    let (accounts, links, addresses, roles) = thread::scope(|s| {
        let accounts = s.spawn(|| with_retry("accounts", retry, || source.accounts()));
        let links = s.spawn(|| {
            with_retry("primary_address_links", retry, || {
                source.primary_address_links(&config.primary_address_codes)
            })
        });
        let addresses = s.spawn(|| with_retry("addresses", retry, || source.addresses()));
        let roles = s.spawn(|| {
            with_retry("ownership_roles", retry, || {
                source.ownership_roles(&config.ownership_role_codes)
            })
        });
        (
            joined("accounts", accounts.join()),
            joined("primary_address_links", links.join()),
            joined("addresses", addresses.join()),
            joined("ownership_roles", roles.join()),
        )
    });

    let records = normalize(accounts?, links?, addresses?, roles?, config)?;
    log::info!(
        "Ingested {} active accounts ({} inactive skipped), {} parties with a primary address, {} ownership roles",
        records.stats.accounts,
        records.stats.inactive_skipped,
        records.stats.parties_with_address,
        records.stats.roles,
    );
    Ok(records)
}

/// Normalize already-fetched rows. Public so callers holding rows can skip
/// the fetch stage.
pub fn normalize(
    raw_accounts: Vec<RawAccount>,
    raw_links: Vec<RawAddressLink>,
    raw_addresses: Vec<RawAddress>,
    raw_roles: Vec<RawRole>,
    config: &R360Config,
) -> R360Result<RecordSet> {
    let mut stats = IngestStats::default();

    // ── Accounts ──────────────────────────────────────────────
    let mut seen: HashSet<AccountId> = HashSet::new();
    let mut accounts = Vec::with_capacity(raw_accounts.len());
    for raw in &raw_accounts {
        let id = required_id("accounts", "acctnbr", &raw.acctnbr)?;
        if !seen.insert(id.clone()) {
            return Err(R360Error::integrity("accounts", format!("duplicate account id {id}")));
        }
        let status_code = raw.status_code.as_text();
        if !config.active_status_codes.is_empty()
            && !status_code.as_ref().is_some_and(|s| config.active_status_codes.contains(s))
        {
            stats.inactive_skipped += 1;
            continue;
        }
        accounts.push(Account {
            id,
            status_code,
            type_code:  raw.type_code.as_text(),
            tax_person: canonical_id("accounts", "taxrptforpersnbr", &raw.tax_person)?.map(|p| person_party(&p)),
            tax_org:    canonical_id("accounts", "taxrptfororgnbr", &raw.tax_org)?.map(|o| org_party(&o)),
            owners:     Vec::new(),
        });
    }
    accounts.sort_by(|a, b| natural_cmp(&a.id, &b.id));
    stats.accounts = accounts.len();

    // ── Primary address per party ─────────────────────────────
    let primary_addresses = dedup_primary_addresses(&raw_links, &mut stats)?;
    stats.parties_with_address = primary_addresses.len();

    // ── Address directory ─────────────────────────────────────
    let mut addresses = BTreeMap::new();
    for raw in &raw_addresses {
        let id = required_id("addresses", "addrnbr", &raw.addrnbr)?;
        let address = Address {
            id: id.clone(),
            text1: raw.text1.as_text(),
            text2: raw.text2.as_text(),
            text3: raw.text3.as_text(),
            city:  raw.city.as_text(),
            state: raw.state.as_text(),
            zip:   raw.zip.as_text(),
        };
        if addresses.insert(id.clone(), address).is_some() {
            return Err(R360Error::integrity("addresses", format!("duplicate address id {id}")));
        }
    }

    // ── Ownership roles ───────────────────────────────────────
    let index: BTreeMap<&str, usize> = accounts
        .iter()
        .enumerate()
        .map(|(i, a)| (a.id.as_str(), i))
        .collect();
    let mut owners: Vec<BTreeSet<PartyId>> = vec![BTreeSet::new(); accounts.len()];
    let mut roles = Vec::new();
    for raw in &raw_roles {
        let Some(account_id) = canonical_id("ownership_roles", "acctnbr", &raw.acctnbr)? else {
            log::warn!("Skipping {} role with no account number", raw.role_code);
            stats.roles_skipped += 1;
            continue;
        };
        let org = canonical_id("ownership_roles", "orgnbr", &raw.orgnbr)?;
        let person = canonical_id("ownership_roles", "persnbr", &raw.persnbr)?;
        let party_id = match (org, person) {
            (Some(o), _)    => org_party(&o),
            (None, Some(p)) => person_party(&p),
            (None, None) => {
                log::warn!("Skipping {} role on account {account_id} with no party", raw.role_code);
                stats.roles_skipped += 1;
                continue;
            }
        };
        // Roles on accounts outside the active universe carry no edge.
        let Some(&i) = index.get(account_id.as_str()) else { continue };
        owners[i].insert(party_id.clone());
        roles.push(OwnershipRole { account_id, party_id, role_code: raw.role_code.clone() });
    }
    drop(index);
    for (account, set) in accounts.iter_mut().zip(owners) {
        account.owners = set.into_iter().collect();
    }
    stats.roles = roles.len();

    Ok(RecordSet { accounts, primary_addresses, addresses, roles, stats })
}

/// Keep the most recently maintained primary address per party.
///
/// Rows are ordered by maintenance time descending with undated rows last.
/// Two top rows with the same stamp but different addresses cannot be
/// resolved and abort the run.
fn dedup_primary_addresses(
    raw_links: &[RawAddressLink],
    stats: &mut IngestStats,
) -> R360Result<BTreeMap<PartyId, AddressId>> {
    let mut by_party: BTreeMap<PartyId, Vec<(Option<NaiveDateTime>, AddressId)>> = BTreeMap::new();
    for raw in raw_links {
        let Some(party) = canonical_id("primary_address_links", "party", &raw.party)? else {
            log::warn!("Skipping primary address link with no party");
            continue;
        };
        let Some(addr) = canonical_id("primary_address_links", "addrnbr", &raw.addrnbr)? else {
            continue;
        };
        let party_id = match raw.party_kind {
            PartyKind::Person       => person_party(&party),
            PartyKind::Organization => org_party(&party),
        };
        by_party.entry(party_id).or_default().push((raw.maintained_at, addr));
    }

    let mut primary = BTreeMap::new();
    for (party_id, mut rows) in by_party {
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        let (top_ts, top_addr) = rows[0].clone();
        if let Some((_, other)) = rows[1..].iter().find(|(ts, a)| *ts == top_ts && *a != top_addr) {
            return Err(R360Error::integrity(
                "primary_address_links",
                format!(
                    "party {party_id} has primary addresses {top_addr} and {other} with the same maintenance time"
                ),
            ));
        }
        stats.superseded_links += rows.len() - 1;
        primary.insert(party_id, top_addr);
    }
    Ok(primary)
}

fn with_retry<T>(
    query: &str,
    policy: &RetryPolicy,
    mut fetch: impl FnMut() -> R360Result<T>,
) -> R360Result<T> {
    let attempts = policy.attempts.max(1);
    let mut backoff_ms = policy.base_backoff_ms;
    let mut attempt = 1;
    loop {
        match fetch() {
            Ok(rows) => return Ok(rows),
            Err(e) if e.is_retryable() && attempt < attempts => {
                log::warn!("{query}: attempt {attempt}/{attempts} failed ({e}); retrying in {backoff_ms}ms");
                thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms = backoff_ms.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                log::error!("{query}: giving up after {attempt} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}

fn joined<T>(query: &str, result: thread::Result<R360Result<T>>) -> R360Result<T> {
    result.unwrap_or_else(|_| {
        Err(R360Error::SourceUnavailable {
            query: query.to_string(),
            reason: "fetch thread panicked".into(),
        })
    })
}
