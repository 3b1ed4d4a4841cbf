//! Graph builder: the implicit account graph for one mode.
//!
//! Accounts live in a dense arena (index = position in natural id order).
//! Edges are never materialized: each hub keeps the list of account indices
//! that reference it, and the resolver unions that list in one pass.
//! Excluded hubs are dropped before grouping, so they never hold members.

use crate::{
    config::{AddressMatch, ModeConfig},
    ingest::RecordSet,
    types::{AccountId, AddressId, Mode, PartyId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Hub {
    /// Address id, or normalized address text under `AddressMatch::Text`.
    Address(String),
    Party(PartyId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub addresses: BTreeSet<AddressId>,
    pub parties:   BTreeSet<PartyId>,
}

impl From<&ModeConfig> for Exclusions {
    fn from(mc: &ModeConfig) -> Self {
        Self {
            addresses: mc.excluded_addresses.clone(),
            parties:   mc.excluded_parties.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub address_hubs:          usize,
    pub party_hubs:            usize,
    pub excluded_address_refs: usize,
    pub excluded_party_refs:   usize,
    pub largest_hub:           usize,
}

#[derive(Debug, Clone)]
pub struct AccountGraph {
    pub mode:     Mode,
    /// Arena: index → account id, natural order.
    pub accounts: Vec<AccountId>,
    /// Hub → member indices, ascending.
    pub hubs:     BTreeMap<Hub, Vec<usize>>,
    pub stats:    GraphStats,
}

impl AccountGraph {
    pub fn members(&self, hub: &Hub) -> &[usize] {
        self.hubs.get(hub).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn build_graph(
    records: &RecordSet,
    mode: Mode,
    exclusions: &Exclusions,
    address_match: AddressMatch,
) -> AccountGraph {
    let mut hubs: BTreeMap<Hub, Vec<usize>> = BTreeMap::new();
    let mut stats = GraphStats::default();

    for (i, account) in records.accounts.iter().enumerate() {
        if mode.uses_address() {
            if let Some(addr_id) = records.account_address(account) {
                if exclusions.addresses.contains(addr_id) {
                    stats.excluded_address_refs += 1;
                } else if let Some(key) = address_hub(records, addr_id, address_match) {
                    hubs.entry(Hub::Address(key)).or_default().push(i);
                }
            }
        }

        if mode.uses_ownership() {
            for party in &account.owners {
                if exclusions.parties.contains(party) {
                    stats.excluded_party_refs += 1;
                    continue;
                }
                hubs.entry(Hub::Party(party.clone())).or_default().push(i);
            }
        }
    }

    for (hub, members) in &hubs {
        match hub {
            Hub::Address(_) => stats.address_hubs += 1,
            Hub::Party(_)   => stats.party_hubs += 1,
        }
        stats.largest_hub = stats.largest_hub.max(members.len());
    }

    log::debug!(
        "{mode} graph: {} accounts, {} address hubs, {} party hubs, largest hub {} accounts, \
         {} address / {} party references excluded",
        records.accounts.len(),
        stats.address_hubs,
        stats.party_hubs,
        stats.largest_hub,
        stats.excluded_address_refs,
        stats.excluded_party_refs,
    );

    AccountGraph {
        mode,
        accounts: records.accounts.iter().map(|a| a.id.clone()).collect(),
        hubs,
        stats,
    }
}

fn address_hub(records: &RecordSet, addr_id: &AddressId, address_match: AddressMatch) -> Option<String> {
    match address_match {
        AddressMatch::Id => Some(addr_id.clone()),
        AddressMatch::Text => {
            let text = records.addresses.get(addr_id).and_then(|a| a.normalized_text());
            if text.is_none() {
                log::debug!("Address {addr_id} has no directory text; no address edge");
            }
            text
        }
    }
}
