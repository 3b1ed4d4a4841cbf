//! Component resolver: connected components of an `AccountGraph`.

use crate::{
    graph::AccountGraph,
    types::{AccountId, Mode},
    union_find::DisjointSet,
};
use std::collections::BTreeMap;

/// One connected component. Members are in natural id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub members: Vec<AccountId>,
}

impl Component {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Smallest member in natural order.
    pub fn first(&self) -> &AccountId {
        &self.members[0]
    }
}

/// The canonical partition of all accounts for one mode.
///
/// Components are ordered by their smallest member, so two partitions of the
/// same account set compare equal exactly when they group accounts the same
/// way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub mode:       Mode,
    pub components: Vec<Component>,
}

impl Partition {
    pub fn account_count(&self) -> usize {
        self.components.iter().map(Component::len).sum()
    }

    /// Account → component index.
    pub fn component_of(&self) -> BTreeMap<&str, usize> {
        self.components
            .iter()
            .enumerate()
            .flat_map(|(ci, c)| c.members.iter().map(move |m| (m.as_str(), ci)))
            .collect()
    }
}

pub fn resolve(graph: &AccountGraph) -> Partition {
    let mut ds = DisjointSet::new(graph.accounts.len());
    let mut unions = 0;
    for members in graph.hubs.values() {
        unions += ds.union_all(members);
    }

    // Arena indices are already in natural order, so grouping by root in
    // index order yields sorted members and first-seen components sorted by
    // their smallest member.
    let mut slot_of_root: BTreeMap<usize, usize> = BTreeMap::new();
    let mut components: Vec<Component> = Vec::new();
    for (i, account_id) in graph.accounts.iter().enumerate() {
        let root = ds.find(i);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            components.push(Component { members: Vec::new() });
            components.len() - 1
        });
        components[slot].members.push(account_id.clone());
    }

    log::debug!(
        "{} partition: {} accounts in {} components ({unions} unions)",
        graph.mode,
        graph.accounts.len(),
        components.len(),
    );

    Partition { mode: graph.mode, components }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphStats, Hub};

    fn graph(accounts: &[&str], hubs: &[&[usize]]) -> AccountGraph {
        AccountGraph {
            mode:     Mode::Portfolio,
            accounts: accounts.iter().map(|a| a.to_string()).collect(),
            hubs:     hubs
                .iter()
                .enumerate()
                .map(|(i, m)| (Hub::Party(format!("P{i}")), m.to_vec()))
                .collect(),
            stats:    GraphStats::default(),
        }
    }

    #[test]
    fn hubs_chain_transitively() {
        let p = resolve(&graph(&["1", "2", "3", "4"], &[&[0, 2], &[2, 3]]));
        assert_eq!(p.components.len(), 2);
        assert_eq!(p.components[0].members, vec!["1", "3", "4"]);
        assert_eq!(p.components[1].members, vec!["2"]);
    }

    #[test]
    fn isolated_accounts_are_singletons() {
        let p = resolve(&graph(&["5", "6"], &[]));
        assert_eq!(p.components.len(), 2);
        assert_eq!(p.account_count(), 2);
        assert_eq!(p.component_of()["6"], 1);
    }
}
