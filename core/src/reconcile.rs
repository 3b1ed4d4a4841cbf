//! Key reconciliation: carries key ids across runs.
//!
//! RULES (fixed, documented, never reordered):
//!   1. No prior snapshot (cold start or fresh mode) → every component mints.
//!   2. Prior keys are granted oldest-first (numerically smallest first).
//!   3. A key goes to the largest component holding it that has not already
//!      been granted an older key; size ties go to the component with the
//!      lowest account id.
//!        - one holder, one key       → reuse (unchanged or grown component)
//!        - several keys, one holder  → merge: the oldest key survives
//!        - one key, several holders  → split: the largest fragment keeps it
//!   4. A key with no eligible holder is retired and never minted again.
//!   5. Components left without a key mint new ones in component order.
//!
//! Ordering keys requires canonical decimal ids. If a contested decision
//! involves a key that is not one, the run aborts with
//! `ReconciliationAmbiguity` rather than guess.

use crate::{
    error::{R360Error, R360Result},
    event::{KeyEvent, RetireReason},
    ids::{key_number, natural_cmp},
    resolver::Partition,
    types::{AccountId, KeyAssignment, KeyId, Mode},
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// The previous run's `current` table for one mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorSnapshot {
    pub assignments: BTreeMap<AccountId, KeyId>,
}

impl PriorSnapshot {
    pub fn from_rows(mode: Mode, rows: Vec<KeyAssignment>) -> R360Result<Self> {
        let mut assignments = BTreeMap::new();
        for row in rows {
            if let Some(existing) = assignments.insert(row.account_id.clone(), row.key_id.clone()) {
                return Err(R360Error::integrity(
                    mode.current_table(),
                    format!(
                        "account {} holds both key {existing} and key {}",
                        row.account_id, row.key_id
                    ),
                ));
            }
        }
        Ok(Self { assignments })
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Largest canonical decimal key, 0 when there is none.
    pub fn max_key(&self) -> u64 {
        self.assignments.values().filter_map(key_number).max().unwrap_or(0)
    }

    pub fn key_of(&self, account_id: &str) -> Option<&KeyId> {
        self.assignments.get(account_id)
    }
}

/// Monotonic per-mode key counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySequence {
    last: u64,
}

impl KeySequence {
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    pub fn mint(&mut self) -> KeyId {
        self.last += 1;
        self.last.to_string()
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub accounts:   usize,
    pub components: usize,
    pub minted:     usize,
    pub retained:   usize,
    pub merged:     usize,
    pub split:      usize,
    pub retired:    usize,
}

/// Everything one mode will commit.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPlan {
    pub mode:        Mode,
    /// Complete account → key mapping in natural account order.
    pub assignments: Vec<KeyAssignment>,
    pub events:      Vec<KeyEvent>,
    /// High-water mark after this run's mints.
    pub last_key:    u64,
    pub stats:       ReconcileStats,
}

impl KeyPlan {
    pub fn unique_keys(&self) -> usize {
        self.assignments.iter().map(|a| a.key_id.as_str()).collect::<BTreeSet<_>>().len()
    }
}

pub fn reconcile(
    partition: &Partition,
    prior: Option<&PriorSnapshot>,
    high_water: u64,
) -> R360Result<KeyPlan> {
    let mode = partition.mode;
    let comps = &partition.components;
    let mut seq = KeySequence::starting_after(high_water.max(prior.map_or(0, PriorSnapshot::max_key)));
    let mut granted: Vec<Option<KeyId>> = vec![None; comps.len()];
    let mut events = Vec::new();
    let mut stats = ReconcileStats {
        accounts:   partition.account_count(),
        components: comps.len(),
        ..ReconcileStats::default()
    };

    if let Some(prior) = prior.filter(|p| !p.is_empty()) {
        // key → components holding it; component → keys it holds
        let mut holders: BTreeMap<&KeyId, BTreeSet<usize>> = BTreeMap::new();
        let mut held: Vec<BTreeSet<&KeyId>> = vec![BTreeSet::new(); comps.len()];
        for (ci, comp) in comps.iter().enumerate() {
            for account in &comp.members {
                if let Some(key) = prior.key_of(account) {
                    holders.entry(key).or_default().insert(ci);
                    held[ci].insert(key);
                }
            }
        }

        let ambiguous: Vec<KeyId> = holders
            .iter()
            .filter(|(key, cs)| {
                let contested = cs.len() > 1 || cs.iter().any(|&ci| held[ci].len() > 1);
                contested && key_number(key).is_none()
            })
            .map(|(key, _)| (*key).clone())
            .collect();
        if !ambiguous.is_empty() {
            return Err(R360Error::ReconciliationAmbiguity {
                mode: mode.to_string(),
                keys: ambiguous,
            });
        }

        let mut order: Vec<&KeyId> = holders.keys().copied().collect();
        order.sort_by(|a, b| oldest_first(a, b));

        for key in order {
            let cs = &holders[key];
            let winner = cs
                .iter()
                .copied()
                .filter(|&ci| granted[ci].is_none())
                .max_by(|&a, &b| larger_fragment(&comps[a].members, &comps[b].members));
            match winner {
                Some(ci) => {
                    granted[ci] = Some(key.clone());
                    if cs.len() > 1 {
                        stats.split += 1;
                        events.push(KeyEvent::Split {
                            key_id:    key.clone(),
                            kept_by:   comps[ci].first().clone(),
                            fragments: cs.len(),
                        });
                    }
                }
                None => {
                    let heir = cs
                        .iter()
                        .copied()
                        .max_by(|&a, &b| larger_fragment(&comps[a].members, &comps[b].members));
                    stats.retired += 1;
                    events.push(KeyEvent::Retired {
                        key_id:    key.clone(),
                        reason:    RetireReason::Merged,
                        successor: heir.and_then(|ci| granted[ci].clone()),
                    });
                }
            }
        }

        let granted_keys: BTreeSet<&KeyId> = granted.iter().flatten().collect();
        for (ci, keys) in held.iter().enumerate() {
            let Some(winner) = &granted[ci] else { continue };
            stats.retained += 1;
            // Keys granted anywhere, the winner included, were not absorbed.
            let absorbed: Vec<KeyId> = keys
                .iter()
                .filter(|k| !granted_keys.contains(**k))
                .map(|k| (*k).clone())
                .collect();
            if !absorbed.is_empty() {
                stats.merged += 1;
                log::debug!("{mode}: key {winner} absorbs {absorbed:?}");
                events.push(KeyEvent::Merged {
                    key_id:        winner.clone(),
                    absorbed,
                    first_account: comps[ci].first().clone(),
                    accounts:      comps[ci].len(),
                });
            }
        }

        let live: BTreeSet<&KeyId> = holders.keys().copied().collect();
        let vanished: BTreeSet<&KeyId> = prior
            .assignments
            .values()
            .filter(|k| !live.contains(k))
            .collect();
        for key in vanished {
            stats.retired += 1;
            events.push(KeyEvent::Retired {
                key_id:    key.clone(),
                reason:    RetireReason::Vanished,
                successor: None,
            });
        }
    }

    for (ci, comp) in comps.iter().enumerate() {
        if granted[ci].is_none() {
            let key_id = seq.mint();
            stats.minted += 1;
            events.push(KeyEvent::Minted {
                key_id:        key_id.clone(),
                first_account: comp.first().clone(),
                accounts:      comp.len(),
            });
            granted[ci] = Some(key_id);
        }
    }

    let mut assignments: Vec<KeyAssignment> = comps
        .iter()
        .zip(&granted)
        .flat_map(|(comp, key)| {
            let key_id = key.clone().unwrap_or_default();
            comp.members.iter().map(move |m| KeyAssignment {
                account_id: m.clone(),
                key_id:     key_id.clone(),
            })
        })
        .collect();
    assignments.sort_by(|a, b| natural_cmp(&a.account_id, &b.account_id));

    log::info!(
        "{mode}: {} accounts in {} components; {} retained, {} minted, {} merged, {} split, {} retired",
        stats.accounts,
        stats.components,
        stats.retained,
        stats.minted,
        stats.merged,
        stats.split,
        stats.retired,
    );

    Ok(KeyPlan {
        mode,
        assignments,
        events,
        last_key: seq.last(),
        stats,
    })
}

/// Canonical decimal keys by value, then any others lexicographically.
fn oldest_first(a: &KeyId, b: &KeyId) -> Ordering {
    match (key_number(a), key_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None)    => Ordering::Less,
        (None, Some(_))    => Ordering::Greater,
        (None, None)       => a.cmp(b),
    }
}

/// `Greater` when `a` should keep a contested key over `b`.
fn larger_fragment(a: &[AccountId], b: &[AccountId]) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| natural_cmp(&b[0], &a[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Component;

    fn partition(groups: &[&[&str]]) -> Partition {
        Partition {
            mode: Mode::Portfolio,
            components: groups
                .iter()
                .map(|g| Component { members: g.iter().map(|s| s.to_string()).collect() })
                .collect(),
        }
    }

    fn prior(rows: &[(&str, &str)]) -> PriorSnapshot {
        PriorSnapshot::from_rows(
            Mode::Portfolio,
            rows.iter()
                .map(|(a, k)| KeyAssignment { account_id: a.to_string(), key_id: k.to_string() })
                .collect(),
        )
        .unwrap()
    }

    fn key_of<'a>(plan: &'a KeyPlan, account: &str) -> &'a str {
        &plan.assignments.iter().find(|a| a.account_id == account).unwrap().key_id
    }

    #[test]
    fn cold_start_mints_in_component_order() {
        let plan = reconcile(&partition(&[&["1", "2"], &["3"]]), None, 0).unwrap();
        assert_eq!(key_of(&plan, "1"), "1");
        assert_eq!(key_of(&plan, "2"), "1");
        assert_eq!(key_of(&plan, "3"), "2");
        assert_eq!(plan.last_key, 2);
        assert_eq!(plan.stats.minted, 2);
    }

    #[test]
    fn minting_continues_past_the_high_water_mark() {
        let plan = reconcile(&partition(&[&["1"]]), None, 41).unwrap();
        assert_eq!(key_of(&plan, "1"), "42");
    }

    #[test]
    fn merge_keeps_the_oldest_key() {
        let p = prior(&[("1", "7"), ("2", "3")]);
        let plan = reconcile(&partition(&[&["1", "2"]]), Some(&p), 7).unwrap();
        assert_eq!(key_of(&plan, "1"), "3");
        assert_eq!(key_of(&plan, "2"), "3");
        assert_eq!(plan.stats.merged, 1);
        assert!(plan.events.contains(&KeyEvent::Retired {
            key_id:    "7".into(),
            reason:    RetireReason::Merged,
            successor: Some("3".into()),
        }));
    }

    #[test]
    fn split_keeps_key_on_larger_fragment() {
        let p = prior(&[("1", "5"), ("2", "5"), ("3", "5")]);
        let plan = reconcile(&partition(&[&["1"], &["2", "3"]]), Some(&p), 5).unwrap();
        assert_eq!(key_of(&plan, "2"), "5");
        assert_eq!(key_of(&plan, "1"), "6");
        assert_eq!(plan.stats.split, 1);
    }

    #[test]
    fn split_tie_goes_to_lowest_account() {
        let p = prior(&[("10", "5"), ("20", "5")]);
        let plan = reconcile(&partition(&[&["10"], &["20"]]), Some(&p), 5).unwrap();
        assert_eq!(key_of(&plan, "10"), "5");
        assert_eq!(key_of(&plan, "20"), "6");
    }

    #[test]
    fn fragment_that_lost_a_split_can_keep_another_key() {
        // {1,2} held 5, {3,4,5} held 3. Now 1 joins {3,4,5}; 2 is alone.
        let p = prior(&[("1", "5"), ("2", "5"), ("3", "3"), ("4", "3"), ("5", "3")]);
        let plan = reconcile(&partition(&[&["1", "3", "4", "5"], &["2"]]), Some(&p), 5).unwrap();
        assert_eq!(key_of(&plan, "3"), "3");
        assert_eq!(key_of(&plan, "2"), "5");
        assert_eq!(plan.stats.minted, 0);
    }

    #[test]
    fn vanished_keys_are_retired() {
        let p = prior(&[("1", "1"), ("9", "2")]);
        let plan = reconcile(&partition(&[&["1"]]), Some(&p), 2).unwrap();
        assert!(plan.events.iter().any(|e| matches!(
            e,
            KeyEvent::Retired { key_id, reason: RetireReason::Vanished, .. } if key_id == "2"
        )));
    }

    #[test]
    fn contested_non_decimal_key_is_ambiguous() {
        let p = prior(&[("1", "legacy-a"), ("2", "4")]);
        let err = reconcile(&partition(&[&["1", "2"]]), Some(&p), 4).unwrap_err();
        assert!(matches!(err, R360Error::ReconciliationAmbiguity { .. }));
    }

    #[test]
    fn uncontested_non_decimal_key_is_reused() {
        let p = prior(&[("1", "legacy-a")]);
        let plan = reconcile(&partition(&[&["1"], &["2"]]), Some(&p), 0).unwrap();
        assert_eq!(key_of(&plan, "1"), "legacy-a");
        assert_eq!(key_of(&plan, "2"), "1");
    }

    #[test]
    fn duplicate_prior_rows_are_rejected() {
        let rows = vec![
            KeyAssignment { account_id: "1".into(), key_id: "1".into() },
            KeyAssignment { account_id: "1".into(), key_id: "2".into() },
        ];
        assert!(PriorSnapshot::from_rows(Mode::Address, rows).is_err());
    }
}
