//! Shared primitive types used across the key engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical account identifier (see `ids::canonical_id`).
pub type AccountId = String;

/// Party identifier carrying its `P`/`O` prefix.
pub type PartyId = String;

/// Canonical address identifier.
pub type AddressId = String;

/// Published relationship key. Decimal string of the mode's key sequence.
pub type KeyId = String;

/// Identifier of one engine run.
pub type RunId = String;

/// Timestamp format used for `as_of` columns.
pub const AS_OF_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Grouping mode. Each mode has its own graph, key sequence and tables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Portfolio, // address OR ownership
    Address,   // household view
    Ownership, // business relationship view
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Portfolio, Mode::Address, Mode::Ownership];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Portfolio => "portfolio",
            Mode::Address   => "address",
            Mode::Ownership => "ownership",
        }
    }

    pub fn uses_address(&self) -> bool {
        matches!(self, Mode::Portfolio | Mode::Address)
    }

    pub fn uses_ownership(&self) -> bool {
        matches!(self, Mode::Portfolio | Mode::Ownership)
    }

    pub fn current_table(&self) -> &'static str {
        match self {
            Mode::Portfolio => "portfolio_current",
            Mode::Address   => "address_current",
            Mode::Ownership => "ownership_current",
        }
    }

    pub fn historical_table(&self) -> &'static str {
        match self {
            Mode::Portfolio => "portfolio_historical",
            Mode::Address   => "address_historical",
            Mode::Ownership => "ownership_historical",
        }
    }

    /// Column name `attach_key` adds to a dataset.
    pub fn key_column(&self) -> String {
        format!("{}_key", self.as_str())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "portfolio" => Ok(Mode::Portfolio),
            "address"   => Ok(Mode::Address),
            "ownership" => Ok(Mode::Ownership),
            other       => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// One row of a `current` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyAssignment {
    pub account_id: AccountId,
    pub key_id:     KeyId,
}
