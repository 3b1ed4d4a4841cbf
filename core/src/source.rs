//! Read-only tabular source capability.
//!
//! The engine never sees query text. A source hands back raw rows for the
//! four record sets; `ingest` normalizes them.

use crate::{error::R360Result, ids::RawValue};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    Person,
    Organization,
}

/// Account master row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAccount {
    pub acctnbr:          RawValue,
    pub status_code:      RawValue,
    pub type_code:        RawValue,
    pub tax_person:       RawValue,
    pub tax_org:          RawValue,
}

/// Party → address use row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAddressLink {
    pub party_kind:    PartyKind,
    pub party:         RawValue,
    pub addrnbr:       RawValue,
    pub use_code:      String,
    pub maintained_at: Option<NaiveDateTime>,
}

/// Address directory row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAddress {
    pub addrnbr: RawValue,
    pub text1:   RawValue,
    pub text2:   RawValue,
    pub text3:   RawValue,
    pub city:    RawValue,
    pub state:   RawValue,
    pub zip:     RawValue,
}

/// Account role row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRole {
    pub acctnbr:   RawValue,
    pub persnbr:   RawValue,
    pub orgnbr:    RawValue,
    pub role_code: String,
}

/// The four read-only queries the engine depends on.
///
/// Implementations must be `Sync`: ingestion issues the fetches concurrently.
/// Connectivity failures should surface as `R360Error::SourceUnavailable` so
/// they are retried.
pub trait RecordSource: Sync {
    fn accounts(&self) -> R360Result<Vec<RawAccount>>;

    /// Party → address links restricted to the given use codes.
    fn primary_address_links(&self, use_codes: &[String]) -> R360Result<Vec<RawAddressLink>>;

    fn addresses(&self) -> R360Result<Vec<RawAddress>>;

    /// Role rows restricted to the given ownership role codes.
    fn ownership_roles(&self, role_codes: &[String]) -> R360Result<Vec<RawRole>>;
}

/// In-memory source. Used by tests and by callers that already hold rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub accounts:      Vec<RawAccount>,
    pub address_links: Vec<RawAddressLink>,
    pub addresses:     Vec<RawAddress>,
    pub roles:         Vec<RawRole>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account reporting under a person.
    pub fn account(&mut self, acctnbr: impl Into<RawValue>, tax_person: impl Into<RawValue>) -> &mut Self {
        self.accounts.push(RawAccount {
            acctnbr:     acctnbr.into(),
            status_code: RawValue::Text("ACT".into()),
            type_code:   RawValue::Null,
            tax_person:  tax_person.into(),
            tax_org:     RawValue::Null,
        });
        self
    }

    /// Add an account reporting under an organization.
    pub fn org_account(&mut self, acctnbr: impl Into<RawValue>, tax_org: impl Into<RawValue>) -> &mut Self {
        self.accounts.push(RawAccount {
            acctnbr:     acctnbr.into(),
            status_code: RawValue::Text("ACT".into()),
            type_code:   RawValue::Null,
            tax_person:  RawValue::Null,
            tax_org:     tax_org.into(),
        });
        self
    }

    /// Add a primary address link for a party, with an explicit maintenance time.
    pub fn primary_address(
        &mut self,
        party_kind: PartyKind,
        party: impl Into<RawValue>,
        addrnbr: impl Into<RawValue>,
        maintained_at: Option<NaiveDateTime>,
    ) -> &mut Self {
        self.address_links.push(RawAddressLink {
            party_kind,
            party: party.into(),
            addrnbr: addrnbr.into(),
            use_code: "PRI".into(),
            maintained_at,
        });
        self
    }

    /// Add an address directory entry with a street line and zip only.
    pub fn address(&mut self, addrnbr: impl Into<RawValue>, street: &str, zip: &str) -> &mut Self {
        self.addresses.push(RawAddress {
            addrnbr: addrnbr.into(),
            text1:   RawValue::Text(street.into()),
            text2:   RawValue::Null,
            text3:   RawValue::Null,
            city:    RawValue::Null,
            state:   RawValue::Null,
            zip:     RawValue::Text(zip.into()),
        });
        self
    }

    pub fn role(
        &mut self,
        acctnbr: impl Into<RawValue>,
        party_kind: PartyKind,
        party: impl Into<RawValue>,
        role_code: &str,
    ) -> &mut Self {
        let party = party.into();
        let (persnbr, orgnbr) = match party_kind {
            PartyKind::Person       => (party, RawValue::Null),
            PartyKind::Organization => (RawValue::Null, party),
        };
        self.roles.push(RawRole {
            acctnbr: acctnbr.into(),
            persnbr,
            orgnbr,
            role_code: role_code.into(),
        });
        self
    }
}

impl RecordSource for MemorySource {
    fn accounts(&self) -> R360Result<Vec<RawAccount>> {
        Ok(self.accounts.clone())
    }

    fn primary_address_links(&self, use_codes: &[String]) -> R360Result<Vec<RawAddressLink>> {
        Ok(self
            .address_links
            .iter()
            .filter(|l| use_codes.contains(&l.use_code))
            .cloned()
            .collect())
    }

    fn addresses(&self) -> R360Result<Vec<RawAddress>> {
        Ok(self.addresses.clone())
    }

    fn ownership_roles(&self, role_codes: &[String]) -> R360Result<Vec<RawRole>> {
        Ok(self
            .roles
            .iter()
            .filter(|r| role_codes.contains(&r.role_code))
            .cloned()
            .collect())
    }
}
