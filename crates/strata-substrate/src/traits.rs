use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_types::{Age, Timestamp, Urn};

use crate::error::SubstrateResult;

/// One stored version of a column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

impl Cell {
    pub fn new(value: Vec<u8>, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Every column of a row, each column's cells newest first.
pub type Row = BTreeMap<String, Vec<Cell>>;

/// A child index entry: the child URN and when it was last indexed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChildEntry {
    pub urn: Urn,
    pub timestamp: Timestamp,
}

/// Lock row contents: holder identity and lease window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    pub identity: String,
    pub acquired_at: Timestamp,
    pub lease: Duration,
}

impl LockRow {
    /// The instant after which the lease is considered abandoned.
    pub fn expires_at(&self) -> Timestamp {
        self.acquired_at.saturating_add(self.lease)
    }

    /// A lock is valid until `now > acquired_at + lease`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at()
    }
}

/// A single write in a mutation batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Write a cell. With `replace`, every other version of the column is
    /// dropped.
    Set {
        urn: Urn,
        attribute: String,
        value: Vec<u8>,
        timestamp: Timestamp,
        replace: bool,
    },
    /// Erase every version of one column.
    DeleteAttribute { urn: Urn, attribute: String },
    /// Record `child` in the child index of `parent`.
    AddChild {
        parent: Urn,
        child: Urn,
        timestamp: Timestamp,
    },
}

impl Mutation {
    /// The row this mutation touches.
    pub fn urn(&self) -> &Urn {
        match self {
            Self::Set { urn, .. } | Self::DeleteAttribute { urn, .. } => urn,
            Self::AddChild { parent, .. } => parent,
        }
    }
}

/// Versioned key-value substrate.
///
/// All implementations must satisfy these invariants:
/// - Cells come back newest first. Cells written at the same timestamp come
///   back in reverse write order (last write first).
/// - `Age::Newest` yields at most one cell per column.
/// - A batch passed to [`Substrate::apply`] is either fully applied or
///   rejected with an error; callers never observe silent partial commits.
/// - Lock-row acquisition is an atomic check-and-set.
pub trait Substrate: Send + Sync {
    /// Read one column of a row, filtered by `age`.
    fn get(&self, urn: &Urn, attribute: &str, age: Age) -> SubstrateResult<Vec<Cell>>;

    /// Read every column of a row, filtered by `age`.
    ///
    /// Returns an empty row if the URN has no data.
    fn resolve_row(&self, urn: &Urn, age: Age) -> SubstrateResult<Row>;

    /// Read many rows in one round-trip.
    ///
    /// Rows without data are omitted. Default implementation calls
    /// `resolve_row()` for each URN; backends may override for fewer
    /// round-trips.
    fn multi_resolve_rows(&self, urns: &[Urn], age: Age) -> SubstrateResult<Vec<(Urn, Row)>> {
        let mut out = Vec::with_capacity(urns.len());
        for urn in urns {
            let row = self.resolve_row(urn, age)?;
            if !row.is_empty() {
                out.push((urn.clone(), row));
            }
        }
        Ok(out)
    }

    /// Apply a batch of mutations.
    fn apply(&self, mutations: &[Mutation]) -> SubstrateResult<()>;

    /// Write one cell.
    fn set(
        &self,
        urn: &Urn,
        attribute: &str,
        value: Vec<u8>,
        timestamp: Timestamp,
        replace: bool,
    ) -> SubstrateResult<()> {
        self.apply(&[Mutation::Set {
            urn: urn.clone(),
            attribute: attribute.to_string(),
            value,
            timestamp,
            replace,
        }])
    }

    /// Erase every version of one column.
    fn delete_attribute(&self, urn: &Urn, attribute: &str) -> SubstrateResult<()> {
        self.apply(&[Mutation::DeleteAttribute {
            urn: urn.clone(),
            attribute: attribute.to_string(),
        }])
    }

    /// Erase every version of every column of a row, and its child index.
    fn delete_all_versions(&self, urn: &Urn) -> SubstrateResult<()>;

    /// Erase many rows.
    fn delete_rows(&self, urns: &[Urn]) -> SubstrateResult<()> {
        urns.iter().try_for_each(|urn| self.delete_all_versions(urn))
    }

    /// Children recorded for `urn`, sorted by URN.
    fn list_child_index(&self, urn: &Urn) -> SubstrateResult<Vec<ChildEntry>>;

    /// Child listings for many URNs in one round-trip.
    fn multi_list_child_index(&self, urns: &[Urn]) -> SubstrateResult<Vec<(Urn, Vec<ChildEntry>)>> {
        urns.iter()
            .map(|urn| Ok((urn.clone(), self.list_child_index(urn)?)))
            .collect()
    }

    /// Record `child` under `parent`, refreshing its index timestamp.
    fn update_child_index(&self, parent: &Urn, child: &Urn, timestamp: Timestamp) -> SubstrateResult<()> {
        self.apply(&[Mutation::AddChild {
            parent: parent.clone(),
            child: child.clone(),
            timestamp,
        }])
    }

    /// Drop `child` from the child index of `parent`.
    fn remove_child_index_entry(&self, parent: &Urn, child: &Urn) -> SubstrateResult<()>;

    /// Acquire (or renew) the lock row of `urn`.
    ///
    /// Succeeds if the row is absent, expired at `now`, or already held by
    /// `identity`. Returns `false` if another identity holds a live lease.
    fn acquire_lock_row(
        &self,
        urn: &Urn,
        identity: &str,
        lease: Duration,
        now: Timestamp,
    ) -> SubstrateResult<bool>;

    /// Release the lock row if `identity` holds it. Returns `true` if a row
    /// was removed.
    fn release_lock_row(&self, urn: &Urn, identity: &str) -> SubstrateResult<bool>;

    /// Current lock row of `urn`, expired or not.
    fn read_lock_row(&self, urn: &Urn) -> SubstrateResult<Option<LockRow>>;
}
