use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use strata_types::{Age, Timestamp, Urn};
use tracing::debug;

use crate::error::{SubstrateError, SubstrateResult};
use crate::traits::{Cell, ChildEntry, LockRow, Mutation, Row, Substrate};

/// A stored cell plus its global write sequence number (tie-break).
#[derive(Clone, Debug)]
struct StoredCell {
    value: Vec<u8>,
    timestamp: Timestamp,
    seq: u64,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<Urn, BTreeMap<String, Vec<StoredCell>>>,
    children: HashMap<Urn, BTreeMap<Urn, Timestamp>>,
    locks: HashMap<Urn, LockRow>,
    next_seq: u64,
}

impl MemoryState {
    fn apply_one(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::Set {
                urn,
                attribute,
                value,
                timestamp,
                replace,
            } => {
                self.next_seq += 1;
                let cell = StoredCell {
                    value: value.clone(),
                    timestamp: *timestamp,
                    seq: self.next_seq,
                };
                let column = self
                    .rows
                    .entry(urn.clone())
                    .or_default()
                    .entry(attribute.clone())
                    .or_default();
                if *replace {
                    column.clear();
                }
                // Keep newest first: (timestamp desc, seq desc).
                let pos = column
                    .iter()
                    .position(|c| (c.timestamp, c.seq) < (cell.timestamp, cell.seq))
                    .unwrap_or(column.len());
                column.insert(pos, cell);
            }
            Mutation::DeleteAttribute { urn, attribute } => {
                if let Some(row) = self.rows.get_mut(urn) {
                    row.remove(attribute);
                    if row.is_empty() {
                        self.rows.remove(urn);
                    }
                }
            }
            Mutation::AddChild {
                parent,
                child,
                timestamp,
            } => {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(child.clone(), *timestamp);
            }
        }
    }
}

fn filter_cells(cells: &[StoredCell], age: Age) -> Vec<Cell> {
    let matching = cells
        .iter()
        .filter(|c| age.contains(c.timestamp))
        .map(|c| Cell::new(c.value.clone(), c.timestamp));
    match age {
        Age::Newest => matching.take(1).collect(),
        Age::All | Age::Range { .. } => matching.collect(),
    }
}

/// In-memory, HashMap-based substrate.
///
/// Intended for tests and embedding. All state is held behind a single
/// `RwLock`, so every batch and every lock-row transition is atomic with
/// respect to other callers.
pub struct InMemorySubstrate {
    state: RwLock<MemoryState>,
    read_only: AtomicBool,
    row_reads: AtomicU64,
    index_reads: AtomicU64,
}

impl InMemorySubstrate {
    /// Create a new empty substrate.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            read_only: AtomicBool::new(false),
            row_reads: AtomicU64::new(0),
            index_reads: AtomicU64::new(0),
        }
    }

    /// Reject every subsequent mutation batch (fault injection).
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of rows resolved so far (round-trip accounting).
    pub fn row_reads(&self) -> u64 {
        self.row_reads.load(Ordering::SeqCst)
    }

    /// Number of child listings served so far.
    pub fn index_reads(&self) -> u64 {
        self.index_reads.load(Ordering::SeqCst)
    }

    /// Returns `true` if the row has any data.
    pub fn contains_row(&self, urn: &Urn) -> bool {
        self.state.read().expect("lock poisoned").rows.contains_key(urn)
    }

    /// Sorted list of every URN that has row data.
    pub fn subjects(&self) -> Vec<Urn> {
        let state = self.state.read().expect("lock poisoned");
        let mut urns: Vec<Urn> = state.rows.keys().cloned().collect();
        urns.sort();
        urns
    }

    /// Total number of stored cells across all rows.
    pub fn cell_count(&self) -> usize {
        let state = self.state.read().expect("lock poisoned");
        state
            .rows
            .values()
            .flat_map(|row| row.values())
            .map(Vec::len)
            .sum()
    }

    /// Remove all rows, child index entries, and lock rows.
    pub fn clear(&self) {
        let mut state = self.state.write().expect("lock poisoned");
        *state = MemoryState::default();
    }
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl Substrate for InMemorySubstrate {
    fn get(&self, urn: &Urn, attribute: &str, age: Age) -> SubstrateResult<Vec<Cell>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state
            .rows
            .get(urn)
            .and_then(|row| row.get(attribute))
            .map(|cells| filter_cells(cells, age))
            .unwrap_or_default())
    }

    fn resolve_row(&self, urn: &Urn, age: Age) -> SubstrateResult<Row> {
        self.row_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().expect("lock poisoned");
        let mut out = Row::new();
        if let Some(row) = state.rows.get(urn) {
            for (attribute, cells) in row {
                let filtered = filter_cells(cells, age);
                if !filtered.is_empty() {
                    out.insert(attribute.clone(), filtered);
                }
            }
        }
        Ok(out)
    }

    fn apply(&self, mutations: &[Mutation]) -> SubstrateResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(SubstrateError::ReadOnly {
                pending: mutations.len(),
            });
        }
        let mut state = self.state.write().expect("lock poisoned");
        for mutation in mutations {
            state.apply_one(mutation);
        }
        debug!(count = mutations.len(), "substrate batch applied");
        Ok(())
    }

    fn delete_all_versions(&self, urn: &Urn) -> SubstrateResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(SubstrateError::ReadOnly { pending: 1 });
        }
        let mut state = self.state.write().expect("lock poisoned");
        state.rows.remove(urn);
        state.children.remove(urn);
        Ok(())
    }

    fn list_child_index(&self, urn: &Urn) -> SubstrateResult<Vec<ChildEntry>> {
        self.index_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().expect("lock poisoned");
        Ok(state
            .children
            .get(urn)
            .map(|children| {
                children
                    .iter()
                    .map(|(child, ts)| ChildEntry {
                        urn: child.clone(),
                        timestamp: *ts,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove_child_index_entry(&self, parent: &Urn, child: &Urn) -> SubstrateResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if let Some(children) = state.children.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                state.children.remove(parent);
            }
        }
        Ok(())
    }

    fn acquire_lock_row(
        &self,
        urn: &Urn,
        identity: &str,
        lease: Duration,
        now: Timestamp,
    ) -> SubstrateResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        if let Some(existing) = state.locks.get(urn) {
            if existing.identity != identity && !existing.is_expired(now) {
                return Ok(false);
            }
        }
        state.locks.insert(
            urn.clone(),
            LockRow {
                identity: identity.to_string(),
                acquired_at: now,
                lease,
            },
        );
        Ok(true)
    }

    fn release_lock_row(&self, urn: &Urn, identity: &str) -> SubstrateResult<bool> {
        let mut state = self.state.write().expect("lock poisoned");
        match state.locks.get(urn) {
            Some(row) if row.identity == identity => {
                state.locks.remove(urn);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn read_lock_row(&self, urn: &Urn) -> SubstrateResult<Option<LockRow>> {
        let state = self.state.read().expect("lock poisoned");
        Ok(state.locks.get(urn).cloned())
    }
}

impl std::fmt::Debug for InMemorySubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("lock poisoned");
        f.debug_struct("InMemorySubstrate")
            .field("row_count", &state.rows.len())
            .field("lock_count", &state.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(s: &str) -> Urn {
        Urn::parse(s).unwrap()
    }

    fn ts(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    fn values(cells: &[Cell]) -> Vec<&[u8]> {
        cells.iter().map(|c| c.value.as_slice()).collect()
    }

    // -----------------------------------------------------------------------
    // Cells and versions
    // -----------------------------------------------------------------------

    #[test]
    fn set_and_get_newest() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        db.set(&u, "col", b"one".to_vec(), ts(1), false).unwrap();
        db.set(&u, "col", b"two".to_vec(), ts(2), false).unwrap();

        let cells = db.get(&u, "col", Age::Newest).unwrap();
        assert_eq!(values(&cells), vec![b"two".as_slice()]);
        assert_eq!(cells[0].timestamp, ts(2));
    }

    #[test]
    fn all_versions_are_newest_first() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        db.set(&u, "col", b"two".to_vec(), ts(2), false).unwrap();
        db.set(&u, "col", b"one".to_vec(), ts(1), false).unwrap();
        db.set(&u, "col", b"three".to_vec(), ts(3), false).unwrap();

        let cells = db.get(&u, "col", Age::All).unwrap();
        assert_eq!(
            values(&cells),
            vec![b"three".as_slice(), b"two".as_slice(), b"one".as_slice()]
        );
    }

    #[test]
    fn equal_timestamps_last_write_first() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        db.set(&u, "col", b"first".to_vec(), ts(5), false).unwrap();
        db.set(&u, "col", b"second".to_vec(), ts(5), false).unwrap();

        let cells = db.get(&u, "col", Age::All).unwrap();
        assert_eq!(values(&cells), vec![b"second".as_slice(), b"first".as_slice()]);
        assert_eq!(values(&db.get(&u, "col", Age::Newest).unwrap()), vec![b"second".as_slice()]);
    }

    #[test]
    fn replace_drops_other_versions() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        db.set(&u, "col", b"one".to_vec(), ts(1), false).unwrap();
        db.set(&u, "col", b"two".to_vec(), ts(2), true).unwrap();

        assert_eq!(db.get(&u, "col", Age::All).unwrap().len(), 1);
    }

    #[test]
    fn range_filters_versions() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        for i in 1..=5 {
            db.set(&u, "col", vec![i as u8], ts(i), false).unwrap();
        }
        let age = Age::Range {
            start: ts(2),
            end: ts(4),
        };
        let cells = db.get(&u, "col", age).unwrap();
        assert_eq!(values(&cells), vec![[4u8].as_slice(), [3u8].as_slice(), [2u8].as_slice()]);
    }

    #[test]
    fn resolve_row_returns_every_column() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        db.set(&u, "x", b"1".to_vec(), ts(1), false).unwrap();
        db.set(&u, "y", b"2".to_vec(), ts(1), false).unwrap();

        let row = db.resolve_row(&u, Age::Newest).unwrap();
        assert_eq!(row.len(), 2);
        assert!(db.resolve_row(&urn("/missing"), Age::Newest).unwrap().is_empty());
    }

    #[test]
    fn multi_resolve_omits_missing_rows() {
        let db = InMemorySubstrate::new();
        db.set(&urn("/x"), "col", b"1".to_vec(), ts(1), false).unwrap();

        let rows = db
            .multi_resolve_rows(&[urn("/x"), urn("/y")], Age::Newest)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, urn("/x"));
        assert_eq!(db.row_reads(), 2);
    }

    #[test]
    fn delete_attribute_and_row() {
        let db = InMemorySubstrate::new();
        let u = urn("/a");
        db.set(&u, "x", b"1".to_vec(), ts(1), false).unwrap();
        db.set(&u, "y", b"2".to_vec(), ts(1), false).unwrap();

        db.delete_attribute(&u, "x").unwrap();
        assert!(db.get(&u, "x", Age::All).unwrap().is_empty());
        assert!(db.contains_row(&u));

        db.delete_all_versions(&u).unwrap();
        assert!(!db.contains_row(&u));
        assert_eq!(db.cell_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    #[test]
    fn apply_batch_is_visible_together() {
        let db = InMemorySubstrate::new();
        db.apply(&[
            Mutation::Set {
                urn: urn("/a"),
                attribute: "col".into(),
                value: b"1".to_vec(),
                timestamp: ts(1),
                replace: false,
            },
            Mutation::AddChild {
                parent: Urn::root(),
                child: urn("/a"),
                timestamp: ts(1),
            },
        ])
        .unwrap();

        assert_eq!(db.subjects(), vec![urn("/a")]);
        assert_eq!(db.list_child_index(&Urn::root()).unwrap().len(), 1);
    }

    #[test]
    fn read_only_rejects_batches() {
        let db = InMemorySubstrate::new();
        db.set_read_only(true);
        let err = db.set(&urn("/a"), "col", b"1".to_vec(), ts(1), false).unwrap_err();
        assert!(matches!(err, SubstrateError::ReadOnly { pending: 1 }));
        assert!(!db.contains_row(&urn("/a")));
    }

    // -----------------------------------------------------------------------
    // Child index
    // -----------------------------------------------------------------------

    #[test]
    fn child_index_refreshes_timestamp() {
        let db = InMemorySubstrate::new();
        let parent = urn("/p");
        db.update_child_index(&parent, &urn("/p/c"), ts(1)).unwrap();
        db.update_child_index(&parent, &urn("/p/c"), ts(9)).unwrap();

        let children = db.list_child_index(&parent).unwrap();
        assert_eq!(
            children,
            vec![ChildEntry {
                urn: urn("/p/c"),
                timestamp: ts(9)
            }]
        );
    }

    #[test]
    fn child_index_entry_removal() {
        let db = InMemorySubstrate::new();
        let parent = urn("/p");
        db.update_child_index(&parent, &urn("/p/a"), ts(1)).unwrap();
        db.update_child_index(&parent, &urn("/p/b"), ts(1)).unwrap();
        db.remove_child_index_entry(&parent, &urn("/p/a")).unwrap();

        let children = db.list_child_index(&parent).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].urn, urn("/p/b"));
    }

    // -----------------------------------------------------------------------
    // Lock rows
    // -----------------------------------------------------------------------

    #[test]
    fn lock_row_blocks_other_identities_until_expiry() {
        let db = InMemorySubstrate::new();
        let u = urn("/locked");
        let lease = Duration::from_secs(100);

        assert!(db.acquire_lock_row(&u, "w1", lease, ts(100)).unwrap());
        assert!(!db.acquire_lock_row(&u, "w2", lease, ts(150)).unwrap());
        assert!(!db.acquire_lock_row(&u, "w2", lease, ts(200)).unwrap());
        assert!(db.acquire_lock_row(&u, "w2", lease, ts(201)).unwrap());

        let row = db.read_lock_row(&u).unwrap().unwrap();
        assert_eq!(row.identity, "w2");
        assert_eq!(row.acquired_at, ts(201));
    }

    #[test]
    fn lock_row_renewal_by_holder() {
        let db = InMemorySubstrate::new();
        let u = urn("/locked");
        assert!(db.acquire_lock_row(&u, "w1", Duration::from_secs(10), ts(1)).unwrap());
        assert!(db.acquire_lock_row(&u, "w1", Duration::from_secs(50), ts(5)).unwrap());
        assert_eq!(db.read_lock_row(&u).unwrap().unwrap().expires_at(), ts(55));
    }

    #[test]
    fn release_only_by_holder() {
        let db = InMemorySubstrate::new();
        let u = urn("/locked");
        db.acquire_lock_row(&u, "w1", Duration::from_secs(10), ts(1)).unwrap();
        assert!(!db.release_lock_row(&u, "w2").unwrap());
        assert!(db.release_lock_row(&u, "w1").unwrap());
        assert!(db.read_lock_row(&u).unwrap().is_none());
        assert!(!db.release_lock_row(&u, "w1").unwrap());
    }

    #[test]
    fn debug_format() {
        let db = InMemorySubstrate::new();
        let debug = format!("{db:?}");
        assert!(debug.contains("InMemorySubstrate"));
        assert!(debug.contains("row_count"));
    }
}
