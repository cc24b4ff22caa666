//! Open objects: synced attributes loaded from the substrate plus pending
//! attributes set during the current session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use strata_substrate::Mutation;
use strata_types::{Age, TimedValue, Timestamp, Urn, Value};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::factory::Factory;
use crate::lock::LockHandle;
use crate::pool::MutationPool;
use crate::schema::{attributes, Attribute, Retention, Schema};

/// How an object was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Resolved, immutable view of an object as loaded from the substrate.
///
/// This is what the object cache holds; it never references the factory.
#[derive(Clone, Debug)]
pub(crate) struct ObjectState {
    pub(crate) urn: Urn,
    pub(crate) symlink_urn: Option<Urn>,
    pub(crate) schema: Arc<Schema>,
    /// Every known type recorded at the URN, newest first.
    pub(crate) observed: Vec<Arc<Schema>>,
    /// Stored values per attribute, newest first.
    pub(crate) synced: BTreeMap<String, Vec<TimedValue>>,
}

impl ObjectState {
    pub(crate) fn empty(urn: Urn, schema: Arc<Schema>) -> Self {
        Self {
            urn,
            symlink_urn: None,
            observed: vec![Arc::clone(&schema)],
            schema,
            synced: BTreeMap::new(),
        }
    }

    pub(crate) fn urn(&self) -> &Urn {
        &self.urn
    }

    pub(crate) fn type_name(&self) -> &str {
        self.schema.name()
    }
}

/// Factory, lock and pool an object writes through.
pub(crate) struct Session {
    pub(crate) factory: Factory,
    pub(crate) lock: Option<LockHandle>,
    pub(crate) pool: Option<MutationPool>,
}

impl Session {
    pub(crate) fn plain(factory: Factory) -> Self {
        Self {
            factory,
            lock: None,
            pool: None,
        }
    }
}

/// One attribute write planned by a flush.
struct PlannedWrite {
    attribute: String,
    values: Vec<TimedValue>,
    replace: bool,
}

/// An open object.
///
/// Reads see pending values first, then synced values. Nothing is durable
/// until [`Object::flush`] or [`Object::close`].
pub struct Object {
    state: ObjectState,
    mode: Mode,
    age: Age,
    strict: bool,
    pending: Vec<(String, TimedValue)>,
    deleted: BTreeSet<String>,
    new_version: bool,
    from_create: bool,
    closed: bool,
    session: Session,
}

impl Object {
    pub(crate) fn opened(state: ObjectState, mode: Mode, age: Age, strict: bool, session: Session) -> Self {
        Self {
            state,
            mode,
            age,
            strict,
            pending: Vec::new(),
            deleted: BTreeSet::new(),
            new_version: false,
            from_create: false,
            closed: false,
            session,
        }
    }

    pub(crate) fn created(state: ObjectState, mode: Mode, session: Session) -> Self {
        let mut object = Self::opened(state, mode, Age::Newest, true, session);
        object.new_version = true;
        object.from_create = true;
        object
    }

    /// The object's own URN, after symlink resolution.
    pub fn urn(&self) -> &Urn {
        &self.state.urn
    }

    /// URN of the symlink this object was opened through, if any.
    pub fn symlink_urn(&self) -> Option<&Urn> {
        self.state.symlink_urn.as_ref()
    }

    /// Registered type name, e.g. `Image`.
    pub fn type_name(&self) -> &str {
        self.state.type_name()
    }

    /// Schema of the object's type.
    pub fn schema(&self) -> &Schema {
        &self.state.schema
    }

    /// Access mode the object was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Version selector the attributes were loaded with.
    pub fn age(&self) -> Age {
        self.age
    }

    /// Returns `true` once [`Object::close`] succeeded.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns `true` if the object was opened or created under a lock.
    pub fn is_locked(&self) -> bool {
        self.session.lock.is_some()
    }

    /// Returns `true` if a flush would write anything.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty() || !self.deleted.is_empty() || self.new_version
    }

    pub(crate) fn factory(&self) -> &Factory {
        &self.session.factory
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Newest value of `key`, falling back to the declared default.
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.get_timed(key)?.map(|tv| tv.value).or_else(|| self.default_for(key)))
    }

    /// Newest value of `key` or `default` if neither a value nor a declared
    /// default exists.
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> StoreResult<Value> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Newest value of `key` with its write timestamp, without defaults.
    pub fn get_timed(&self, key: &str) -> StoreResult<Option<TimedValue>> {
        Ok(self.values_for(key)?.into_iter().next())
    }

    /// Every value of `key` visible to this object, newest first. Equal
    /// timestamps keep write order, last write first.
    pub fn values_for(&self, key: &str) -> StoreResult<Vec<TimedValue>> {
        self.ensure_readable(key)?;
        let mut values: Vec<TimedValue> = self
            .pending
            .iter()
            .rev()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect();
        if let Some(synced) = self.state.synced.get(key) {
            values.extend(synced.iter().cloned());
        }
        values.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(values)
    }

    pub fn is_set(&self, key: &str) -> StoreResult<bool> {
        self.ensure_readable(key)?;
        Ok(self.pending.iter().any(|(k, _)| k == key)
            || self.state.synced.get(key).is_some_and(|v| !v.is_empty()))
    }

    pub fn labels(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .get(attributes::LABELS)?
            .and_then(|v| v.as_list().map(<[String]>::to_vec))
            .unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Replace the pending values of `key` with `value`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        let value = value.into();
        let attribute = self.writable_attribute(key, &value)?;
        let now = self.session.factory.now();
        self.pending.retain(|(k, _)| k != key);
        self.push_pending(&attribute, value, now);
        Ok(())
    }

    /// Append another pending version of `key`.
    pub fn add_attribute(&mut self, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        let now = self.session.factory.now();
        self.add_attribute_at(key, value, now)
    }

    /// Append a pending version of `key` with an explicit timestamp.
    pub fn add_attribute_at(
        &mut self,
        key: &str,
        value: impl Into<Value>,
        timestamp: Timestamp,
    ) -> StoreResult<()> {
        let value = value.into();
        let attribute = self.writable_attribute(key, &value)?;
        self.push_pending(&attribute, value, timestamp);
        Ok(())
    }

    /// Drop pending values of `key` and erase its stored versions on flush.
    pub fn delete_attribute(&mut self, key: &str) -> StoreResult<()> {
        self.ensure_writable()?;
        self.lookup_attribute(key).ok_or_else(|| self.unknown(key))?;
        self.pending.retain(|(k, _)| k != key);
        self.state.synced.remove(key);
        self.deleted.insert(key.to_string());
        Ok(())
    }

    /// Copy every version of `other_key` on `other` into `key`, keeping the
    /// original timestamps.
    pub fn copy_from(&mut self, key: &str, other: &Object, other_key: &str) -> StoreResult<()> {
        let values = other.values_for(other_key)?;
        for tv in values.into_iter().rev() {
            self.add_attribute_at(key, tv.value, tv.timestamp)?;
        }
        Ok(())
    }

    pub fn add_labels(&mut self, labels: &[&str]) -> StoreResult<()> {
        let mut current = self.labels()?;
        for label in labels {
            if !current.iter().any(|l| l == label) {
                current.push((*label).to_string());
            }
        }
        self.set(attributes::LABELS, Value::List(current))
    }

    pub fn remove_label(&mut self, label: &str) -> StoreResult<()> {
        let mut current = self.labels()?;
        current.retain(|l| l != label);
        self.set(attributes::LABELS, Value::List(current))
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Remaining lease of the lock this object was opened with.
    pub fn check_lease(&self) -> StoreResult<Duration> {
        self.lock_handle()?.check_lease()
    }

    pub fn update_lease(&self, lease: Duration) -> StoreResult<()> {
        self.lock_handle()?.update_lease(lease)
    }

    fn lock_handle(&self) -> StoreResult<&LockHandle> {
        self.session
            .lock
            .as_ref()
            .ok_or_else(|| StoreError::lock(self.urn(), "object is not locked"))
    }

    // -----------------------------------------------------------------------
    // Durability
    // -----------------------------------------------------------------------

    /// Write pending attributes.
    ///
    /// Unversioned attributes, and every attribute of a keep-newest type,
    /// write only their last pending value and drop older stored versions.
    /// A flush of a new version records the type again and indexes the URN
    /// under its ancestors.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.ensure_lease()?;
        if !self.is_dirty() {
            return Ok(());
        }

        let factory = self.session.factory.clone();
        let now = factory.now();
        let urn = self.state.urn.clone();
        let writes = self.plan_writes(now)?;

        let mut mutations: Vec<Mutation> = self
            .deleted
            .iter()
            .map(|attribute| Mutation::DeleteAttribute {
                urn: urn.clone(),
                attribute: attribute.clone(),
            })
            .collect();
        for write in &writes {
            for (i, tv) in write.values.iter().enumerate() {
                mutations.push(Mutation::Set {
                    urn: urn.clone(),
                    attribute: write.attribute.clone(),
                    value: factory.codec().encode(&tv.value)?,
                    timestamp: tv.timestamp,
                    replace: write.replace && i == 0,
                });
            }
        }

        let indexed = if self.new_version {
            let (index_mutations, indexed) = factory.plan_child_index(&urn, now)?;
            mutations.extend(index_mutations);
            indexed
        } else {
            Vec::new()
        };

        let count = mutations.len();
        match &self.session.pool {
            Some(pool) => pool.stage(mutations),
            None => factory.substrate().apply(&mutations)?,
        }
        factory.mark_indexed(&indexed, now);
        factory.invalidate(&urn);

        self.merge_synced(writes);
        self.pending.clear();
        self.deleted.clear();
        self.new_version = false;
        debug!(urn = %urn, mutations = count, pooled = self.session.pool.is_some(), "object flushed");
        Ok(())
    }

    /// Flush, then release the lock if one is held. The object is unusable
    /// afterwards.
    pub fn close(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        let flushed = if self.mode.can_write() { self.flush() } else { Ok(()) };
        self.closed = true;
        let released = match self.session.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        };
        flushed.and(released)
    }

    /// Fails unless the object is open and, when it was opened under a
    /// lock, the lease is still live.
    pub(crate) fn ensure_lease(&self) -> StoreResult<()> {
        self.ensure_open()?;
        match &self.session.lock {
            Some(lock) => lock.ensure_live(),
            None => Ok(()),
        }
    }

    fn plan_writes(&self, now: Timestamp) -> StoreResult<Vec<PlannedWrite>> {
        let keep_newest = self.state.schema.retention() == Retention::KeepNewest;
        let mut grouped: Vec<(String, Vec<TimedValue>)> = Vec::new();
        for (key, tv) in &self.pending {
            match grouped.iter_mut().find(|(k, _)| k == key) {
                Some((_, values)) => values.push(tv.clone()),
                None => grouped.push((key.clone(), vec![tv.clone()])),
            }
        }

        let mut writes = Vec::with_capacity(grouped.len() + 2);
        for (key, mut values) in grouped {
            let attribute = self.lookup_attribute(&key).ok_or_else(|| self.unknown(&key))?;
            if !attribute.is_versioned() || keep_newest {
                writes.push(PlannedWrite {
                    attribute: key,
                    values: values.pop().into_iter().collect(),
                    replace: true,
                });
            } else {
                writes.push(PlannedWrite {
                    attribute: key,
                    values,
                    replace: false,
                });
            }
        }
        if self.new_version {
            writes.push(PlannedWrite {
                attribute: attributes::TYPE.to_string(),
                values: vec![TimedValue::new(Value::from(self.type_name()), now)],
                replace: keep_newest,
            });
        }
        writes.push(PlannedWrite {
            attribute: attributes::LAST.to_string(),
            values: vec![TimedValue::new(Value::Timestamp(now), now)],
            replace: true,
        });
        Ok(writes)
    }

    fn merge_synced(&mut self, writes: Vec<PlannedWrite>) {
        for write in writes {
            let column = self.state.synced.entry(write.attribute).or_default();
            if write.replace {
                column.clear();
            }
            for tv in write.values {
                column.insert(0, tv);
            }
            column.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            if self.age == Age::Newest {
                column.truncate(1);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Attribute resolution
    // -----------------------------------------------------------------------

    /// Declaration of `key`: the resolved type only when a type was
    /// requested, otherwise any type ever recorded at the URN.
    fn lookup_attribute(&self, key: &str) -> Option<&Attribute> {
        if let Some(attribute) = self.state.schema.attribute(key) {
            return Some(attribute);
        }
        if self.strict {
            return None;
        }
        self.state.observed.iter().find_map(|s| s.attribute(key))
    }

    fn default_for(&self, key: &str) -> Option<Value> {
        self.lookup_attribute(key).and_then(|a| a.default().cloned())
    }

    fn unknown(&self, key: &str) -> StoreError {
        StoreError::UnknownAttribute {
            type_name: self.type_name().to_string(),
            attribute: key.to_string(),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::InvalidOperation(format!(
                "object {} is closed",
                self.state.urn
            )));
        }
        Ok(())
    }

    fn ensure_readable(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        if self.strict && !self.state.schema.declares(key) {
            return Err(self.unknown(key));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        self.ensure_open()?;
        if !self.mode.can_write() {
            return Err(StoreError::InvalidOperation(format!(
                "object {} was opened read-only",
                self.state.urn
            )));
        }
        Ok(())
    }

    fn writable_attribute(&self, key: &str, value: &Value) -> StoreResult<Attribute> {
        self.ensure_writable()?;
        let attribute = self.lookup_attribute(key).ok_or_else(|| self.unknown(key))?;
        if attribute.kind() != value.kind() {
            return Err(StoreError::InvalidOperation(format!(
                "attribute {key} holds {} values, got {}",
                attribute.kind(),
                value.kind()
            )));
        }
        if attribute.is_lock_protected() && !self.from_create && self.session.lock.is_none() {
            return Err(StoreError::lock(
                &self.state.urn,
                format!("attribute {key} is lock protected"),
            ));
        }
        Ok(attribute.clone())
    }

    fn push_pending(&mut self, attribute: &Attribute, value: Value, timestamp: Timestamp) {
        if attribute.is_versioned() {
            self.new_version = true;
        }
        self.pending
            .push((attribute.key().to_string(), TimedValue::new(value, timestamp)));
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if !self.closed && (!self.pending.is_empty() || !self.deleted.is_empty()) {
            warn!(urn = %self.state.urn, pending = self.pending.len(), "object dropped with unflushed attributes");
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("urn", &self.state.urn)
            .field("type", &self.type_name())
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockOptions;
    use crate::schema::types;
    use crate::test_support::*;
    use proptest::prelude::*;
    use strata_substrate::Substrate;

    fn create(h: &Harness, path: &str, type_name: &str) -> Object {
        h.factory.create(&urn(path), type_name, Mode::Write).unwrap()
    }

    fn open(h: &Harness, path: &str, mode: Mode, age: Age) -> Object {
        h.factory.open(&urn(path), Some(TEST_OBJECT), mode, age).unwrap()
    }

    fn stored_cells(h: &Harness, path: &str, attribute: &str) -> usize {
        h.substrate.get(&urn(path), attribute, Age::All).unwrap().len()
    }

    // -----------------------------------------------------------------------
    // Buffering
    // -----------------------------------------------------------------------

    #[test]
    fn pending_values_are_visible_before_flush() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.set(STORED, "pending").unwrap();
        assert_eq!(object.get(STORED).unwrap(), Some(Value::from("pending")));
        assert!(object.is_dirty());
        assert!(!h.substrate.contains_row(&urn("/o")));

        object.close().unwrap();
        assert!(h.substrate.contains_row(&urn("/o")));
        assert!(object.is_closed());
    }

    #[test]
    fn flush_records_type_and_last_modified() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.set(STORED, "x").unwrap();
        object.flush().unwrap();
        assert!(!object.is_dirty());

        let reopened = open(&h, "/o", Mode::Read, Age::Newest);
        assert_eq!(reopened.type_name(), TEST_OBJECT);
        assert_eq!(
            reopened.get(attributes::LAST).unwrap(),
            Some(Value::Timestamp(h.clock_now()))
        );
    }

    #[test]
    fn same_timestamp_last_write_wins() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.set(STORED, "a").unwrap();
        object.close().unwrap();

        let mut object = open(&h, "/o", Mode::ReadWrite, Age::Newest);
        object.set(STORED, "b").unwrap();
        object.close().unwrap();

        let reopened = open(&h, "/o", Mode::Read, Age::Newest);
        assert_eq!(reopened.get(STORED).unwrap(), Some(Value::from("b")));
    }

    #[test]
    fn add_attribute_keeps_every_pending_version() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.add_attribute(STORED, "a").unwrap();
        object.add_attribute(STORED, "b").unwrap();
        assert_eq!(object.values_for(STORED).unwrap().len(), 2);
        assert_eq!(object.get(STORED).unwrap(), Some(Value::from("b")));

        object.set(STORED, "c").unwrap();
        assert_eq!(object.values_for(STORED).unwrap().len(), 1);
    }

    #[test]
    fn history_accumulates_across_versions() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.set(STORED, "v1").unwrap();
        object.close().unwrap();
        for value in ["v2", "v3"] {
            h.clock.advance(Duration::from_secs(1));
            let mut object = open(&h, "/o", Mode::ReadWrite, Age::Newest);
            object.set(STORED, value).unwrap();
            object.close().unwrap();
        }

        let all = open(&h, "/o", Mode::Read, Age::All);
        let values: Vec<Value> = all
            .values_for(STORED)
            .unwrap()
            .into_iter()
            .map(|tv| tv.value)
            .collect();
        assert_eq!(values, vec![Value::from("v3"), Value::from("v2"), Value::from("v1")]);

        let newest = open(&h, "/o", Mode::Read, Age::Newest);
        assert_eq!(newest.values_for(STORED).unwrap().len(), 1);
    }

    #[test]
    fn keep_newest_type_leaves_one_version() {
        let h = harness();
        let mut object = create(&h, "/n", TEST_NEWEST);
        object.set(STORED, "a").unwrap();
        object.close().unwrap();
        h.clock.advance(Duration::from_secs(1));

        let mut object = h
            .factory
            .open(&urn("/n"), Some(TEST_NEWEST), Mode::ReadWrite, Age::Newest)
            .unwrap();
        object.add_attribute(STORED, "b").unwrap();
        object.add_attribute(STORED, "c").unwrap();
        object.close().unwrap();

        assert_eq!(stored_cells(&h, "/n", STORED), 1);
        assert_eq!(stored_cells(&h, "/n", attributes::TYPE), 1);
        let reopened = h
            .factory
            .open(&urn("/n"), None, Mode::Read, Age::All)
            .unwrap();
        assert_eq!(reopened.get(STORED).unwrap(), Some(Value::from("c")));
    }

    #[test]
    fn only_versioned_writes_record_a_new_type_version() {
        let h = harness();
        create(&h, "/o", TEST_OBJECT).close().unwrap();
        assert_eq!(stored_cells(&h, "/o", attributes::TYPE), 1);

        h.clock.advance(Duration::from_secs(1));
        let mut object = open(&h, "/o", Mode::ReadWrite, Age::Newest);
        object.set(CLOCK, 7i64).unwrap();
        object.close().unwrap();
        assert_eq!(stored_cells(&h, "/o", attributes::TYPE), 1);
        assert_eq!(stored_cells(&h, "/o", CLOCK), 1);

        h.clock.advance(Duration::from_secs(1));
        let mut object = open(&h, "/o", Mode::ReadWrite, Age::Newest);
        object.set(STORED, "x").unwrap();
        object.close().unwrap();
        assert_eq!(stored_cells(&h, "/o", attributes::TYPE), 2);
    }

    #[test]
    fn unversioned_attribute_is_replaced() {
        let h = harness();
        for n in 1..=3i64 {
            let mut object = create(&h, "/o", TEST_OBJECT);
            object.set(CLOCK, n).unwrap();
            object.close().unwrap();
            h.clock.advance(Duration::from_secs(1));
        }
        assert_eq!(stored_cells(&h, "/o", CLOCK), 1);
        let all = open(&h, "/o", Mode::Read, Age::All);
        assert_eq!(all.get(CLOCK).unwrap(), Some(Value::Integer(3)));
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn undeclared_attribute_depends_on_requested_type() {
        let h = harness();
        create(&h, "/o", TEST_OBJECT).close().unwrap();

        let strict = open(&h, "/o", Mode::Read, Age::Newest);
        assert!(strict.get(HOSTNAME).unwrap_err().is_unknown_attribute());

        let loose = h.factory.open(&urn("/o"), None, Mode::Read, Age::Newest).unwrap();
        assert_eq!(loose.get(HOSTNAME).unwrap(), None);
    }

    #[test]
    fn setting_an_undeclared_attribute_fails() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        assert!(object.set(HOSTNAME, "host").unwrap_err().is_unknown_attribute());
        assert!(object.delete_attribute(HOSTNAME).unwrap_err().is_unknown_attribute());
    }

    #[test]
    fn value_kind_must_match_declaration() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        assert!(object.set(STORED, 5i64).unwrap_err().is_invalid_operation());
        assert!(object.set(CLOCK, "five").unwrap_err().is_invalid_operation());
    }

    #[test]
    fn read_only_objects_reject_writes() {
        let h = harness();
        create(&h, "/o", TEST_OBJECT).close().unwrap();
        let mut object = open(&h, "/o", Mode::Read, Age::Newest);
        assert!(object.set(STORED, "x").unwrap_err().is_invalid_operation());
        assert!(object.add_labels(&["x"]).unwrap_err().is_invalid_operation());
        assert!(object.delete_attribute(STORED).unwrap_err().is_invalid_operation());
    }

    #[test]
    fn closed_objects_reject_everything() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.close().unwrap();
        assert!(object.get(STORED).unwrap_err().is_invalid_operation());
        assert!(object.set(STORED, "x").unwrap_err().is_invalid_operation());
        assert!(object.flush().unwrap_err().is_invalid_operation());
        assert!(object.close().unwrap_err().is_invalid_operation());
    }

    #[test]
    fn create_in_read_only_mode_fails() {
        let h = harness();
        let err = h
            .factory
            .create(&urn("/o"), TEST_OBJECT, Mode::Read)
            .unwrap_err();
        assert!(err.is_invalid_operation());
    }

    // -----------------------------------------------------------------------
    // Attribute helpers
    // -----------------------------------------------------------------------

    #[test]
    fn labels_are_deduplicated_and_removable() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        assert!(object.labels().unwrap().is_empty());
        object.add_labels(&["a", "b"]).unwrap();
        object.add_labels(&["b", "c"]).unwrap();
        assert_eq!(object.labels().unwrap(), vec!["a", "b", "c"]);
        object.remove_label("b").unwrap();
        object.close().unwrap();

        let reopened = open(&h, "/o", Mode::Read, Age::Newest);
        assert_eq!(reopened.labels().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn declared_defaults_fill_missing_values() {
        let h = harness();
        let object = create(&h, "/s", types::MEMORY_STREAM);
        assert_eq!(object.get(attributes::SIZE).unwrap(), Some(Value::Integer(0)));
        assert!(!object.is_set(attributes::SIZE).unwrap());
        assert_eq!(object.get_timed(attributes::SIZE).unwrap(), None);
        assert_eq!(
            object.get_or(attributes::CONTENT, Vec::<u8>::new()).unwrap(),
            Value::Bytes(Vec::new())
        );
    }

    #[test]
    fn copy_preserves_timestamps() {
        let h = harness();
        let mut source = create(&h, "/src", TEST_OBJECT);
        source.add_attribute_at(STORED, "old", Timestamp::from_secs(10)).unwrap();
        source.add_attribute_at(STORED, "new", Timestamp::from_secs(20)).unwrap();

        let mut target = create(&h, "/dst", TEST_OBJECT);
        target.copy_from(STORED, &source, STORED).unwrap();
        let copied = target.values_for(STORED).unwrap();
        assert_eq!(copied, source.values_for(STORED).unwrap());
        assert_eq!(copied[0].timestamp, Timestamp::from_secs(20));
    }

    #[test]
    fn delete_attribute_erases_history() {
        let h = harness();
        let mut object = create(&h, "/o", TEST_OBJECT);
        object.add_attribute(STORED, "a").unwrap();
        object.close().unwrap();
        h.clock.advance(Duration::from_secs(1));

        let mut object = open(&h, "/o", Mode::ReadWrite, Age::Newest);
        object.set(STORED, "b").unwrap();
        object.delete_attribute(STORED).unwrap();
        assert!(!object.is_set(STORED).unwrap());
        object.close().unwrap();

        assert_eq!(stored_cells(&h, "/o", STORED), 0);
        let reopened = open(&h, "/o", Mode::Read, Age::All);
        assert_eq!(reopened.get(STORED).unwrap(), None);
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    #[test]
    fn lock_protected_attribute_needs_create_or_lock() {
        let h = harness();
        let mut fresh = create(&h, "/o", TEST_OBJECT);
        fresh.set(PROTECTED, "on create").unwrap();
        fresh.close().unwrap();

        let mut unlocked = open(&h, "/o", Mode::ReadWrite, Age::Newest);
        assert!(unlocked.set(PROTECTED, "x").unwrap_err().is_lock_error());

        let mut locked = h
            .factory
            .open_with_lock(&urn("/o"), Some(TEST_OBJECT), &LockOptions::default())
            .unwrap();
        assert!(locked.is_locked());
        locked.set(PROTECTED, "under lock").unwrap();
        locked.close().unwrap();
        assert!(!h.factory.lock_manager().is_held_locally(&urn("/o")));

        let reopened = open(&h, "/o", Mode::Read, Age::Newest);
        assert_eq!(reopened.get(PROTECTED).unwrap(), Some(Value::from("under lock")));
    }

    #[test]
    fn expired_lease_fails_flush_and_close() {
        let h = harness();
        create(&h, "/o", TEST_OBJECT).close().unwrap();
        let options = LockOptions::default().with_lease(Duration::from_secs(10));
        let mut object = h
            .factory
            .open_with_lock(&urn("/o"), Some(TEST_OBJECT), &options)
            .unwrap();
        object.set(STORED, "late").unwrap();
        h.clock.advance(Duration::from_secs(11));

        assert!(object.flush().unwrap_err().is_lock_error());
        assert!(object.close().unwrap_err().is_lock_error());
        assert_eq!(stored_cells(&h, "/o", STORED), 0);
    }

    #[test]
    fn lease_can_be_checked_and_extended() {
        let h = harness();
        create(&h, "/o", TEST_OBJECT).close().unwrap();
        let options = LockOptions::default().with_lease(Duration::from_secs(100));
        let mut object = h
            .factory
            .open_with_lock(&urn("/o"), Some(TEST_OBJECT), &options)
            .unwrap();

        h.clock.advance(Duration::from_secs(40));
        assert_eq!(object.check_lease().unwrap(), Duration::from_secs(60));
        object.update_lease(Duration::from_secs(100)).unwrap();
        assert_eq!(object.check_lease().unwrap(), Duration::from_secs(100));

        h.clock.advance(Duration::from_secs(90));
        object.set(STORED, "in time").unwrap();
        object.close().unwrap();
    }

    #[test]
    fn lease_operations_need_a_lock() {
        let h = harness();
        let object = create(&h, "/o", TEST_OBJECT);
        assert!(!object.is_locked());
        assert!(object.check_lease().unwrap_err().is_lock_error());
        assert!(object
            .update_lease(Duration::from_secs(5))
            .unwrap_err()
            .is_lock_error());
    }

    #[test]
    fn second_lock_on_same_urn_fails() {
        let h = harness();
        create(&h, "/o", TEST_OBJECT).close().unwrap();
        let _held = h
            .factory
            .open_with_lock(&urn("/o"), None, &LockOptions::default())
            .unwrap();
        let err = h
            .factory
            .open_with_lock(&urn("/o"), None, &LockOptions::default())
            .unwrap_err();
        assert!(err.is_lock_error());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn versions_read_back_newest_first(stamps in proptest::collection::vec(1u64..50, 1..12)) {
            let h = harness();
            let mut object = create(&h, "/o", TEST_OBJECT);
            for (i, secs) in stamps.iter().enumerate() {
                object
                    .add_attribute_at(STORED, i.to_string(), Timestamp::from_secs(*secs))
                    .unwrap();
            }
            object.close().unwrap();

            let all = open(&h, "/o", Mode::Read, Age::All);
            let values = all.values_for(STORED).unwrap();
            prop_assert_eq!(values.len(), stamps.len());
            prop_assert!(values.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

            let newest = stamps.iter().max().copied().unwrap_or_default();
            let winner = stamps.iter().rposition(|s| *s == newest).unwrap_or_default();
            prop_assert_eq!(all.get(STORED).unwrap(), Some(Value::from(winner.to_string())));
        }
    }
}
