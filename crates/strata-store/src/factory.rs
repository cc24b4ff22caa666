//! The object store façade.
//!
//! A [`Factory`] owns the process-wide state of one store: the object
//! cache, the child index coalescing cache and the lock manager. Clones are
//! cheap and share that state. It is created once at process start;
//! [`Factory::flush_caches`] exists for test isolation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use strata_substrate::{Mutation, Row, Substrate};
use strata_types::{Age, BincodeCodec, Clock, TimedValue, Timestamp, Urn, Value, ValueCodec};
use tracing::{debug, info};

use crate::cache::{CacheKey, IntermediateCache, ObjectCache};
use crate::config::StoreConfig;
use crate::deletion::DeletionPool;
use crate::error::{StoreError, StoreResult};
use crate::lock::{LockManager, LockOptions};
use crate::object::{Mode, Object, ObjectState, Session};
use crate::pool::MutationPool;
use crate::schema::{attributes, ObjectKind, SchemaRegistry};

struct FactoryInner {
    substrate: Arc<dyn Substrate>,
    registry: Arc<SchemaRegistry>,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn ValueCodec>,
    config: StoreConfig,
    cache: Arc<ObjectCache>,
    intermediate: IntermediateCache,
    locks: Arc<LockManager>,
}

/// Entry point for creating, opening, listing and deleting objects.
#[derive(Clone)]
pub struct Factory {
    inner: Arc<FactoryInner>,
}

impl Factory {
    /// Build a store over `substrate` using the bincode value codec.
    ///
    /// Fails with `Config` if `config` does not validate.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        registry: SchemaRegistry,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        Self::with_codec(substrate, registry, clock, config, Arc::new(BincodeCodec))
    }

    /// Like [`Factory::new`], encoding attribute values with `codec`.
    pub fn with_codec(
        substrate: Arc<dyn Substrate>,
        registry: SchemaRegistry,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
        codec: Arc<dyn ValueCodec>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let cache = Arc::new(ObjectCache::new(
            config.object_cache_size,
            config.object_cache_age,
        ));
        let intermediate =
            IntermediateCache::new(config.intermediate_cache_size, config.intermediate_cache_age);
        let locks = Arc::new(LockManager::new(Arc::clone(&substrate), Arc::clone(&clock)));
        debug!(types = registry.len(), "object store created");
        Ok(Self {
            inner: Arc::new(FactoryInner {
                substrate,
                registry: Arc::new(registry),
                clock,
                codec,
                config,
                cache,
                intermediate,
                locks,
            }),
        })
    }

    /// The substrate every object reads from and writes to.
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.inner.substrate
    }

    /// Registered object types.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    /// The validated configuration this store was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Snapshot cache shared by every clone of this factory.
    pub fn object_cache(&self) -> &ObjectCache {
        &self.inner.cache
    }

    /// Lock manager shared by every clone of this factory.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.inner.locks
    }

    /// Current time of the injected clock.
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub(crate) fn codec(&self) -> &dyn ValueCodec {
        self.inner.codec.as_ref()
    }

    /// Clear the object and child index caches.
    pub fn flush_caches(&self) {
        self.inner.cache.clear();
        self.inner.intermediate.clear();
    }

    /// A new, empty mutation pool writing to this store's substrate.
    pub fn mutation_pool(&self) -> MutationPool {
        MutationPool::new(Arc::clone(&self.inner.substrate), Arc::clone(&self.inner.cache))
    }

    /// A new deletion pool for one deletion-planning pass.
    pub fn deletion_pool(&self) -> DeletionPool {
        DeletionPool::new(self.clone())
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// A fresh object of `type_name` at `urn`.
    ///
    /// With a readable `mode` the existing attributes are loaded first, so
    /// the new version inherits the object's history. Nothing is written
    /// until the object is flushed.
    pub fn create(&self, urn: &Urn, type_name: &str, mode: Mode) -> StoreResult<Object> {
        self.create_with_session(urn, type_name, mode, Session::plain(self.clone()))
    }

    /// Like [`Factory::create`], staging the flush in `pool`.
    pub fn create_in_pool(
        &self,
        urn: &Urn,
        type_name: &str,
        mode: Mode,
        pool: &MutationPool,
    ) -> StoreResult<Object> {
        let session = Session {
            factory: self.clone(),
            lock: None,
            pool: Some(pool.clone()),
        };
        self.create_with_session(urn, type_name, mode, session)
    }

    /// Acquire the lock on `urn`, then create. The lock is released when
    /// the object is closed or dropped.
    pub fn create_with_lock(
        &self,
        urn: &Urn,
        type_name: &str,
        options: &LockOptions,
    ) -> StoreResult<Object> {
        self.inner.registry.get(type_name)?;
        let lock = self.inner.locks.acquire(urn, options)?;
        let session = Session {
            factory: self.clone(),
            lock: Some(lock),
            pool: None,
        };
        self.create_with_session(urn, type_name, Mode::ReadWrite, session)
    }

    fn create_with_session(
        &self,
        urn: &Urn,
        type_name: &str,
        mode: Mode,
        session: Session,
    ) -> StoreResult<Object> {
        let schema = self.inner.registry.get(type_name)?;
        if !mode.can_write() {
            return Err(StoreError::InvalidOperation(format!(
                "cannot create {urn} in read-only mode"
            )));
        }

        let existing = if mode.can_read() {
            let row = self.inner.substrate.resolve_row(urn, Age::Newest)?;
            match self.state_from_row(urn, row) {
                Ok(state) => state,
                Err(StoreError::UnknownType(name)) => {
                    debug!(urn = %urn, stored = %name, "overwriting object of unknown type");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let state = match existing {
            Some(mut state) => {
                state.observed.retain(|s| s.name() != schema.name());
                state.observed.insert(0, Arc::clone(&schema));
                state.schema = schema;
                state
            }
            None => ObjectState::empty(urn.clone(), schema),
        };
        debug!(urn = %urn, type_name, ?mode, "object created");
        Ok(Object::created(state, mode, session))
    }

    // -----------------------------------------------------------------------
    // Open
    // -----------------------------------------------------------------------

    /// Open the object at `urn`.
    ///
    /// Fails with `NotFound` if no type was ever recorded at `urn`. With
    /// `type_name`, a different stored type is a `TypeMismatch` and reads of
    /// undeclared attributes fail; without it, the stored type is used and
    /// undeclared reads return `None`. A symlink is resolved to its target.
    pub fn open(
        &self,
        urn: &Urn,
        type_name: Option<&str>,
        mode: Mode,
        age: Age,
    ) -> StoreResult<Object> {
        if let Some(name) = type_name {
            self.inner.registry.get(name)?;
        }
        let key = CacheKey {
            urn: urn.clone(),
            mode,
            type_name: type_name.map(str::to_string),
        };
        let now = self.now();
        let cacheable = age == Age::Newest;

        let state = match cacheable.then(|| self.inner.cache.get(&key, now)).flatten() {
            Some(state) => state,
            None => {
                let state = self
                    .resolve_state(urn, age)?
                    .ok_or_else(|| StoreError::NotFound(urn.clone()))?;
                self.check_type(&state, type_name)?;
                if cacheable {
                    self.inner.cache.put(key, state.clone(), now);
                }
                state
            }
        };
        Ok(Object::opened(
            state,
            mode,
            age,
            type_name.is_some(),
            Session::plain(self.clone()),
        ))
    }

    /// Acquire the lock on `urn`, then open it for reading and writing.
    ///
    /// Never served from the object cache. Lock-protected attributes may be
    /// set while the lease is live.
    pub fn open_with_lock(
        &self,
        urn: &Urn,
        type_name: Option<&str>,
        options: &LockOptions,
    ) -> StoreResult<Object> {
        if let Some(name) = type_name {
            self.inner.registry.get(name)?;
        }
        let lock = self.inner.locks.acquire(urn, options)?;
        let state = self
            .resolve_state(urn, Age::Newest)?
            .ok_or_else(|| StoreError::NotFound(urn.clone()))?;
        self.check_type(&state, type_name)?;
        let session = Session {
            factory: self.clone(),
            lock: Some(lock),
            pool: None,
        };
        Ok(Object::opened(
            state,
            Mode::ReadWrite,
            Age::Newest,
            type_name.is_some(),
            session,
        ))
    }

    /// Open many objects with batched substrate reads.
    ///
    /// Missing objects and objects failing the type filter are omitted.
    /// Results follow the input order; duplicates are opened once.
    pub fn multi_open(
        &self,
        urns: &[Urn],
        type_name: Option<&str>,
        mode: Mode,
    ) -> StoreResult<Vec<Object>> {
        if let Some(name) = type_name {
            self.inner.registry.get(name)?;
        }
        let now = self.now();
        let key = |urn: &Urn| CacheKey {
            urn: urn.clone(),
            mode,
            type_name: type_name.map(str::to_string),
        };

        let mut seen = HashSet::new();
        let unique: Vec<&Urn> = urns.iter().filter(|u| seen.insert(*u)).collect();
        let mut resolved: HashMap<Urn, ObjectState> = HashMap::new();
        let mut uncached = Vec::new();
        for urn in &unique {
            match self.inner.cache.get(&key(urn), now) {
                Some(state) => {
                    resolved.insert((*urn).clone(), state);
                }
                None => uncached.push((*urn).clone()),
            }
        }

        for (urn, state) in self.multi_resolve_states(&uncached, Age::Newest)? {
            if self.check_type(&state, type_name).is_ok() {
                self.inner.cache.put(key(&urn), state.clone(), now);
                resolved.insert(urn, state);
            }
        }

        let objects: Vec<Object> = unique
            .into_iter()
            .filter_map(|urn| resolved.remove(urn))
            .map(|state| {
                Object::opened(
                    state,
                    mode,
                    Age::Newest,
                    type_name.is_some(),
                    Session::plain(self.clone()),
                )
            })
            .collect();
        debug!(requested = urns.len(), fetched = uncached.len(), opened = objects.len(), "multi open");
        Ok(objects)
    }

    /// Returns `true` if an object exists at `urn` and its latest recorded
    /// type is `type_name`. Never fails.
    pub fn exists_with_type(&self, urn: &Urn, type_name: &str) -> bool {
        let cells = match self.inner.substrate.get(urn, attributes::TYPE, Age::Newest) {
            Ok(cells) => cells,
            Err(e) => {
                debug!(urn = %urn, error = %e, "type lookup failed");
                return false;
            }
        };
        cells
            .first()
            .and_then(|cell| self.codec().decode(&cell.value).ok())
            .is_some_and(|value| value.as_str() == Some(type_name))
    }

    /// One read-only object per recorded type version, oldest first.
    ///
    /// Each object reflects the attributes declared on that version's type
    /// as of the version's timestamp. With `diffs_only`, versions after the
    /// first carry only the attributes whose newest value changed.
    pub fn open_discrete_versions(&self, urn: &Urn, diffs_only: bool) -> StoreResult<Vec<Object>> {
        let row = self.inner.substrate.resolve_row(urn, Age::All)?;
        let synced = self.decode_row(row)?;
        let type_values = synced
            .get(attributes::TYPE)
            .filter(|values| !values.is_empty())
            .ok_or_else(|| StoreError::NotFound(urn.clone()))?;

        let mut versions: Vec<(Timestamp, String)> = type_values
            .iter()
            .filter_map(|tv| tv.value.as_str().map(|name| (tv.timestamp, name.to_string())))
            .collect();
        versions.dedup_by_key(|(ts, _)| *ts);
        versions.reverse();

        let mut previous: Option<BTreeMap<String, TimedValue>> = None;
        let mut objects = Vec::with_capacity(versions.len());
        for (version, type_name) in versions {
            let schema = self.inner.registry.get(&type_name)?;
            let mut view: BTreeMap<String, Vec<TimedValue>> = synced
                .iter()
                .filter(|(key, _)| schema.declares(key))
                .map(|(key, values)| {
                    let visible = values.iter().filter(|tv| tv.timestamp <= version).cloned();
                    (key.clone(), visible.collect::<Vec<_>>())
                })
                .filter(|(_, values)| !values.is_empty())
                .collect();

            let newest: BTreeMap<String, TimedValue> = view
                .iter()
                .map(|(key, values)| (key.clone(), values[0].clone()))
                .collect();
            if diffs_only {
                if let Some(previous) = &previous {
                    view.retain(|key, values| {
                        key == attributes::TYPE || previous.get(key) != Some(&values[0])
                    });
                }
            }
            previous = Some(newest);

            let state = ObjectState {
                urn: urn.clone(),
                symlink_urn: None,
                observed: vec![Arc::clone(&schema)],
                schema,
                synced: view,
            };
            objects.push(Object::opened(
                state,
                Mode::Read,
                Age::up_to(version),
                false,
                Session::plain(self.clone()),
            ));
        }
        Ok(objects)
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// Children recorded in the child index of `urn`, sorted.
    pub fn list_children(&self, urn: &Urn) -> StoreResult<Vec<Urn>> {
        Ok(self
            .inner
            .substrate
            .list_child_index(urn)?
            .into_iter()
            .map(|entry| entry.urn)
            .collect())
    }

    /// Children of many URNs in one round-trip. URNs without children are
    /// omitted.
    pub fn multi_list_children(&self, urns: &[Urn]) -> StoreResult<BTreeMap<Urn, Vec<Urn>>> {
        Ok(self
            .inner
            .substrate
            .multi_list_child_index(urns)?
            .into_iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(urn, entries)| (urn, entries.into_iter().map(|e| e.urn).collect()))
            .collect())
    }

    /// Children of `urns` and, transitively, of every discovered
    /// descendant.
    pub fn recursive_multi_list_children(
        &self,
        urns: &[Urn],
    ) -> StoreResult<BTreeMap<Urn, Vec<Urn>>> {
        recursive_listing(urns, |batch| self.multi_list_children(batch))
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Erase `urn` and every descendant, with their full version history.
    pub fn delete(&self, urn: &Urn) -> StoreResult<()> {
        self.multi_delete(std::slice::from_ref(urn))
    }

    /// Erase every URN in `urns` and all their descendants.
    ///
    /// The root URN is rejected before any substrate call.
    pub fn multi_delete(&self, urns: &[Urn]) -> StoreResult<()> {
        if urns.iter().any(Urn::is_root) {
            return Err(StoreError::InvalidOperation(
                "the root URN cannot be deleted".into(),
            ));
        }

        let mut pool = self.deletion_pool();
        pool.multi_mark_for_deletion(urns)?;
        let roots = pool.root_urns_for_deletion();
        let marked: Vec<Urn> = pool.urns_for_deletion().iter().cloned().collect();

        for root in &roots {
            if let Some(parent) = root.parent() {
                self.inner.substrate.remove_child_index_entry(&parent, root)?;
            }
        }
        self.inner.substrate.delete_rows(&marked)?;

        for urn in &marked {
            self.inner.intermediate.forget(urn);
        }
        for root in &roots {
            self.inner.cache.invalidate_tree(root);
        }
        info!(roots = roots.len(), objects = marked.len(), "objects deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals shared with objects, pools and streams
    // -----------------------------------------------------------------------

    pub(crate) fn invalidate(&self, urn: &Urn) {
        self.inner.cache.invalidate(urn);
    }

    /// Child index writes for a new version of `urn`.
    ///
    /// Walks from `urn` towards the root and stops at the first URN already
    /// indexed within the coalescing window. Every indexed parent except the
    /// root also gets its last-modified time refreshed.
    pub(crate) fn plan_child_index(
        &self,
        urn: &Urn,
        now: Timestamp,
    ) -> StoreResult<(Vec<Mutation>, Vec<Urn>)> {
        let mut mutations = Vec::new();
        let mut indexed = Vec::new();
        let mut child = urn.clone();
        while let Some(parent) = child.parent() {
            if self.inner.intermediate.contains(&child, now) {
                break;
            }
            mutations.push(Mutation::AddChild {
                parent: parent.clone(),
                child: child.clone(),
                timestamp: now,
            });
            if !parent.is_root() {
                mutations.push(Mutation::Set {
                    urn: parent.clone(),
                    attribute: attributes::LAST.to_string(),
                    value: self.codec().encode(&Value::Timestamp(now))?,
                    timestamp: now,
                    replace: true,
                });
            }
            indexed.push(child);
            child = parent;
        }
        if indexed.is_empty() {
            debug!(urn = %urn, "child index update coalesced");
        } else {
            debug!(urn = %urn, levels = indexed.len(), "child index updated");
        }
        Ok((mutations, indexed))
    }

    pub(crate) fn mark_indexed(&self, urns: &[Urn], now: Timestamp) {
        self.inner.intermediate.insert_all(urns, now);
    }

    /// Resolve `urn` at `age`, following one symlink hop.
    pub(crate) fn resolve_state(&self, urn: &Urn, age: Age) -> StoreResult<Option<ObjectState>> {
        let row = self.inner.substrate.resolve_row(urn, age)?;
        match self.state_from_row(urn, row)? {
            Some(state) => match symlink_target(&state) {
                Some(target) => {
                    let row = self.inner.substrate.resolve_row(&target, age)?;
                    Ok(self.state_from_row(&target, row)?.map(|mut resolved| {
                        resolved.symlink_urn = Some(urn.clone());
                        resolved
                    }))
                }
                None => Ok(Some(state)),
            },
            None => Ok(None),
        }
    }

    /// Batched [`Factory::resolve_state`], keyed by requested URN. Objects
    /// that are missing or of an unregistered type are omitted.
    pub(crate) fn multi_resolve_states(
        &self,
        urns: &[Urn],
        age: Age,
    ) -> StoreResult<HashMap<Urn, ObjectState>> {
        let mut states = HashMap::new();
        if urns.is_empty() {
            return Ok(states);
        }
        let mut links: Vec<(Urn, Urn)> = Vec::new();
        for (urn, state) in self.states_from_rows(self.inner.substrate.multi_resolve_rows(urns, age)?)? {
            match symlink_target(&state) {
                Some(target) => links.push((urn, target)),
                None => {
                    states.insert(urn, state);
                }
            }
        }

        if !links.is_empty() {
            let targets: Vec<Urn> = links.iter().map(|(_, t)| t.clone()).collect();
            let resolved: HashMap<Urn, ObjectState> = self
                .states_from_rows(self.inner.substrate.multi_resolve_rows(&targets, age)?)?
                .into_iter()
                .collect();
            for (link, target) in links {
                if let Some(state) = resolved.get(&target) {
                    let mut state = state.clone();
                    state.symlink_urn = Some(link.clone());
                    states.insert(link, state);
                }
            }
        }
        Ok(states)
    }

    fn states_from_rows(&self, rows: Vec<(Urn, Row)>) -> StoreResult<Vec<(Urn, ObjectState)>> {
        let mut out = Vec::with_capacity(rows.len());
        for (urn, row) in rows {
            match self.state_from_row(&urn, row) {
                Ok(Some(state)) => out.push((urn, state)),
                Ok(None) => {}
                Err(StoreError::UnknownType(name)) => {
                    debug!(urn = %urn, stored = %name, "skipping object of unknown type");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub(crate) fn check_type(&self, state: &ObjectState, requested: Option<&str>) -> StoreResult<()> {
        match requested {
            Some(expected) if state.type_name() != expected => Err(StoreError::TypeMismatch {
                urn: state.urn.clone(),
                expected: expected.to_string(),
                found: state.type_name().to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn decode_row(&self, row: Row) -> StoreResult<BTreeMap<String, Vec<TimedValue>>> {
        let mut synced = BTreeMap::new();
        for (attribute, cells) in row {
            let values = cells
                .into_iter()
                .map(|cell| Ok(TimedValue::new(self.codec().decode(&cell.value)?, cell.timestamp)))
                .collect::<StoreResult<Vec<_>>>()?;
            synced.insert(attribute, values);
        }
        Ok(synced)
    }

    /// Build the object view of a row. `None` if no type is recorded.
    fn state_from_row(&self, urn: &Urn, row: Row) -> StoreResult<Option<ObjectState>> {
        let synced = self.decode_row(row)?;
        let Some(types) = synced.get(attributes::TYPE).filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let latest = types[0]
            .value
            .as_str()
            .ok_or_else(|| StoreError::UnknownType(types[0].value.to_string()))?;
        let schema = self.inner.registry.get(latest)?;

        let mut observed = vec![Arc::clone(&schema)];
        for tv in &types[1..] {
            let Some(name) = tv.value.as_str() else { continue };
            if observed.iter().any(|s| s.name() == name) {
                continue;
            }
            if let Ok(older) = self.inner.registry.get(name) {
                observed.push(older);
            }
        }

        Ok(Some(ObjectState {
            urn: urn.clone(),
            symlink_urn: None,
            schema,
            observed,
            synced,
        }))
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("types", &self.inner.registry.len())
            .field("cache", &self.inner.cache)
            .finish()
    }
}

fn symlink_target(state: &ObjectState) -> Option<Urn> {
    if state.schema.kind() != ObjectKind::Symlink {
        return None;
    }
    state
        .synced
        .get(attributes::SYMLINK_TARGET)
        .and_then(|values| values.first())
        .and_then(|tv| tv.value.as_urn().cloned())
}

/// Breadth-first expansion of `list` until no new descendants appear.
pub(crate) fn recursive_listing(
    urns: &[Urn],
    mut list: impl FnMut(&[Urn]) -> StoreResult<BTreeMap<Urn, Vec<Urn>>>,
) -> StoreResult<BTreeMap<Urn, Vec<Urn>>> {
    let mut result = BTreeMap::new();
    let mut checked: HashSet<Urn> = HashSet::new();
    let mut next: Vec<Urn> = urns.to_vec();
    while !next.is_empty() {
        let batch: Vec<Urn> = next.drain(..).filter(|u| checked.insert(u.clone())).collect();
        if batch.is_empty() {
            break;
        }
        for (parent, children) in list(&batch)? {
            next.extend(children.iter().cloned());
            result.insert(parent, children);
        }
    }
    Ok(result)
}
