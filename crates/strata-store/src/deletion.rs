//! Deletion planning.
//!
//! A [`DeletionPool`] computes the transitive closure of URNs to erase and
//! caches every lookup it makes, so one deletion never reads the same URN
//! twice and never observes objects created by other operations after the
//! first lookup. It lives for one deletion pass only.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use strata_types::{Age, Urn};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::factory::{recursive_listing, Factory};
use crate::object::{Mode, Object, ObjectState, Session};

pub struct DeletionPool {
    factory: Factory,
    opened: HashMap<(Urn, Mode), ObjectState>,
    children: HashMap<Urn, Vec<Urn>>,
    marked: BTreeSet<Urn>,
}

impl DeletionPool {
    pub(crate) fn new(factory: Factory) -> Self {
        Self {
            factory,
            opened: HashMap::new(),
            children: HashMap::new(),
            marked: BTreeSet::new(),
        }
    }

    /// Cached open. A stored result is reused even when a later call asks
    /// for a different type; missing objects are looked up again.
    pub fn open(&mut self, urn: &Urn, type_name: Option<&str>, mode: Mode) -> StoreResult<Object> {
        let key = (urn.clone(), mode);
        let state = match self.opened.get(&key) {
            Some(state) => state.clone(),
            None => {
                let state = self
                    .factory
                    .resolve_state(urn, Age::Newest)?
                    .ok_or_else(|| StoreError::NotFound(urn.clone()))?;
                self.opened.insert(key, state.clone());
                state
            }
        };
        self.factory.check_type(&state, type_name)?;
        Ok(self.object(state, type_name, mode))
    }

    /// Cached multi-open. Only URNs not seen before reach the substrate.
    pub fn multi_open(
        &mut self,
        urns: &[Urn],
        type_name: Option<&str>,
        mode: Mode,
    ) -> StoreResult<Vec<Object>> {
        let uncached: Vec<Urn> = urns
            .iter()
            .filter(|urn| !self.opened.contains_key(&((*urn).clone(), mode)))
            .cloned()
            .collect();
        for (urn, state) in self.factory.multi_resolve_states(&uncached, Age::Newest)? {
            self.opened.insert((urn, mode), state);
        }

        let mut objects = Vec::new();
        for urn in urns {
            let Some(state) = self.opened.get(&(urn.clone(), mode)) else {
                continue;
            };
            if self.factory.check_type(state, type_name).is_ok() {
                objects.push(self.object(state.clone(), type_name, mode));
            }
        }
        Ok(objects)
    }

    pub fn list_children(&mut self, urn: &Urn) -> StoreResult<Vec<Urn>> {
        let listing = self.multi_list_children(std::slice::from_ref(urn))?;
        Ok(listing.into_values().next().unwrap_or_default())
    }

    /// Cached child listing. Unlike the factory's, every requested URN is
    /// present in the result, with an empty list if it has no children.
    pub fn multi_list_children(&mut self, urns: &[Urn]) -> StoreResult<BTreeMap<Urn, Vec<Urn>>> {
        let uncached: Vec<Urn> = urns
            .iter()
            .filter(|urn| !self.children.contains_key(*urn))
            .cloned()
            .collect();
        if !uncached.is_empty() {
            let mut listing = self.factory.multi_list_children(&uncached)?;
            for urn in uncached {
                let children = listing.remove(&urn).unwrap_or_default();
                self.children.insert(urn, children);
            }
        }
        Ok(urns
            .iter()
            .map(|urn| {
                let children = self.children.get(urn).cloned().unwrap_or_default();
                (urn.clone(), children)
            })
            .collect())
    }

    /// Cached transitive listing; URNs without children are omitted.
    pub fn recursive_multi_list_children(
        &mut self,
        urns: &[Urn],
    ) -> StoreResult<BTreeMap<Urn, Vec<Urn>>> {
        recursive_listing(urns, |batch| {
            let mut listing = self.multi_list_children(batch)?;
            listing.retain(|_, children| !children.is_empty());
            Ok(listing)
        })
    }

    pub fn mark_for_deletion(&mut self, urn: &Urn) -> StoreResult<()> {
        self.multi_mark_for_deletion(std::slice::from_ref(urn))
    }

    /// Mark `urns` and all their descendants.
    pub fn multi_mark_for_deletion(&mut self, urns: &[Urn]) -> StoreResult<()> {
        if urns.iter().any(Urn::is_root) {
            return Err(StoreError::InvalidOperation(
                "the root URN cannot be marked for deletion".into(),
            ));
        }
        self.marked.extend(urns.iter().cloned());
        let descendants = self.recursive_multi_list_children(urns)?;
        for children in descendants.into_values() {
            self.marked.extend(children);
        }
        debug!(seeds = urns.len(), marked = self.marked.len(), "marked for deletion");
        Ok(())
    }

    /// Every marked URN.
    pub fn urns_for_deletion(&self) -> &BTreeSet<Urn> {
        &self.marked
    }

    /// The minimal covering subset of the marked URNs: a URN is dropped if
    /// one of its ancestors is marked too.
    pub fn root_urns_for_deletion(&self) -> BTreeSet<Urn> {
        self.marked
            .iter()
            .filter(|urn| !urn.ancestors().iter().any(|a| self.marked.contains(a)))
            .cloned()
            .collect()
    }

    fn object(&self, state: ObjectState, type_name: Option<&str>, mode: Mode) -> Object {
        Object::opened(
            state,
            mode,
            Age::Newest,
            type_name.is_some(),
            Session::plain(self.factory.clone()),
        )
    }
}

impl std::fmt::Debug for DeletionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionPool")
            .field("opened", &self.opened.len())
            .field("listed", &self.children.len())
            .field("marked", &self.marked.len())
            .finish()
    }
}
