//! Versioned, typed object store over the Strata substrate.
//!
//! Every piece of evidence is an object addressed by a hierarchical
//! [`Urn`](strata_types::Urn) and typed by a [`Schema`]. Attributes keep
//! their full timestamped history unless declared unversioned, and every
//! new version links the object into its parent's child index.
//!
//! # Components
//!
//! - [`Factory`] -- create, open, list and delete objects
//! - [`Object`] -- buffered attribute reads and writes with flush/close
//! - [`ObjectCache`] -- short-lived snapshots of recently opened objects
//! - [`LockManager`] -- lease-based exclusive locks on URNs
//! - [`MutationPool`] -- batches flushes into one substrate write
//! - [`DeletionPool`] -- plans recursive deletions with cached lookups
//! - [`MemoryStream`], [`ImageStream`], [`MultiStream`] -- byte streams
//!
//! # Design Rules
//!
//! 1. Nothing reaches the substrate before a flush.
//! 2. Every flush, pool flush and delete invalidates the cached snapshots
//!    of the URNs it touched.
//! 3. A lock-protected attribute is only writable on a fresh object or
//!    under a live lease.
//! 4. All time comes from the injected [`Clock`](strata_types::Clock).

pub mod cache;
pub mod config;
pub mod deletion;
pub mod error;
pub mod factory;
pub mod lock;
pub mod object;
pub mod pool;
pub mod schema;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use cache::ObjectCache;
pub use config::StoreConfig;
pub use deletion::DeletionPool;
pub use error::{StoreError, StoreResult};
pub use factory::Factory;
pub use lock::{LockHandle, LockManager, LockOptions};
pub use object::{Mode, Object};
pub use pool::MutationPool;
pub use schema::{attributes, types, Attribute, ObjectKind, Retention, Schema, SchemaRegistry};
pub use stream::{AnyStream, ImageStream, MemoryStream, MultiStream, Stream, StreamChunk};
