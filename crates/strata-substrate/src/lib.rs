//! Key-value substrate for the Strata object store.
//!
//! The object store persists through a flat, versioned key-value model:
//! rows keyed by [`Urn`](strata_types::Urn), columns keyed by attribute
//! name, each cell holding multiple timestamped values. Next to the rows the
//! substrate keeps a child index (parent → children) and lock rows.
//!
//! # Backends
//!
//! All backends implement the [`Substrate`] trait:
//!
//! - [`InMemorySubstrate`] -- `HashMap`-based backend for tests and embedding
//!
//! # Design Rules
//!
//! 1. Cells are returned newest first; equal timestamps resolve by write
//!    order, last write first.
//! 2. A replacing write removes every other version of that column.
//! 3. Lock-row acquisition is atomic: check-and-set happens under one guard.
//! 4. The substrate never interprets cell contents.
//! 5. All backend errors are propagated, never silently ignored.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{SubstrateError, SubstrateResult};
pub use memory::InMemorySubstrate;
pub use traits::{Cell, ChildEntry, LockRow, Mutation, Row, Substrate};
