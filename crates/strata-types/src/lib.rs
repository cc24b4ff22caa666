//! Foundation types for the Strata object store.
//!
//! This crate provides the addressing, temporal, and value types shared by
//! the substrate adapter and the object store. It performs no I/O.
//!
//! # Key Types
//!
//! - [`Urn`] -- Hierarchical object identifier with parent/child decomposition
//! - [`Timestamp`] -- Microseconds since the UNIX epoch, the unit of every version
//! - [`Clock`] -- Injectable time source ([`SystemClock`], [`ManualClock`])
//! - [`Age`] -- Version filter applied when reading attributes
//! - [`Value`] -- Typed attribute value, encoded through a [`ValueCodec`]
//! - [`TimedValue`] -- A value together with the timestamp it was written at

pub mod error;
pub mod timestamp;
pub mod urn;
pub mod value;

pub use error::TypeError;
pub use timestamp::{Age, Clock, ManualClock, SystemClock, Timestamp};
pub use urn::Urn;
pub use value::{BincodeCodec, TimedValue, Value, ValueCodec, ValueKind};
