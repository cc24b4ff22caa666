//! Random-access byte streams over object bodies.
//!
//! Two strategies implement [`Stream`]:
//!
//! - [`MemoryStream`] -- the whole body in one attribute cell
//! - [`ImageStream`] -- the body split into fixed-size chunk child objects
//!
//! [`AnyStream`] dispatches on the object's type, and [`MultiStream`] reads
//! many streams of either strategy in batches.

mod image;
mod memory;
mod multi;

use std::io::SeekFrom;

use strata_types::{Age, Urn};

use crate::error::{StoreError, StoreResult};
use crate::factory::Factory;
use crate::object::{Mode, Object};
use crate::schema::ObjectKind;

pub use image::ImageStream;
pub use memory::MemoryStream;
pub use multi::{MultiStream, StreamChunk};

/// Uniform random-access contract of stream objects.
pub trait Stream {
    fn urn(&self) -> &Urn;

    /// Logical size in bytes.
    fn size(&self) -> u64;

    /// Current position.
    fn tell(&self) -> u64;

    /// Move the position. Seeking past the end is allowed; the gap reads as
    /// zeros once written past.
    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64>;

    /// Read up to `length` bytes from the current position.
    fn read(&mut self, length: usize) -> StoreResult<Vec<u8>>;

    /// Write at the current position, overwriting or extending the body.
    fn write(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Persist the body and its size.
    fn flush(&mut self) -> StoreResult<()>;

    /// Flush and close the underlying object.
    fn close(&mut self) -> StoreResult<()>;

    /// Ceiling of [`Stream::read_to_end`].
    fn max_unbound_read(&self) -> u64;

    /// Read everything from the current position.
    fn read_to_end(&mut self) -> StoreResult<Vec<u8>> {
        let requested = self.size().saturating_sub(self.tell());
        let limit = self.max_unbound_read();
        if requested > limit {
            return Err(StoreError::OversizedRead { requested, limit });
        }
        self.read(to_usize(requested)?)
    }
}

/// A stream of either strategy.
#[derive(Debug)]
pub enum AnyStream {
    Memory(MemoryStream),
    Image(ImageStream),
}

impl AnyStream {
    /// Wrap an open object according to its type.
    pub fn from_object(object: Object) -> StoreResult<Self> {
        let kind = object.schema().kind();
        match kind {
            ObjectKind::MemoryStream => Ok(Self::Memory(MemoryStream::new(object)?)),
            ObjectKind::Image => Ok(Self::Image(ImageStream::new(object)?)),
            _ => Err(StoreError::InvalidOperation(format!(
                "{} is a {kind:?} object, not a stream",
                object.urn()
            ))),
        }
    }

    /// Open an existing stream.
    pub fn open(factory: &Factory, urn: &Urn, mode: Mode, age: Age) -> StoreResult<Self> {
        Self::from_object(factory.open(urn, None, mode, age)?)
    }

    /// Start a new, empty stream of `type_name`, replacing any previous
    /// body on flush.
    pub fn create(factory: &Factory, urn: &Urn, type_name: &str) -> StoreResult<Self> {
        Self::from_object(factory.create(urn, type_name, Mode::Write)?)
    }

    fn inner(&self) -> &dyn Stream {
        match self {
            Self::Memory(s) => s as &dyn Stream,
            Self::Image(s) => s as &dyn Stream,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Stream {
        match self {
            Self::Memory(s) => s as &mut dyn Stream,
            Self::Image(s) => s as &mut dyn Stream,
        }
    }
}

impl Stream for AnyStream {
    fn urn(&self) -> &Urn {
        self.inner().urn()
    }

    fn size(&self) -> u64 {
        self.inner().size()
    }

    fn tell(&self) -> u64 {
        self.inner().tell()
    }

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64> {
        self.inner_mut().seek(pos)
    }

    fn read(&mut self, length: usize) -> StoreResult<Vec<u8>> {
        self.inner_mut().read(length)
    }

    fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        self.inner_mut().write(data)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.inner_mut().flush()
    }

    fn close(&mut self) -> StoreResult<()> {
        self.inner_mut().close()
    }

    fn max_unbound_read(&self) -> u64 {
        self.inner().max_unbound_read()
    }
}

/// Absolute position for `pos`, rejecting positions before the start.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> StoreResult<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
    };
    target.ok_or_else(|| StoreError::InvalidOperation(format!("invalid seek to {pos:?}")))
}

pub(crate) fn to_usize(value: u64) -> StoreResult<usize> {
    usize::try_from(value)
        .map_err(|_| StoreError::InvalidOperation(format!("{value} exceeds addressable memory")))
}
