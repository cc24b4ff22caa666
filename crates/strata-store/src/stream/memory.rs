use std::io::SeekFrom;

use strata_types::{Urn, Value};

use crate::error::{StoreError, StoreResult};
use crate::object::Object;
use crate::schema::{attributes, ObjectKind};
use crate::stream::{resolve_seek, to_usize, Stream};

/// Stream whose whole body lives in one attribute cell.
pub struct MemoryStream {
    object: Object,
    content: Vec<u8>,
    position: u64,
    dirty: bool,
    max_read: u64,
}

impl MemoryStream {
    /// Wrap `object`, loading its body. Fails unless it is a memory stream.
    pub fn new(object: Object) -> StoreResult<Self> {
        if object.schema().kind() != ObjectKind::MemoryStream {
            return Err(StoreError::InvalidOperation(format!(
                "{} of type {} is not a memory stream",
                object.urn(),
                object.type_name()
            )));
        }
        let content = match object.get(attributes::CONTENT)? {
            Some(Value::Bytes(bytes)) => bytes,
            _ => Vec::new(),
        };
        let max_read = object.factory().config().max_unbound_read_size;
        Ok(Self {
            object,
            content,
            position: 0,
            dirty: false,
            max_read,
        })
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    /// The current body, including unflushed writes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

impl Stream for MemoryStream {
    fn urn(&self) -> &Urn {
        self.object.urn()
    }

    fn size(&self) -> u64 {
        self.content.len() as u64
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64> {
        self.position = resolve_seek(pos, self.position, self.size())?;
        Ok(self.position)
    }

    fn read(&mut self, length: usize) -> StoreResult<Vec<u8>> {
        let start = to_usize(self.position)?.min(self.content.len());
        let end = start.saturating_add(length).min(self.content.len());
        self.position = end as u64;
        Ok(self.content[start..end].to_vec())
    }

    fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        if !self.object.mode().can_write() {
            return Err(StoreError::InvalidOperation(format!(
                "stream {} was opened read-only",
                self.object.urn()
            )));
        }
        let start = to_usize(self.position)?;
        let end = start.checked_add(data.len()).ok_or_else(|| {
            StoreError::InvalidOperation(format!(
                "write of {} bytes at {} overflows stream {}",
                data.len(),
                self.position,
                self.object.urn()
            ))
        })?;
        if self.content.len() < end {
            self.content.resize(end, 0);
        }
        self.content[start..end].copy_from_slice(data);
        self.position = end as u64;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        if self.dirty {
            let size = self.content.len() as i64;
            self.object
                .set(attributes::CONTENT, Value::Bytes(self.content.clone()))?;
            self.object.set(attributes::SIZE, size)?;
            self.dirty = false;
        }
        self.object.flush()
    }

    fn close(&mut self) -> StoreResult<()> {
        self.flush()?;
        self.object.close()
    }

    fn max_unbound_read(&self) -> u64 {
        self.max_read
    }
}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("urn", self.object.urn())
            .field("size", &self.content.len())
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Mode;
    use crate::schema::types;
    use crate::stream::AnyStream;
    use crate::test_support::{harness, urn};
    use strata_types::Age;

    fn create(h: &crate::test_support::Harness, path: &str, type_name: &str) -> MemoryStream {
        let object = h.factory.create(&urn(path), type_name, Mode::Write).unwrap();
        MemoryStream::new(object).unwrap()
    }

    #[test]
    fn size_and_tell_track_writes() {
        let h = harness();
        let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
        stream.write(b"hello world").unwrap();
        assert_eq!(stream.size(), 11);
        assert_eq!(stream.tell(), 11);

        stream.seek(SeekFrom::Start(6)).unwrap();
        stream.write(b"WORLD").unwrap();
        assert_eq!(stream.size(), 11);
        assert_eq!(stream.tell(), 11);

        stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(stream.read(100).unwrap(), b"hello WORLD");
    }

    #[test]
    fn body_persists_across_opens() {
        let h = harness();
        let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
        stream.write(b"persisted").unwrap();
        stream.close().unwrap();

        let object = h.factory.open(&urn("/foo"), None, Mode::Read, Age::Newest).unwrap();
        assert_eq!(object.get(attributes::SIZE).unwrap(), Some(Value::Integer(9)));
        let mut reopened = MemoryStream::new(object).unwrap();
        assert_eq!(reopened.size(), 9);
        assert_eq!(reopened.read_to_end().unwrap(), b"persisted");
    }

    #[test]
    fn writing_past_the_end_zero_fills() {
        let h = harness();
        let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
        stream.seek(SeekFrom::Start(3)).unwrap();
        stream.write(b"x").unwrap();
        stream.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(stream.read(10).unwrap(), vec![0, 0, 0, b'x']);
    }

    #[test]
    fn read_only_stream_rejects_writes() {
        let h = harness();
        let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
        stream.write(b"abc").unwrap();
        stream.close().unwrap();

        let mut reader = AnyStream::open(&h.factory, &urn("/foo"), Mode::Read, Age::Newest).unwrap();
        assert!(reader.write(b"z").unwrap_err().is_invalid_operation());
    }

    #[test]
    fn versioned_body_keeps_history() {
        let h = harness();
        for body in [b"first".as_slice(), b"second".as_slice()] {
            let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
            stream.write(body).unwrap();
            stream.close().unwrap();
            h.clock.advance(std::time::Duration::from_secs(1));
        }

        let object = h.factory.open(&urn("/foo"), None, Mode::Read, Age::All).unwrap();
        assert_eq!(object.values_for(attributes::CONTENT).unwrap().len(), 2);
    }

    #[test]
    fn unversioned_body_keeps_only_latest() {
        let h = harness();
        for body in [b"first".as_slice(), b"second".as_slice()] {
            let mut stream = create(&h, "/foo", types::UNVERSIONED_MEMORY_STREAM);
            stream.write(body).unwrap();
            stream.close().unwrap();
            h.clock.advance(std::time::Duration::from_secs(1));
        }

        let object = h.factory.open(&urn("/foo"), None, Mode::Read, Age::All).unwrap();
        let values = object.values_for(attributes::CONTENT).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, Value::Bytes(b"second".to_vec()));
    }

    #[test]
    fn oversized_unbound_read_fails() {
        let mut config = crate::StoreConfig::default();
        config.max_unbound_read_size = 4;
        let h = crate::test_support::harness_with(config);
        let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
        stream.write(b"too long").unwrap();
        stream.seek(SeekFrom::Start(0)).unwrap();

        let err = stream.read_to_end().unwrap_err();
        assert!(matches!(err, StoreError::OversizedRead { requested: 8, limit: 4 }));
        stream.seek(SeekFrom::Start(5)).unwrap();
        assert_eq!(stream.read_to_end().unwrap(), b"ong");
    }

    #[test]
    fn non_stream_objects_are_rejected() {
        let h = harness();
        let object = h.factory.create(&urn("/foo"), types::OBJECT, Mode::Write).unwrap();
        assert!(MemoryStream::new(object).unwrap_err().is_invalid_operation());
    }

    #[test]
    fn write_past_addressable_end_is_rejected() {
        let h = harness();
        let mut stream = create(&h, "/foo", types::MEMORY_STREAM);
        stream.seek(SeekFrom::Start(u64::MAX - 1)).unwrap();
        assert!(stream.write(b"abc").unwrap_err().is_invalid_operation());
        assert_eq!(stream.size(), 0);
    }
}
