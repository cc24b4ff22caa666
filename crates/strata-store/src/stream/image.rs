use std::io::SeekFrom;
use std::num::NonZeroUsize;

use lru::LruCache;
use strata_types::{Age, Urn, Value};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::factory::Factory;
use crate::object::{Mode, Object};
use crate::schema::{attributes, types, ObjectKind};
use crate::stream::{resolve_seek, to_usize, Stream};

struct Chunk {
    data: Vec<u8>,
    dirty: bool,
}

/// Stream whose body is split into fixed-size chunk child objects.
///
/// Chunk `i` lives at `<urn>/<i as 10 zero-padded digits>`. Decoded chunks
/// are kept in an LRU window; a dirty chunk evicted from the window is
/// written out immediately. The size is stored explicitly, so sparse writes
/// and overwrites never shrink it.
pub struct ImageStream {
    object: Object,
    factory: Factory,
    chunk_type: String,
    chunk_size: u64,
    size: u64,
    position: u64,
    age: Age,
    chunks: LruCache<u64, Chunk>,
    metadata_dirty: bool,
    content_written: bool,
    max_read: u64,
}

impl ImageStream {
    /// Wrap `object`. Fails unless its type is an image.
    pub fn new(object: Object) -> StoreResult<Self> {
        if object.schema().kind() != ObjectKind::Image {
            return Err(StoreError::InvalidOperation(format!(
                "{} of type {} is not an image",
                object.urn(),
                object.type_name()
            )));
        }
        let factory = object.factory().clone();
        let config = factory.config();
        let stored_chunk_size = object
            .get(attributes::CHUNKSIZE)?
            .and_then(|v| v.as_i64())
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0);
        let size = object
            .get(attributes::SIZE)?
            .and_then(|v| v.as_i64())
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);
        let capacity = NonZeroUsize::new(config.image_chunk_cache).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            chunk_type: object
                .schema()
                .chunk_type()
                .unwrap_or(types::MEMORY_STREAM)
                .to_string(),
            chunk_size: stored_chunk_size.unwrap_or(config.image_chunk_size),
            metadata_dirty: stored_chunk_size.is_none() && object.mode().can_write(),
            max_read: config.max_unbound_read_size,
            age: object.age(),
            chunks: LruCache::new(capacity),
            content_written: false,
            position: 0,
            size,
            object,
            factory,
        })
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Bytes per chunk object.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Change the chunk size. Only allowed before any content exists.
    pub fn set_chunk_size(&mut self, chunk_size: u64) -> StoreResult<()> {
        if chunk_size == 0 {
            return Err(StoreError::InvalidOperation(
                "chunk size must be positive".into(),
            ));
        }
        if self.size > 0 {
            return Err(StoreError::InvalidOperation(format!(
                "chunk size of {} cannot change once content is written",
                self.object.urn()
            )));
        }
        self.chunk_size = chunk_size;
        self.metadata_dirty = true;
        Ok(())
    }

    /// Number of chunks covering the current size.
    pub fn chunk_count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size)
    }

    /// URN of chunk `index`.
    pub fn chunk_urn(&self, index: u64) -> Urn {
        self.object.urn().add(&format!("{index:010}"))
    }

    fn load_chunk(&self, index: u64) -> StoreResult<Vec<u8>> {
        match self
            .factory
            .open(&self.chunk_urn(index), None, Mode::Read, self.age)
        {
            Ok(chunk) => Ok(match chunk.get(attributes::CONTENT)? {
                Some(Value::Bytes(bytes)) => bytes,
                _ => Vec::new(),
            }),
            Err(e) if e.is_not_found() => {
                warn!(urn = %self.object.urn(), chunk = index, "image chunk missing");
                Err(StoreError::StreamIntegrity {
                    urn: self.object.urn().clone(),
                    missing: vec![self.chunk_urn(index)],
                })
            }
            Err(e) => Err(e),
        }
    }

    fn write_chunk(&mut self, index: u64, data: &[u8]) -> StoreResult<()> {
        self.object.ensure_lease()?;
        let urn = self.chunk_urn(index);
        let mut chunk = self.factory.create(&urn, &self.chunk_type, Mode::Write)?;
        chunk.set(attributes::CONTENT, Value::Bytes(data.to_vec()))?;
        chunk.set(attributes::SIZE, data.len() as i64)?;
        chunk.close()?;
        self.content_written = true;
        debug!(urn = %urn, bytes = data.len(), "chunk written");
        Ok(())
    }

    /// The decoded chunk, loading it into the window if needed.
    ///
    /// A dirty chunk about to be evicted is written first and stays in the
    /// window if that write fails.
    fn chunk_mut(&mut self, index: u64) -> StoreResult<&mut Chunk> {
        if !self.chunks.contains(&index) {
            // Chunks at or past the current size were never written.
            let data = if index * self.chunk_size >= self.size {
                Vec::new()
            } else {
                self.load_chunk(index)?
            };
            if self.chunks.len() >= self.chunks.cap().get() {
                let victim = self
                    .chunks
                    .peek_lru()
                    .filter(|(_, chunk)| chunk.dirty)
                    .map(|(victim, chunk)| (*victim, chunk.data.clone()));
                if let Some((victim, body)) = victim {
                    self.write_chunk(victim, &body)?;
                    if let Some(chunk) = self.chunks.peek_mut(&victim) {
                        chunk.dirty = false;
                    }
                }
            }
            self.chunks.push(index, Chunk { data, dirty: false });
        }
        self.chunks
            .get_mut(&index)
            .ok_or_else(|| StoreError::InvalidOperation(format!("chunk {index} not cached")))
    }

    /// Write `data` at the current position, which must not lie past the end.
    fn write_piece(&mut self, data: &[u8]) -> StoreResult<()> {
        let mut written = 0;
        while written < data.len() {
            let index = self.position / self.chunk_size;
            let offset = to_usize(self.position % self.chunk_size)?;
            let take = to_usize(self.chunk_size - offset as u64)?.min(data.len() - written);

            let chunk = self.chunk_mut(index)?;
            if chunk.data.len() < offset + take {
                chunk.data.resize(offset + take, 0);
            }
            chunk.data[offset..offset + take].copy_from_slice(&data[written..written + take]);
            chunk.dirty = true;

            written += take;
            self.position += take as u64;
            self.size = self.size.max(self.position);
            self.metadata_dirty = true;
        }
        Ok(())
    }
}

impl Stream for ImageStream {
    fn urn(&self) -> &Urn {
        self.object.urn()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> StoreResult<u64> {
        self.position = resolve_seek(pos, self.position, self.size)?;
        Ok(self.position)
    }

    fn read(&mut self, length: usize) -> StoreResult<Vec<u8>> {
        let end = self.size.min(self.position.saturating_add(length as u64));
        let mut out = Vec::with_capacity(end.saturating_sub(self.position) as usize);
        while self.position < end {
            let index = self.position / self.chunk_size;
            let offset = (self.position % self.chunk_size) as usize;
            let take = (self.chunk_size - offset as u64).min(end - self.position) as usize;

            let chunk = self.chunk_mut(index)?;
            let available = chunk.data.len().saturating_sub(offset).min(take);
            if available > 0 {
                out.extend_from_slice(&chunk.data[offset..offset + available]);
            }
            out.resize(out.len() + (take - available), 0);
            self.position += take as u64;
        }
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        if !self.object.mode().can_write() {
            return Err(StoreError::InvalidOperation(format!(
                "image {} was opened read-only",
                self.object.urn()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.position.checked_add(data.len() as u64).is_none() {
            return Err(StoreError::InvalidOperation(format!(
                "write of {} bytes at {} overflows image {}",
                data.len(),
                self.position,
                self.object.urn()
            )));
        }

        // Every chunk below the size must exist, so a gap left by seeking
        // past the end is written out as zeros.
        if self.position > self.size {
            let target = self.position;
            self.position = self.size;
            while self.position < target {
                let offset = self.position % self.chunk_size;
                let take = (self.chunk_size - offset).min(target - self.position);
                self.write_piece(&vec![0; to_usize(take)?])?;
            }
        }
        self.write_piece(data)
    }

    fn flush(&mut self) -> StoreResult<()> {
        self.object.ensure_lease()?;
        let dirty: Vec<(u64, Vec<u8>)> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.dirty)
            .map(|(index, chunk)| (*index, chunk.data.clone()))
            .collect();
        for (index, data) in dirty {
            self.write_chunk(index, &data)?;
            if let Some(chunk) = self.chunks.peek_mut(&index) {
                chunk.dirty = false;
            }
        }

        if self.metadata_dirty {
            self.object.set(attributes::SIZE, self.size as i64)?;
            self.object
                .set(attributes::CHUNKSIZE, self.chunk_size as i64)?;
            self.metadata_dirty = false;
        }
        if self.content_written {
            let now = self.factory.now();
            self.object
                .set(attributes::CONTENT_LAST, Value::Timestamp(now))?;
            self.content_written = false;
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

impl std::fmt::Debug for ImageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStream")
            .field("urn", self.object.urn())
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("cached_chunks", &self.chunks.len())
            .finish()
    }
}
