use std::collections::{HashMap, VecDeque};

use strata_types::{Urn, Value};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::factory::Factory;
use crate::object::Mode;
use crate::schema::attributes;
use crate::stream::{AnyStream, ImageStream, Stream};

/// One piece of a multi-stream read.
///
/// Pieces of the same stream arrive in order. An `Err` result ends that
/// stream's pieces.
#[derive(Debug)]
pub struct StreamChunk<'a> {
    pub stream: &'a AnyStream,
    pub result: StoreResult<Vec<u8>>,
}

/// Iterator reading many streams with batched chunk lookups.
///
/// Single-cell streams are sliced from their loaded body. Image streams are
/// read one at a time, fetching `read_ahead` chunk objects per substrate
/// round-trip. Only flushed image content is visible.
///
/// When a window has missing chunks, the chunks before the first gap are
/// yielded, followed by one [`StoreError::StreamIntegrity`] listing every
/// missing chunk of the window, and the rest of that stream is skipped.
pub struct MultiStream<'a> {
    factory: Factory,
    streams: VecDeque<&'a AnyStream>,
    ready: VecDeque<StreamChunk<'a>>,
    read_ahead: usize,
    slice_size: usize,
}

impl<'a> MultiStream<'a> {
    pub fn new(factory: &Factory, streams: &[&'a AnyStream]) -> Self {
        let config = factory.config();
        Self {
            read_ahead: config.image_read_ahead.max(1),
            slice_size: config.multi_stream_chunk_size.max(1),
            factory: factory.clone(),
            streams: streams.iter().copied().collect(),
            ready: VecDeque::new(),
        }
    }

    /// Override the number of image chunks fetched per round-trip.
    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead.max(1);
        self
    }

    fn enqueue(&mut self, stream: &'a AnyStream) {
        match stream {
            AnyStream::Memory(memory) => {
                for slice in memory.content().chunks(self.slice_size) {
                    self.ready.push_back(StreamChunk {
                        stream,
                        result: Ok(slice.to_vec()),
                    });
                }
            }
            AnyStream::Image(image) => {
                if let Err(e) = self.enqueue_image(stream, image) {
                    self.ready.push_back(StreamChunk {
                        stream,
                        result: Err(e),
                    });
                }
            }
        }
    }

    fn enqueue_image(&mut self, stream: &'a AnyStream, image: &ImageStream) -> StoreResult<()> {
        let count = image.chunk_count();
        let mut start = 0;
        while start < count {
            let end = count.min(start + self.read_ahead as u64);
            let urns: Vec<Urn> = (start..end).map(|i| image.chunk_urn(i)).collect();
            let mut found: HashMap<Urn, Vec<u8>> = self
                .factory
                .multi_open(&urns, None, Mode::Read)?
                .into_iter()
                .map(|chunk| {
                    let body = match chunk.get(attributes::CONTENT)? {
                        Some(Value::Bytes(bytes)) => bytes,
                        _ => Vec::new(),
                    };
                    Ok((chunk.urn().clone(), body))
                })
                .collect::<StoreResult<_>>()?;

            let missing: Vec<Urn> = urns.iter().filter(|u| !found.contains_key(*u)).cloned().collect();
            for urn in &urns {
                let Some(body) = found.remove(urn) else { break };
                self.ready.push_back(StreamChunk {
                    stream,
                    result: Ok(body),
                });
            }
            if !missing.is_empty() {
                warn!(urn = %image.urn(), missing = missing.len(), "image stream has missing chunks");
                self.ready.push_back(StreamChunk {
                    stream,
                    result: Err(StoreError::StreamIntegrity {
                        urn: image.urn().clone(),
                        missing,
                    }),
                });
                return Ok(());
            }
            start = end;
        }
        debug!(urn = %image.urn(), chunks = count, "image stream read");
        Ok(())
    }
}

impl<'a> Iterator for MultiStream<'a> {
    type Item = StreamChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.ready.is_empty() {
            let stream = self.streams.pop_front()?;
            self.enqueue(stream);
        }
        self.ready.pop_front()
    }
}

impl std::fmt::Debug for MultiStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiStream")
            .field("remaining_streams", &self.streams.len())
            .field("ready", &self.ready.len())
            .field("read_ahead", &self.read_ahead)
            .finish()
    }
}

impl Factory {
    /// Read `streams` in order with batched chunk lookups.
    pub fn multi_stream<'a>(&self, streams: &[&'a AnyStream]) -> MultiStream<'a> {
        MultiStream::new(self, streams)
    }
}
