//! Synthetic byte stream bound to a demuxer.
//!
//! The inner demuxer reads a continuous byte stream; this view splices the
//! stream's chunk chain into one, pulling whole blocks from the chunk feed
//! and serving partial reads out of a pending buffer. `reset` returns it to
//! a pristine state so it can be rebound to a new segment chain without
//! residual bytes.

use std::{io, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{chunk::Block, error::NagareResult};

/// Supplies the next block of the stream's segment chain. `Ok(None)` is a
/// (possibly temporary) end: chain exhausted or a pending
/// discontinuity/restart gate.
pub trait ChunkFeed: Send + Sync {
    fn next_block(&self) -> NagareResult<Option<Block>>;
}

#[derive(Default)]
struct StreamState {
    feed: Option<Arc<dyn ChunkFeed>>,
    pending: Bytes,
}

#[derive(Default)]
pub struct SourceStream {
    inner: Mutex<StreamState>,
}

impl SourceStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed(&self, feed: Arc<dyn ChunkFeed>) {
        self.inner.lock().feed = Some(feed);
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` means the feed has nothing to
    /// offer right now (end of chain or a gate); it is not a latch.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.lock();
        loop {
            if !state.pending.is_empty() {
                let n = buf.len().min(state.pending.len());
                buf[..n].copy_from_slice(&state.pending.split_to(n));
                return Ok(n);
            }
            let Some(feed) = state.feed.clone() else {
                return Ok(0);
            };
            match feed.next_block() {
                Ok(Some(block)) if !block.data.is_empty() => {
                    state.pending = block.data;
                }
                Ok(Some(_)) | Ok(None) => return Ok(0),
                Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
            }
        }
    }

    /// Drops buffered bytes; the feed binding is kept.
    pub fn reset(&self) {
        self.inner.lock().pending = Bytes::new();
    }
}

impl io::Read for &SourceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SourceStream::read(self, buf)
    }
}
