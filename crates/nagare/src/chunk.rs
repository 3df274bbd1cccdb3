//! Segment chunk: one fetchable unit of media data, wrapping a chunk source
//! with byte accounting and optional in-flight decryption.

use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::{
    decrypt::DecryptSession,
    error::NagareResult,
    http::{
        connection::RequestStatus,
        manager::ConnectionManager,
        source::{ChunkSource, HttpChunkBufferedSource, HttpChunkSource, SourceHandle, CHUNK_SIZE},
    },
    types::{ByteRange, ChunkType},
};

/// One block of downloaded (and possibly decrypted) segment data.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub data: Bytes,
    /// First block produced by the chunk; consumers may special-case it to
    /// detect container headers.
    pub header: bool,
    /// The chunk starts after a signaled timeline break.
    pub discontinuity: bool,
}

pub struct SegmentChunk {
    source: SourceHandle,
    manager: Arc<ConnectionManager>,
    sequence: u64,
    discontinuity: bool,
    bytes_read: u64,
    started: bool,
    decrypt: Option<DecryptSession>,
}

impl SegmentChunk {
    /// Builds the chunk and its source. `Segment` fetches ride the
    /// background downloader when one is available; metadata fetches are
    /// always synchronous.
    pub fn new(
        manager: Arc<ConnectionManager>,
        url: Url,
        range: Option<ByteRange>,
        chunk_type: ChunkType,
        sequence: u64,
        discontinuity: bool,
        decrypt: Option<DecryptSession>,
    ) -> Self {
        let source = if chunk_type == ChunkType::Segment && manager.downloader().is_some() {
            let buffered = Arc::new(HttpChunkBufferedSource::new(
                manager.clone(),
                url,
                range,
                chunk_type,
            ));
            let handle = SourceHandle::Buffered(buffered);
            manager.start(&handle);
            handle
        } else {
            SourceHandle::Sync(Arc::new(HttpChunkSource::new(
                manager.clone(),
                url,
                range,
                chunk_type,
            )))
        };
        Self {
            source,
            manager,
            sequence,
            discontinuity,
            bytes_read: 0,
            started: false,
            decrypt,
        }
    }

    /// Wraps an already constructed source; used by tests and trackers that
    /// build sources themselves.
    pub fn with_source(
        manager: Arc<ConnectionManager>,
        source: SourceHandle,
        sequence: u64,
        discontinuity: bool,
        decrypt: Option<DecryptSession>,
    ) -> Self {
        Self {
            source,
            manager,
            sequence,
            discontinuity,
            bytes_read: 0,
            started: false,
            decrypt,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn discontinuity(&self) -> bool {
        self.discontinuity
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_empty(&self) -> bool {
        !self.source.has_more_data()
    }

    pub fn request_status(&self) -> Option<RequestStatus> {
        self.source.request_status()
    }

    pub fn content_type(&self) -> Option<String> {
        self.source.content_type()
    }

    pub fn read_block(&mut self) -> NagareResult<Block> {
        let data = self.source.read_block()?;
        Ok(self.finish_block(data))
    }

    pub fn read(&mut self, max: usize) -> NagareResult<Block> {
        let data = self.source.read(max.min(CHUNK_SIZE))?;
        Ok(self.finish_block(data))
    }

    fn finish_block(&mut self, data: Bytes) -> Block {
        self.bytes_read += data.len() as u64;
        let last = !self.source.has_more_data();
        let data = match &mut self.decrypt {
            Some(session) => session.decrypt(&data, last),
            None => data,
        };
        let first = !self.started;
        self.started = true;
        Block {
            data,
            header: first,
            discontinuity: first && self.discontinuity,
        }
    }
}

impl Drop for SegmentChunk {
    fn drop(&mut self) {
        // A queued or in-flight buffered source must be cancelled before the
        // chunk goes away; no-op for synchronous sources.
        self.manager.cancel(&self.source);
    }
}
