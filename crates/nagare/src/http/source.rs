//! Chunk sources: one segment's (or sub-range's) byte stream over a pooled
//! connection.
//!
//! Two flavors share the prepare/redirect path: [`HttpChunkSource`] pulls
//! bytes synchronously on the caller's thread, [`HttpChunkBufferedSource`]
//! is filled by the background downloader in `CHUNK_SIZE` quanta and drained
//! through a condition variable.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};
use url::Url;

use crate::{
    error::{NagareError, NagareResult},
    http::{
        connection::{Connection, ConnectionParams, RequestStatus, MAX_REDIRECTS},
        manager::ConnectionManager,
    },
    types::{ByteRange, ChunkType},
};

/// Background fill quantum. Also the cancellation-latency contract: a
/// cooperative cancel is observed within one quantum, never later.
pub const CHUNK_SIZE: usize = 32 * 1024;

pub trait ChunkSource: Send + Sync {
    fn has_more_data(&self) -> bool;
    /// Pulls up to `max` bytes, possibly short. Empty means end of data.
    fn read(&self, max: usize) -> NagareResult<Bytes>;
    /// Pulls one implementation-chosen quantum.
    fn read_block(&self) -> NagareResult<Bytes>;
    fn content_type(&self) -> Option<String>;
    fn request_status(&self) -> Option<RequestStatus>;
    fn chunk_type(&self) -> ChunkType;
    fn url(&self) -> &Url;
}

/// Synchronous or background-buffered source, as one owned handle.
#[derive(Clone)]
pub enum SourceHandle {
    Sync(Arc<HttpChunkSource>),
    Buffered(Arc<HttpChunkBufferedSource>),
}

impl SourceHandle {
    fn as_source(&self) -> &dyn ChunkSource {
        match self {
            SourceHandle::Sync(source) => source.as_ref(),
            SourceHandle::Buffered(source) => source.as_ref(),
        }
    }
}

impl ChunkSource for SourceHandle {
    fn has_more_data(&self) -> bool {
        self.as_source().has_more_data()
    }

    fn read(&self, max: usize) -> NagareResult<Bytes> {
        self.as_source().read(max)
    }

    fn read_block(&self) -> NagareResult<Bytes> {
        self.as_source().read_block()
    }

    fn content_type(&self) -> Option<String> {
        self.as_source().content_type()
    }

    fn request_status(&self) -> Option<RequestStatus> {
        self.as_source().request_status()
    }

    fn chunk_type(&self) -> ChunkType {
        self.as_source().chunk_type()
    }

    fn url(&self) -> &Url {
        self.as_source().url()
    }
}

struct Prepared {
    conn: Arc<Mutex<Connection>>,
    status: RequestStatus,
    content_length: u64,
    content_type: Option<String>,
}

/// Issues the request, following up to [`MAX_REDIRECTS`] hops. A redirect
/// response at the cap is a `GenericError`, not another attempt.
fn prepare_request(
    manager: &ConnectionManager,
    url: &Url,
    range: Option<ByteRange>,
) -> NagareResult<Prepared> {
    let mut target = url.clone();
    let mut redirects = 0usize;
    loop {
        let params = ConnectionParams::from_url(&target)?;
        let conn = manager
            .get_connection(&params)
            .ok_or(NagareError::NoConnection)?;
        let status = conn.lock().request(&params.path, range)?;
        match status {
            RequestStatus::Success => {
                let (content_length, content_type) = {
                    let locked = conn.lock();
                    (
                        locked.content_length(),
                        locked.content_type().map(str::to_string),
                    )
                };
                return Ok(Prepared {
                    conn,
                    status,
                    content_length,
                    content_type,
                });
            }
            RequestStatus::Redirection => {
                let location = conn.lock().redirect_location().map(str::to_string);
                conn.lock().set_used(false);
                redirects += 1;
                if redirects >= MAX_REDIRECTS {
                    return Err(NagareError::TooManyRedirects);
                }
                let location = location.ok_or(NagareError::TooManyRedirects)?;
                target = target.join(&location)?;
                trace!("following redirect {} to {}", redirects, target);
            }
            status => {
                conn.lock().set_used(false);
                let content_type = conn.lock().content_type().map(str::to_string);
                return Ok(Prepared {
                    conn,
                    status,
                    content_length: 0,
                    content_type,
                });
            }
        }
    }
}

struct SyncState {
    prepared: bool,
    conn: Option<Arc<Mutex<Connection>>>,
    status: Option<RequestStatus>,
    content_type: Option<String>,
    content_length: u64,
    consumed: u64,
    done: bool,
    request_start: Option<Instant>,
    first_byte: Option<Duration>,
}

/// Synchronous-pull chunk source. The HTTP request is issued lazily on the
/// first read; each read then blocks the calling thread on the socket.
pub struct HttpChunkSource {
    manager: Arc<ConnectionManager>,
    url: Url,
    range: Option<ByteRange>,
    chunk_type: ChunkType,
    state: Mutex<SyncState>,
}

impl HttpChunkSource {
    pub fn new(
        manager: Arc<ConnectionManager>,
        url: Url,
        range: Option<ByteRange>,
        chunk_type: ChunkType,
    ) -> Self {
        Self {
            manager,
            url,
            range,
            chunk_type,
            state: Mutex::new(SyncState {
                prepared: false,
                conn: None,
                status: None,
                content_type: None,
                content_length: 0,
                consumed: 0,
                done: false,
                request_start: None,
                first_byte: None,
            }),
        }
    }

    fn prepare_locked(&self, state: &mut MutexGuard<'_, SyncState>) {
        if state.prepared {
            return;
        }
        state.prepared = true;
        state.request_start = Some(Instant::now());
        match prepare_request(&self.manager, &self.url, self.range) {
            Ok(prepared) if prepared.status == RequestStatus::Success => {
                state.status = Some(prepared.status);
                state.content_length = prepared.content_length;
                state.content_type = prepared.content_type;
                state.conn = Some(prepared.conn);
            }
            Ok(prepared) => {
                state.status = Some(prepared.status);
                state.content_type = prepared.content_type;
                state.done = true;
            }
            Err(e) => {
                warn!("prepare of {} failed: {e}", self.url);
                state.status = Some(RequestStatus::GenericError);
                state.done = true;
            }
        }
    }

    fn finish_locked(&self, state: &mut MutexGuard<'_, SyncState>) {
        if state.done {
            return;
        }
        state.done = true;
        if let Some(conn) = state.conn.take() {
            conn.lock().set_used(false);
        }
        if self.chunk_type == ChunkType::Segment {
            if let Some(start) = state.request_start {
                self.manager.update_download_rate(
                    &self.url,
                    state.consumed,
                    start.elapsed(),
                    state.first_byte.unwrap_or_default(),
                );
            }
        }
    }
}

impl ChunkSource for HttpChunkSource {
    fn has_more_data(&self) -> bool {
        !self.state.lock().done
    }

    fn read(&self, max: usize) -> NagareResult<Bytes> {
        let mut state = self.state.lock();
        self.prepare_locked(&mut state);
        if state.done {
            return Ok(Bytes::new());
        }
        let Some(conn) = state.conn.clone() else {
            self.finish_locked(&mut state);
            return Ok(Bytes::new());
        };

        let mut buf = vec![0u8; max];
        let n = match conn.lock().read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                state.status = Some(RequestStatus::GenericError);
                self.finish_locked(&mut state);
                return Err(e);
            }
        };
        if n == 0 {
            self.finish_locked(&mut state);
            return Ok(Bytes::new());
        }
        if state.first_byte.is_none() {
            state.first_byte = state.request_start.map(|start| start.elapsed());
        }
        state.consumed += n as u64;
        buf.truncate(n);
        if state.content_length > 0 && state.consumed >= state.content_length {
            self.finish_locked(&mut state);
        }
        Ok(Bytes::from(buf))
    }

    fn read_block(&self) -> NagareResult<Bytes> {
        self.read(CHUNK_SIZE)
    }

    fn content_type(&self) -> Option<String> {
        self.state.lock().content_type.clone()
    }

    fn request_status(&self) -> Option<RequestStatus> {
        self.state.lock().status
    }

    fn chunk_type(&self) -> ChunkType {
        self.chunk_type
    }

    fn url(&self) -> &Url {
        &self.url
    }
}

struct BufferedState {
    prepared: bool,
    conn: Option<Arc<Mutex<Connection>>>,
    status: Option<RequestStatus>,
    content_type: Option<String>,
    content_length: u64,
    blocks: VecDeque<Bytes>,
    /// Bytes resident in `blocks`, not yet handed to the consumer.
    buffered: u64,
    /// Bytes handed to the consumer.
    consumed: u64,
    /// Bytes fetched from the connection so far.
    total_read: u64,
    done: bool,
    cancelled: bool,
    /// Prevents a bufferize/teardown race: set while the downloader may
    /// still touch this source.
    held: bool,
    cancel_requested: bool,
    request_start: Option<Instant>,
    first_byte: Option<Duration>,
}

/// Background-buffered chunk source. The downloader thread fills the block
/// queue one quantum at a time; consumers block on the condition variable
/// until enough bytes are resident or the fill is done.
pub struct HttpChunkBufferedSource {
    manager: Arc<ConnectionManager>,
    url: Url,
    range: Option<ByteRange>,
    chunk_type: ChunkType,
    inner: Mutex<BufferedState>,
    wait: Condvar,
}

impl HttpChunkBufferedSource {
    pub fn new(
        manager: Arc<ConnectionManager>,
        url: Url,
        range: Option<ByteRange>,
        chunk_type: ChunkType,
    ) -> Self {
        Self {
            manager,
            url,
            range,
            chunk_type,
            inner: Mutex::new(BufferedState {
                prepared: false,
                conn: None,
                status: None,
                content_type: None,
                content_length: 0,
                blocks: VecDeque::new(),
                buffered: 0,
                consumed: 0,
                total_read: 0,
                done: false,
                cancelled: false,
                held: false,
                cancel_requested: false,
                request_start: None,
                first_byte: None,
            }),
            wait: Condvar::new(),
        }
    }

    pub(crate) fn hold(&self) {
        self.inner.lock().held = true;
    }

    pub(crate) fn release_hold(&self) {
        self.inner.lock().held = false;
    }

    pub(crate) fn is_held(&self) -> bool {
        self.inner.lock().held
    }

    /// Requests cooperative cancellation; observed by the downloader at the
    /// next quantum boundary.
    pub(crate) fn request_cancel(&self) {
        self.inner.lock().cancel_requested = true;
    }

    /// Marks a cancelled source done and wakes blocked consumers. Called by
    /// the downloader once the in-flight fill (if any) has finished.
    pub(crate) fn finish_cancelled(&self) {
        let mut state = self.inner.lock();
        if !state.done {
            state.done = true;
            state.cancelled = true;
            if let Some(conn) = state.conn.take() {
                conn.lock().set_used(false);
            }
        }
        drop(state);
        self.wait.notify_all();
    }

    /// One background fill pass. Returns `true` once the source needs no
    /// further fills (complete, failed or cancelled).
    pub(crate) fn bufferize(&self, quantum: usize) -> bool {
        {
            let mut state = self.inner.lock();
            if state.done || state.cancel_requested {
                return true;
            }
            if !state.prepared {
                state.prepared = true;
                state.request_start = Some(Instant::now());
                drop(state);
                // The HTTP exchange happens with the state lock released;
                // consumers may keep polling counters meanwhile.
                let prepared = prepare_request(&self.manager, &self.url, self.range);
                let mut state = self.inner.lock();
                match prepared {
                    Ok(p) if p.status == RequestStatus::Success => {
                        state.status = Some(p.status);
                        state.content_length = p.content_length;
                        state.content_type = p.content_type;
                        state.conn = Some(p.conn);
                    }
                    Ok(p) => {
                        state.status = Some(p.status);
                        state.content_type = p.content_type;
                        return self.complete_locked(state);
                    }
                    Err(e) => {
                        warn!("prepare of {} failed: {e}", self.url);
                        state.status = Some(RequestStatus::GenericError);
                        return self.complete_locked(state);
                    }
                }
            }
        }

        let conn = self.inner.lock().conn.clone();
        let Some(conn) = conn else {
            return true;
        };

        // The connection is exclusively borrowed by this source; blocking
        // on its socket here never contends with consumers.
        let mut buf = vec![0u8; quantum];
        let result = conn.lock().read(&mut buf);

        let mut state = self.inner.lock();
        match result {
            Ok(0) => self.complete_locked(state),
            Ok(n) => {
                if state.first_byte.is_none() {
                    state.first_byte = state.request_start.map(|start| start.elapsed());
                }
                buf.truncate(n);
                state.blocks.push_back(Bytes::from(buf));
                state.buffered += n as u64;
                state.total_read += n as u64;
                self.wait.notify_all();
                if state.content_length > 0 && state.total_read >= state.content_length {
                    self.complete_locked(state)
                } else {
                    false
                }
            }
            Err(e) => {
                warn!("background fill of {} failed: {e}", self.url);
                state.status = Some(RequestStatus::GenericError);
                self.complete_locked(state)
            }
        }
    }

    /// Natural completion: releases the connection, emits the rate sample
    /// for segment fetches, wakes consumers.
    fn complete_locked(&self, mut state: MutexGuard<'_, BufferedState>) -> bool {
        state.done = true;
        if let Some(conn) = state.conn.take() {
            conn.lock().set_used(false);
        }
        let sample = (self.chunk_type == ChunkType::Segment && !state.cancelled)
            .then_some((state.total_read, state.request_start, state.first_byte));
        drop(state);
        self.wait.notify_all();
        if let Some((total, Some(start), first_byte)) = sample {
            self.manager.update_download_rate(
                &self.url,
                total,
                start.elapsed(),
                first_byte.unwrap_or_default(),
            );
        }
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        self.inner.lock().done
    }
}

impl ChunkSource for HttpChunkBufferedSource {
    fn has_more_data(&self) -> bool {
        let state = self.inner.lock();
        !(state.done && state.blocks.is_empty())
    }

    fn read(&self, max: usize) -> NagareResult<Bytes> {
        let mut state = self.inner.lock();
        while state.buffered < max as u64 && !state.done {
            self.wait.wait(&mut state);
        }
        let want = (max as u64).min(state.buffered) as usize;
        if want == 0 {
            return Ok(Bytes::new());
        }

        // read(n) may have to splice across several queued blocks.
        let mut out = Vec::with_capacity(want);
        while out.len() < want {
            let mut front = state.blocks.pop_front().expect("buffered bytes out of sync");
            let take = (want - out.len()).min(front.len());
            out.extend_from_slice(&front.split_to(take));
            if !front.is_empty() {
                state.blocks.push_front(front);
            }
        }
        state.buffered -= want as u64;
        state.consumed += want as u64;
        Ok(Bytes::from(out))
    }

    fn read_block(&self) -> NagareResult<Bytes> {
        let mut state = self.inner.lock();
        while state.blocks.is_empty() && !state.done {
            self.wait.wait(&mut state);
        }
        // Whole-block hand-off, zero copy.
        let Some(block) = state.blocks.pop_front() else {
            return Ok(Bytes::new());
        };
        state.buffered -= block.len() as u64;
        state.consumed += block.len() as u64;
        Ok(block)
    }

    fn content_type(&self) -> Option<String> {
        self.inner.lock().content_type.clone()
    }

    fn request_status(&self) -> Option<RequestStatus> {
        self.inner.lock().status
    }

    fn chunk_type(&self) -> ChunkType {
        self.chunk_type
    }

    fn url(&self) -> &Url {
        &self.url
    }
}
