//! Background downloader: one dedicated worker thread draining a FIFO of
//! buffered chunk sources.
//!
//! The front source is serviced one `CHUNK_SIZE` quantum per pass until it
//! reports done or a cancel is observed; only then is the next source
//! considered. Cancellation is cooperative: `cancel` blocks the caller until
//! the in-flight fill pass (bounded by one quantum) has finished.

use std::{collections::VecDeque, sync::Arc, thread};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::http::source::{HttpChunkBufferedSource, CHUNK_SIZE};

struct State {
    queue: VecDeque<Arc<HttpChunkBufferedSource>>,
    current: Option<Arc<HttpChunkBufferedSource>>,
    killed: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signaled on enqueue and on kill.
    wait: Condvar,
    /// Signaled whenever the in-flight item changes.
    updated: Condvar,
}

pub struct Downloader {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Downloader {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                current: None,
                killed: false,
            }),
            wait: Condvar::new(),
            updated: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("nagare-downloader".to_string())
            .spawn(move || Self::worker(worker_shared))
            .expect("failed to spawn downloader thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Appends `source` to the fill queue and wakes the worker. The source
    /// is held until it completes or is cancelled.
    pub fn schedule(&self, source: Arc<HttpChunkBufferedSource>) {
        if source.is_held() {
            return;
        }
        source.hold();
        let mut state = self.shared.state.lock();
        state.queue.push_back(source);
        trace!("scheduled buffered source (queue depth {})", state.queue.len());
        drop(state);
        self.shared.wait.notify_one();
    }

    /// Cancels `source`, blocking until any in-flight fill pass for it has
    /// finished. Latency is bounded by one `CHUNK_SIZE` quantum.
    pub fn cancel(&self, source: &Arc<HttpChunkBufferedSource>) {
        if source.is_done() && !source.is_held() {
            return;
        }
        source.request_cancel();

        let mut state = self.shared.state.lock();
        while state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, source))
        {
            self.shared.updated.wait(&mut state);
        }
        state.queue.retain(|queued| !Arc::ptr_eq(queued, source));
        drop(state);

        source.finish_cancelled();
        source.release_hold();
    }

    fn worker(shared: Arc<Shared>) {
        loop {
            let source = {
                let mut state = shared.state.lock();
                loop {
                    if state.killed {
                        return;
                    }
                    if let Some(front) = state.queue.front().cloned() {
                        state.current = Some(front.clone());
                        break front;
                    }
                    shared.wait.wait(&mut state);
                }
            };

            // One quantum, no locks held across the socket read.
            let done = source.bufferize(CHUNK_SIZE);

            let mut state = shared.state.lock();
            state.current = None;
            if done {
                if state
                    .queue
                    .front()
                    .is_some_and(|front| Arc::ptr_eq(front, &source))
                {
                    state.queue.pop_front();
                }
                source.release_hold();
            }
            drop(state);
            shared.updated.notify_all();
        }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.killed = true;
        }
        self.shared.wait.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
