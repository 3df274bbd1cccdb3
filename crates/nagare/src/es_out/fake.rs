//! Intercepting elementary-stream output.
//!
//! The inner demuxer writes into a [`FakeEsOut`] as if it were the real
//! output; packets are staged in the [`CommandsQueue`] so the stream can
//! measure buffering level and commit/drain/flush atomically, forwarding to
//! the real output only on schedule.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    es_out::{
        commands::{Command, CommandsQueue, EsIdentifier},
        EsOut,
    },
    types::Timestamp,
};

/// The output surface handed to the inner demuxer.
pub trait EsOutSink: Send + Sync {
    /// Declares a new elementary stream and returns its handle.
    fn add_es(&self) -> EsIdentifier;
    fn send(&self, id: EsIdentifier, ts: Timestamp, data: Bytes);
    fn del_es(&self, id: EsIdentifier);
    /// In-band flush point, forwarded downstream in queue order.
    fn flush(&self);
}

#[derive(Default)]
pub struct FakeEsOut {
    queue: Mutex<CommandsQueue>,
    next_id: AtomicU64,
    /// Display time to announce downstream on the next process call.
    pending_display_time: Mutex<Option<Timestamp>>,
}

impl FakeEsOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self) {
        self.queue.lock().commit();
    }

    pub fn abort(&self, reset: bool) {
        self.queue.lock().abort(reset);
    }

    pub fn process(&self, out: &mut dyn EsOut, deadline: Timestamp) -> Option<Timestamp> {
        if let Some(display_time) = self.pending_display_time.lock().take() {
            out.set_display_time(display_time);
        }
        self.queue.lock().process(out, deadline)
    }

    pub fn demuxed_amount(&self) -> Timestamp {
        self.queue.lock().demuxed_amount()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn set_draining(&self) {
        self.queue.lock().set_draining(true);
    }

    pub fn clear_draining(&self) {
        self.queue.lock().set_draining(false);
    }

    pub fn is_draining(&self) -> bool {
        self.queue.lock().is_draining()
    }

    pub fn set_eof(&self, eof: bool) {
        self.queue.lock().set_eof(eof);
    }

    pub fn is_eof(&self) -> bool {
        self.queue.lock().is_eof()
    }

    /// Dropping mode: discard everything the demuxer emits while a forced
    /// restart tears the old instance down.
    pub fn recycle(&self, dropping: bool) {
        self.queue.lock().set_dropping(dropping);
    }

    pub fn pcr(&self) -> Option<Timestamp> {
        self.queue.lock().pcr()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.queue.lock().first_timestamp()
    }

    pub fn buffering_level(&self) -> Option<Timestamp> {
        self.queue.lock().buffering_level()
    }

    pub fn set_expected_display_time(&self, ts: Timestamp) {
        *self.pending_display_time.lock() = Some(ts);
    }
}

impl EsOutSink for FakeEsOut {
    fn add_es(&self) -> EsIdentifier {
        let id = EsIdentifier(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.queue.lock().push(Command::AddEs { id });
        id
    }

    fn send(&self, id: EsIdentifier, ts: Timestamp, data: Bytes) {
        self.queue.lock().push(Command::Send { id, ts, data });
    }

    fn del_es(&self, id: EsIdentifier) {
        self.queue.lock().push(Command::DelEs { id });
    }

    fn flush(&self) {
        self.queue.lock().push(Command::Flush);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::es_out::testing::RecordingOut;

    #[test]
    fn test_recycle_drops_teardown_commands() {
        let fake = FakeEsOut::new();
        let id = fake.add_es();
        fake.send(id, Timestamp::from_millis(10), Bytes::from_static(b"a"));
        fake.commit();

        fake.recycle(true);
        fake.del_es(id);
        fake.recycle(false);
        fake.commit();

        let mut out = RecordingOut::default();
        fake.process(&mut out, Timestamp::from_millis(100));
        // AddEs + Send forwarded, the recycled DelEs never reaches out.
        assert_eq!(out.events.len(), 2);
    }

    #[test]
    fn test_display_time_announced_once() {
        let fake = FakeEsOut::new();
        fake.set_expected_display_time(Timestamp::from_secs(30));

        let mut out = RecordingOut::default();
        fake.process(&mut out, Timestamp::ZERO);
        fake.process(&mut out, Timestamp::ZERO);
        assert_eq!(out.display_times, vec![Timestamp::from_secs(30)]);
    }
}
