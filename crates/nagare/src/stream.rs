//! Per-elementary-stream orchestrator.
//!
//! A [`Stream`] ties one segment tracker to one demuxer instance and the
//! intercepting output, and runs the buffering state machine: schedule
//! demuxing up to a deadline, classify the buffering level, dequeue due
//! output, and restart the demuxer across discontinuities, format changes
//! and rendition switches.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    chunk::SegmentChunk,
    demux::{ChunkFeed, DemuxStatus, DemuxerFactory, SourceStream, WrappedDemuxer},
    error::NagareResult,
    es_out::{EsOut, FakeEsOut},
    http::{manager::ConnectionManager, RequestStatus},
    tracker::{SharedTracker, TrackerEvent, TrackerEventSink},
    types::{StreamFormat, Timestamp},
};

use crate::chunk::Block;

/// Missing segments tolerated before the gap is escalated to end of stream.
const MAX_NOTFOUND_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingStatus {
    /// Nothing further will be buffered (disabled, dead or fully ended).
    End,
    /// Temporarily unable to make progress (draining, live edge).
    Suspended,
    Ongoing,
    LessThanMin,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueStatus {
    Demuxed,
    /// A drain just completed; the caller should flush downstream decoders.
    Discontinuity,
    Eof,
    Buffering,
}

struct FeederState {
    tracker: SharedTracker,
    manager: Arc<ConnectionManager>,
    current: Option<SegmentChunk>,
    /// Gates: while set, the demuxer is starved so the restart machinery can
    /// run at a block boundary.
    discontinuity: bool,
    needrestart: bool,
    eof: bool,
    notfound: u32,
}

/// Chunk chain shared between the stream state machine and the demuxer's
/// byte stream.
struct ChunkFeeder {
    state: Mutex<FeederState>,
}

impl ChunkFeeder {
    fn new(tracker: SharedTracker, manager: Arc<ConnectionManager>) -> Self {
        Self {
            state: Mutex::new(FeederState {
                tracker,
                manager,
                current: None,
                discontinuity: false,
                needrestart: false,
                eof: false,
                notfound: 0,
            }),
        }
    }

    fn set_discontinuity(&self) {
        self.state.lock().discontinuity = true;
    }

    fn set_needrestart(&self) {
        self.state.lock().needrestart = true;
    }

    fn discontinuity_pending(&self) -> bool {
        self.state.lock().discontinuity
    }

    fn restart_pending(&self) -> bool {
        self.state.lock().needrestart
    }

    fn clear_gates(&self) {
        let mut state = self.state.lock();
        state.discontinuity = false;
        state.needrestart = false;
    }

    fn is_eof(&self) -> bool {
        self.state.lock().eof
    }

    /// Drops the in-flight chunk and every latched condition; used on seeks
    /// and reactivation.
    fn reset(&self) {
        let mut state = self.state.lock();
        state.current = None;
        state.discontinuity = false;
        state.needrestart = false;
        state.eof = false;
        state.notfound = 0;
    }
}

impl ChunkFeed for ChunkFeeder {
    fn next_block(&self) -> NagareResult<Option<Block>> {
        let mut state = self.state.lock();
        loop {
            if state.eof || state.discontinuity || state.needrestart {
                return Ok(None);
            }
            if state.current.is_none() {
                let chunk = state.tracker.lock().next_chunk(true, &state.manager);
                match chunk {
                    Some(chunk) => state.current = Some(chunk),
                    None => {
                        state.eof = true;
                        return Ok(None);
                    }
                }
            }
            let chunk = state.current.as_mut().expect("chunk just installed");
            let block = chunk.read_block()?;
            let exhausted = chunk.is_empty();
            if block.data.is_empty() {
                if !exhausted {
                    return Ok(None);
                }
                let status = chunk.request_status();
                state.current = None;
                if status == Some(RequestStatus::NotFound) {
                    state.notfound += 1;
                    if state.notfound <= MAX_NOTFOUND_RETRIES {
                        debug!("segment missing, signaling discontinuity (attempt {})", state.notfound);
                        state.discontinuity = true;
                    } else {
                        warn!("too many missing segments, ending stream");
                        state.eof = true;
                    }
                    return Ok(None);
                }
                // Zero-length segment, move on to the next one.
                continue;
            }
            state.notfound = 0;
            if exhausted {
                state.current = None;
            }
            return Ok(Some(block));
        }
    }
}

pub struct Stream {
    tracker: SharedTracker,
    factory: Arc<dyn DemuxerFactory>,
    events: TrackerEventSink,
    feeder: Arc<ChunkFeeder>,
    source: Arc<SourceStream>,
    fake: Arc<FakeEsOut>,
    demuxer: Option<WrappedDemuxer>,
    format: StreamFormat,
    disabled: bool,
    eof: bool,
    dead: bool,
    inrestart: bool,
}

impl Stream {
    pub fn new(
        tracker: SharedTracker,
        manager: Arc<ConnectionManager>,
        factory: Arc<dyn DemuxerFactory>,
    ) -> Self {
        let events = TrackerEventSink::default();
        tracker.lock().register_listener(events.clone());
        let feeder = Arc::new(ChunkFeeder::new(tracker.clone(), manager));
        let source = Arc::new(SourceStream::new());
        source.set_feed(feeder.clone());
        Self {
            tracker,
            factory,
            events,
            feeder,
            source,
            fake: Arc::new(FakeEsOut::new()),
            demuxer: None,
            format: StreamFormat::Unknown,
            disabled: false,
            eof: false,
            dead: false,
            inrestart: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Selection toggled by the caller. Re-enabling clears latched end
    /// conditions so buffering can resume from the tracker's position.
    pub fn set_disabled(&mut self, disabled: bool) {
        if self.disabled == disabled {
            return;
        }
        self.disabled = disabled;
        self.tracker.lock().notify_buffering_state(!disabled);
        if !disabled {
            self.eof = false;
            self.feeder.reset();
        }
    }

    pub fn pcr(&self) -> Option<Timestamp> {
        self.fake.pcr()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.fake.first_timestamp()
    }

    /// Playback position according to the tracker's timeline.
    pub fn playback_time(&self) -> Timestamp {
        self.tracker.lock().playback_time()
    }

    /// Applies one timeline event from the tracker.
    pub fn on_tracker_event(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::Discontinuity => self.feeder.set_discontinuity(),
            TrackerEvent::FormatChange(format) => {
                let detects = self
                    .demuxer
                    .as_ref()
                    .is_some_and(|d| d.policy().can_detect_switches());
                if format != self.format && !detects {
                    self.feeder.set_needrestart();
                }
            }
            TrackerEvent::Switching => {
                if !self.inrestart && self.demuxer.is_some() {
                    self.feeder.set_needrestart();
                }
            }
            TrackerEvent::SegmentChange => {
                let restarts = self
                    .demuxer
                    .as_ref()
                    .is_some_and(|d| d.policy().always_restarts());
                if restarts && !self.inrestart {
                    self.feeder.set_needrestart();
                }
            }
        }
    }

    fn drain_tracker_events(&mut self) {
        for event in self.events.drain() {
            self.on_tracker_event(event);
        }
    }

    fn start_demux(&mut self) -> bool {
        self.format = self.tracker.lock().current_format();
        if self.format == StreamFormat::Unsupported {
            return false;
        }
        self.source.reset();
        match WrappedDemuxer::create(
            &*self.factory,
            self.format,
            self.source.clone(),
            self.fake.clone(),
        ) {
            Some(demuxer) => {
                self.fake.recycle(false);
                self.demuxer = Some(demuxer);
                true
            }
            None => false,
        }
    }

    /// Tears the demuxer down for a restart: drain what it still holds,
    /// switch the output to draining, and discard its teardown commands.
    fn prepare_restart(&mut self) {
        self.inrestart = true;
        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.drain();
            self.fake.commit();
            self.fake.set_draining();
            self.fake.recycle(true);
            demuxer.destroy();
            self.fake.recycle(false);
        }
        self.feeder.clear_gates();
        self.inrestart = false;
    }

    /// One buffering tick: demux towards `deadline` until `min + extra` is
    /// resident, then classify the level.
    pub fn bufferize(
        &mut self,
        deadline: Timestamp,
        min_buffering: Timestamp,
        extra_buffering: Timestamp,
    ) -> BufferingStatus {
        self.drain_tracker_events();
        if self.dead {
            return BufferingStatus::End;
        }
        if self.disabled {
            self.tracker.lock().reset();
            self.fake.abort(true);
            return BufferingStatus::End;
        }
        if self.fake.is_draining() {
            return BufferingStatus::Suspended;
        }
        if self.eof {
            return BufferingStatus::End;
        }

        if self.demuxer.is_none() {
            if !self.start_demux() {
                if self.feeder.discontinuity_pending() || self.feeder.restart_pending() {
                    // Probe hit gated input; restart and retry next tick.
                    self.prepare_restart();
                    return BufferingStatus::Ongoing;
                }
                self.dead = true;
                self.fake.set_eof(true);
                return BufferingStatus::End;
            }
        }

        // Live timelines may demand more lead than the caller asked for.
        let min_buffering = min_buffering.max(self.tracker.lock().min_ahead_time());
        let total = min_buffering + extra_buffering;
        let mut demuxed = self.fake.demuxed_amount();
        self.tracker
            .lock()
            .notify_buffering_level(min_buffering, demuxed, total);

        if demuxed < total {
            if !self.tracker.lock().segments_list_ready() {
                // Live edge: the playlist does not cover further segments yet.
                return BufferingStatus::Suspended;
            }
            let status = self
                .demuxer
                .as_mut()
                .expect("demuxer started above")
                .demux(deadline);
            self.fake.commit();
            if status != DemuxStatus::Success {
                if self.feeder.discontinuity_pending() || self.feeder.restart_pending() {
                    self.prepare_restart();
                    return BufferingStatus::Ongoing;
                }
                self.eof = true;
                self.fake.set_eof(true);
                if self.fake.is_empty() {
                    return BufferingStatus::End;
                }
                self.fake.set_draining();
                return BufferingStatus::Suspended;
            }
            demuxed = self.fake.demuxed_amount();
        }

        if demuxed >= total {
            BufferingStatus::Full
        } else if demuxed >= min_buffering {
            BufferingStatus::Ongoing
        } else {
            BufferingStatus::LessThanMin
        }
    }

    /// Forwards committed output due at `deadline` to the real output.
    pub fn dequeue(&mut self, out: &mut dyn EsOut, deadline: Timestamp) -> DequeueStatus {
        if self.dead {
            return DequeueStatus::Eof;
        }
        if self.fake.is_draining() {
            self.fake.process(out, deadline);
            if self.fake.is_empty() {
                self.fake.clear_draining();
                if !self.fake.is_eof() {
                    // The drain belonged to a restart; reset clocks so the
                    // next instance starts clean.
                    self.fake.abort(true);
                    return DequeueStatus::Discontinuity;
                }
            }
            return DequeueStatus::Demuxed;
        }
        if self.disabled || self.eof {
            return DequeueStatus::Eof;
        }
        let buffered_past_deadline = self
            .fake
            .buffering_level()
            .is_some_and(|level| level >= deadline);
        if buffered_past_deadline {
            self.fake.process(out, deadline);
            DequeueStatus::Demuxed
        } else {
            DequeueStatus::Buffering
        }
    }

    /// Whether a seek can be honored right now: not mid-restart, no gated
    /// input, and nothing still draining.
    pub fn seek_able(&self) -> bool {
        self.demuxer.is_some()
            && !self.inrestart
            && !self.feeder.discontinuity_pending()
            && !self.feeder.restart_pending()
            && !(self.fake.is_draining() && !self.fake.is_eof())
    }

    /// Repositions the stream. With `tryonly`, only feasibility is checked.
    pub fn set_position(&mut self, time: Timestamp, tryonly: bool) -> bool {
        if self.dead {
            return false;
        }
        let needs_reinit = self
            .demuxer
            .as_ref()
            .map_or(true, |d| d.policy().reinits_on_seek());
        if !self
            .tracker
            .lock()
            .set_position_by_time(time, needs_reinit, tryonly)
        {
            return false;
        }
        if tryonly {
            return true;
        }

        self.eof = false;
        self.fake.set_eof(false);
        self.feeder.reset();
        self.fake.abort(true);
        if needs_reinit {
            if let Some(demuxer) = self.demuxer.take() {
                demuxer.destroy();
            }
            if !self.start_demux() {
                warn!("demuxer did not survive reposition, stream is dead");
                self.dead = true;
                self.fake.set_eof(true);
                return false;
            }
        }
        self.fake.set_expected_display_time(time);
        true
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.tracker.lock().unregister_listener();
    }
}
