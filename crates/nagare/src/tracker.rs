//! Segment tracker interface.
//!
//! A tracker owns one rendition's segment timeline (playlist or manifest
//! driven) and hands out chunks in playback order. Timeline events flow the
//! other way through a [`TrackerEventSink`] the stream registers; the stream
//! drains the sink at the start of every scheduling tick.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{
    chunk::SegmentChunk,
    http::manager::ConnectionManager,
    types::{StreamFormat, Timestamp},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The timeline breaks before the next segment.
    Discontinuity,
    /// Upcoming segments carry a different container format.
    FormatChange(StreamFormat),
    /// The tracker moved to another rendition of the same content.
    Switching,
    /// A new segment becomes current.
    SegmentChange,
}

/// Queue the tracker pushes timeline events into; drained by the owning
/// stream on its own thread.
#[derive(Clone, Default)]
pub struct TrackerEventSink {
    events: Arc<Mutex<VecDeque<TrackerEvent>>>,
}

impl TrackerEventSink {
    pub fn push(&self, event: TrackerEvent) {
        self.events.lock().push_back(event);
    }

    pub fn drain(&self) -> Vec<TrackerEvent> {
        self.events.lock().drain(..).collect()
    }
}

pub trait SegmentTracker: Send {
    fn register_listener(&mut self, sink: TrackerEventSink);
    fn unregister_listener(&mut self);

    /// Builds the chunk for the current position and advances past it.
    /// `None` when no further segment is available.
    fn next_chunk(
        &mut self,
        allow_init: bool,
        manager: &Arc<ConnectionManager>,
    ) -> Option<SegmentChunk>;

    fn current_format(&self) -> StreamFormat;

    /// Whether the segment list covers the current position; live timelines
    /// may still be waiting on a playlist refresh.
    fn segments_list_ready(&self) -> bool {
        true
    }

    /// Minimum buffer the timeline wants ahead of playback.
    fn min_ahead_time(&self) -> Timestamp {
        Timestamp::ZERO
    }

    fn playback_time(&self) -> Timestamp {
        Timestamp::ZERO
    }

    /// Repositions the timeline. With `tryonly`, only feasibility is
    /// reported and no state changes.
    fn set_position_by_time(&mut self, time: Timestamp, needs_reinit: bool, tryonly: bool)
        -> bool;

    fn notify_buffering_state(&mut self, _active: bool) {}

    fn notify_buffering_level(
        &mut self,
        _min: Timestamp,
        _current: Timestamp,
        _total: Timestamp,
    ) {
    }

    fn reset(&mut self) {}
}

pub type SharedTracker = Arc<Mutex<dyn SegmentTracker>>;
