//! Demuxer wrapping and restart policy.
//!
//! The inner demuxer is format specific and opaque; it pulls bytes from a
//! [`SourceStream`] and emits into the stream's intercepting output. The
//! wrapper adds the lifecycle the orchestrator needs: bounded drain loops,
//! teardown that leaves the byte stream clean, and per-format restart
//! behavior.

mod source_stream;

pub use source_stream::{ChunkFeed, SourceStream};

use std::sync::Arc;

use tracing::warn;

use crate::{
    es_out::FakeEsOut,
    types::{StreamFormat, Timestamp},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxStatus {
    Success,
    Eof,
    Error,
}

/// Format-specific demuxer. `demux` advances until `deadline` worth of output
/// has been produced or input runs out; `drain` pumps internally buffered
/// output without consuming new input.
pub trait Demuxer: Send {
    fn demux(&mut self, deadline: Timestamp) -> DemuxStatus;
    fn drain(&mut self) -> DemuxStatus;
}

/// Probes the source stream and builds a demuxer for it. Probe failure
/// returns `None` and must leave no side effects behind.
pub trait DemuxerFactory: Send + Sync {
    fn create(
        &self,
        format: StreamFormat,
        source: Arc<SourceStream>,
        out: Arc<FakeEsOut>,
    ) -> Option<Box<dyn Demuxer>>;
}

/// How a demuxer instance behaves across segment boundaries and seeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Timestamps restart from zero on every new instance.
    AlwaysFromZero,
    /// Handles in-band format switches without a new instance.
    DetectsSwitchesInBand,
    /// Needs a fresh instance for every segment.
    RestartsPerSegment,
    Default,
}

impl RestartPolicy {
    pub fn for_format(format: StreamFormat) -> Self {
        match format {
            StreamFormat::MpegTs => RestartPolicy::DetectsSwitchesInBand,
            StreamFormat::Mp4 => RestartPolicy::AlwaysFromZero,
            StreamFormat::WebVtt => RestartPolicy::RestartsPerSegment,
            _ => RestartPolicy::Default,
        }
    }

    pub fn starts_from_zero(self) -> bool {
        matches!(self, RestartPolicy::AlwaysFromZero)
    }

    pub fn can_detect_switches(self) -> bool {
        matches!(self, RestartPolicy::DetectsSwitchesInBand)
    }

    pub fn always_restarts(self) -> bool {
        matches!(self, RestartPolicy::RestartsPerSegment)
    }

    /// Whether a seek invalidates the instance. Self-synchronizing formats
    /// recover from a byte-stream jump in place.
    pub fn reinits_on_seek(self) -> bool {
        !matches!(self, RestartPolicy::DetectsSwitchesInBand)
    }
}

/// An inner demuxer plus the stream plumbing it is bound to.
pub struct WrappedDemuxer {
    inner: Box<dyn Demuxer>,
    policy: RestartPolicy,
    source: Arc<SourceStream>,
}

impl WrappedDemuxer {
    pub fn create(
        factory: &dyn DemuxerFactory,
        format: StreamFormat,
        source: Arc<SourceStream>,
        out: Arc<FakeEsOut>,
    ) -> Option<Self> {
        let inner = factory.create(format, source.clone(), out)?;
        Some(Self {
            inner,
            policy: RestartPolicy::for_format(format),
            source,
        })
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    pub fn demux(&mut self, deadline: Timestamp) -> DemuxStatus {
        self.inner.demux(deadline)
    }

    /// Pumps the inner demuxer until it has nothing buffered left.
    pub fn drain(&mut self) {
        while self.inner.drain() == DemuxStatus::Success {}
    }

    /// Tears the instance down and leaves the byte stream empty for a
    /// successor instance.
    pub fn destroy(self) {
        let WrappedDemuxer { inner, source, .. } = self;
        drop(inner);
        source.reset();
    }
}

/// Secondary demuxer driven off a master clock (subtitle sidecars). The
/// deadline it is stepped with must only move forward.
pub struct SlaveDemuxer {
    inner: WrappedDemuxer,
    last_deadline: Option<Timestamp>,
}

impl SlaveDemuxer {
    pub fn new(inner: WrappedDemuxer) -> Self {
        Self {
            inner,
            last_deadline: None,
        }
    }

    pub fn demux(&mut self, deadline: Timestamp) -> DemuxStatus {
        if let Some(last) = self.last_deadline {
            if deadline <= last {
                warn!("slave demux deadline moved backwards ({last} -> {deadline})");
                return DemuxStatus::Error;
            }
        }
        self.last_deadline = Some(deadline);
        self.inner.demux(deadline)
    }

    pub fn destroy(self) {
        self.inner.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_per_format() {
        assert!(RestartPolicy::for_format(StreamFormat::MpegTs).can_detect_switches());
        assert!(!RestartPolicy::for_format(StreamFormat::MpegTs).reinits_on_seek());
        assert!(RestartPolicy::for_format(StreamFormat::Mp4).starts_from_zero());
        assert!(RestartPolicy::for_format(StreamFormat::WebVtt).always_restarts());
        assert!(RestartPolicy::for_format(StreamFormat::Unknown).reinits_on_seek());
    }

    struct NoopDemuxer;

    impl Demuxer for NoopDemuxer {
        fn demux(&mut self, _deadline: Timestamp) -> DemuxStatus {
            DemuxStatus::Success
        }

        fn drain(&mut self) -> DemuxStatus {
            DemuxStatus::Eof
        }
    }

    fn wrapped() -> WrappedDemuxer {
        WrappedDemuxer {
            inner: Box::new(NoopDemuxer),
            policy: RestartPolicy::Default,
            source: Arc::new(SourceStream::new()),
        }
    }

    #[test]
    fn test_slave_rejects_non_increasing_deadline() {
        let mut slave = SlaveDemuxer::new(wrapped());
        assert_eq!(slave.demux(Timestamp::from_millis(100)), DemuxStatus::Success);
        assert_eq!(slave.demux(Timestamp::from_millis(100)), DemuxStatus::Error);
        assert_eq!(slave.demux(Timestamp::from_millis(50)), DemuxStatus::Error);
        assert_eq!(slave.demux(Timestamp::from_millis(200)), DemuxStatus::Success);
    }
}
