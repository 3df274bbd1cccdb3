//! Ordered queue of buffered elementary-stream output commands.
//!
//! Demuxed output is staged here (uncommitted), committed so buffering-level
//! queries see it, and processed out to the real output up to a deadline.
//! The queue carries the per-stream output state machine:
//! `Normal -> Draining -> (empty & EOF ? terminal EOF : Normal)`, with an
//! orthogonal `dropping` mode used while discarding a demuxer's teardown
//! commands during a forced restart.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::{es_out::EsOut, types::Timestamp};

/// Opaque per-elementary-stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EsIdentifier(pub(crate) u64);

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddEs { id: EsIdentifier },
    Send { id: EsIdentifier, ts: Timestamp, data: Bytes },
    DelEs { id: EsIdentifier },
    Flush,
}

impl Command {
    /// Presentation timestamp gating the command; control commands run when
    /// they reach the head of the queue.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Command::Send { ts, .. } => Some(*ts),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct CommandsQueue {
    incoming: VecDeque<Command>,
    commands: VecDeque<Command>,
    /// Highest committed timestamp; the buffering ceiling.
    buffering_level: Option<Timestamp>,
    first_ts: Option<Timestamp>,
    pcr: Option<Timestamp>,
    draining: bool,
    dropping: bool,
    eof: bool,
}

impl CommandsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a command. Dropped while `dropping` is set or after EOF
    /// (terminal until an explicit reset).
    pub fn push(&mut self, command: Command) {
        if self.eof || self.dropping {
            trace!("dropping command in {} state", if self.eof { "eof" } else { "dropping" });
            return;
        }
        self.incoming.push_back(command);
    }

    /// Publishes staged commands so PCR/buffering queries reflect them.
    pub fn commit(&mut self) {
        while let Some(command) = self.incoming.pop_front() {
            if let Some(ts) = command.timestamp() {
                if self.first_ts.is_none() {
                    self.first_ts = Some(ts);
                }
                self.buffering_level = Some(self.buffering_level.map_or(ts, |level| level.max(ts)));
            }
            self.commands.push_back(command);
        }
    }

    /// Discards queued commands. With `reset`, accumulated buffering/PCR
    /// bookkeeping is cleared too (seeks, stream disable); otherwise the
    /// buffering ceiling falls back to the last forwarded position.
    pub fn abort(&mut self, reset: bool) {
        self.incoming.clear();
        self.commands.clear();
        if reset {
            self.buffering_level = None;
            self.first_ts = None;
            self.pcr = None;
            self.eof = false;
            self.draining = false;
            self.dropping = false;
        } else {
            self.buffering_level = self.pcr;
        }
    }

    /// Forwards every committed command due at `deadline` to `out`,
    /// advancing the reported PCR to the last forwarded timestamp, or to
    /// `deadline` when nothing was due.
    pub fn process(&mut self, out: &mut dyn EsOut, deadline: Timestamp) -> Option<Timestamp> {
        let mut last_forwarded = None;
        while let Some(front) = self.commands.front() {
            if let Some(ts) = front.timestamp() {
                if ts > deadline {
                    break;
                }
                last_forwarded = Some(ts);
            }
            match self.commands.pop_front().expect("front checked") {
                Command::AddEs { id } => out.add_es(id),
                Command::Send { id, ts, data } => out.send(id, ts, data),
                Command::DelEs { id } => out.del_es(id),
                Command::Flush => out.flush(),
            }
        }
        let advanced = last_forwarded.unwrap_or(deadline);
        self.pcr = Some(self.pcr.map_or(advanced, |pcr| pcr.max(advanced)));
        self.pcr
    }

    /// Queue-resident duration: the committed ceiling minus the position
    /// already pushed downstream. The core buffering metric.
    pub fn demuxed_amount(&self) -> Timestamp {
        let base = self.pcr.or(self.first_ts);
        match (self.buffering_level, base) {
            (Some(level), Some(base)) if level > base => level - base,
            _ => Timestamp::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.commands.is_empty()
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn set_dropping(&mut self, dropping: bool) {
        self.dropping = dropping;
    }

    pub fn set_eof(&mut self, eof: bool) {
        self.eof = eof;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn pcr(&self) -> Option<Timestamp> {
        self.pcr
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.first_ts
    }

    pub fn buffering_level(&self) -> Option<Timestamp> {
        self.buffering_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::es_out::testing::RecordingOut;

    fn send(seq: u64, ms: i64) -> Command {
        Command::Send {
            id: EsIdentifier(seq),
            ts: Timestamp::from_millis(ms),
            data: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_uncommitted_commands_are_invisible() {
        let mut queue = CommandsQueue::new();
        queue.push(send(0, 100));
        assert_eq!(queue.demuxed_amount(), Timestamp::ZERO);
        assert!(queue.buffering_level().is_none());

        queue.commit();
        assert_eq!(queue.buffering_level(), Some(Timestamp::from_millis(100)));
    }

    #[test]
    fn test_process_forwards_up_to_deadline() {
        let mut queue = CommandsQueue::new();
        queue.push(Command::AddEs { id: EsIdentifier(0) });
        queue.push(send(0, 100));
        queue.push(send(0, 200));
        queue.push(send(0, 300));
        queue.commit();

        let mut out = RecordingOut::default();
        let pcr = queue.process(&mut out, Timestamp::from_millis(200));
        assert_eq!(pcr, Some(Timestamp::from_millis(200)));
        // AddEs + the two due sends forwarded; the 300ms send stays queued.
        assert_eq!(out.events.len(), 3);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_process_advances_pcr_to_deadline_when_idle() {
        let mut queue = CommandsQueue::new();
        let mut out = RecordingOut::default();
        let pcr = queue.process(&mut out, Timestamp::from_millis(500));
        assert_eq!(pcr, Some(Timestamp::from_millis(500)));
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_demuxed_amount_tracks_pcr() {
        let mut queue = CommandsQueue::new();
        queue.push(send(0, 100));
        queue.push(send(0, 800));
        queue.commit();
        assert_eq!(queue.demuxed_amount(), Timestamp::from_millis(700));

        // The 100ms send is due and forwarded; PCR tracks the forwarded
        // timestamp, not the deadline.
        let mut out = RecordingOut::default();
        queue.process(&mut out, Timestamp::from_millis(400));
        assert_eq!(queue.pcr(), Some(Timestamp::from_millis(100)));
        assert_eq!(queue.demuxed_amount(), Timestamp::from_millis(700));

        // With nothing due, PCR advances to the deadline instead.
        queue.process(&mut out, Timestamp::from_millis(500));
        assert_eq!(queue.pcr(), Some(Timestamp::from_millis(500)));
        assert_eq!(queue.demuxed_amount(), Timestamp::from_millis(300));
    }

    #[test]
    fn test_eof_is_terminal_until_reset() {
        let mut queue = CommandsQueue::new();
        queue.set_eof(true);
        queue.push(send(0, 100));
        queue.commit();
        assert!(queue.is_empty());

        queue.abort(true);
        assert!(!queue.is_eof());
        queue.push(send(0, 100));
        queue.commit();
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_dropping_discards_commands() {
        let mut queue = CommandsQueue::new();
        queue.set_dropping(true);
        queue.push(send(0, 100));
        queue.set_dropping(false);
        queue.push(send(0, 200));
        queue.commit();

        let mut out = RecordingOut::default();
        queue.process(&mut out, Timestamp::from_millis(1000));
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn test_abort_without_reset_keeps_pcr() {
        let mut queue = CommandsQueue::new();
        queue.push(send(0, 100));
        queue.commit();
        let mut out = RecordingOut::default();
        queue.process(&mut out, Timestamp::from_millis(100));

        queue.abort(false);
        assert_eq!(queue.pcr(), Some(Timestamp::from_millis(100)));
        assert_eq!(queue.buffering_level(), Some(Timestamp::from_millis(100)));
        assert_eq!(queue.demuxed_amount(), Timestamp::ZERO);
    }
}
