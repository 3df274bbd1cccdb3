mod commands;
mod fake;

pub use commands::{Command, CommandsQueue, EsIdentifier};
pub use fake::{EsOutSink, FakeEsOut};

use bytes::Bytes;

use crate::types::Timestamp;

/// The real downstream output the committed commands are forwarded to.
pub trait EsOut: Send {
    fn add_es(&mut self, id: EsIdentifier);
    fn send(&mut self, id: EsIdentifier, ts: Timestamp, data: Bytes);
    fn del_es(&mut self, id: EsIdentifier);
    fn flush(&mut self);
    fn set_display_time(&mut self, _ts: Timestamp) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum OutEvent {
        AddEs(EsIdentifier),
        Send(EsIdentifier, Timestamp, Bytes),
        DelEs(EsIdentifier),
        Flush,
    }

    /// Records forwarded commands for assertions.
    #[derive(Default)]
    pub struct RecordingOut {
        pub events: Vec<OutEvent>,
        pub display_times: Vec<Timestamp>,
    }

    impl EsOut for RecordingOut {
        fn add_es(&mut self, id: EsIdentifier) {
            self.events.push(OutEvent::AddEs(id));
        }

        fn send(&mut self, id: EsIdentifier, ts: Timestamp, data: Bytes) {
            self.events.push(OutEvent::Send(id, ts, data));
        }

        fn del_es(&mut self, id: EsIdentifier) {
            self.events.push(OutEvent::DelEs(id));
        }

        fn flush(&mut self) {
            self.events.push(OutEvent::Flush);
        }

        fn set_display_time(&mut self, ts: Timestamp) {
            self.display_times.push(ts);
        }
    }
}
