pub mod chunk;
pub mod decrypt;
pub mod demux;
pub mod downloader;
pub mod error;
pub mod es_out;
pub mod http;
pub mod stream;
pub mod tracker;
pub mod transport;
pub mod types;

/// ┌──────────────────┐  next_chunk   ┌───────────────┐  schedule  ┌────────────────┐
/// │                  ├───────────────►               ├────────────►                │
/// │  SegmentTracker  │               │  SegmentChunk │            │   Downloader   │
/// │   (timeline)     │   events      │   (buffered   │  quanta    │ [Mutex+Condvar]│
/// │                  ◄───────────────┤    source)    ◄────────────┤                │
/// └──────────────────┘               └───────┬───────┘            └────────────────┘
///                                            │ blocks
///                                    ┌───────▼───────┐   demux    ┌────────────────┐
///                                    │  SourceStream ├────────────►   FakeEsOut    │
///                                    │  (byte view)  │  commands  │ [CommandsQueue]│
///                                    └───────────────┘            └───────┬────────┘
///                                                                         │ process
///                                                                 ┌───────▼────────┐
///                                                                 │   real EsOut   │
///                                                                 └────────────────┘
pub use error::{NagareError, NagareResult};
pub use stream::{BufferingStatus, DequeueStatus, Stream};
pub use types::{ByteRange, ChunkType, StreamFormat, Timestamp};
