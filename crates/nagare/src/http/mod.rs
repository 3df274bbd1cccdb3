pub mod connection;
pub mod manager;
pub mod source;

pub use connection::{Connection, ConnectionParams, RequestStatus, MAX_REDIRECTS};
pub use manager::{ConnectionFactory, ConnectionManager, DownloadRateObserver};
pub use source::{ChunkSource, SourceHandle, CHUNK_SIZE};
