use std::{
    fmt,
    ops::{Add, AddAssign, Sub},
    time::Duration,
};

/// Media time in microseconds. Used both for absolute presentation
/// timestamps and for buffering spans; `None` at call sites means
/// "no clock yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub const fn from_millis(ms: i64) -> Self {
        Self(ms * 1_000)
    }

    pub const fn from_secs(s: i64) -> Self {
        Self(s * 1_000_000)
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000
    }

    pub fn saturating_sub(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.0).max(0))
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl AddAssign for Timestamp {
    fn add_assign(&mut self, rhs: Timestamp) {
        self.0 += rhs.0;
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0 - rhs.0)
    }
}

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Timestamp(d.as_micros() as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// What a chunk fetch is for. Only `Segment` fetches feed the download-rate
/// estimation; metadata fetches are not representative of sustained
/// throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Segment,
    Init,
    Index,
    Playlist,
    Key,
}

/// Container format of an elementary stream, as announced by the segment
/// tracker. Closed set: the demuxer factory keys its restart policy on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamFormat {
    MpegTs,
    Mp4,
    WebVtt,
    #[default]
    Unknown,
    Unsupported,
}

impl StreamFormat {
    pub fn from_mime_type(mime_type: &str) -> Self {
        match mime_type {
            "video/mp2t" => Self::MpegTs,
            "video/mp4" | "audio/mp4" | "video/iso.segment" => Self::Mp4,
            "text/vtt" => Self::WebVtt,
            _ => Self::Unknown,
        }
    }
}

/// Inclusive HTTP byte range. `end == None` means "to end of resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered, when the range is bounded.
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    pub fn to_header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}
