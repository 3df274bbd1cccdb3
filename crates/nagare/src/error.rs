use thiserror::Error;

#[derive(Error, Debug)]
pub enum NagareError {
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("malformed status line: {0:?}")]
    InvalidStatusLine(String),

    #[error("malformed header line: {0:?}")]
    InvalidHeaderLine(String),

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("connection is already in use")]
    ConnectionBusy,

    #[error("no connection available for request")]
    NoConnection,

    #[error("invalid AES-128 key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("invalid AES-128 IV length: {0} bytes")]
    InvalidIvLength(usize),

    #[error("key fetch failed: {0}")]
    KeyFetch(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),
}

pub type NagareResult<T> = Result<T, NagareError>;
