//! Reusable request/response channel to one host.
//!
//! A `Connection` is an exclusive-use resource: `prepare` claims it for one
//! request and `set_used(false)` releases it. A half-read keep-alive
//! connection cannot safely be reused (the next reader would desync
//! mid-body), so release forcibly disconnects unless the previous response
//! was fully consumed.

use std::{io::Write, sync::Arc};

use tracing::{trace, warn};
use url::Url;

use crate::{
    error::{NagareError, NagareResult},
    transport::{Transport, TransportFactory},
    types::ByteRange,
};

pub const MAX_REDIRECTS: usize = 3;

/// Maximum accepted size of a response status line + header block.
const MAX_HEADER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Redirection,
    Unauthorized,
    NotFound,
    GenericError,
}

/// Identity and request target of one HTTP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ConnectionParams {
    pub fn from_url(url: &Url) -> NagareResult<Self> {
        let scheme = url.scheme().to_string();
        if !matches!(scheme.as_str(), "http" | "https" | "file") {
            return Err(NagareError::UnsupportedScheme(scheme));
        }
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url
            .port()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Local targets are rejected by the manager unless explicitly allowed.
    pub fn is_local(&self) -> bool {
        self.scheme == "file" || self.host.is_empty()
    }

    pub fn same_authority(&self, other: &ConnectionParams) -> bool {
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

pub struct Connection {
    factory: Arc<dyn TransportFactory>,
    scheme: String,
    host: String,
    port: u16,
    user_agent: String,

    transport: Option<Box<dyn Transport>>,
    /// Mutual-exclusion flag: at most one borrower at a time.
    available: bool,
    /// Whether we announce `Connection: close` on the next request.
    connection_close: bool,
    /// Negotiated per response; HTTP/1.1 defaults to persistent.
    keep_alive: bool,
    /// The transport was freshly connected for the current request (a stale
    /// keep-alive reuse is the only case worth a forced-close retry).
    fresh: bool,

    content_length: u64,
    bytes_read: u64,
    body_eof: bool,
    bytes_range: Option<ByteRange>,
    location: Option<String>,
    content_type: Option<String>,
}

impl Connection {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        params: &ConnectionParams,
        user_agent: String,
    ) -> Self {
        Self {
            factory,
            scheme: params.scheme.clone(),
            host: params.host.clone(),
            port: params.port,
            user_agent,
            transport: None,
            available: true,
            connection_close: false,
            keep_alive: true,
            fresh: false,
            content_length: 0,
            bytes_read: 0,
            body_eof: false,
            bytes_range: None,
            location: None,
            content_type: None,
        }
    }

    pub fn can_reuse(&self, params: &ConnectionParams) -> bool {
        self.available
            && self.scheme == params.scheme
            && self.host == params.host
            && self.port == params.port
    }

    /// Claims the connection for one request. Fails if already in use.
    pub fn prepare(&mut self, params: &ConnectionParams) -> NagareResult<()> {
        if !self.available {
            return Err(NagareError::ConnectionBusy);
        }
        if self.scheme != params.scheme || self.host != params.host || self.port != params.port {
            return Err(NagareError::NoConnection);
        }
        self.available = false;
        Ok(())
    }

    pub fn set_used(&mut self, used: bool) {
        if used {
            self.available = false;
            return;
        }
        self.available = true;
        // A partially read keep-alive body would desync the next reader.
        if !(self.keep_alive && self.fully_consumed()) {
            self.disconnect();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Raw `Location` header of the last redirect response.
    pub fn redirect_location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Issues the request line + headers and parses the response head.
    pub fn request(
        &mut self,
        path: &str,
        byte_range: Option<ByteRange>,
    ) -> NagareResult<RequestStatus> {
        self.content_length = 0;
        self.bytes_read = 0;
        self.body_eof = false;
        self.location = None;
        self.content_type = None;
        self.bytes_range = byte_range;
        // Persistence is renegotiated per response; a forced close from an
        // earlier retry must not outlive the request it rescued.
        self.keep_alive = true;
        self.connection_close = false;

        match self.exchange(path, byte_range) {
            Ok(status) => Ok(status),
            Err(e) if !self.fresh => {
                // Keep-alive servers may silently close between requests.
                // Retry exactly once over a fresh, non-persistent connection.
                warn!("request on reused connection failed ({e}), retrying with forced close");
                self.disconnect();
                self.connection_close = true;
                self.exchange(path, byte_range)
            }
            Err(e) => Err(e),
        }
    }

    fn exchange(
        &mut self,
        path: &str,
        byte_range: Option<ByteRange>,
    ) -> NagareResult<RequestStatus> {
        if self.transport.is_none() {
            self.transport = Some(self.factory.connect(&self.host, self.port)?);
            self.fresh = true;
        } else {
            self.fresh = false;
        }

        let request = self.format_request(path, byte_range);
        trace!("request to {}:{}: {:?}", self.host, self.port, request);

        let transport = self.transport.as_mut().ok_or(NagareError::NoConnection)?;
        let written = transport
            .write_all(request.as_bytes())
            .and_then(|_| transport.flush());
        if let Err(e) = written {
            self.disconnect();
            return Err(e.into());
        }

        let head = match self.read_head() {
            Ok(head) => head,
            Err(e) => {
                self.disconnect();
                return Err(e);
            }
        };
        self.parse_head(&head)
    }

    /// Byte-exact request shape; `Connection: close` only when this
    /// connection is not meant to be kept alive.
    fn format_request(&self, path: &str, byte_range: Option<ByteRange>) -> String {
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Cache-Control: no-cache\r\n\
             Accept-Encoding: \r\n\
             User-Agent: {}\r\n",
            path, self.host, self.user_agent
        );
        if let Some(range) = byte_range {
            request.push_str(&format!("Range: {}\r\n", range.to_header_value()));
        }
        if self.connection_close {
            request.push_str("Connection: close\r\n");
        }
        request.push_str("\r\n");
        request
    }

    /// Reads up to and including the blank line terminating the header block.
    fn read_head(&mut self) -> NagareResult<String> {
        let transport = self.transport.as_mut().ok_or(NagareError::NoConnection)?;
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_HEADER_BYTES {
                return Err(NagareError::InvalidHeaderLine("header block too large".into()));
            }
            let n = transport.read(&mut byte)?;
            if n == 0 {
                return Err(NagareError::InvalidStatusLine(
                    String::from_utf8_lossy(&head).into_owned(),
                ));
            }
            head.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&head).into_owned())
    }

    fn parse_head(&mut self, head: &str) -> NagareResult<RequestStatus> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let code = status_line
            .strip_prefix("HTTP/1.1 ")
            .and_then(|rest| rest.get(..3))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| NagareError::InvalidStatusLine(status_line.to_string()))?;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(NagareError::InvalidHeaderLine(line.to_string()));
            };
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => {
                    self.content_length = value.parse().unwrap_or(0);
                }
                "location" => {
                    self.location = Some(value.to_string());
                }
                "content-type" => {
                    self.content_type = Some(value.to_string());
                }
                "connection" => {
                    if value.eq_ignore_ascii_case("close") {
                        self.keep_alive = false;
                    }
                }
                _ => {}
            }
        }
        if self.connection_close {
            self.keep_alive = false;
        }

        Ok(match code {
            200 | 206 => RequestStatus::Success,
            301 | 302 | 303 | 307 | 308 if self.location.is_some() => RequestStatus::Redirection,
            401 => RequestStatus::Unauthorized,
            404 => RequestStatus::NotFound,
            _ => RequestStatus::GenericError,
        })
    }

    /// Reads at most `buf.len()` bytes, clipped to the remaining declared
    /// content length. `Ok(0)` signals end of body.
    pub fn read(&mut self, buf: &mut [u8]) -> NagareResult<usize> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(0);
        };

        let max = if self.content_length > 0 {
            let remaining = self.content_length.saturating_sub(self.bytes_read);
            (buf.len() as u64).min(remaining) as usize
        } else {
            buf.len()
        };
        if max == 0 {
            self.finish_body();
            return Ok(0);
        }

        let n = match transport.read(&mut buf[..max]) {
            Ok(n) => n,
            Err(e) => {
                self.disconnect();
                return Err(e.into());
            }
        };
        self.bytes_read += n as u64;

        if n == 0 {
            self.body_eof = true;
            self.finish_body();
        } else if self.content_length > 0 && self.bytes_read >= self.content_length {
            self.finish_body();
        }
        Ok(n)
    }

    fn fully_consumed(&self) -> bool {
        self.content_length > 0 && self.bytes_read >= self.content_length
    }

    fn finish_body(&mut self) {
        // Unknown-length bodies end at connection close, so there is nothing
        // left to keep alive in that case.
        if !(self.keep_alive && self.fully_consumed()) {
            self.disconnect();
        }
    }

    fn disconnect(&mut self) {
        self.transport = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{
        collections::VecDeque,
        io::{self, Read},
    };

    struct ScriptedTransport {
        input: io::Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        fail_write: bool,
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_write {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            self.written.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        responses: Mutex<VecDeque<(Vec<u8>, bool)>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedFactory {
        fn new(responses: Vec<(&[u8], bool)>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|(data, fail)| (data.to_vec(), fail))
                        .collect(),
                ),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl TransportFactory for ScriptedFactory {
        fn connect(&self, _host: &str, _port: u16) -> NagareResult<Box<dyn Transport>> {
            let (input, fail_write) = self
                .responses
                .lock()
                .pop_front()
                .expect("unexpected connect");
            Ok(Box::new(ScriptedTransport {
                input: io::Cursor::new(input),
                written: self.written.clone(),
                fail_write,
            }))
        }
    }

    fn params() -> ConnectionParams {
        ConnectionParams::from_url(&Url::parse("http://example.com/seg1.ts").unwrap()).unwrap()
    }

    fn connection(factory: Arc<ScriptedFactory>) -> Connection {
        Connection::new(factory, &params(), "nagare/0.1".to_string())
    }

    #[test]
    fn test_request_shape() {
        let factory = Arc::new(ScriptedFactory::new(vec![(
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nABCD",
            false,
        )]));
        let mut conn = connection(factory.clone());
        conn.prepare(&params()).unwrap();
        let status = conn.request("/seg1.ts", None).unwrap();
        assert_eq!(status, RequestStatus::Success);
        assert_eq!(
            String::from_utf8(factory.written.lock().clone()).unwrap(),
            "GET /seg1.ts HTTP/1.1\r\n\
             Host: example.com\r\n\
             Cache-Control: no-cache\r\n\
             Accept-Encoding: \r\n\
             User-Agent: nagare/0.1\r\n\r\n"
        );
    }

    #[test]
    fn test_request_shape_with_range() {
        let factory = Arc::new(ScriptedFactory::new(vec![(
            b"HTTP/1.1 206 Partial Content\r\nContent-Length: 10\r\n\r\n0123456789",
            false,
        )]));
        let mut conn = connection(factory.clone());
        conn.prepare(&params()).unwrap();
        let status = conn
            .request("/seg1.ts", Some(ByteRange::new(10, Some(19))))
            .unwrap();
        assert_eq!(status, RequestStatus::Success);
        let written = String::from_utf8(factory.written.lock().clone()).unwrap();
        assert!(written.contains("Range: bytes=10-19\r\n"));
    }

    #[test]
    fn test_read_clipped_to_content_length() {
        // Extra bytes after the body must stay on the wire.
        let factory = Arc::new(ScriptedFactory::new(vec![(
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nABCDEXTRA",
            false,
        )]));
        let mut conn = connection(factory);
        conn.prepare(&params()).unwrap();
        conn.request("/seg1.ts", None).unwrap();

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ABCD");
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_prepare_busy() {
        let factory = Arc::new(ScriptedFactory::new(vec![]));
        let mut conn = connection(factory);
        conn.prepare(&params()).unwrap();
        assert!(matches!(
            conn.prepare(&params()),
            Err(NagareError::ConnectionBusy)
        ));
        conn.set_used(false);
        assert!(conn.prepare(&params()).is_ok());
    }

    #[test]
    fn test_redirect_location() {
        let factory = Arc::new(ScriptedFactory::new(vec![(
            b"HTTP/1.1 302 Found\r\nLocation: http://cdn.example.com/seg1.ts\r\n\r\n",
            false,
        )]));
        let mut conn = connection(factory);
        conn.prepare(&params()).unwrap();
        let status = conn.request("/seg1.ts", None).unwrap();
        assert_eq!(status, RequestStatus::Redirection);
        assert_eq!(
            conn.redirect_location(),
            Some("http://cdn.example.com/seg1.ts")
        );
    }

    #[test]
    fn test_malformed_status_line() {
        let factory = Arc::new(ScriptedFactory::new(vec![(
            b"ICY 200 OK\r\n\r\n",
            false,
        )]));
        let mut conn = connection(factory);
        conn.prepare(&params()).unwrap();
        assert!(matches!(
            conn.request("/seg1.ts", None),
            Err(NagareError::InvalidStatusLine(_))
        ));
    }

    #[test]
    fn test_keep_alive_reuse_after_full_read() {
        let factory = Arc::new(ScriptedFactory::new(vec![(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK\
              HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nGO",
            false,
        )]));
        let mut conn = connection(factory);
        conn.prepare(&params()).unwrap();
        conn.request("/a.ts", None).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        conn.set_used(false);

        // Second request runs over the same transport; no new connect.
        conn.prepare(&params()).unwrap();
        assert_eq!(conn.request("/b.ts", None).unwrap(), RequestStatus::Success);
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"GO");
    }

    #[test]
    fn test_write_failure_retries_once_with_forced_close() {
        let factory = Arc::new(ScriptedFactory::new(vec![
            (b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK" as &[u8], false),
            // Reused transport dies on write; the retry gets a fresh one.
            (b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nGO", false),
        ]));
        let mut conn = connection(factory.clone());
        conn.prepare(&params()).unwrap();
        conn.request("/a.ts", None).unwrap();
        let mut buf = [0u8; 8];
        conn.read(&mut buf).unwrap();
        conn.set_used(false);

        // Simulate the server silently closing the kept-alive transport:
        // the first (reused) exchange fails at the read of the status line
        // because the scripted input is exhausted.
        conn.prepare(&params()).unwrap();
        assert_eq!(conn.request("/b.ts", None).unwrap(), RequestStatus::Success);
        let written = String::from_utf8(factory.written.lock().clone()).unwrap();
        assert!(written.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_forced_close_does_not_latch_across_requests() {
        let factory = Arc::new(ScriptedFactory::new(vec![
            (b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK" as &[u8], false),
            // Transport for the forced-close retry after the stale reuse.
            (b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nGO", false),
            (b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nHI", false),
        ]));
        let mut conn = connection(factory.clone());
        let mut buf = [0u8; 8];

        conn.prepare(&params()).unwrap();
        conn.request("/a.ts", None).unwrap();
        conn.read(&mut buf).unwrap();
        conn.set_used(false);

        // Stale keep-alive reuse fails and triggers the forced-close retry.
        conn.prepare(&params()).unwrap();
        conn.request("/b.ts", None).unwrap();
        conn.read(&mut buf).unwrap();
        conn.set_used(false);

        // The next request starts clean: persistent again, no forced close.
        conn.prepare(&params()).unwrap();
        assert_eq!(conn.request("/c.ts", None).unwrap(), RequestStatus::Success);
        let written = String::from_utf8(factory.written.lock().clone()).unwrap();
        let last = &written[written.rfind("GET /c.ts").unwrap()..];
        assert!(!last.contains("Connection: close"));
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HI");
    }
}
