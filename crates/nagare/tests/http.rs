//! End-to-end HTTP tests against a real loopback server.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use nagare::{
    http::{
        manager::{ConnectionManager, DefaultConnectionFactory},
        source::{ChunkSource, HttpChunkSource},
        ConnectionParams, RequestStatus,
    },
    transport::TcpTransportFactory,
    types::{ByteRange, ChunkType},
};
use url::Url;

fn manager() -> Arc<ConnectionManager> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Arc::new(
        ConnectionManager::new(Box::new(DefaultConnectionFactory::new(
            Arc::new(TcpTransportFactory),
            "nagare/0.1",
        )))
        .without_downloader(),
    )
}

/// Reads one request head off the stream, `None` on a closed connection.
fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

#[test]
fn test_fetches_exact_body() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_request(&mut stream).unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nABCD")
            .unwrap();
        head
    });

    let url = Url::parse(&format!("http://{addr}/seg1.ts")).unwrap();
    let source = HttpChunkSource::new(manager(), url, None, ChunkType::Segment);
    let data = source.read_block().unwrap();
    assert_eq!(&data[..], b"ABCD");
    assert!(!source.has_more_data());
    assert_eq!(source.request_status(), Some(RequestStatus::Success));

    let head = server.join().unwrap();
    assert!(head.starts_with("GET /seg1.ts HTTP/1.1\r\n"));
    assert!(head.contains("Cache-Control: no-cache\r\n"));
    assert!(head.contains("Accept-Encoding: \r\n"));
    assert!(head.contains("User-Agent: nagare/0.1\r\n"));
}

#[test]
fn test_byte_range_request_delivers_exact_slice() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_request(&mut stream).unwrap();
        stream
            .write_all(b"HTTP/1.1 206 Partial Content\r\nContent-Length: 10\r\n\r\n0123456789")
            .unwrap();
        head
    });

    let url = Url::parse(&format!("http://{addr}/seg1.ts")).unwrap();
    let source = HttpChunkSource::new(
        manager(),
        url,
        Some(ByteRange::new(10, Some(19))),
        ChunkType::Segment,
    );
    let data = source.read_block().unwrap();
    assert_eq!(&data[..], b"0123456789");
    assert!(!source.has_more_data());

    let head = server.join().unwrap();
    assert!(head.contains("Range: bytes=10-19\r\n"));
}

#[test]
fn test_redirect_cap_issues_exactly_three_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut requests = 0u32;
        // The client tears the connection down after each redirect (nothing
        // kept alive to reuse), so every hop is a fresh accept.
        for hop in 0..3 {
            let (mut stream, _) = listener.accept().unwrap();
            if read_request(&mut stream).is_none() {
                break;
            }
            requests += 1;
            let response = format!(
                "HTTP/1.1 302 Found\r\nLocation: http://{addr}/hop{hop}\r\nContent-Length: 0\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).unwrap();
        }
        requests
    });

    let url = Url::parse(&format!("http://{addr}/seg1.ts")).unwrap();
    let source = HttpChunkSource::new(manager(), url, None, ChunkType::Segment);
    let data = source.read_block().unwrap();
    assert!(data.is_empty());
    assert_eq!(source.request_status(), Some(RequestStatus::GenericError));
    assert_eq!(server.join().unwrap(), 3);
}

#[test]
fn test_missing_segment_reports_not_found() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream).unwrap();
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let url = Url::parse(&format!("http://{addr}/gone.ts")).unwrap();
    let source = HttpChunkSource::new(manager(), url, None, ChunkType::Segment);
    let data = source.read_block().unwrap();
    assert!(data.is_empty());
    assert!(!source.has_more_data());
    assert_eq!(source.request_status(), Some(RequestStatus::NotFound));
    server.join().unwrap();
}

#[test]
fn test_connection_claims_are_exclusive() {
    let manager = manager();
    let params =
        ConnectionParams::from_url(&Url::parse("http://198.51.100.1/seg.ts").unwrap()).unwrap();

    let first = manager.get_connection(&params).unwrap();
    let second = manager.get_connection(&params).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    // Releasing puts the connection back into rotation.
    first.lock().set_used(false);
    let third = manager.get_connection(&params).unwrap();
    assert!(Arc::ptr_eq(&first, &third));
}

#[test]
fn test_pool_scan_skips_connections_with_requests_in_flight() {
    let manager = manager();
    let busy_params =
        ConnectionParams::from_url(&Url::parse("http://198.51.100.1/seg.ts").unwrap()).unwrap();
    let busy = manager.get_connection(&busy_params).unwrap();
    // Simulates a socket read in flight on the pooled connection.
    let _reading = busy.lock();

    // Another authority must be reachable without waiting on that read.
    let other_params =
        ConnectionParams::from_url(&Url::parse("http://198.51.100.2/seg.ts").unwrap()).unwrap();
    assert!(manager.get_connection(&other_params).is_some());

    // Same authority too: the held connection is simply not reusable.
    let fresh = manager.get_connection(&busy_params).unwrap();
    assert!(!Arc::ptr_eq(&busy, &fresh));
}

#[test]
fn test_local_targets_are_refused_by_default() {
    let manager = manager();
    let params =
        ConnectionParams::from_url(&Url::parse("file:///media/seg.ts").unwrap()).unwrap();
    assert!(params.is_local());
    assert!(manager.get_connection(&params).is_none());
}
