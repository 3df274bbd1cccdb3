//! Byte-stream socket abstraction.
//!
//! The engine issues its HTTP requests over a connected, reliable byte
//! stream. TLS and socket-level timeouts stay on the other side of this
//! seam; callers that need them plug in their own [`TransportFactory`].

use std::{
    io::{Read, Write},
    net::TcpStream,
};

use crate::error::NagareResult;

/// A connected, reliable byte stream.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

pub trait TransportFactory: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> NagareResult<Box<dyn Transport>>;
}

/// Plain TCP transport.
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn connect(&self, host: &str, port: u16) -> NagareResult<Box<dyn Transport>> {
        let stream = TcpStream::connect((host, port))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}
