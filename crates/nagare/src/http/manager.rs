//! Connection pool.
//!
//! Owns every [`Connection`] in the session and arbitrates exclusive use:
//! reuse is a linear scan by (scheme, host, port) with first match winning,
//! creation goes through the pluggable [`ConnectionFactory`]. Local targets
//! are rejected unless local access has been explicitly allowed.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::{
    downloader::Downloader,
    http::{
        connection::{Connection, ConnectionParams},
        source::SourceHandle,
    },
    transport::TransportFactory,
};

/// Receives one sample per completed segment fetch. The adaptive-bitrate
/// logic sits behind this seam.
pub trait DownloadRateObserver: Send + Sync {
    fn on_rate_sample(&self, url: &Url, bytes: u64, elapsed: Duration, latency: Duration);
}

pub trait ConnectionFactory: Send + Sync {
    fn create(&self, params: &ConnectionParams) -> Option<Connection>;
}

pub struct DefaultConnectionFactory {
    transport: Arc<dyn TransportFactory>,
    user_agent: String,
}

impl DefaultConnectionFactory {
    pub fn new(transport: Arc<dyn TransportFactory>, user_agent: impl Into<String>) -> Self {
        Self {
            transport,
            user_agent: user_agent.into(),
        }
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(&self, params: &ConnectionParams) -> Option<Connection> {
        Some(Connection::new(
            self.transport.clone(),
            params,
            self.user_agent.clone(),
        ))
    }
}

pub struct ConnectionManager {
    pool: Mutex<Vec<Arc<Mutex<Connection>>>>,
    factory: Box<dyn ConnectionFactory>,
    downloader: Option<Downloader>,
    rate_observer: Option<Box<dyn DownloadRateObserver>>,
    allow_local: bool,
}

impl ConnectionManager {
    pub fn new(factory: Box<dyn ConnectionFactory>) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            factory,
            downloader: Some(Downloader::new()),
            rate_observer: None,
            allow_local: false,
        }
    }

    /// Drops the background downloader; every chunk source degrades to the
    /// synchronous pull variant.
    pub fn without_downloader(mut self) -> Self {
        self.downloader = None;
        self
    }

    pub fn with_rate_observer(mut self, observer: Box<dyn DownloadRateObserver>) -> Self {
        self.rate_observer = Some(observer);
        self
    }

    pub fn with_local_access(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }

    pub fn downloader(&self) -> Option<&Downloader> {
        self.downloader.as_ref()
    }

    /// Returns a claimed connection for `params`, reusing an idle pooled one
    /// when the authority matches, creating one otherwise. `None` when the
    /// target is local and local access is not allowed, or creation fails.
    pub fn get_connection(&self, params: &ConnectionParams) -> Option<Arc<Mutex<Connection>>> {
        if params.is_local() && !self.allow_local {
            debug!("refusing local access to {}://{}", params.scheme, params.host);
            return None;
        }

        let mut pool = self.pool.lock();
        for conn in pool.iter() {
            // A held connection mutex means a request is in flight on it,
            // so it cannot be reused anyway; never stall the scan on it.
            let Some(mut locked) = conn.try_lock() else {
                continue;
            };
            if locked.can_reuse(params) {
                trace!("reusing connection to {}:{}", params.host, params.port);
                locked.set_used(true);
                return Some(conn.clone());
            }
        }

        let mut created = self.factory.create(params)?;
        if created.prepare(params).is_err() {
            return None;
        }
        let created = Arc::new(Mutex::new(created));
        pool.push(created.clone());
        trace!(
            "created connection to {}:{} (pool size {})",
            params.host,
            params.port,
            pool.len()
        );
        Some(created)
    }

    pub fn close_all_connections(&self) {
        self.pool.lock().clear();
    }

    /// Hands a buffered source to the background downloader. No-op for
    /// synchronous sources.
    pub fn start(&self, source: &SourceHandle) {
        if let (SourceHandle::Buffered(buffered), Some(downloader)) =
            (source, self.downloader.as_ref())
        {
            downloader.schedule(buffered.clone());
        }
    }

    pub fn cancel(&self, source: &SourceHandle) {
        if let (SourceHandle::Buffered(buffered), Some(downloader)) =
            (source, self.downloader.as_ref())
        {
            downloader.cancel(buffered);
        }
    }

    pub fn update_download_rate(
        &self,
        url: &Url,
        bytes: u64,
        elapsed: Duration,
        latency: Duration,
    ) {
        if let Some(observer) = self.rate_observer.as_ref() {
            observer.on_rate_sample(url, bytes, elapsed, latency);
        }
    }
}
