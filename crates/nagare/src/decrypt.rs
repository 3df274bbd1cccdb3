//! AES-128-CBC segment decryption and the key cache.
//!
//! A [`DecryptSession`] is carried across the blocks of one chunk: the CBC
//! state chains from block to block, a carry buffer absorbs non-16-aligned
//! reads, and PKCS#7 padding is stripped only on the final block after full
//! validation. Decrypt failures degrade silently to empty/unmodified output
//! (the demuxer sees truncated data rather than a fault) but are logged.

use std::{collections::VecDeque, sync::Arc};

use aes::cipher::{generic_array::GenericArray, BlockDecryptMut, KeyIvInit};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;
use url::Url;

use crate::{
    error::{NagareError, NagareResult},
    http::{
        manager::ConnectionManager,
        source::{ChunkSource, HttpChunkSource},
    },
    types::ChunkType,
};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const AES_BLOCK: usize = 16;

pub struct DecryptSession {
    cipher: Aes128CbcDec,
    /// Ciphertext carry: the unaligned tail plus one withheld cipher block,
    /// so the PKCS#7 pad block is never emitted before we know it is last.
    carry: Vec<u8>,
    degraded: bool,
}

impl DecryptSession {
    pub fn new(key: &[u8], iv: [u8; 16]) -> NagareResult<Self> {
        let key: [u8; 16] = key
            .try_into()
            .map_err(|_| NagareError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            cipher: Aes128CbcDec::new(&key.into(), &iv.into()),
            carry: Vec::new(),
            degraded: false,
        })
    }

    /// Decrypts one downloaded block. `last` must be true for the final
    /// block of the chunk (possibly with empty `data`).
    pub fn decrypt(&mut self, data: &[u8], last: bool) -> Bytes {
        if self.degraded {
            return Bytes::new();
        }
        self.carry.extend_from_slice(data);

        let usable = if last {
            if self.carry.is_empty() {
                return Bytes::new();
            }
            if self.carry.len() % AES_BLOCK != 0 {
                warn!(
                    "ciphertext not block aligned ({} bytes), dropping chunk remainder",
                    self.carry.len()
                );
                self.degraded = true;
                self.carry.clear();
                return Bytes::new();
            }
            self.carry.len()
        } else {
            // Withhold one block beyond alignment; it may be the pad block.
            (self.carry.len() / AES_BLOCK * AES_BLOCK).saturating_sub(AES_BLOCK)
        };

        let mut out: Vec<u8> = self.carry.drain(..usable).collect();
        for block in out.chunks_exact_mut(AES_BLOCK) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        if last {
            strip_pkcs7(&mut out);
        }
        Bytes::from(out)
    }
}

/// Validated PKCS#7 strip: the trailing pad byte names the pad length and
/// every pad byte must equal it. On mismatch the data is left unmodified in
/// length (never guess how much to cut).
fn strip_pkcs7(data: &mut Vec<u8>) {
    let Some(&pad) = data.last() else {
        return;
    };
    let pad = pad as usize;
    if pad == 0 || pad > AES_BLOCK || pad > data.len() {
        warn!("invalid pkcs7 pad length {pad}, leaving data unmodified");
        return;
    }
    if data[data.len() - pad..].iter().any(|&b| b != pad as u8) {
        warn!("corrupt pkcs7 padding, leaving data unmodified");
        return;
    }
    data.truncate(data.len() - pad);
}

/// Parses a playlist IV attribute (`0x`-prefixed hex) into a 16-byte IV.
pub fn parse_iv(value: &str) -> NagareResult<[u8; 16]> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let raw = hex::decode(digits)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| NagareError::InvalidIvLength(raw.len()))
}

/// Fetches raw key material for a key URI. The default loader goes through
/// the connection manager; tests plug their own.
pub trait KeyLoader: Send + Sync {
    fn load(&self, uri: &Url) -> NagareResult<Vec<u8>>;
}

pub struct HttpKeyLoader {
    manager: Arc<ConnectionManager>,
}

impl HttpKeyLoader {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

impl KeyLoader for HttpKeyLoader {
    fn load(&self, uri: &Url) -> NagareResult<Vec<u8>> {
        let source = HttpChunkSource::new(self.manager.clone(), uri.clone(), None, ChunkType::Key);
        let mut data = Vec::new();
        loop {
            let chunk = source.read(512)?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        if data.is_empty() {
            return Err(NagareError::KeyFetch(uri.to_string()));
        }
        Ok(data)
    }
}

pub const KEYRING_CAPACITY: usize = 50;

/// LRU cache of AES-128 keys by key URI, capacity [`KEYRING_CAPACITY`].
pub struct Keyring {
    loader: Box<dyn KeyLoader>,
    cache: Mutex<VecDeque<(Url, [u8; 16])>>,
}

impl Keyring {
    pub fn new(loader: Box<dyn KeyLoader>) -> Self {
        Self {
            loader,
            cache: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the key for `uri`, fetching through the loader on a miss.
    /// A hit moves the entry to the front; the least recently used entry is
    /// evicted once capacity is exceeded.
    pub fn get(&self, uri: &Url) -> NagareResult<[u8; 16]> {
        {
            let mut cache = self.cache.lock();
            if let Some(pos) = cache.iter().position(|(cached, _)| cached == uri) {
                let entry = cache.remove(pos).expect("position out of sync");
                let key = entry.1;
                cache.push_front(entry);
                return Ok(key);
            }
        }

        let raw = self.loader.load(uri)?;
        let key: [u8; 16] = raw
            .as_slice()
            .try_into()
            .map_err(|_| NagareError::InvalidKeyLength(raw.len()))?;

        let mut cache = self.cache.lock();
        cache.push_front((uri.clone(), key));
        cache.truncate(KEYRING_CAPACITY);
        Ok(key)
    }
}
