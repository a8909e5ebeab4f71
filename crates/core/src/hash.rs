//! Cryptographic hash types and the block-wise content fingerprint.
//!
//! The fingerprint used for deduplication is the SHA-256 of the concatenated
//! SHA-256 digests of consecutive fixed-size blocks (see [`crate::HASH_BLOCK_SIZE`]).
//! Because the block digests are independent of how a client chunks its
//! upload, the fingerprint is stable across any chunking, and a partially
//! received upload can resume hashing from its persisted block digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the plain SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        Self(result.into())
    }

    /// Compute the block-wise content fingerprint of a complete buffer.
    pub fn fingerprint(data: &[u8]) -> Self {
        let mut hasher = BlockHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Create an incremental plain SHA-256 hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str =
                std::str::from_utf8(chunk).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental SHA-256 hasher.
pub struct ContentHasher(Sha256);

impl ContentHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

/// Incremental block-wise fingerprint hasher.
///
/// Feed bytes in order with [`BlockHasher::update`]; each time a full block
/// accumulates its digest is sealed. Sealed digests can be persisted and
/// handed back to [`BlockHasher::resume`] after a restart.
pub struct BlockHasher {
    block_size: u64,
    current: Sha256,
    current_len: u64,
    blocks: Vec<ContentHash>,
}

impl BlockHasher {
    /// Create a hasher using the default block size.
    pub fn new() -> Self {
        Self::with_block_size(crate::HASH_BLOCK_SIZE)
    }

    /// Create a hasher with a custom block size.
    pub fn with_block_size(block_size: u64) -> Self {
        Self::resume(block_size, Vec::new())
    }

    /// Continue hashing after `blocks` full blocks have already been sealed.
    pub fn resume(block_size: u64, blocks: Vec<ContentHash>) -> Self {
        Self {
            block_size: block_size.max(1),
            current: Sha256::new(),
            current_len: 0,
            blocks,
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (self.block_size - self.current_len) as usize;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take as u64;
            data = &data[take..];
            if self.current_len == self.block_size {
                self.seal_block();
            }
        }
    }

    /// Total number of bytes fed so far, including resumed blocks.
    pub fn bytes_hashed(&self) -> u64 {
        self.blocks.len() as u64 * self.block_size + self.current_len
    }

    /// Digests of every full block sealed so far.
    pub fn sealed_blocks(&self) -> &[ContentHash] {
        &self.blocks
    }

    /// Finalize and return the content fingerprint.
    pub fn finalize(mut self) -> ContentHash {
        if self.current_len > 0 || self.blocks.is_empty() {
            self.seal_block();
        }
        let mut outer = Sha256::new();
        for block in &self.blocks {
            outer.update(block.as_bytes());
        }
        ContentHash(outer.finalize().into())
    }

    fn seal_block(&mut self) {
        let digest = std::mem::take(&mut self.current).finalize();
        self.blocks.push(ContentHash(digest.into()));
        self.current_len = 0;
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a list of digests as concatenated lowercase hex.
pub fn encode_digests(digests: &[ContentHash]) -> String {
    digests.iter().map(ContentHash::to_hex).collect()
}

/// Decode concatenated hex produced by [`encode_digests`].
pub fn decode_digests(s: &str) -> crate::Result<Vec<ContentHash>> {
    if s.len() % 64 != 0 {
        return Err(crate::Error::InvalidHash(format!(
            "digest list length {} is not a multiple of 64",
            s.len()
        )));
    }
    s.as_bytes()
        .chunks(64)
        .map(|chunk| {
            let hex =
                std::str::from_utf8(chunk).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            ContentHash::from_hex(hex)
        })
        .collect()
}
