//! Block hashes and locators.
//!
//! A block is addressed by the hex MD5 of its contents. Clients pass
//! locators of the form `hash[+size][+hint...]`; the bare 32-hex hash is the
//! canonical key under which the block lives in a bucket.

use md5::{Digest, Md5};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Matches a bare block key as stored in a bucket.
static BLOCK_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("static regex"));

/// Full client-facing locator grammar: hash, optional size, optional hints.
static LOCATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-f]{32})(\+[0-9]+)?((?:\+[A-Za-z][A-Za-z0-9@_-]*)*)$")
        .expect("static regex")
});

/// Service hints (`+K@uuid`) are routing advice, not block identity.
static SERVICE_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+K@[A-Za-z0-9]+").expect("static regex"));

/// Returns true if `key` is a block key (bare hex MD5) rather than a
/// `recent/`, `trash/`, or foreign key.
pub fn is_block_key(key: &str) -> bool {
    BLOCK_KEY_RE.is_match(key)
}

/// A 16-byte MD5 digest identifying a block by content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash([u8; 16]);

impl BlockHash {
    /// Compute the hash of a block body.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> BlockHasher {
        BlockHasher(Md5::new())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Base64 digest for the `Content-MD5` request header.
    pub fn content_md5(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Lowercase hex, the canonical bucket key.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl FromStr for BlockHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if !is_block_key(s) {
            return Err(crate::Error::InvalidHash(format!(
                "expected 32 lowercase hex chars, got {s:?}"
            )));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).expect("hex input is ascii");
            bytes[i] = u8::from_str_radix(hex, 16).expect("validated by regex");
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental MD5 hasher for streamed block bodies.
pub struct BlockHasher(Md5);

impl BlockHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> BlockHash {
        BlockHash(self.0.finalize().into())
    }
}

/// A parsed client locator: `hash[+size][+hint...]`.
///
/// Hints carry permission signatures (`+A<sig>@<expiry>`) and service
/// routing advice (`+K@<uuid>`) in any order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub hash: BlockHash,
    pub size: Option<u64>,
    pub hints: Vec<String>,
}

impl Locator {
    pub fn new(hash: BlockHash, size: u64) -> Self {
        Self {
            hash,
            size: Some(size),
            hints: Vec::new(),
        }
    }

    /// Canonical form with service hints removed but signatures preserved.
    pub fn stripped(&self) -> String {
        let full = self.to_string();
        SERVICE_HINT_RE.replace_all(&full, "").into_owned()
    }
}

impl FromStr for Locator {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let caps = LOCATOR_RE
            .captures(s)
            .ok_or_else(|| crate::Error::InvalidLocator(s.to_string()))?;
        let hash = caps[1].parse()?;
        let size = match caps.get(2) {
            Some(m) => Some(
                m.as_str()[1..]
                    .parse::<u64>()
                    .map_err(|_| crate::Error::InvalidLocator(s.to_string()))?,
            ),
            None => None,
        };
        let hints = match caps.get(3) {
            Some(m) if !m.as_str().is_empty() => m.as_str()[1..]
                .split('+')
                .map(|h| h.to_string())
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self { hash, size, hints })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)?;
        if let Some(size) = self.size {
            write!(f, "+{size}")?;
        }
        for hint in &self.hints {
            write!(f, "+{hint}")?;
        }
        Ok(())
    }
}
