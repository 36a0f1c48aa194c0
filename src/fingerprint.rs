//! Stable stage fingerprints.
//!
//! A fingerprint identifies a stage by its semantics: the command vector,
//! the input files it reads, and the parameters that change its behavior
//! (memory estimate, core count). It keys the finished-stages log, so it
//! must be identical across processes and across runs for a stage whose
//! semantics have not changed.
//!
//! Scheme: SHA-256 over a canonical serialization in which every variable-
//! length field is length-prefixed, rendered as 64 lowercase hex characters.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// A SHA-256 digest of a stage's semantics.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Parse the 64-hex-character form used in the finished-stages log.
    pub fn parse(s: &str) -> Option<Fingerprint> {
        let s = s.trim();
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Fingerprint(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Incremental fingerprint construction with unambiguous field framing.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        FingerprintBuilder {
            hasher: Sha256::new(),
        }
    }

    /// Append a section tag separating groups of fields.
    pub fn section(&mut self, name: &str) -> &mut Self {
        self.hasher.update([0xff]);
        self.bytes(name.as_bytes())
    }

    /// Append a length-prefixed byte string.
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        self.bytes(s.as_bytes())
    }

    pub fn path(&mut self, p: &PathBuf) -> &mut Self {
        self.bytes(p.to_string_lossy().as_bytes())
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.hasher.update(v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.hasher.update(v.to_le_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}
