//! Perceptual fingerprints and the distance between them
//!
//! A photo's [`Fingerprint`] pairs two fixed-width perceptual hashes: a
//! gradient hash (dHash), which stays stable on flat, low-detail images, and a
//! frequency hash (DCT pHash), which tolerates re-encoding and resizing. The
//! combined distance adds (or takes the max of) the two Hamming distances so
//! each algorithm covers the other's blind spot.
//!
//! Both combinations are metrics on fixed-width bit vectors, so the triangle
//! inequality holds and the BK-tree in [`crate::index`] may prune on it.
//!
//! Hashes serialize as lowercase hex strings, which keeps photo manifests
//! readable and diffable.

use crate::error::{DeclutterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A fixed-width perceptual hash stored as raw bytes
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PerceptualHash {
    bytes: Box<[u8]>,
}

impl PerceptualHash {
    /// Wrap raw hash bytes
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// Parse a hex string such as `"c3a1f0e08c1e3f07"`
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| {
            DeclutterError::corrupt_fingerprint(Path::new(""), format!("invalid hex {:?}: {}", hex_str, e))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Width in bits
    pub fn bit_width(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Whether the hash carries no bits at all
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of differing bits
    ///
    /// Hashes of different widths are compared over the shared prefix and each
    /// surplus byte counts as eight differing bits, which keeps the function a
    /// metric even for mixed input. The index never mixes widths.
    pub fn hamming(&self, other: &PerceptualHash) -> u32 {
        let shared: u32 = self
            .bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        let surplus = self.bytes.len().abs_diff(other.bytes.len()) as u32;
        shared + surplus * 8
    }
}

impl fmt::Debug for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PerceptualHash({})", self.to_hex())
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for PerceptualHash {
    type Error = DeclutterError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<PerceptualHash> for String {
    fn from(hash: PerceptualHash) -> Self {
        hash.to_hex()
    }
}

/// How the two component distances fold into one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    /// Sum of both distances
    #[default]
    Sum,
    /// Larger of the two distances
    Max,
}

impl CombineMode {
    /// Fold two component distances
    pub fn combine(&self, gradient: u32, frequency: u32) -> u32 {
        match self {
            CombineMode::Sum => gradient + frequency,
            CombineMode::Max => gradient.max(frequency),
        }
    }
}

/// Combined gradient + frequency fingerprint of one photo
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Gradient (difference) hash
    pub gradient: PerceptualHash,
    /// Frequency (DCT) hash
    pub frequency: PerceptualHash,
}

impl Fingerprint {
    /// Pair two component hashes
    pub fn new(gradient: PerceptualHash, frequency: PerceptualHash) -> Self {
        Self {
            gradient,
            frequency,
        }
    }

    /// Parse both components from hex
    pub fn from_hex(gradient: &str, frequency: &str) -> Result<Self> {
        Ok(Self::new(
            PerceptualHash::from_hex(gradient)?,
            PerceptualHash::from_hex(frequency)?,
        ))
    }

    /// Component widths in bits, `(gradient, frequency)`
    pub fn widths(&self) -> (usize, usize) {
        (self.gradient.bit_width(), self.frequency.bit_width())
    }

    /// Reject zero-length components
    pub fn validate(&self, photo: &Path) -> Result<()> {
        if self.gradient.is_empty() {
            return Err(DeclutterError::corrupt_fingerprint(photo, "gradient hash is empty"));
        }
        if self.frequency.is_empty() {
            return Err(DeclutterError::corrupt_fingerprint(photo, "frequency hash is empty"));
        }
        Ok(())
    }

    /// Combined distance to another fingerprint
    pub fn distance(&self, other: &Fingerprint, mode: CombineMode) -> u32 {
        mode.combine(
            self.gradient.hamming(&other.gradient),
            self.frequency.hamming(&other.frequency),
        )
    }
}
