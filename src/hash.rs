//! Strong block hash using BLAKE3.
//!
//! BLAKE3 confirms block matches after the rolling checksum identifies
//! candidates, and is the hash compared block-by-block during signature
//! verification.

use serde::{Deserialize, Serialize};

/// Strong cryptographic hash of a block.
///
/// 32 bytes of BLAKE3. Two blocks with equal strong hashes are treated as
/// identical; mixing hash algorithms across artifacts would make every
/// comparison fail, so this one is fixed.
///
/// # Example
///
/// ```rust
/// use blockpatch::StrongHash;
///
/// let hash1 = StrongHash::compute(b"hello world");
/// let hash2 = StrongHash::compute(b"hello world");
/// assert_eq!(hash1, hash2);
/// assert_ne!(hash1, StrongHash::compute(b"different data"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongHash([u8; 32]);

impl StrongHash {
    /// Compute the BLAKE3 hash of a block.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(*hash.as_bytes())
    }

    /// Create a `StrongHash` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The all-zero hash, used as a placeholder before computation.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }
}

impl std::fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StrongHash({:016x}...)",
            u64::from_be_bytes(self.0[..8].try_into().unwrap_or([0u8; 8]))
        )
    }
}

impl std::fmt::Display for StrongHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for StrongHash {
    fn default() -> Self {
        Self::zero()
    }
}

impl AsRef<[u8]> for StrongHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_empty() {
        // BLAKE3 has a well-defined hash for empty input
        assert_ne!(StrongHash::compute(b""), StrongHash::zero());
    }

    #[test]
    fn compute_deterministic() {
        let data = b"test data for hashing";
        assert_eq!(StrongHash::compute(data), StrongHash::compute(data));
    }

    #[test]
    fn compute_different_data() {
        assert_ne!(StrongHash::compute(b"hello"), StrongHash::compute(b"world"));
    }

    #[test]
    fn single_bit_flip_changes_hash() {
        let mut data = vec![0u8; 4096];
        let original = StrongHash::compute(&data);
        data[2048] ^= 1;
        assert_ne!(StrongHash::compute(&data), original);
    }

    #[test]
    fn round_trip_bytes() {
        let hash = StrongHash::compute(b"round trip");
        let restored = StrongHash::from_bytes(*hash.as_bytes());
        assert_eq!(hash, restored);
    }

    #[test]
    fn display_is_hex() {
        let hash = StrongHash::zero();
        assert_eq!(hash.to_string(), "0".repeat(64));
    }

    #[test]
    fn serde_round_trip() {
        let hash = StrongHash::compute(b"serialized");
        let bytes = bincode::serialize(&hash).unwrap();
        let restored: StrongHash = bincode::deserialize(&bytes).unwrap();
        assert_eq!(hash, restored);
    }
}
