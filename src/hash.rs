//! SHA-256 identifiers and prefix matching.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::LibernetError;

/// Length of an identifier in hex characters.
pub const IDENTIFIER_SIZE: usize = 64;

/// Number of bits in an identifier.
pub const IDENTIFIER_BITS: u32 = 256;

/// A 256-bit SHA-256 digest, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier([u8; 32]);

impl Identifier {
    /// Digest of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Identifier(digest.into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Identifier(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_hex())
    }
}

impl FromStr for Identifier {
    type Err = LibernetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != IDENTIFIER_SIZE
            || !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(LibernetError::InvalidIdentifier(value.to_string()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(value, &mut bytes)
            .map_err(|_| LibernetError::InvalidIdentifier(value.to_string()))?;
        Ok(Identifier(bytes))
    }
}

/// Count of leading equal bits between two identifiers (0..=256).
///
/// Identifiers are compared as 256-bit big-endian values, so a score of
/// `k` means the first `k` bits agree and bit `k` differs.
pub fn match_score(left: &Identifier, right: &Identifier) -> u32 {
    let mut score = 0u32;

    for (a, b) in left.0.iter().zip(right.0.iter()) {
        let diff = a ^ b;

        if diff == 0 {
            score += 8;
            continue;
        }

        score += diff.leading_zeros();
        return score;
    }

    IDENTIFIER_BITS
}
