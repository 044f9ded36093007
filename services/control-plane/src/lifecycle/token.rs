//! Per-server validation tokens.
//!
//! Tokens are 32 random bytes, hex encoded. They are handed to the daemon at
//! creation time and presented back by console viewers.

use rand::Rng;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

pub fn generate_validation_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison over the SHA-256 digests of both tokens.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
