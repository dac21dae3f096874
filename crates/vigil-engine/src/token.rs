//! Bearer tokens for trusted contacts and recipients.
//!
//! Tokens are 32 random bytes, hex-encoded. Only the SHA-256 of a token is
//! ever persisted; the plaintext is handed out once.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

/// A freshly minted token and the hash to store for it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
  pub plaintext: String,
  pub hash:      String,
}

pub fn issue() -> IssuedToken {
  let mut bytes = [0u8; 32];
  OsRng.fill_bytes(&mut bytes);
  let plaintext = hex::encode(bytes);
  let hash = hash(&plaintext);
  IssuedToken { plaintext, hash }
}

/// Lowercase hex SHA-256 of `token`.
pub fn hash(token: &str) -> String { hex::encode(Sha256::digest(token.as_bytes())) }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn issued_tokens_are_unique_and_hash_consistently() {
    let a = issue();
    let b = issue();
    assert_ne!(a.plaintext, b.plaintext);
    assert_eq!(a.plaintext.len(), 64);
    assert_eq!(hash(&a.plaintext), a.hash);
    assert_ne!(a.hash, a.plaintext);
  }
}
