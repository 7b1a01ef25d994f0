//! Hash operations
//!
//! SHA-1 keystring derivation. The OpenPGP card v2 keystring is defined
//! as the SHA-1 digest of the password; this is a protocol constant, not
//! an algorithm choice.

use sha1::{Digest, Sha1};

/// Size of a keystring digest in bytes
pub const KEYSTRING_MD_SIZE: usize = 20;

/// Hash operations
pub struct HashOperations;

impl HashOperations {
    /// Compute the SHA-1 digest of a buffer
    pub fn sha1(data: &[u8]) -> [u8; KEYSTRING_MD_SIZE] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Derive the keystring for a password
    pub fn keystring(password: &[u8]) -> [u8; KEYSTRING_MD_SIZE] {
        Self::sha1(password)
    }
}
