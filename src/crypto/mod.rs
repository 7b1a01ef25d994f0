//! Cryptographic operations
//!
//! The primitives the command core orchestrates: RSA sign/decrypt, SHA-1
//! keystring derivation, and the AES keystring wrap protecting private
//! keys at rest.

pub mod hash;
pub mod rsa;
pub mod wrap;

pub use self::hash::{HashOperations, KEYSTRING_MD_SIZE};
pub use self::rsa::{RsaError, RsaOperations};
pub use self::wrap::{KeyWrap, WrapError};
