//! RSA operations
//!
//! Signing and decryption using the `rsa` crate, plus the byte formats
//! the card stores keys in. Private key material is kept as
//! `e_len(2) || e || p_len(2) || p || q_len(2) || q`; the public part as
//! `n_len(2) || n || e_len(2) || e`, all lengths big-endian.

use rsa::{BigUint, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey};

/// RSA operation errors
#[derive(Debug)]
pub enum RsaError {
    InvalidKey(String),
    InvalidData(String),
    SigningFailed(String),
    DecryptionFailed(String),
}

/// RSA operations
pub struct RsaOperations;

impl RsaOperations {
    /// Reconstruct a private key from stored `e || p || q` material
    pub fn decode_private_key(material: &[u8]) -> Result<RsaPrivateKey, RsaError> {
        let (e, offset) = Self::read_component(material, 0)?;
        let (p, offset) = Self::read_component(material, offset)?;
        let (q, offset) = Self::read_component(material, offset)?;
        if offset != material.len() {
            return Err(RsaError::InvalidKey(format!(
                "{} trailing bytes after q",
                material.len() - offset
            )));
        }

        RsaPrivateKey::from_p_q(
            BigUint::from_bytes_be(&p),
            BigUint::from_bytes_be(&q),
            BigUint::from_bytes_be(&e),
        )
        .map_err(|e| RsaError::InvalidKey(e.to_string()))
    }

    /// Sign a DigestInfo with PKCS#1 v1.5.
    ///
    /// The caller supplies the complete DigestInfo; the padding step adds
    /// only the `00 01 FF.. 00` frame.
    pub fn sign(key: &RsaPrivateKey, digest_info: &[u8]) -> Result<Vec<u8>, RsaError> {
        key.sign(Pkcs1v15Sign::new_unprefixed(), digest_info)
            .map_err(|e| RsaError::SigningFailed(e.to_string()))
    }

    /// Decrypt a PKCS#1 v1.5 ciphertext
    pub fn decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, RsaError> {
        key.decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| RsaError::DecryptionFailed(e.to_string()))
    }

    /// Encode private key material from its components
    pub fn encode_private(e: &[u8], p: &[u8], q: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(e.len() + p.len() + q.len() + 6);
        for part in [e, p, q] {
            out.extend_from_slice(&(part.len() as u16).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    /// Encode a public key from its components
    pub fn encode_public(n: &[u8], e: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.len() + e.len() + 4);
        for part in [n, e] {
            out.extend_from_slice(&(part.len() as u16).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    /// Modulus bytes of an encoded public key
    pub fn modulus(public: &[u8]) -> Option<Vec<u8>> {
        let (n, _) = Self::read_component(public, 0).ok()?;
        Some(n)
    }

    /// Exponent bytes of an encoded public key
    pub fn exponent(public: &[u8]) -> Option<Vec<u8>> {
        let (_, offset) = Self::read_component(public, 0).ok()?;
        let (e, _) = Self::read_component(public, offset).ok()?;
        Some(e)
    }

    /// Read one length-prefixed component starting at `offset`
    fn read_component(data: &[u8], offset: usize) -> Result<(Vec<u8>, usize), RsaError> {
        if offset + 2 > data.len() {
            return Err(RsaError::InvalidData("missing component length".into()));
        }
        let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        let start = offset + 2;
        if start + len > data.len() {
            return Err(RsaError::InvalidData(format!(
                "component of {} bytes exceeds buffer",
                len
            )));
        }
        Ok((data[start..start + len].to_vec(), start + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};
    use rsa::RsaPublicKey;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 1024).unwrap()
    }

    fn material_of(key: &RsaPrivateKey) -> Vec<u8> {
        let primes = key.primes();
        RsaOperations::encode_private(
            &key.e().to_bytes_be(),
            &primes[0].to_bytes_be(),
            &primes[1].to_bytes_be(),
        )
    }

    #[test]
    fn test_decode_roundtrip() {
        let key = test_key();
        let decoded = RsaOperations::decode_private_key(&material_of(&key)).unwrap();
        assert_eq!(decoded.n(), key.n());
        assert_eq!(decoded.e(), key.e());
    }

    #[test]
    fn test_sign_digest_info() {
        let key = test_key();
        // SHA-1 DigestInfo prefix plus a 20-byte digest, 35 bytes total
        let mut digest_info = vec![
            0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00,
            0x04, 0x14,
        ];
        digest_info.extend_from_slice(&[0xA5; 20]);

        let sig = RsaOperations::sign(&key, &digest_info).unwrap();
        assert_eq!(sig.len(), 128);

        // Verify by recovering the padded block with the public key
        let m = BigUint::from_bytes_be(&sig);
        let recovered = m.modpow(key.e(), key.n()).to_bytes_be();
        assert!(recovered.ends_with(&digest_info));
    }

    #[test]
    fn test_decrypt() {
        let key = test_key();
        let public = RsaPublicKey::from(&key);
        let ciphertext = public
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, b"attack at dawn")
            .unwrap();
        assert_eq!(
            RsaOperations::decrypt(&key, &ciphertext).unwrap(),
            b"attack at dawn"
        );
    }

    #[test]
    fn test_public_components() {
        let key = test_key();
        let public = RsaOperations::encode_public(&key.n().to_bytes_be(), &key.e().to_bytes_be());
        assert_eq!(RsaOperations::modulus(&public).unwrap(), key.n().to_bytes_be());
        assert_eq!(RsaOperations::exponent(&public).unwrap(), key.e().to_bytes_be());
    }

    #[test]
    fn test_decode_truncated() {
        let key = test_key();
        let material = material_of(&key);
        assert!(RsaOperations::decode_private_key(&material[..material.len() - 1]).is_err());
    }
}
