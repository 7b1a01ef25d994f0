//! Wrapped private keys
//!
//! Each of the three RSA private keys is stored sealed under a random
//! KEK; the KEK is wrapped once per credential that may use the key. A
//! verify therefore yields a keystring, the keystring unwraps the KEK,
//! and the KEK opens the key material. Changing a password re-wraps only
//! the KEK copy, never the key material itself.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{KeyWrap, RsaOperations, WrapError, KEYSTRING_MD_SIZE};

use super::state::{base64_bytes, base64_bytes_opt, CardState};

/// Which long-lived key an operation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Signing,
    Decryption,
    Authentication,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 3] = [
        KeyPurpose::Signing,
        KeyPurpose::Decryption,
        KeyPurpose::Authentication,
    ];
}

/// The credential a keystring belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// PW1, the user password
    User,
    /// RC, the reset code
    ResetCode,
    /// PW3, the admin password
    Admin,
}

/// Errors from key load and re-wrap operations
#[derive(Debug, PartialEq, Eq)]
pub enum KeyError {
    /// Unwrap failed: wrong keystring, or no wrap exists for the
    /// requested credential
    Crypto,
    /// The stored key material could not be decoded
    Data,
}

impl From<WrapError> for KeyError {
    fn from(_: WrapError) -> Self {
        KeyError::Crypto
    }
}

/// Result of migrating the stored keys to a new keystring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMigration {
    /// No wrapped keys were present; nothing to migrate
    NoKeys,
    /// This many keys were present and re-wrapped
    Migrated(usize),
}

/// A private key at rest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateKeyRecord {
    /// Key material (`e || p || q`) sealed under the KEK
    #[serde(with = "base64_bytes")]
    pub sealed: Vec<u8>,
    /// Public part, `n || e`
    #[serde(with = "base64_bytes")]
    pub public: Vec<u8>,
    #[serde(with = "base64_bytes_opt")]
    kek_user: Option<Vec<u8>>,
    #[serde(with = "base64_bytes_opt")]
    kek_resetcode: Option<Vec<u8>>,
    #[serde(with = "base64_bytes_opt")]
    kek_admin: Option<Vec<u8>>,
}

impl PrivateKeyRecord {
    /// Seal fresh key material under a new random KEK, wrapping the KEK
    /// for each given credential.
    pub fn install(
        material: &[u8],
        public: Vec<u8>,
        wraps: &[(Credential, [u8; KEYSTRING_MD_SIZE])],
    ) -> Result<Self, KeyError> {
        let mut kek = [0u8; KeyWrap::KEK_SIZE];
        OsRng.fill_bytes(&mut kek);

        let mut record = Self {
            sealed: KeyWrap::seal(&kek, material)?,
            public,
            kek_user: None,
            kek_resetcode: None,
            kek_admin: None,
        };
        for (who, ks) in wraps {
            *record.wrap_slot(*who) = Some(KeyWrap::wrap_kek(ks, &kek)?);
        }
        Ok(record)
    }

    /// Unwrap with a credential's keystring and decode the private key
    pub fn load(
        &self,
        who: Credential,
        keystring: &[u8],
    ) -> Result<RsaPrivateKey, KeyError> {
        let kek = self.unwrap_kek(who, keystring)?;
        let material = KeyWrap::open(&kek, &self.sealed)?;
        RsaOperations::decode_private_key(&material).map_err(|_| KeyError::Data)
    }

    /// Move the key from one credential's keystring to another. The
    /// wrap for `who_old` must open with `ks_old`; a wrap for `who_new`
    /// under `ks_new` replaces whatever that slot held.
    pub fn rewrap(
        &mut self,
        who_old: Credential,
        ks_old: &[u8],
        who_new: Credential,
        ks_new: &[u8],
    ) -> Result<(), KeyError> {
        let kek = self.unwrap_kek(who_old, ks_old)?;
        *self.wrap_slot(who_new) = Some(KeyWrap::wrap_kek(ks_new, &kek)?);
        Ok(())
    }

    /// Whether a wrap exists for a credential
    pub fn has_wrap(&self, who: Credential) -> bool {
        match who {
            Credential::User => self.kek_user.is_some(),
            Credential::ResetCode => self.kek_resetcode.is_some(),
            Credential::Admin => self.kek_admin.is_some(),
        }
    }

    /// Remove a credential's wrap (used when the reset code is cleared)
    pub fn drop_wrap(&mut self, who: Credential) {
        *self.wrap_slot(who) = None;
    }

    fn unwrap_kek(&self, who: Credential, keystring: &[u8]) -> Result<Vec<u8>, KeyError> {
        let wrapped = match who {
            Credential::User => &self.kek_user,
            Credential::ResetCode => &self.kek_resetcode,
            Credential::Admin => &self.kek_admin,
        };
        let wrapped = wrapped.as_ref().ok_or(KeyError::Crypto)?;
        Ok(KeyWrap::unwrap_kek(keystring, wrapped)?)
    }

    fn set_wrap(&mut self, who: Credential, wrapped: Vec<u8>) {
        *self.wrap_slot(who) = Some(wrapped);
    }

    fn wrap_slot(&mut self, who: Credential) -> &mut Option<Vec<u8>> {
        match who {
            Credential::User => &mut self.kek_user,
            Credential::ResetCode => &mut self.kek_resetcode,
            Credential::Admin => &mut self.kek_admin,
        }
    }
}

/// Re-wrap every stored private key from `(who_old, old_ks)` to
/// `(who_new, new_ks)`.
///
/// Absent keys are skipped. The old keystring must open every present
/// key before anything is mutated, so a failure leaves all records
/// exactly as they were. The caller persists the state afterwards and
/// maps a failed write to MEMORY_FAILURE.
pub fn change_keystring(
    state: &mut CardState,
    who_old: Credential,
    old_ks: &[u8],
    who_new: Credential,
    new_ks: &[u8],
) -> Result<KeyMigration, KeyError> {
    let mut keks = Vec::new();
    for purpose in KeyPurpose::ALL {
        if let Some(record) = state.key(purpose) {
            keks.push((purpose, record.unwrap_kek(who_old, old_ks)?));
        }
    }
    if keks.is_empty() {
        return Ok(KeyMigration::NoKeys);
    }

    let migrated = keks.len();
    for (purpose, kek) in keks {
        let wrapped = KeyWrap::wrap_kek(new_ks, &kek)?;
        if let Some(record) = state.key_mut(purpose) {
            record.set_wrap(who_new, wrapped);
        }
    }

    Ok(KeyMigration::Migrated(migrated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashOperations;
    use rsa::traits::{PrivateKeyParts, PublicKeyParts};

    fn sample_record(wraps: &[(Credential, [u8; 20])]) -> (PrivateKeyRecord, RsaPrivateKey) {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let primes = key.primes();
        let material = RsaOperations::encode_private(
            &key.e().to_bytes_be(),
            &primes[0].to_bytes_be(),
            &primes[1].to_bytes_be(),
        );
        let public =
            RsaOperations::encode_public(&key.n().to_bytes_be(), &key.e().to_bytes_be());
        let record = PrivateKeyRecord::install(&material, public, wraps).unwrap();
        (record, key)
    }

    #[test]
    fn test_install_and_load() {
        let ks = HashOperations::keystring(b"123456");
        let (record, key) = sample_record(&[(Credential::User, ks)]);

        let loaded = record.load(Credential::User, &ks).unwrap();
        assert_eq!(loaded.n(), key.n());
    }

    #[test]
    fn test_load_with_wrong_keystring() {
        let ks = HashOperations::keystring(b"123456");
        let (record, _) = sample_record(&[(Credential::User, ks)]);

        let wrong = HashOperations::keystring(b"000000");
        assert!(matches!(
            record.load(Credential::User, &wrong),
            Err(KeyError::Crypto)
        ));
    }

    #[test]
    fn test_load_without_wrap() {
        let ks = HashOperations::keystring(b"123456");
        let (record, _) = sample_record(&[(Credential::User, ks)]);

        assert!(!record.has_wrap(Credential::Admin));
        assert!(matches!(
            record.load(Credential::Admin, &ks),
            Err(KeyError::Crypto)
        ));
    }

    #[test]
    fn test_rewrap_moves_key() {
        let old_ks = HashOperations::keystring(b"123456");
        let new_ks = HashOperations::keystring(b"abcdefgh");
        let (mut record, key) = sample_record(&[(Credential::User, old_ks)]);

        record
            .rewrap(Credential::User, &old_ks, Credential::User, &new_ks)
            .unwrap();
        assert!(matches!(
            record.load(Credential::User, &old_ks),
            Err(KeyError::Crypto)
        ));
        assert_eq!(record.load(Credential::User, &new_ks).unwrap().n(), key.n());
    }

    #[test]
    fn test_change_keystring_counts_present_keys() {
        let old_ks = HashOperations::keystring(b"123456");
        let new_ks = HashOperations::keystring(b"newpw123");

        let mut state = CardState::default();
        assert_eq!(
            change_keystring(&mut state, Credential::User, &old_ks, Credential::User, &new_ks),
            Ok(KeyMigration::NoKeys)
        );

        let (record, _) = sample_record(&[(Credential::User, old_ks)]);
        *state.key_mut(KeyPurpose::Signing) = Some(record);
        assert_eq!(
            change_keystring(&mut state, Credential::User, &old_ks, Credential::User, &new_ks),
            Ok(KeyMigration::Migrated(1))
        );
        assert!(state
            .key(KeyPurpose::Signing)
            .as_ref()
            .unwrap()
            .load(Credential::User, &new_ks)
            .is_ok());
    }

    #[test]
    fn test_change_keystring_wrong_old() {
        let ks = HashOperations::keystring(b"123456");
        let wrong = HashOperations::keystring(b"wrong0");
        let new_ks = HashOperations::keystring(b"newpw123");

        let mut state = CardState::default();
        let (record, _) = sample_record(&[(Credential::User, ks)]);
        *state.key_mut(KeyPurpose::Decryption) = Some(record);

        assert_eq!(
            change_keystring(&mut state, Credential::User, &wrong, Credential::User, &new_ks),
            Err(KeyError::Crypto)
        );
        // untouched
        assert!(state
            .key(KeyPurpose::Decryption)
            .as_ref()
            .unwrap()
            .load(Credential::User, &ks)
            .is_ok());
    }

    #[test]
    fn test_admin_to_user_rewrap_keeps_admin_wrap() {
        let admin_ks = HashOperations::keystring(b"12345678");
        let user_ks = HashOperations::keystring(b"newpw123");
        let (mut record, _) = sample_record(&[(Credential::Admin, admin_ks)]);

        record
            .rewrap(Credential::Admin, &admin_ks, Credential::User, &user_ks)
            .unwrap();
        assert!(record.load(Credential::Admin, &admin_ks).is_ok());
        assert!(record.load(Credential::User, &user_ks).is_ok());
    }
}
