//! Card state data structures
//!
//! Everything the token persists: keystring records, error counters, the
//! wrapped private keys, and the tag-addressed data objects. The whole
//! state serializes as one JSON document; byte fields are base64-encoded.

use serde::{Deserialize, Serialize};

use crate::crypto::{HashOperations, KEYSTRING_MD_SIZE};

use super::keys::{Credential, KeyPurpose, PrivateKeyRecord};

/// Serde helper: byte vectors as base64 strings
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper: optional byte vectors as base64 strings
pub(crate) mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Deserialize::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => STANDARD
                .decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Maximum wrong attempts before a credential locks
pub const PW_MAX_ERRORS: u8 = 3;

/// Factory-default PW1, assumed while no PW1 record is stored
pub const FACTORY_PW1: &[u8] = b"123456";

/// Factory-default PW3, assumed while no PW3 record is stored
pub const FACTORY_PW3: &[u8] = b"12345678";

/// A stored keystring: the SHA-1 digest of a password plus the original
/// password length. PW1 and RC persist both (a 21-byte record on the
/// wire); PW3 keeps the length only to locate the old/new split in
/// CHANGE REFERENCE DATA.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystringRecord {
    pub length: u8,
    #[serde(with = "base64_bytes")]
    pub digest: Vec<u8>,
}

impl KeystringRecord {
    /// Derive the record for a password
    pub fn derive(password: &[u8]) -> Self {
        Self {
            length: password.len() as u8,
            digest: HashOperations::keystring(password).to_vec(),
        }
    }

    /// Constant keystring view, as the wrap operations expect it. A
    /// digest of the wrong length (a hand-edited state file) is padded
    /// or truncated rather than trusted to be 20 bytes.
    pub fn keystring(&self) -> [u8; KEYSTRING_MD_SIZE] {
        let mut ks = [0u8; KEYSTRING_MD_SIZE];
        let n = self.digest.len().min(KEYSTRING_MD_SIZE);
        ks[..n].copy_from_slice(&self.digest[..n]);
        ks
    }

    pub fn matches(&self, password: &[u8]) -> bool {
        HashOperations::keystring(password)[..] == self.digest[..]
    }
}

/// Cardholder-related data objects
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CardholderData {
    pub name: String,
    pub language: String,
    pub sex: u8,
    pub login: String,
    pub url: String,
}

/// The complete persistent card state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardState {
    /// Application Identifier; the first byte is the AID length
    #[serde(with = "base64_bytes")]
    pub aid: Vec<u8>,

    pub pw1: Option<KeystringRecord>,
    pub rc: Option<KeystringRecord>,
    pub pw3: Option<KeystringRecord>,

    pub pw1_errors: u8,
    pub rc_errors: u8,
    pub pw3_errors: u8,

    /// True when a PW1 verification stays valid for several PSO:CDS
    pub pw1_lifetime: bool,

    pub signature_counter: u32,

    pub key_sig: Option<PrivateKeyRecord>,
    pub key_dec: Option<PrivateKeyRecord>,
    pub key_aut: Option<PrivateKeyRecord>,

    pub cardholder: CardholderData,

    #[serde(with = "base64_bytes")]
    pub private_do_1: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub private_do_2: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub private_do_3: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub private_do_4: Vec<u8>,

    #[serde(with = "base64_bytes")]
    pub fingerprint_sig: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub fingerprint_dec: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub fingerprint_aut: Vec<u8>,
}

impl Default for CardState {
    fn default() -> Self {
        // RID D2 76 00 01 24 01, application version 2.0, test-range
        // manufacturer, serial 1
        let aid = vec![
            0x10, 0xD2, 0x76, 0x00, 0x01, 0x24, 0x01, 0x02, 0x00, 0xFF, 0xFE, 0x00, 0x00,
            0x00, 0x01, 0x00, 0x00,
        ];
        Self {
            aid,
            pw1: None,
            rc: None,
            pw3: None,
            pw1_errors: 0,
            rc_errors: 0,
            pw3_errors: 0,
            pw1_lifetime: false,
            signature_counter: 0,
            key_sig: None,
            key_dec: None,
            key_aut: None,
            cardholder: CardholderData::default(),
            private_do_1: Vec::new(),
            private_do_2: Vec::new(),
            private_do_3: Vec::new(),
            private_do_4: Vec::new(),
            fingerprint_sig: vec![0u8; 20],
            fingerprint_dec: vec![0u8; 20],
            fingerprint_aut: vec![0u8; 20],
        }
    }
}

impl CardState {
    /// The AID bytes without the leading length byte
    pub fn aid_bytes(&self) -> &[u8] {
        let len = self.aid.first().copied().unwrap_or(0) as usize;
        if 1 + len <= self.aid.len() {
            &self.aid[1..1 + len]
        } else {
            &self.aid[1..]
        }
    }

    pub fn key(&self, purpose: KeyPurpose) -> &Option<PrivateKeyRecord> {
        match purpose {
            KeyPurpose::Signing => &self.key_sig,
            KeyPurpose::Decryption => &self.key_dec,
            KeyPurpose::Authentication => &self.key_aut,
        }
    }

    pub fn key_mut(&mut self, purpose: KeyPurpose) -> &mut Option<PrivateKeyRecord> {
        match purpose {
            KeyPurpose::Signing => &mut self.key_sig,
            KeyPurpose::Decryption => &mut self.key_dec,
            KeyPurpose::Authentication => &mut self.key_aut,
        }
    }

    pub fn errors(&self, who: Credential) -> u8 {
        match who {
            Credential::User => self.pw1_errors,
            Credential::ResetCode => self.rc_errors,
            Credential::Admin => self.pw3_errors,
        }
    }

    pub fn increment_errors(&mut self, who: Credential) {
        let counter = match who {
            Credential::User => &mut self.pw1_errors,
            Credential::ResetCode => &mut self.rc_errors,
            Credential::Admin => &mut self.pw3_errors,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn reset_errors(&mut self, who: Credential) {
        match who {
            Credential::User => self.pw1_errors = 0,
            Credential::ResetCode => self.rc_errors = 0,
            Credential::Admin => self.pw3_errors = 0,
        }
    }

    /// A credential is locked once its error counter reaches the
    /// maximum; a locked verify never consults the secret.
    pub fn locked(&self, who: Credential) -> bool {
        self.errors(who) >= PW_MAX_ERRORS
    }

    /// PW status bytes (DO 0xC4): lifetime flag, maximum lengths,
    /// remaining tries per credential
    pub fn pw_status_bytes(&self) -> Vec<u8> {
        vec![
            u8::from(self.pw1_lifetime),
            127,
            127,
            127,
            PW_MAX_ERRORS.saturating_sub(self.pw1_errors),
            if self.rc.is_some() {
                PW_MAX_ERRORS.saturating_sub(self.rc_errors)
            } else {
                0
            },
            PW_MAX_ERRORS.saturating_sub(self.pw3_errors),
        ]
    }

    /// Digital signature counter (DO 0x93), 3 bytes big-endian
    pub fn signature_counter_bytes(&self) -> Vec<u8> {
        let c = self.signature_counter;
        vec![(c >> 16) as u8, (c >> 8) as u8, c as u8]
    }

    /// All three key fingerprints concatenated (DO 0xC5)
    pub fn fingerprints(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(60);
        out.extend_from_slice(&self.fingerprint_sig);
        out.extend_from_slice(&self.fingerprint_dec);
        out.extend_from_slice(&self.fingerprint_aut);
        out
    }

    /// Total size in bytes of the data objects currently present, as
    /// reported in the SELECT-MF directory template
    pub fn do_bytes_total(&self) -> usize {
        let keystring = |r: &Option<KeystringRecord>| {
            r.as_ref().map_or(0, |k| 1 + k.digest.len())
        };
        let key = |r: &Option<PrivateKeyRecord>| {
            r.as_ref().map_or(0, |k| k.sealed.len() + k.public.len())
        };

        keystring(&self.pw1)
            + keystring(&self.rc)
            + keystring(&self.pw3)
            + key(&self.key_sig)
            + key(&self.key_dec)
            + key(&self.key_aut)
            + self.cardholder.name.len()
            + self.cardholder.language.len()
            + self.cardholder.login.len()
            + self.cardholder.url.len()
            + self.private_do_1.len()
            + self.private_do_2.len()
            + self.private_do_3.len()
            + self.private_do_4.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystring_record() {
        let record = KeystringRecord::derive(b"123456");
        assert_eq!(record.length, 6);
        assert_eq!(record.digest.len(), 20);
        assert!(record.matches(b"123456"));
        assert!(!record.matches(b"123457"));
    }

    #[test]
    fn test_factory_defaults() {
        let state = CardState::default();
        assert!(state.pw1.is_none());
        assert!(state.pw3.is_none());
        assert!(!state.pw1_lifetime);
        assert_eq!(state.signature_counter, 0);
        assert_eq!(state.aid_bytes().len(), 16);
        assert_eq!(&state.aid_bytes()[..6], &[0xD2, 0x76, 0x00, 0x01, 0x24, 0x01]);
    }

    #[test]
    fn test_lockout() {
        let mut state = CardState::default();
        assert!(!state.locked(Credential::User));
        for _ in 0..PW_MAX_ERRORS {
            state.increment_errors(Credential::User);
        }
        assert!(state.locked(Credential::User));
        assert!(!state.locked(Credential::Admin));
        state.reset_errors(Credential::User);
        assert!(!state.locked(Credential::User));
    }

    #[test]
    fn test_pw_status_bytes() {
        let mut state = CardState::default();
        let status = state.pw_status_bytes();
        assert_eq!(status[0], 0);
        assert_eq!(status[4], 3);
        assert_eq!(status[5], 0); // no reset code installed

        state.pw1_lifetime = true;
        state.increment_errors(Credential::User);
        state.rc = Some(KeystringRecord::derive(b"resetcode"));
        let status = state.pw_status_bytes();
        assert_eq!(status[0], 1);
        assert_eq!(status[4], 2);
        assert_eq!(status[5], 3);
    }

    #[test]
    fn test_signature_counter_bytes() {
        let mut state = CardState::default();
        state.signature_counter = 0x0102_03;
        assert_eq!(state.signature_counter_bytes(), vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_do_bytes_total_grows() {
        let mut state = CardState::default();
        let before = state.do_bytes_total();
        state.pw1 = Some(KeystringRecord::derive(b"123456"));
        state.cardholder.name = "Doe<<John".to_string();
        assert_eq!(state.do_bytes_total(), before + 21 + 9);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut state = CardState::default();
        state.pw1 = Some(KeystringRecord::derive(b"123456"));
        state.private_do_2 = vec![0xDE, 0xAD];
        state.signature_counter = 7;

        let json = serde_json::to_string(&state).unwrap();
        let back: CardState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
