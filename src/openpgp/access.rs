//! Access control state
//!
//! Three independent authorizations are held in RAM: PSO-CDS (PW1 mode
//! 81), PSO-OTHER (PW1 mode 82) and ADMIN (PW3). They are granted by
//! VERIFY, consumed or cleared by the handlers, and all dropped at
//! reset. Error counters and the keystring records they guard live in
//! the persistent [`CardState`].

use log::debug;

use crate::card::{CardState, Credential, FACTORY_PW1, FACTORY_PW3};
use crate::crypto::{HashOperations, KEYSTRING_MD_SIZE};

/// Outcome of a password verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    /// Wrong password; the credential's error counter was incremented
    Failed,
    /// The credential is locked; the secret was not consulted
    Blocked,
    Verified,
}

/// Outcome of the verify-with-length used by CHANGE REFERENCE DATA for
/// PW3, where the payload is `old_pw || new_pw` and the split point is
/// only known to the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixVerify {
    Failed,
    Blocked,
    /// The prefix of this length matched the admin password
    Ok(usize),
}

/// Which PW1 authorization a verify targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMode {
    /// P2 = 0x81, signing
    Cds,
    /// P2 = 0x82, decryption and authentication
    Other,
}

/// The three session authorization flags
#[derive(Debug, Default)]
pub struct AccessState {
    pso_cds: bool,
    pso_other: bool,
    admin: bool,
}

impl AccessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pso_cds_authorized(&self) -> bool {
        self.pso_cds
    }

    pub fn pso_other_authorized(&self) -> bool {
        self.pso_other
    }

    pub fn admin_authorized(&self) -> bool {
        self.admin
    }

    pub fn clear_pso_cds(&mut self) {
        self.pso_cds = false;
    }

    pub fn clear_pso_other(&mut self) {
        self.pso_other = false;
    }

    /// Drop all authorizations, as a power cycle would
    pub fn clear_all(&mut self) {
        self.pso_cds = false;
        self.pso_other = false;
        self.admin = false;
    }

    /// Verify PW1 for one of its two modes
    pub fn verify_user(
        &mut self,
        state: &mut CardState,
        mode: UserMode,
        password: &[u8],
    ) -> VerifyStatus {
        if state.locked(Credential::User) {
            return VerifyStatus::Blocked;
        }

        let good = match &state.pw1 {
            Some(record) => record.matches(password),
            None => password == FACTORY_PW1,
        };

        if good {
            state.reset_errors(Credential::User);
            match mode {
                UserMode::Cds => self.pso_cds = true,
                UserMode::Other => self.pso_other = true,
            }
            VerifyStatus::Verified
        } else {
            debug!("PW1 verification failed");
            state.increment_errors(Credential::User);
            match mode {
                UserMode::Cds => self.pso_cds = false,
                UserMode::Other => self.pso_other = false,
            }
            VerifyStatus::Failed
        }
    }

    /// Verify PW3
    pub fn verify_admin(&mut self, state: &mut CardState, password: &[u8]) -> VerifyStatus {
        if state.locked(Credential::Admin) {
            return VerifyStatus::Blocked;
        }

        let good = match &state.pw3 {
            Some(record) => record.matches(password),
            None => password == FACTORY_PW3,
        };

        if good {
            state.reset_errors(Credential::Admin);
            self.admin = true;
            VerifyStatus::Verified
        } else {
            debug!("PW3 verification failed");
            state.increment_errors(Credential::Admin);
            self.admin = false;
            VerifyStatus::Failed
        }
    }

    /// Verify that `payload` starts with the admin password and report
    /// the split point. Does not grant the ADMIN authorization.
    pub fn verify_admin_prefix(
        &mut self,
        state: &mut CardState,
        payload: &[u8],
    ) -> PrefixVerify {
        if state.locked(Credential::Admin) {
            return PrefixVerify::Blocked;
        }

        let old_len = match &state.pw3 {
            Some(record) => record.length as usize,
            None => FACTORY_PW3.len(),
        };
        if payload.len() < old_len {
            state.increment_errors(Credential::Admin);
            return PrefixVerify::Failed;
        }

        let good = match &state.pw3 {
            Some(record) => record.matches(&payload[..old_len]),
            None => &payload[..old_len] == FACTORY_PW3,
        };

        if good {
            PrefixVerify::Ok(old_len)
        } else {
            debug!("PW3 prefix verification failed");
            state.increment_errors(Credential::Admin);
            PrefixVerify::Failed
        }
    }
}

/// The keystring PW1 currently verifies against: the stored record's
/// digest, or the factory default while none is stored
pub fn current_user_keystring(state: &CardState) -> [u8; KEYSTRING_MD_SIZE] {
    match &state.pw1 {
        Some(record) => record.keystring(),
        None => HashOperations::keystring(FACTORY_PW1),
    }
}

/// The keystring PW3 currently verifies against
pub fn current_admin_keystring(state: &CardState) -> [u8; KEYSTRING_MD_SIZE] {
    match &state.pw3 {
        Some(record) => record.keystring(),
        None => HashOperations::keystring(FACTORY_PW3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{KeystringRecord, PW_MAX_ERRORS};

    #[test]
    fn test_factory_verify() {
        let mut state = CardState::default();
        let mut access = AccessState::new();

        assert_eq!(
            access.verify_user(&mut state, UserMode::Cds, b"123456"),
            VerifyStatus::Verified
        );
        assert!(access.pso_cds_authorized());
        assert!(!access.pso_other_authorized());
        assert!(!access.admin_authorized());
    }

    #[test]
    fn test_failed_verify_counts_and_clears_flag() {
        let mut state = CardState::default();
        let mut access = AccessState::new();

        access.verify_user(&mut state, UserMode::Cds, b"123456");
        assert!(access.pso_cds_authorized());

        assert_eq!(
            access.verify_user(&mut state, UserMode::Cds, b"bad000"),
            VerifyStatus::Failed
        );
        assert!(!access.pso_cds_authorized());
        assert_eq!(state.pw1_errors, 1);
    }

    #[test]
    fn test_lockout_blocks_without_consulting_secret() {
        let mut state = CardState::default();
        let mut access = AccessState::new();

        for _ in 0..PW_MAX_ERRORS {
            access.verify_user(&mut state, UserMode::Other, b"bad000");
        }
        // right password, but the credential is locked
        assert_eq!(
            access.verify_user(&mut state, UserMode::Other, b"123456"),
            VerifyStatus::Blocked
        );
        assert_eq!(state.pw1_errors, PW_MAX_ERRORS);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut state = CardState::default();
        let mut access = AccessState::new();

        access.verify_user(&mut state, UserMode::Cds, b"bad000");
        access.verify_user(&mut state, UserMode::Cds, b"bad000");
        assert_eq!(state.pw1_errors, 2);
        access.verify_user(&mut state, UserMode::Cds, b"123456");
        assert_eq!(state.pw1_errors, 0);
    }

    #[test]
    fn test_admin_verify_against_stored_record() {
        let mut state = CardState::default();
        state.pw3 = Some(KeystringRecord::derive(b"super-admin"));
        let mut access = AccessState::new();

        assert_eq!(
            access.verify_admin(&mut state, b"12345678"),
            VerifyStatus::Failed
        );
        assert_eq!(
            access.verify_admin(&mut state, b"super-admin"),
            VerifyStatus::Verified
        );
        assert!(access.admin_authorized());
    }

    #[test]
    fn test_admin_prefix_split() {
        let mut state = CardState::default();
        let mut access = AccessState::new();

        let payload = b"12345678new-admin-pw";
        assert_eq!(
            access.verify_admin_prefix(&mut state, payload),
            PrefixVerify::Ok(8)
        );
        assert_eq!(
            access.verify_admin_prefix(&mut state, b"wrongpw8xx"),
            PrefixVerify::Failed
        );
        assert_eq!(state.pw3_errors, 1);
    }

    #[test]
    fn test_prefix_shorter_than_password() {
        let mut state = CardState::default();
        let mut access = AccessState::new();

        assert_eq!(
            access.verify_admin_prefix(&mut state, b"1234"),
            PrefixVerify::Failed
        );
    }

    #[test]
    fn test_clear_all() {
        let mut state = CardState::default();
        let mut access = AccessState::new();
        access.verify_user(&mut state, UserMode::Cds, b"123456");
        access.verify_admin(&mut state, b"12345678");
        access.clear_all();
        assert!(!access.pso_cds_authorized());
        assert!(!access.admin_authorized());
    }

    #[test]
    fn test_current_keystrings_follow_records() {
        let mut state = CardState::default();
        assert_eq!(
            current_user_keystring(&state),
            HashOperations::keystring(b"123456")
        );
        state.pw1 = Some(KeystringRecord::derive(b"abcdefgh"));
        assert_eq!(
            current_user_keystring(&state),
            HashOperations::keystring(b"abcdefgh")
        );
        assert_eq!(
            current_admin_keystring(&state),
            HashOperations::keystring(b"12345678")
        );
    }
}
