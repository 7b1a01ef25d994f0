//! Command session: dispatcher and handlers
//!
//! One session owns the card state, the access-control flags and the
//! selected-file state, and processes one command APDU at a time. Every
//! handler is total: each path writes exactly one status word, and no
//! error propagates past [`TokenSession::process_apdu`].

use log::{debug, warn};
use rsa::BigUint;

use crate::apdu::{Apdu, Ins, Response, SW};
use crate::card::{
    change_keystring, Credential, DataStore, KeyError, KeyMigration, KeyPurpose,
    KeystringRecord, PrivateKeyRecord,
};
use crate::crypto::{HashOperations, RsaOperations};
use crate::tlv::{read_list, TlvBuilder};

use super::access::{
    current_admin_keystring, current_user_keystring, AccessState, PrefixVerify, UserMode,
    VerifyStatus,
};

/// The ISO 7816 file currently selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileSelection {
    #[default]
    None,
    Mf,
    DfOpenpgp,
    EfDir,
    EfSerial,
}

/// FCI template answered to SELECT of the MF. Bytes 2-3 are patched with
/// the current total size of the data objects, little-endian.
const SELECT_MF_TEMPLATE: [u8; 20] = [
    0x00, 0x00, // unused
    0x00, 0x00, // number of bytes in this directory, patched
    0x3F, 0x00, // selected file: MF
    0x38, // it's a DF
    0xFF, // unused
    0xFF, 0x44, 0x44, // access conditions
    0x01, // file status: OK, unblocked
    0x05, // five bytes of data follow
    0x03, // features
    0x01, // one subdirectory (OpenPGP)
    0x01, // one elementary file (serial)
    0x00, // no secret codes
    0x00, // unused
    0x00, 0x00, // PIN status
];

/// Required total APDU length for PSO: COMPUTE DIGITAL SIGNATURE with a
/// 35-byte DigestInfo, without and with a trailing Le byte
const PSO_CDS_APDU_LEN: usize = 8 + 35;

/// A command-processing session over the card state
pub struct TokenSession {
    store: DataStore,
    access: AccessState,
    file_selection: FileSelection,
}

impl TokenSession {
    /// Create a session over a loaded store
    pub fn new(store: DataStore) -> Self {
        Self {
            store,
            access: AccessState::new(),
            file_selection: FileSelection::None,
        }
    }

    /// Drop all authorizations and the file selection, as a power cycle
    /// or card reset would
    pub fn reset(&mut self) {
        self.access.clear_all();
        self.file_selection = FileSelection::None;
    }

    /// Process one command APDU and produce its response
    pub fn process_apdu(&mut self, raw: &[u8]) -> Response {
        let apdu = match Apdu::parse(raw) {
            Ok(apdu) => apdu,
            Err(e) => {
                warn!("unusable command: {}", e);
                return Response::error(SW::GENERIC_ERROR);
            }
        };

        debug!(
            "INS {:02X} P1 {:02X} P2 {:02X} len {}",
            apdu.ins(),
            apdu.p1(),
            apdu.p2(),
            apdu.total_len()
        );

        match Ins::from_byte(apdu.ins()) {
            Some(Ins::Verify) => self.cmd_verify(apdu),
            Some(Ins::ChangeReferenceData) => self.cmd_change_password(apdu),
            Some(Ins::Pso) => self.cmd_pso(apdu),
            Some(Ins::ResetRetryCounter) => self.cmd_reset_retry_counter(apdu),
            Some(Ins::GenerateAsymmetricKeyPair) => self.cmd_generate_key(apdu),
            Some(Ins::InternalAuthenticate) => self.cmd_internal_authenticate(apdu),
            Some(Ins::SelectFile) => self.cmd_select_file(apdu),
            Some(Ins::ReadBinary) => self.cmd_read_binary(apdu),
            Some(Ins::GetData) => self.cmd_get_data(apdu),
            Some(Ins::PutData) | Some(Ins::PutDataOdd) => self.cmd_put_data(apdu),
            None => {
                debug!("unknown INS {:02X}", apdu.ins());
                Response::error(SW::WRONG_INS)
            }
        }
    }

    // =====================================================================
    // SELECT FILE / READ BINARY
    // =====================================================================

    fn cmd_select_file(&mut self, apdu: Apdu) -> Response {
        if apdu.p1() == 4 {
            // selection by DF name; the AID payload is not validated
            debug!("select DF by name");
            self.file_selection = FileSelection::DfOpenpgp;
            return Response::ok();
        }

        let body = match apdu.body() {
            Ok(body) => body,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        match body {
            [0x2F, 0x02] => {
                debug!("select EF 2F02 (serial)");
                self.file_selection = FileSelection::EfSerial;
                Response::ok()
            }
            [0x3F, 0x00] => {
                debug!("select MF");
                self.file_selection = FileSelection::Mf;
                if apdu.p2() == 0x0C {
                    Response::ok()
                } else {
                    let mut template = SELECT_MF_TEMPLATE.to_vec();
                    let total = self.store.state().do_bytes_total().min(0xFFFF) as u16;
                    template[2] = total as u8;
                    template[3] = (total >> 8) as u8;
                    Response::success(template)
                }
            }
            _ => {
                debug!("select: target not found");
                self.file_selection = FileSelection::None;
                Response::error(SW::NO_FILE)
            }
        }
    }

    fn cmd_read_binary(&mut self, apdu: Apdu) -> Response {
        if self.file_selection != FileSelection::EfSerial {
            return Response::error(SW::NO_RECORD);
        }
        if apdu.p2() >= 6 {
            return Response::error(SW::BAD_P0_P1);
        }

        let aid = self.store.state().aid_bytes();
        let mut data = Vec::with_capacity(1 + aid.len());
        data.push(0x5A);
        data.extend_from_slice(aid);
        Response::success(data)
    }

    // =====================================================================
    // VERIFY
    // =====================================================================

    fn cmd_verify(&mut self, apdu: Apdu) -> Response {
        let body = match apdu.body() {
            Ok(body) => body,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        match apdu.p2() {
            0x81 | 0x82 => {
                let mode = if apdu.p2() == 0x81 {
                    UserMode::Cds
                } else {
                    UserMode::Other
                };
                if body.is_empty() {
                    return self.verify_status_query(Credential::User, match mode {
                        UserMode::Cds => self.access.pso_cds_authorized(),
                        UserMode::Other => self.access.pso_other_authorized(),
                    });
                }
                let status = self
                    .access
                    .verify_user(self.store.state_mut(), mode, body);
                self.finish_verify(status)
            }
            0x83 => {
                if body.is_empty() {
                    return self
                        .verify_status_query(Credential::Admin, self.access.admin_authorized());
                }
                let status = self.access.verify_admin(self.store.state_mut(), body);
                self.finish_verify(status)
            }
            _ => Response::error(SW::BAD_P0_P1),
        }
    }

    /// Empty VERIFY payload asks whether the credential is verified
    fn verify_status_query(&self, who: Credential, authorized: bool) -> Response {
        if self.store.state().locked(who) {
            Response::error(SW::AUTH_BLOCKED)
        } else if authorized {
            Response::ok()
        } else {
            Response::error(SW::SECURITY_FAILURE)
        }
    }

    fn finish_verify(&mut self, status: VerifyStatus) -> Response {
        self.persist_counters();
        match status {
            VerifyStatus::Failed => Response::error(SW::SECURITY_FAILURE),
            VerifyStatus::Blocked => Response::error(SW::AUTH_BLOCKED),
            VerifyStatus::Verified => Response::ok(),
        }
    }

    // =====================================================================
    // CHANGE REFERENCE DATA
    // =====================================================================

    fn cmd_change_password(&mut self, apdu: Apdu) -> Response {
        let body = match apdu.body() {
            Ok(body) => body,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        match apdu.p2() {
            0x81 => self.change_pw1(body),
            0x83 => self.change_pw3(body),
            _ => Response::error(SW::BAD_P0_P1),
        }
    }

    fn change_pw1(&mut self, body: &[u8]) -> Response {
        let state = self.store.state_mut();
        let old_len = match &state.pw1 {
            Some(record) => record.length as usize,
            None => crate::card::FACTORY_PW1.len(),
        };
        if body.len() < old_len {
            debug!("change PW1: payload shorter than current password");
            return Response::error(SW::SECURITY_FAILURE);
        }
        let (old_pw, new_pw) = body.split_at(old_len);

        let old_ks = HashOperations::keystring(old_pw);
        let new_ks = HashOperations::keystring(new_pw);

        match change_keystring(state, Credential::User, &old_ks, Credential::User, &new_ks) {
            Err(_) => {
                debug!("change PW1: key migration failed");
                Response::error(SW::SECURITY_FAILURE)
            }
            Ok(_) => {
                state.pw1 = Some(KeystringRecord::derive(new_pw));
                state.reset_errors(Credential::User);
                self.access.clear_pso_cds();
                self.save_or_memory_failure()
            }
        }
    }

    fn change_pw3(&mut self, body: &[u8]) -> Response {
        let split = match self
            .access
            .verify_admin_prefix(self.store.state_mut(), body)
        {
            PrefixVerify::Failed => {
                self.persist_counters();
                return Response::error(SW::SECURITY_FAILURE);
            }
            PrefixVerify::Blocked => return Response::error(SW::AUTH_BLOCKED),
            PrefixVerify::Ok(split) => split,
        };

        let (old_pw, new_pw) = body.split_at(split);
        let old_ks = HashOperations::keystring(old_pw);
        let new_ks = HashOperations::keystring(new_pw);

        let state = self.store.state_mut();
        match change_keystring(state, Credential::Admin, &old_ks, Credential::Admin, &new_ks) {
            Err(KeyError::Crypto) | Err(KeyError::Data) => {
                debug!("change PW3: key migration failed");
                Response::error(SW::SECURITY_FAILURE)
            }
            Ok(_) => {
                state.pw3 = Some(KeystringRecord::derive(new_pw));
                state.reset_errors(Credential::Admin);
                self.save_or_memory_failure()
            }
        }
    }

    // =====================================================================
    // RESET RETRY COUNTER
    // =====================================================================

    fn cmd_reset_retry_counter(&mut self, apdu: Apdu) -> Response {
        let body = match apdu.body() {
            Ok(body) => body,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        match apdu.p1() {
            0x00 => self.reset_pw1_with_rc(body),
            0x02 => self.reset_pw1_with_admin(body),
            _ => Response::error(SW::BAD_P0_P1),
        }
    }

    fn reset_pw1_with_rc(&mut self, body: &[u8]) -> Response {
        let state = self.store.state_mut();
        if state.locked(Credential::ResetCode) {
            return Response::error(SW::AUTH_BLOCKED);
        }
        let rc = match &state.rc {
            Some(rc) => rc.clone(),
            None => return Response::error(SW::SECURITY_FAILURE),
        };

        let old_len = rc.length as usize;
        if body.len() < old_len {
            return self.rc_failure();
        }
        let (old_pw, new_pw) = body.split_at(old_len);
        let old_ks = HashOperations::keystring(old_pw);
        let new_ks = HashOperations::keystring(new_pw);

        match change_keystring(
            state,
            Credential::ResetCode,
            &old_ks,
            Credential::User,
            &new_ks,
        ) {
            Err(_) => self.rc_failure(),
            Ok(KeyMigration::NoKeys) if old_ks[..] != rc.digest[..] => self.rc_failure(),
            Ok(_) => {
                let state = self.store.state_mut();
                state.pw1 = Some(KeystringRecord::derive(new_pw));
                state.reset_errors(Credential::ResetCode);
                state.reset_errors(Credential::User);
                self.access.clear_pso_cds();
                self.save_or_memory_failure()
            }
        }
    }

    fn rc_failure(&mut self) -> Response {
        self.store
            .state_mut()
            .increment_errors(Credential::ResetCode);
        self.persist_counters();
        Response::error(SW::SECURITY_FAILURE)
    }

    fn reset_pw1_with_admin(&mut self, body: &[u8]) -> Response {
        if !self.access.admin_authorized() {
            return Response::error(SW::SECURITY_FAILURE);
        }

        let state = self.store.state_mut();
        let old_ks = current_admin_keystring(state);
        let new_ks = HashOperations::keystring(body);

        match change_keystring(state, Credential::Admin, &old_ks, Credential::User, &new_ks) {
            Err(_) => {
                debug!("reset PW1 by admin: key migration failed");
                Response::error(SW::SECURITY_FAILURE)
            }
            Ok(_) => {
                state.pw1 = Some(KeystringRecord::derive(body));
                state.reset_errors(Credential::User);
                self.access.clear_pso_cds();
                self.save_or_memory_failure()
            }
        }
    }

    // =====================================================================
    // PSO / INTERNAL AUTHENTICATE
    // =====================================================================

    fn cmd_pso(&mut self, apdu: Apdu) -> Response {
        match (apdu.p1(), apdu.p2()) {
            (0x9E, 0x9A) => self.pso_compute_signature(apdu),
            (0x80, 0x86) => self.pso_decipher(apdu),
            _ => {
                debug!("PSO {:02X}{:02X} not supported", apdu.p1(), apdu.p2());
                Response::error(SW::GENERIC_ERROR)
            }
        }
    }

    fn pso_compute_signature(&mut self, apdu: Apdu) -> Response {
        if !self.access.pso_cds_authorized() {
            return Response::error(SW::SECURITY_FAILURE);
        }

        let total = apdu.total_len();
        if total != PSO_CDS_APDU_LEN && total != PSO_CDS_APDU_LEN + 1 {
            debug!("PSO sign: wrong length {}", total);
            return Response::error(SW::GENERIC_ERROR);
        }
        let digest_info = match apdu.body() {
            Ok(body) => body,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        let state = self.store.state();
        let ks = current_user_keystring(state);
        let loaded = state
            .key(KeyPurpose::Signing)
            .as_ref()
            .ok_or(KeyError::Crypto)
            .and_then(|record| record.load(Credential::User, &ks));
        let key = match loaded {
            Ok(key) => key,
            Err(_) => {
                self.access.clear_pso_cds();
                return Response::error(SW::GENERIC_ERROR);
            }
        };

        match RsaOperations::sign(&key, digest_info) {
            Ok(signature) => {
                let state = self.store.state_mut();
                if !state.pw1_lifetime {
                    self.access.clear_pso_cds();
                }
                state.signature_counter = state.signature_counter.saturating_add(1);
                self.persist_counters();
                Response::success(signature)
            }
            Err(_) => {
                self.access.clear_pso_cds();
                Response::error(SW::GENERIC_ERROR)
            }
        }
    }

    fn pso_decipher(&mut self, apdu: Apdu) -> Response {
        if self.store.state().locked(Credential::User)
            || !self.access.pso_other_authorized()
        {
            self.access.clear_pso_other();
            return Response::error(SW::SECURITY_FAILURE);
        }

        let body = match apdu.body() {
            Ok(body) if !body.is_empty() => body,
            _ => return Response::error(SW::GENERIC_ERROR),
        };

        let key = match self.load_user_key(KeyPurpose::Decryption) {
            Ok(key) => key,
            Err(response) => return response,
        };
        self.access.clear_pso_other();

        // skip the leading padding-indicator byte
        match RsaOperations::decrypt(&key, &body[1..]) {
            Ok(plain) => Response::success(plain),
            Err(_) => Response::error(SW::GENERIC_ERROR),
        }
    }

    fn cmd_internal_authenticate(&mut self, apdu: Apdu) -> Response {
        if apdu.p1() != 0x00 || apdu.p2() != 0x00 {
            return Response::error(SW::GENERIC_ERROR);
        }
        if self.store.state().locked(Credential::User)
            || !self.access.pso_other_authorized()
        {
            self.access.clear_pso_other();
            return Response::error(SW::SECURITY_FAILURE);
        }

        let body = match apdu.body() {
            Ok(body) => body,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        let key = match self.load_user_key(KeyPurpose::Authentication) {
            Ok(key) => key,
            Err(response) => return response,
        };
        self.access.clear_pso_other();

        match RsaOperations::sign(&key, body) {
            Ok(signature) => Response::success(signature),
            Err(_) => Response::error(SW::GENERIC_ERROR),
        }
    }

    /// Load a key under PW1's keystring with the counter discipline of
    /// the decrypt/authenticate paths: an unwrap failure counts against
    /// PW1, a success resets the counter.
    fn load_user_key(
        &mut self,
        purpose: KeyPurpose,
    ) -> Result<rsa::RsaPrivateKey, Response> {
        let state = self.store.state();
        let ks = current_user_keystring(state);
        let record = match state.key(purpose) {
            Some(record) => record,
            None => return Err(Response::error(SW::GENERIC_ERROR)),
        };

        match record.load(Credential::User, &ks) {
            Ok(key) => {
                self.store.state_mut().reset_errors(Credential::User);
                self.persist_counters();
                Ok(key)
            }
            Err(_) => {
                self.store.state_mut().increment_errors(Credential::User);
                self.access.clear_pso_other();
                self.persist_counters();
                Err(Response::error(SW::SECURITY_FAILURE))
            }
        }
    }

    // =====================================================================
    // GENERATE ASYMMETRIC KEY PAIR
    // =====================================================================

    fn cmd_generate_key(&mut self, apdu: Apdu) -> Response {
        if apdu.p1() == 0x81 {
            // read public key; the CRT tag sits at offset 7 of the
            // extended-length APDU GnuPG sends
            let purpose = match apdu.byte_at(7).and_then(purpose_for_crt) {
                Some(purpose) => purpose,
                None => return Response::error(SW::GENERIC_ERROR),
            };
            return match self.store.state().key(purpose) {
                Some(record) => public_key_template(record),
                None => Response::error(SW::NO_RECORD),
            };
        }

        if !self.access.admin_authorized() {
            return Response::error(SW::SECURITY_FAILURE);
        }
        // on-device key generation is not supported
        Response::error(SW::GENERIC_ERROR)
    }

    // =====================================================================
    // GET DATA / PUT DATA
    // =====================================================================

    fn cmd_get_data(&mut self, apdu: Apdu) -> Response {
        if self.file_selection != FileSelection::DfOpenpgp {
            return Response::error(SW::NO_RECORD);
        }

        let state = self.store.state();
        let tag = apdu.p1p2();
        let data = match tag {
            0x004F => state.aid_bytes().to_vec(),

            0x005B => state.cardholder.name.as_bytes().to_vec(),
            0x5F2D => state.cardholder.language.as_bytes().to_vec(),
            0x5F35 => vec![state.cardholder.sex],
            0x005E => state.cardholder.login.as_bytes().to_vec(),
            0x5F50 => state.cardholder.url.as_bytes().to_vec(),

            // cardholder related data
            0x0065 => TlvBuilder::new()
                .add(0x5B, state.cardholder.name.as_bytes())
                .add(0x5F2D, state.cardholder.language.as_bytes())
                .add(0x5F35, &[state.cardholder.sex])
                .wrap(0x65)
                .build(),

            // application related data
            0x006E => {
                let discretionary = TlvBuilder::new()
                    .add(0xC4, &state.pw_status_bytes())
                    .add(0xC5, &state.fingerprints())
                    .wrap(0x73)
                    .build();
                TlvBuilder::new()
                    .add(0x4F, state.aid_bytes())
                    .add_raw(&discretionary)
                    .wrap(0x6E)
                    .build()
            }

            // security support template
            0x007A => TlvBuilder::new()
                .add(0x93, &state.signature_counter_bytes())
                .wrap(0x7A)
                .build(),

            0x00C4 => state.pw_status_bytes(),
            0x00C5 => state.fingerprints(),
            0x00C7 => state.fingerprint_sig.clone(),
            0x00C8 => state.fingerprint_dec.clone(),
            0x00C9 => state.fingerprint_aut.clone(),

            0x0093 => state.signature_counter_bytes(),

            0x0101 => state.private_do_1.clone(),
            0x0102 => state.private_do_2.clone(),
            0x0103 => state.private_do_3.clone(),
            0x0104 => state.private_do_4.clone(),

            _ => {
                debug!("GET DATA: no DO {:04X}", tag);
                return Response::error(SW::NO_RECORD);
            }
        };

        Response::success(data)
    }

    fn cmd_put_data(&mut self, apdu: Apdu) -> Response {
        if self.file_selection != FileSelection::DfOpenpgp {
            return Response::error(SW::NO_RECORD);
        }

        let tag = apdu.p1p2();
        if !self.put_access_granted(tag) {
            return Response::error(SW::SECURITY_FAILURE);
        }

        let body = match apdu.body() {
            Ok(body) => body.to_vec(),
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };

        match tag {
            0x3FFF => return self.import_key(&body),
            0x00D3 => return self.install_reset_code(&body),
            _ => {}
        }

        let state = self.store.state_mut();
        match tag {
            0x005B => state.cardholder.name = String::from_utf8_lossy(&body).into_owned(),
            0x5F2D => state.cardholder.language = String::from_utf8_lossy(&body).into_owned(),
            0x5F35 => {
                if let Some(&sex) = body.first() {
                    state.cardholder.sex = sex;
                }
            }
            0x005E => state.cardholder.login = String::from_utf8_lossy(&body).into_owned(),
            0x5F50 => state.cardholder.url = String::from_utf8_lossy(&body).into_owned(),

            // first status byte selects the PW1 lifetime
            0x00C4 => match body.first() {
                Some(&flag) => state.pw1_lifetime = flag != 0,
                None => return Response::error(SW::GENERIC_ERROR),
            },

            0x00C7 | 0x00C8 | 0x00C9 => {
                if body.len() != 20 {
                    return Response::error(SW::GENERIC_ERROR);
                }
                match tag {
                    0x00C7 => state.fingerprint_sig = body,
                    0x00C8 => state.fingerprint_dec = body,
                    _ => state.fingerprint_aut = body,
                }
            }

            0x0101 => state.private_do_1 = body,
            0x0102 => state.private_do_2 = body,
            0x0103 => state.private_do_3 = body,
            0x0104 => state.private_do_4 = body,

            _ => {
                debug!("PUT DATA: no DO {:04X}", tag);
                return Response::error(SW::NO_RECORD);
            }
        }

        self.save_or_memory_failure()
    }

    /// Per-tag write access. Reads are unrestricted; writes need ADMIN
    /// except for the first two private DOs, which PW1 may write.
    fn put_access_granted(&self, tag: u16) -> bool {
        match tag {
            0x0101 | 0x0102 => {
                self.access.pso_cds_authorized() || self.access.pso_other_authorized()
            }
            _ => self.access.admin_authorized(),
        }
    }

    /// Install, replace or clear the Reset Code (DO 0xD3)
    fn install_reset_code(&mut self, body: &[u8]) -> Response {
        let state = self.store.state_mut();

        if body.is_empty() {
            state.rc = None;
            state.rc_errors = 0;
            for purpose in KeyPurpose::ALL {
                if let Some(record) = state.key_mut(purpose) {
                    record.drop_wrap(Credential::ResetCode);
                }
            }
            return self.save_or_memory_failure();
        }

        let admin_ks = current_admin_keystring(state);
        let rc_record = KeystringRecord::derive(body);
        let rc_ks = rc_record.keystring();

        // existing keys become resettable: give each one an RC wrap
        for purpose in KeyPurpose::ALL {
            if let Some(record) = state.key_mut(purpose) {
                if record
                    .rewrap(Credential::Admin, &admin_ks, Credential::ResetCode, &rc_ks)
                    .is_err()
                {
                    debug!("reset code install: cannot rewrap {:?} key", purpose);
                    return Response::error(SW::SECURITY_FAILURE);
                }
            }
        }

        state.rc = Some(rc_record);
        state.rc_errors = 0;
        self.save_or_memory_failure()
    }

    /// RSA key import from an extended header list
    /// (`4D { CRT, 7F48, 5F48 }`)
    fn import_key(&mut self, body: &[u8]) -> Response {
        let header = match read_list(body).into_iter().find(|t| t.tag == 0x4D) {
            Some(t) => t,
            None => return Response::error(SW::GENERIC_ERROR),
        };
        let children = read_list(&header.value);

        let purpose = match children
            .iter()
            .find_map(|t| purpose_for_crt(t.tag as u8))
        {
            Some(p) => p,
            None => return Response::error(SW::GENERIC_ERROR),
        };
        let template = match children.iter().find(|t| t.tag == 0x7F48) {
            Some(t) => t,
            None => return Response::error(SW::GENERIC_ERROR),
        };
        let concat = match children.iter().find(|t| t.tag == 0x5F48) {
            Some(t) => t,
            None => return Response::error(SW::GENERIC_ERROR),
        };

        let (e_len, p_len, q_len) = parse_crt_lengths(&template.value);
        if e_len == 0 || p_len == 0 || q_len == 0 {
            return Response::error(SW::GENERIC_ERROR);
        }
        if concat.value.len() != e_len + p_len + q_len {
            debug!(
                "key import: component length mismatch {} != {}+{}+{}",
                concat.value.len(),
                e_len,
                p_len,
                q_len
            );
            return Response::error(SW::GENERIC_ERROR);
        }

        let e = &concat.value[..e_len];
        let p = &concat.value[e_len..e_len + p_len];
        let q = &concat.value[e_len + p_len..];

        let n = (BigUint::from_bytes_be(p) * BigUint::from_bytes_be(q)).to_bytes_be();
        let material = RsaOperations::encode_private(e, p, q);
        let public = RsaOperations::encode_public(&n, e);

        let state = self.store.state_mut();
        let mut wraps = vec![
            (Credential::User, current_user_keystring(state)),
            (Credential::Admin, current_admin_keystring(state)),
        ];
        if let Some(rc) = &state.rc {
            wraps.push((Credential::ResetCode, rc.keystring()));
        }

        let record = match PrivateKeyRecord::install(&material, public, &wraps) {
            Ok(record) => record,
            Err(_) => return Response::error(SW::GENERIC_ERROR),
        };
        *state.key_mut(purpose) = Some(record);

        debug!("imported {:?} key, modulus {} bits", purpose, n.len() * 8);
        self.save_or_memory_failure()
    }

    // =====================================================================
    // helpers
    // =====================================================================

    /// Persist after a record mutation; a failed write is MEMORY_FAILURE
    fn save_or_memory_failure(&mut self) -> Response {
        match self.store.save() {
            Ok(()) => Response::ok(),
            Err(e) => {
                warn!("persist failed: {}", e);
                Response::error(SW::MEMORY_FAILURE)
            }
        }
    }

    /// Best-effort persist of counter movements; counter state degrades
    /// to the last written value after power loss, it never corrupts
    fn persist_counters(&self) {
        if let Err(e) = self.store.save() {
            warn!("counter persist failed: {}", e);
        }
    }
}

/// Map a CRT tag byte to the key it addresses
fn purpose_for_crt(crt: u8) -> Option<KeyPurpose> {
    match crt {
        0xB6 => Some(KeyPurpose::Signing),
        0xB8 => Some(KeyPurpose::Decryption),
        0xA4 => Some(KeyPurpose::Authentication),
        _ => None,
    }
}

/// Public key response: `7F49 { 81 modulus, 82 exponent }`
fn public_key_template(record: &PrivateKeyRecord) -> Response {
    let n = match RsaOperations::modulus(&record.public) {
        Some(n) => n,
        None => return Response::error(SW::GENERIC_ERROR),
    };
    let e = match RsaOperations::exponent(&record.public) {
        Some(e) => e,
        None => return Response::error(SW::GENERIC_ERROR),
    };
    Response::success(
        TlvBuilder::new()
            .add(0x81, &n)
            .add(0x82, &e)
            .wrap(0x7F49)
            .build(),
    )
}

/// Parse the `91 <len-e> 92 <len-p> 93 <len-q>` private-key template.
/// The BER length after each tag IS the component size; the template
/// carries no values.
fn parse_crt_lengths(data: &[u8]) -> (usize, usize, usize) {
    let mut e_len = 0;
    let mut p_len = 0;
    let mut q_len = 0;

    let mut offset = 0;
    while offset < data.len() {
        let tag = data[offset];
        offset += 1;

        let first = match data.get(offset) {
            Some(&b) => b,
            None => break,
        };
        let len = if first & 0x80 == 0 {
            offset += 1;
            first as usize
        } else {
            let count = (first & 0x7F) as usize;
            if count == 0 || count > 2 || offset + count >= data.len() {
                break;
            }
            let mut len = 0usize;
            for i in 0..count {
                len = (len << 8) | data[offset + 1 + i] as usize;
            }
            offset += 1 + count;
            len
        };

        match tag {
            0x91 => e_len = len,
            0x92 => p_len = len,
            0x93 => q_len = len,
            _ => {}
        }
    }

    (e_len, p_len, q_len)
}
