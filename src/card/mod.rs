//! Card state, wrapped keys and persistence
//!
//! The data-object store of the token: a tag-addressed, persistent state
//! that the command handlers read and write, including the three wrapped
//! private keys.

pub mod keys;
pub mod state;
pub mod storage;

pub use keys::{
    change_keystring, Credential, KeyError, KeyMigration, KeyPurpose, PrivateKeyRecord,
};
pub use state::{
    CardState, CardholderData, KeystringRecord, FACTORY_PW1, FACTORY_PW3, PW_MAX_ERRORS,
};
pub use storage::{DataStore, StoreError};
