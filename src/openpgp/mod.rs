//! OpenPGP card application
//!
//! The command dispatcher and the access-control state machine around
//! the three long-lived RSA keys.

pub mod access;
pub mod session;

pub use access::{AccessState, PrefixVerify, UserMode, VerifyStatus};
pub use session::{FileSelection, TokenSession};
