//! pgptoken: a software OpenPGP card command core
//!
//! Implements the OpenPGP smart card application's command processor:
//! an APDU dispatcher, the PW1/RC/PW3 access-control state machine, and
//! a tag-addressed data-object store holding three RSA private keys
//! wrapped under password-derived keystrings.
//!
//! The crate is transport-agnostic. A transport delivers one command
//! APDU at a time to the [`worker::TokenWorker`] (or directly to an
//! [`openpgp::TokenSession`]) and receives `payload || SW1 || SW2` back;
//! `pgptoken-serve` bridges a TCP socket to the worker for testing with
//! host-side tools.

pub mod apdu;
pub mod card;
pub mod crypto;
pub mod openpgp;
pub mod tlv;
pub mod worker;

pub use apdu::{Apdu, Response, SW};
pub use card::{CardState, DataStore};
pub use openpgp::TokenSession;
pub use worker::TokenWorker;
