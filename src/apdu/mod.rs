//! APDU (Application Protocol Data Unit) handling
//!
//! A command APDU arrives as raw bytes: `CLA INS P1 P2 [Lc data..] [Le]`.
//! The total length on the wire is authoritative; Lc is advisory and must
//! never be trusted to index past the end of the buffer. `Apdu` therefore
//! keeps the raw bytes and computes the payload view on demand, reporting
//! truncation instead of panicking.
//!
//! Two length encodings are supported:
//! - short: Lc is one byte, 1..=255, payload starts at offset 5
//! - extended: Lc byte is 0x00 followed by a big-endian u16, payload
//!   starts at offset 7

mod response;
mod status;

pub use response::Response;
pub use status::SW;

use thiserror::Error;

/// Errors that can occur while reading an APDU
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApduError {
    #[error("APDU too short: expected at least 4 bytes, got {0}")]
    TooShort(usize),

    #[error("payload exceeds APDU length: {data_start} + {len} > {total}")]
    Truncated {
        data_start: usize,
        len: usize,
        total: usize,
    },
}

/// Instruction bytes recognized by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ins {
    Verify,
    ChangeReferenceData,
    Pso,
    ResetRetryCounter,
    GenerateAsymmetricKeyPair,
    InternalAuthenticate,
    SelectFile,
    ReadBinary,
    GetData,
    PutData,
    PutDataOdd,
}

impl Ins {
    /// Decode an instruction byte. Unknown instructions are data, not
    /// errors; the dispatcher answers them with `SW::WRONG_INS`.
    pub fn from_byte(ins: u8) -> Option<Self> {
        match ins {
            0x20 => Some(Ins::Verify),
            0x24 => Some(Ins::ChangeReferenceData),
            0x2A => Some(Ins::Pso),
            0x2C => Some(Ins::ResetRetryCounter),
            0x47 => Some(Ins::GenerateAsymmetricKeyPair),
            0x88 => Some(Ins::InternalAuthenticate),
            0xA4 => Some(Ins::SelectFile),
            0xB0 => Some(Ins::ReadBinary),
            0xCA => Some(Ins::GetData),
            0xDA => Some(Ins::PutData),
            0xDB => Some(Ins::PutDataOdd),
            _ => None,
        }
    }
}

/// A command APDU, viewed over the raw request bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Apdu<'a> {
    raw: &'a [u8],
}

impl<'a> Apdu<'a> {
    /// Wrap raw command bytes. Only the 4-byte header is required here;
    /// payload validation happens lazily in [`Apdu::body`].
    pub fn parse(raw: &'a [u8]) -> Result<Self, ApduError> {
        if raw.len() < 4 {
            return Err(ApduError::TooShort(raw.len()));
        }
        Ok(Self { raw })
    }

    pub fn cla(&self) -> u8 {
        self.raw[0]
    }

    pub fn ins(&self) -> u8 {
        self.raw[1]
    }

    pub fn p1(&self) -> u8 {
        self.raw[2]
    }

    pub fn p2(&self) -> u8 {
        self.raw[3]
    }

    /// P1 and P2 combined, as used by PSO dispatch
    pub fn p1p2(&self) -> u16 {
        ((self.raw[2] as u16) << 8) | (self.raw[3] as u16)
    }

    /// Total length of the command on the wire. Authoritative.
    pub fn total_len(&self) -> usize {
        self.raw.len()
    }

    /// The raw bytes, for handlers that address absolute offsets
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// A single byte at an absolute offset, bounds-checked
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        self.raw.get(offset).copied()
    }

    /// The command payload, decoded from the Lc encoding.
    ///
    /// A header-only command, or one whose Lc byte is 0x00 but which is
    /// too short to carry an extended length, has an empty payload. An Lc
    /// that points past the end of the buffer is an error.
    pub fn body(&self) -> Result<&'a [u8], ApduError> {
        let total = self.raw.len();
        if total <= 4 {
            return Ok(&[]);
        }

        let lc = self.raw[4] as usize;
        let (data_start, len) = if lc == 0 {
            if total < 7 {
                // case-2 short APDU: the byte at offset 4 is Le
                return Ok(&[]);
            }
            let len = ((self.raw[5] as usize) << 8) | (self.raw[6] as usize);
            (7, len)
        } else {
            (5, lc)
        };

        if data_start + len > total {
            return Err(ApduError::Truncated {
                data_start,
                len,
                total,
            });
        }

        Ok(&self.raw[data_start..data_start + len])
    }
}
