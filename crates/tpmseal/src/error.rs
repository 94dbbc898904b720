// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types
//!
//! Every failure the library reports is one of the variants of [`Error`].
//! Device response codes are mapped onto the closed [`ResponseCode`]
//! enumeration at the codec boundary; nothing above it looks at raw
//! integers to decide what to do.

use std::fmt;

use thiserror::Error;

use crate::TpmRc;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while talking to the TPM
#[derive(Debug, Error)]
pub enum Error {
    #[error("TPM protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportReason),

    #[error("Malformed TPM response: {0}")]
    Malformed(#[from] MalformedReason),

    #[error("Handle misuse: {0}")]
    Handle(#[from] HandleReason),

    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentReason),
}

impl Error {
    /// Semantic category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(e) => match e.kind {
                ResponseCode::AuthFailure => ErrorKind::AuthFailure,
                ResponseCode::PolicyFailure => ErrorKind::PolicyFailure,
                ResponseCode::SizeViolation => ErrorKind::SizeViolation,
                ResponseCode::ResourceExhausted => ErrorKind::ResourceExhausted,
                ResponseCode::InvalidHandle | ResponseCode::Value | ResponseCode::Other => {
                    ErrorKind::Device
                }
            },
            Error::Transport(_) => ErrorKind::TransportFailure,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Handle(_) => ErrorKind::HandleMisuse,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// The response code carried by a protocol error, if any
    pub fn rc(&self) -> Option<u32> {
        match self {
            Error::Protocol(e) => Some(e.rc),
            _ => None,
        }
    }
}

/// Flat error category for callers that branch on failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthFailure,
    PolicyFailure,
    SizeViolation,
    ResourceExhausted,
    TransportFailure,
    /// Any other device response code
    Device,
    Malformed,
    HandleMisuse,
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthFailure => "auth failure",
            ErrorKind::PolicyFailure => "policy failure",
            ErrorKind::SizeViolation => "size violation",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::TransportFailure => "transport failure",
            ErrorKind::Device => "device error",
            ErrorKind::Malformed => "malformed response",
            ErrorKind::HandleMisuse => "handle misuse",
            ErrorKind::InvalidArgument => "invalid argument",
        };
        f.write_str(name)
    }
}

// =============================================================================
// ProtocolError
// =============================================================================

/// Closed classification of TPM response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Presented auth value does not match the object's commitment
    AuthFailure,
    /// Session policy digest does not match the object's authPolicy
    PolicyFailure,
    /// A value exceeds the size allowed for its field
    SizeViolation,
    /// No free session or object slots
    ResourceExhausted,
    InvalidHandle,
    Value,
    Other,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseCode::AuthFailure => "AuthFailure",
            ResponseCode::PolicyFailure => "PolicyFailure",
            ResponseCode::SizeViolation => "SizeViolation",
            ResponseCode::ResourceExhausted => "ResourceExhausted",
            ResponseCode::InvalidHandle => "InvalidHandle",
            ResponseCode::Value => "Value",
            ResponseCode::Other => "Other",
        };
        f.write_str(name)
    }
}

/// A response-code-carrying failure
///
/// Produced either by the device or by a local pre-flight check that mirrors
/// a device check (for example an auth value longer than the name digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} (rc 0x{rc:03X})")]
pub struct ProtocolError {
    pub kind: ResponseCode,
    /// Raw response code as returned by the TPM
    pub rc: u32,
}

/// Format-one response codes carry bit 7
const RC_FMT1: u32 = 0x080;

/// Error number plus the format bit, for format-one codes
const RC_FMT1_MASK: u32 = 0x0BF;

impl ProtocolError {
    /// Classify a raw response code
    pub fn from_rc(rc: u32) -> Self {
        let kind = match TpmRc::from_u32(base_code(rc)) {
            Some(TpmRc::AuthFail)
            | Some(TpmRc::BadAuth)
            | Some(TpmRc::AuthType)
            | Some(TpmRc::AuthMissing)
            | Some(TpmRc::AuthUnavailable) => ResponseCode::AuthFailure,
            Some(TpmRc::PolicyFail) | Some(TpmRc::Policy) | Some(TpmRc::PcrChanged) => {
                ResponseCode::PolicyFailure
            }
            Some(TpmRc::Size) => ResponseCode::SizeViolation,
            Some(TpmRc::ObjectMemory)
            | Some(TpmRc::SessionMemory)
            | Some(TpmRc::Memory)
            | Some(TpmRc::SessionHandles)
            | Some(TpmRc::ObjectHandles) => ResponseCode::ResourceExhausted,
            Some(TpmRc::Handle) => ResponseCode::InvalidHandle,
            Some(TpmRc::Value) => ResponseCode::Value,
            _ => ResponseCode::Other,
        };
        Self { kind, rc }
    }

    /// Local size check failure, reported with the device's TPM_RC_SIZE code
    pub fn size_violation() -> Self {
        Self::from_rc(TpmRc::Size as u32)
    }

    /// Response code with handle/session/parameter number bits removed
    pub fn base(&self) -> u32 {
        base_code(self.rc)
    }
}

fn base_code(rc: u32) -> u32 {
    if rc & RC_FMT1 != 0 {
        rc & RC_FMT1_MASK
    } else {
        rc
    }
}

// =============================================================================
// TransportReason
// =============================================================================

#[derive(Debug, Error)]
pub enum TransportReason {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel unusable after an earlier transport failure")]
    Poisoned,
}

// =============================================================================
// MalformedReason
// =============================================================================

#[derive(Debug, Error)]
pub enum MalformedReason {
    #[error("Response buffer underflow: need {wanted} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        wanted: usize,
        available: usize,
    },

    #[error("Response size field says {declared} bytes, received {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("Parameter size mismatch: TPM said {declared} bytes, {available} available")]
    ParameterSize { declared: usize, available: usize },

    #[error("Unexpected response tag 0x{tag:04X}")]
    UnexpectedTag { tag: u16 },

    #[error("PCR {index} missing from PCR_Read response")]
    MissingPcr { index: u8 },

    #[error("Digest of {got} bytes where {expected} were expected")]
    DigestLength { expected: usize, got: usize },

    #[error("Sealed blob is not a TPM2B_PRIVATE followed by a TPM2B_PUBLIC")]
    SealedBlobLayout,
}

// =============================================================================
// HandleReason
// =============================================================================

#[derive(Debug, Error)]
pub enum HandleReason {
    #[error("Handle 0x{handle:08X} is not open")]
    NotOpen { handle: u32 },

    #[error("Handle 0x{handle:08X} is already tracked")]
    AlreadyOpen { handle: u32 },

    #[error("Handle 0x{handle:08X} is not a policy session handle")]
    NotASession { handle: u32 },

    #[error("Handle 0x{handle:08X} is not a root key")]
    NotARootKey { handle: u32 },

    #[error("Session 0x{handle:08X} is a {got} session, {expected} required")]
    WrongSessionKind {
        handle: u32,
        expected: crate::SessionKind,
        got: crate::SessionKind,
    },

    #[error("Session 0x{handle:08X} has no policy assertions yet")]
    NoAssertions { handle: u32 },

    #[error("Session 0x{handle:08X} was already consumed by a command")]
    SessionConsumed { handle: u32 },

    #[error("Policy digest of trial session 0x{handle:08X} was already read")]
    DigestAlreadyRead { handle: u32 },
}

// =============================================================================
// ArgumentReason
// =============================================================================

#[derive(Debug, Error)]
pub enum ArgumentReason {
    #[error("Algorithm 0x{alg:04X} is not a supported hash algorithm")]
    UnsupportedHash { alg: u16 },

    #[error("Unknown algorithm name: {0}")]
    UnknownAlgorithm(String),

    #[error("PCR index {index} out of range (0-23)")]
    PcrIndexOutOfRange { index: u8 },

    #[error("PCR selection is empty")]
    EmptyPcrSelection,

    #[error("Expected a {expected}-byte digest, got {got} bytes")]
    DigestSize { expected: usize, got: usize },

    #[error("Policy digest uses {got}, the session hash is {expected}")]
    PolicyAlgorithm {
        expected: crate::TpmAlg,
        got: crate::TpmAlg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_bits_are_masked() {
        // TPM_RC_AUTH_FAIL reported against session 1
        let err = ProtocolError::from_rc(0x98E);
        assert_eq!(err.kind, ResponseCode::AuthFailure);
        assert_eq!(err.base(), TpmRc::AuthFail as u32);

        let err = ProtocolError::from_rc(0x999);
        assert_eq!(err.kind, ResponseCode::PolicyFailure);
        assert_eq!(err.base(), TpmRc::PolicyFail as u32);
    }

    #[test]
    fn test_warning_codes_are_not_masked() {
        let err = ProtocolError::from_rc(0x903);
        assert_eq!(err.kind, ResponseCode::ResourceExhausted);
        assert_eq!(err.base(), 0x903);
    }

    #[test]
    fn test_unknown_code_is_other() {
        let err = Error::from(ProtocolError::from_rc(0x101));
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(err.rc(), Some(0x101));
    }

    #[test]
    fn test_local_size_violation_matches_device_code() {
        let err = ProtocolError::size_violation();
        assert_eq!(err.kind, ResponseCode::SizeViolation);
        assert_eq!(err.rc, 0x095);
        assert_eq!(Error::from(err).kind(), ErrorKind::SizeViolation);
    }
}
