// SPDX-License-Identifier: MIT OR Apache-2.0

//! Policy digest vectors and error classification through the public API
//!
//! Nothing here talks to a device: these pin the byte-level values a sealed
//! object's authPolicy commits to.

use tpmseal::{
    calculate_pcr_policy_digest, extend_value, ArgumentReason, Error, ErrorKind, PcrSelection,
    PolicyDigest, ProtocolError, ResponseCode, SealedBlob, TpmAlg, TpmRc,
};

/// PolicyPCR(sha1, [16]) over an all-zero PCR, then PolicyPassword
const PCR16_PASSWORD_SHA1: &str = "f1d6a42f9f23b96e6a4b1b0c989a8d8e6c856ca7";

const PASSWORD_ONLY_SHA1: &str = "af6038c78c5c962d37127e319124e3a8dc582e9b";
const PASSWORD_ONLY_SHA256: &str =
    "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e";

// =============================================================================
// Policy digests
// =============================================================================

#[test]
fn test_password_only_vectors() {
    let mut sha1 = PolicyDigest::empty(TpmAlg::Sha1).unwrap();
    sha1.extend_password().unwrap();
    assert_eq!(sha1.to_hex(), PASSWORD_ONLY_SHA1);

    let mut sha256 = PolicyDigest::empty(TpmAlg::Sha256).unwrap();
    sha256.extend_password().unwrap();
    assert_eq!(sha256.to_string(), PASSWORD_ONLY_SHA256);
}

#[test]
fn test_pcr_and_password_vector() {
    let mut policy =
        calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &[(16, vec![0u8; 20])]).unwrap();
    policy.extend_password().unwrap();
    assert_eq!(policy.to_hex(), PCR16_PASSWORD_SHA1);
}

#[test]
fn test_pcr_policy_ignores_value_order() {
    let a = vec![0x11u8; 32];
    let b = vec![0x22u8; 32];
    let forward =
        calculate_pcr_policy_digest(TpmAlg::Sha256, TpmAlg::Sha256, &[(1, a.clone()), (7, b.clone())])
            .unwrap();
    let reversed =
        calculate_pcr_policy_digest(TpmAlg::Sha256, TpmAlg::Sha256, &[(7, b), (1, a)]).unwrap();
    assert_eq!(forward, reversed);
}

#[test]
fn test_pcr_policy_depends_on_values() {
    let zero =
        calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &[(16, vec![0u8; 20])]).unwrap();
    let extended = extend_value(TpmAlg::Sha1, &[0u8; 20], &[b'X'; 20]).unwrap();
    let changed =
        calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &[(16, extended)]).unwrap();
    assert_ne!(zero, changed);
}

#[test]
fn test_pcr_policy_rejects_bad_input() {
    let err = calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgument(ArgumentReason::EmptyPcrSelection)
    ));

    let err = calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha256, &[(16, vec![0u8; 20])])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgument(ArgumentReason::DigestSize {
            expected: 32,
            got: 20
        })
    ));

    let err = calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &[(24, vec![0u8; 20])])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_policy_digest_from_bytes_checks_length() {
    assert!(PolicyDigest::from_bytes(TpmAlg::Sha1, &[0u8; 20]).is_ok());
    assert!(PolicyDigest::from_bytes(TpmAlg::Sha1, &[0u8; 32]).is_err());
    assert!(PolicyDigest::from_bytes(TpmAlg::Sha256, &hex::decode(PASSWORD_ONLY_SHA256).unwrap())
        .is_ok());
}

// =============================================================================
// PCR selection
// =============================================================================

#[test]
fn test_selection_wire_form() {
    let selection = PcrSelection::new(TpmAlg::Sha1, &[16, 0, 7, 16]).unwrap();
    assert_eq!(selection.indices(), vec![0, 7, 16]);
    assert_eq!(
        selection.to_bytes(),
        vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x04, 0x03, 0x81, 0x00, 0x01]
    );
}

// =============================================================================
// Error classification
// =============================================================================

#[test]
fn test_response_codes_classify() {
    let cases = [
        (0x98E, ResponseCode::AuthFailure, TpmRc::AuthFail),
        (0x999, ResponseCode::PolicyFailure, TpmRc::PolicyFail),
        (0x1D5, ResponseCode::SizeViolation, TpmRc::Size),
        (0x12F, ResponseCode::AuthFailure, TpmRc::AuthUnavailable),
        (0x902, ResponseCode::ResourceExhausted, TpmRc::ObjectMemory),
        (0x903, ResponseCode::ResourceExhausted, TpmRc::SessionMemory),
        (0x1C4, ResponseCode::Value, TpmRc::Value),
    ];
    for (rc, kind, base) in cases {
        let err = ProtocolError::from_rc(rc);
        assert_eq!(err.kind, kind, "rc 0x{:03X}", rc);
        assert_eq!(err.base(), base as u32, "rc 0x{:03X}", rc);
        assert_eq!(err.rc, rc);
    }
}

#[test]
fn test_error_kind_of_unknown_code() {
    let err = Error::from(ProtocolError::from_rc(0x1DF));
    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(err.rc(), Some(0x1DF));
}

#[test]
fn test_local_size_violation_matches_device() {
    let local = ProtocolError::size_violation();
    assert_eq!(local.kind, ResponseCode::SizeViolation);
    assert_eq!(local.base(), ProtocolError::from_rc(0x1D5).base());
}

// =============================================================================
// Sealed blobs
// =============================================================================

#[test]
fn test_sealed_blob_layout() {
    let blob = SealedBlob {
        private: vec![0xAA; 4],
        public: vec![0xBB; 2],
    };
    let bytes = blob.to_bytes();
    assert_eq!(
        bytes,
        vec![0x00, 0x04, 0xAA, 0xAA, 0xAA, 0xAA, 0x00, 0x02, 0xBB, 0xBB]
    );
    assert_eq!(SealedBlob::from_bytes(&bytes).unwrap(), blob);

    let err = SealedBlob::from_bytes(&bytes[..9]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);
}
