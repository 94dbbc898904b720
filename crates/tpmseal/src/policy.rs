// SPDX-License-Identifier: MIT OR Apache-2.0

//! Policy digest accumulation
//!
//! A policy session folds each assertion into its running digest:
//!
//! ```text
//! PolicyPCR:      new = H(old || u32(TPM_CC_PolicyPCR) || TPML_PCR_SELECTION || pcrDigest)
//! PolicyPassword: new = H(old || u32(TPM_CC_PolicyAuthValue))
//! ```
//!
//! `H` is the session hash, the initial digest is all zeros of its size, and
//! `pcrDigest = H(value_0 || value_1 || ...)` over the selected PCRs in
//! ascending index order. PolicyPassword deliberately folds the same code as
//! PolicyAuthValue; the two differ only in how the auth value is presented
//! at command time.
//!
//! [`PolicyDigest`] reproduces the device's fold locally, so a digest can be
//! computed without a trial session and the device's answer can be
//! cross-checked.

use std::fmt;

use crate::digest;
use crate::error::{ArgumentReason, Result};
use crate::pcr::PcrSelection;
use crate::{TpmAlg, TpmCc};

/// Accumulated hash of the assertions applied to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDigest {
    alg: TpmAlg,
    bytes: Vec<u8>,
}

impl PolicyDigest {
    /// The digest of a session with no assertions (all zero bytes)
    pub fn empty(alg: TpmAlg) -> Result<Self> {
        let size = alg.hash_size()?;
        Ok(Self {
            alg,
            bytes: vec![0u8; size],
        })
    }

    /// Wrap a digest obtained elsewhere, e.g. from PolicyGetDigest
    pub fn from_bytes(alg: TpmAlg, bytes: &[u8]) -> Result<Self> {
        digest::check_size(alg, bytes)?;
        Ok(Self {
            alg,
            bytes: bytes.to_vec(),
        })
    }

    pub fn alg(&self) -> TpmAlg {
        self.alg
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Fold a PolicyPCR assertion
    ///
    /// `pcr_digest` is the session-hash digest of the selected PCR values,
    /// see [`pcr_composite_digest`].
    pub fn extend_pcr(&mut self, selection: &PcrSelection, pcr_digest: &[u8]) -> Result<()> {
        digest::check_size(self.alg, pcr_digest)?;
        self.bytes = digest::hash(
            self.alg,
            &[
                &self.bytes,
                &(TpmCc::PolicyPCR as u32).to_be_bytes(),
                &selection.to_bytes(),
                pcr_digest,
            ],
        )?;
        Ok(())
    }

    /// Fold a PolicyPassword assertion
    pub fn extend_password(&mut self) -> Result<()> {
        self.bytes = digest::hash(
            self.alg,
            &[&self.bytes, &(TpmCc::PolicyAuthValue as u32).to_be_bytes()],
        )?;
        Ok(())
    }
}

impl AsRef<[u8]> for PolicyDigest {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for PolicyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest of PCR values as folded into PolicyPCR
///
/// Values must be in ascending index order, which is the order PCR_Read
/// returns them in.
pub fn pcr_composite_digest(session_alg: TpmAlg, pcr_values: &[(u8, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut hasher = digest::Hasher::new(session_alg)?;
    for (_index, value) in pcr_values {
        hasher.update(value);
    }
    Ok(hasher.finalize())
}

/// Calculate the policy digest of a single PolicyPCR assertion
///
/// # Arguments
/// * `session_alg` - The session hash (the sealed object's nameAlg)
/// * `pcr_bank` - The PCR bank the policy references
/// * `pcr_values` - The PCR index and value pairs, in any order
pub fn calculate_pcr_policy_digest(
    session_alg: TpmAlg,
    pcr_bank: TpmAlg,
    pcr_values: &[(u8, Vec<u8>)],
) -> Result<PolicyDigest> {
    let bank_size = pcr_bank.hash_size()?;
    let mut values = pcr_values.to_vec();
    values.sort_by_key(|(index, _)| *index);
    values.dedup_by_key(|(index, _)| *index);

    for (_index, value) in &values {
        if value.len() != bank_size {
            return Err(ArgumentReason::DigestSize {
                expected: bank_size,
                got: value.len(),
            }
            .into());
        }
    }

    let indices: Vec<u8> = values.iter().map(|(index, _)| *index).collect();
    let selection = PcrSelection::new(pcr_bank, &indices)?;
    let pcr_digest = pcr_composite_digest(session_alg, &values)?;

    let mut policy = PolicyDigest::empty(session_alg)?;
    policy.extend_pcr(&selection, &pcr_digest)?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest_is_zeros() {
        let d = PolicyDigest::empty(TpmAlg::Sha1).unwrap();
        assert_eq!(d.as_bytes(), &[0u8; 20]);
        assert!(PolicyDigest::empty(TpmAlg::Aes).is_err());
    }

    #[test]
    fn test_password_assertion_known_answer() {
        // Well-known PolicyAuthValue/PolicyPassword digest for SHA-256
        let mut d = PolicyDigest::empty(TpmAlg::Sha256).unwrap();
        d.extend_password().unwrap();
        assert_eq!(
            d.to_hex(),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );
    }

    #[test]
    fn test_pcr_assertion_byte_layout() {
        let values = vec![(16u8, vec![0u8; 20])];
        let selection = PcrSelection::new(TpmAlg::Sha1, &[16]).unwrap();
        let pcr_digest = pcr_composite_digest(TpmAlg::Sha1, &values).unwrap();

        let mut expected_input = vec![0u8; 20];
        expected_input.extend_from_slice(&[0x00, 0x00, 0x01, 0x7F]);
        expected_input.extend_from_slice(&[0, 0, 0, 1, 0x00, 0x04, 3, 0x00, 0x00, 0x01]);
        expected_input.extend_from_slice(&pcr_digest);
        let expected = digest::hash(TpmAlg::Sha1, &[&expected_input]).unwrap();

        let mut d = PolicyDigest::empty(TpmAlg::Sha1).unwrap();
        d.extend_pcr(&selection, &pcr_digest).unwrap();
        assert_eq!(d.as_bytes(), expected.as_slice());

        let calculated = calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &values).unwrap();
        assert_eq!(calculated, d);
    }

    #[test]
    fn test_assertion_order_matters() {
        let selection = PcrSelection::new(TpmAlg::Sha1, &[16]).unwrap();
        let pcr_digest = pcr_composite_digest(TpmAlg::Sha1, &[(16, vec![0u8; 20])]).unwrap();

        let mut pcr_first = PolicyDigest::empty(TpmAlg::Sha1).unwrap();
        pcr_first.extend_pcr(&selection, &pcr_digest).unwrap();
        pcr_first.extend_password().unwrap();

        let mut password_first = PolicyDigest::empty(TpmAlg::Sha1).unwrap();
        password_first.extend_password().unwrap();
        password_first.extend_pcr(&selection, &pcr_digest).unwrap();

        assert_ne!(pcr_first, password_first);
    }

    #[test]
    fn test_calculate_ignores_input_order() {
        let a = vec![(7u8, vec![0x11; 32]), (0u8, vec![0x22; 32])];
        let b = vec![(0u8, vec![0x22; 32]), (7u8, vec![0x11; 32])];
        assert_eq!(
            calculate_pcr_policy_digest(TpmAlg::Sha256, TpmAlg::Sha256, &a).unwrap(),
            calculate_pcr_policy_digest(TpmAlg::Sha256, TpmAlg::Sha256, &b).unwrap()
        );
    }

    #[test]
    fn test_calculate_checks_value_size() {
        let values = vec![(0u8, vec![0u8; 32])];
        assert!(calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &values).is_err());
    }

    #[test]
    fn test_bank_and_session_hash_can_differ() {
        let values = vec![(16u8, vec![0u8; 32])];
        let d = calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha256, &values).unwrap();
        assert_eq!(d.alg(), TpmAlg::Sha1);
        assert_eq!(d.as_bytes().len(), 20);
    }
}
