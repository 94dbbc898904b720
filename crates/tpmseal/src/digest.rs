// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hash primitives for PCR extension and policy digest accumulation

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{ArgumentReason, Result};
use crate::TpmAlg;

/// Incremental hasher over one of the TPM hash algorithms
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub fn new(alg: TpmAlg) -> Result<Self> {
        let hasher = match alg {
            TpmAlg::Sha1 => Hasher::Sha1(Sha1::new()),
            TpmAlg::Sha256 => Hasher::Sha256(Sha256::new()),
            TpmAlg::Sha384 => Hasher::Sha384(Sha384::new()),
            TpmAlg::Sha512 => Hasher::Sha512(Sha512::new()),
            other => {
                return Err(ArgumentReason::UnsupportedHash {
                    alg: other as u16,
                }
                .into())
            }
        };
        Ok(hasher)
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Hash the concatenation of `parts`
pub fn hash(alg: TpmAlg, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut hasher = Hasher::new(alg)?;
    for part in parts {
        hasher.update(part);
    }
    Ok(hasher.finalize())
}

/// Check that `digest` has the size of `alg`'s output
pub fn check_size(alg: TpmAlg, digest: &[u8]) -> Result<()> {
    let expected = alg.hash_size()?;
    if digest.len() != expected {
        return Err(ArgumentReason::DigestSize {
            expected,
            got: digest.len(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_answers() {
        assert_eq!(
            hex::encode(hash(TpmAlg::Sha1, &[b"abc"]).unwrap()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hex::encode(hash(TpmAlg::Sha256, &[b"a", b"bc"]).unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_output_sizes_match_algorithm() {
        for alg in [TpmAlg::Sha1, TpmAlg::Sha256, TpmAlg::Sha384, TpmAlg::Sha512] {
            let out = hash(alg, &[b"x"]).unwrap();
            assert_eq!(Some(out.len()), alg.digest_size());
        }
    }

    #[test]
    fn test_non_hash_algorithm_rejected() {
        assert!(Hasher::new(TpmAlg::Rsa).is_err());
        assert!(check_size(TpmAlg::Aes, &[0u8; 16]).is_err());
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(TpmAlg::Sha1, &[0u8; 20]).is_ok());
        assert!(check_size(TpmAlg::Sha1, &[0u8; 32]).is_err());
    }
}
