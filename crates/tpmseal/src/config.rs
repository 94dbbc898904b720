// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device and algorithm configuration

use std::env;
use std::path::PathBuf;

use crate::error::{ArgumentReason, Result};
use crate::TpmAlg;

/// Environment variable naming the TPM device
pub const ENV_DEVICE: &str = "TPMSEAL_DEVICE";

/// Environment variable naming the session/object name algorithm
pub const ENV_NAME_ALG: &str = "TPMSEAL_NAME_ALG";

/// Environment variable naming the PCR bank used for policies
pub const ENV_PCR_BANK: &str = "TPMSEAL_PCR_BANK";

pub const DEFAULT_DEVICE: &str = "/dev/tpmrm0";

/// Raw TPM device; sessions opened through it outlive the process
pub const RAW_DEVICE: &str = "/dev/tpm0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// TPM character device
    pub device: PathBuf,
    /// Hash for session digests, object names and the auth value size limit
    pub name_alg: TpmAlg,
    /// PCR bank read by policy assertions
    pub pcr_bank: TpmAlg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            name_alg: TpmAlg::Sha1,
            pcr_bank: TpmAlg::Sha1,
        }
    }
}

impl Config {
    /// Defaults overridden by `TPMSEAL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(device) = lookup(ENV_DEVICE) {
            config.device = PathBuf::from(device);
        }
        if let Some(alg) = lookup(ENV_NAME_ALG) {
            config.name_alg = alg.parse()?;
        }
        if let Some(alg) = lookup(ENV_PCR_BANK) {
            config.pcr_bank = alg.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Both algorithms must be hash algorithms
    ///
    /// The PCR bank may differ from `name_alg`: register values are hashed
    /// into the policy with `name_alg` whatever bank they come from.
    pub fn validate(&self) -> Result<()> {
        for alg in [self.name_alg, self.pcr_bank] {
            if alg.digest_size().is_none() {
                return Err(ArgumentReason::UnsupportedHash { alg: alg as u16 }.into());
            }
        }
        Ok(())
    }

    /// Largest auth value a sealed object accepts
    pub fn max_auth_len(&self) -> usize {
        self.name_alg.digest_size().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device, PathBuf::from("/dev/tpmrm0"));
        assert_eq!(config.max_auth_len(), 20);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::from_lookup(lookup(&[
            (ENV_DEVICE, "/dev/tpm0"),
            (ENV_NAME_ALG, "SHA256"),
            (ENV_PCR_BANK, "sha256"),
        ]))
        .unwrap();
        assert_eq!(config.device, PathBuf::from("/dev/tpm0"));
        assert_eq!(config.name_alg, TpmAlg::Sha256);
        assert_eq!(config.pcr_bank, TpmAlg::Sha256);
        assert_eq!(config.max_auth_len(), 32);
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        assert!(Config::from_lookup(lookup(&[(ENV_NAME_ALG, "md5")])).is_err());
    }

    #[test]
    fn test_bank_may_differ_from_name_alg() {
        let config = Config {
            name_alg: TpmAlg::Sha256,
            pcr_bank: TpmAlg::Sha1,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_auth_len(), 32);
    }

    #[test]
    fn test_non_hash_algorithm_rejected() {
        let config = Config {
            pcr_bank: TpmAlg::Rsa,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
