// SPDX-License-Identifier: MIT OR Apache-2.0

//! tpm2-pcr-policy
//!
//! Builds a PCR policy on the TPM. With `--trial` the resulting policy digest
//! is printed as hex, for use as a sealed object's authPolicy. Without it a
//! real policy session is left open on the device and its handle is printed,
//! for a later unseal by another process.
//!
//! The kernel resource manager flushes a client's sessions when its file is
//! closed, so non-trial mode talks to the raw device.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::debug;

use tpmseal::config::{DEFAULT_DEVICE, ENV_DEVICE, RAW_DEVICE};
use tpmseal::{Config, SessionKind, Tpm, TpmAlg};

#[derive(Parser, Debug)]
#[command(name = "tpm2-pcr-policy", version, about = "Create a TPM 2.0 PCR policy")]
struct Args {
    /// PCR index to include (repeatable)
    #[arg(long = "pcr", value_name = "INDEX", required = true)]
    pcrs: Vec<u8>,

    /// Hash algorithm of the policy digest
    #[arg(long, default_value = "sha1")]
    name_alg: TpmAlg,

    /// PCR bank to read
    #[arg(long, default_value = "sha1")]
    bank: TpmAlg,

    /// Use a trial session and print the policy digest
    #[arg(long)]
    trial: bool,

    /// TPM device [default: /dev/tpmrm0 with --trial, /dev/tpm0 without]
    #[arg(long, env = ENV_DEVICE)]
    device: Option<PathBuf>,

    /// Log every command sent to the TPM
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let device = resolve_device(args.device.clone(), args.trial)?;
    let config = Config {
        device: device.clone(),
        name_alg: args.name_alg,
        pcr_bank: args.bank,
    };
    let mut tpm =
        Tpm::from_config(config).with_context(|| format!("opening {}", device.display()))?;

    if args.trial {
        let digest = tpm
            .with_session(SessionKind::Trial, |tpm, session| {
                tpm.apply_pcr_policy(session, &args.pcrs)?;
                tpm.read_policy_digest(session)
            })
            .context("computing trial policy")?;
        println!("{}", digest.to_hex());
        return Ok(());
    }

    let session = tpm
        .open_session(SessionKind::Policy)
        .context("starting policy session")?;
    if let Err(e) = tpm.apply_pcr_policy(&session, &args.pcrs) {
        tpm.flush_session(session).ok();
        return Err(e).context("applying PCR policy");
    }

    // The session outlives this process; whoever unseals with it flushes it
    let handle = tpm.release_session(session)?;
    debug!("Released policy session 0x{:08X}", handle);
    println!("0x{:08x}", handle);
    Ok(())
}

/// Pick the device for the mode, refusing a resource-managed device when the
/// session has to outlive this process
fn resolve_device(device: Option<PathBuf>, trial: bool) -> Result<PathBuf> {
    let device = match device {
        Some(device) => device,
        None if trial => PathBuf::from(DEFAULT_DEVICE),
        None => PathBuf::from(RAW_DEVICE),
    };
    if !trial && is_resource_managed(&device) {
        bail!(
            "{} flushes the policy session when this process exits; \
             use {} or pass --trial",
            device.display(),
            RAW_DEVICE
        );
    }
    Ok(device)
}

fn is_resource_managed(device: &Path) -> bool {
    device
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("tpmrm"))
}

fn init_logging(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_follows_mode() {
        assert_eq!(
            resolve_device(None, true).unwrap(),
            PathBuf::from("/dev/tpmrm0")
        );
        assert_eq!(resolve_device(None, false).unwrap(), PathBuf::from("/dev/tpm0"));
    }

    #[test]
    fn test_released_session_needs_raw_device() {
        let err = resolve_device(Some(PathBuf::from("/dev/tpmrm0")), false).unwrap_err();
        assert!(err.to_string().contains("/dev/tpm0"));
        assert!(resolve_device(Some(PathBuf::from("/dev/tpmrm1")), false).is_err());
    }

    #[test]
    fn test_explicit_device_kept() {
        let raw = PathBuf::from("/dev/tpm1");
        assert_eq!(resolve_device(Some(raw.clone()), false).unwrap(), raw);
        let managed = PathBuf::from("/dev/tpmrm0");
        assert_eq!(resolve_device(Some(managed.clone()), true).unwrap(), managed);
    }
}
