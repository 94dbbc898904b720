// SPDX-License-Identifier: MIT OR Apache-2.0

//! tpm2-smoke
//!
//! Seals and unseals against the local TPM, covering the password path, PCR
//! policies and the expected failure codes. Extends PCR 1 and PCR 16 of the
//! SHA-1 bank, so run it on a test machine only.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;

use tpmseal::config::{DEFAULT_DEVICE, ENV_DEVICE};
use tpmseal::{
    calculate_pcr_policy_digest, Config, Error, PcrOps, PcrSelection, PolicyDigest, RootKey,
    SealedBlob, SessionKind, Tpm, TpmRc,
};

#[derive(Parser, Debug)]
#[command(name = "tpm2-smoke", version, about = "Seal/unseal smoke test for a TPM 2.0")]
struct Args {
    /// TPM device
    #[arg(long, env = ENV_DEVICE, default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Dump TPM commands and replies
    #[arg(long)]
    debug: bool,
}

type Scenario = fn(&mut Tpm, &RootKey) -> Result<()>;

const SCENARIOS: &[(&str, Scenario)] = &[
    ("seal with auth", seal_with_auth),
    ("seal with policy", seal_with_policy),
    ("seal with released policy session", seal_with_released_session),
    ("unseal with wrong auth", unseal_with_wrong_auth),
    ("unseal with wrong policy", unseal_with_wrong_policy),
    ("seal with too long auth", seal_with_too_long_auth),
];

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match run(&args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Run every scenario with its own root key; returns the number of failures
fn run(args: &Args) -> Result<usize> {
    println!("TPM 2.0 Seal/Unseal Smoke Test");
    println!("==============================\n");

    let config = Config {
        device: args.device.clone(),
        ..Config::default()
    };
    let mut tpm = Tpm::from_config(config)
        .with_context(|| format!("opening {}", args.device.display()))?;
    println!("✓ Opened {}\n", args.device.display());

    let mut failures = 0;
    for (name, scenario) in SCENARIOS {
        match tpm.with_root_key(|tpm, root| Ok(scenario(tpm, root))) {
            Ok(Ok(())) => println!("✓ {}", name),
            Ok(Err(e)) => {
                println!("✗ {}: {:#}", name, e);
                failures += 1;
            }
            Err(e) => {
                println!("✗ {}: {}", name, e);
                failures += 1;
            }
        }
    }

    println!();
    if failures == 0 {
        println!("All {} scenarios passed", SCENARIOS.len());
    } else {
        println!("{} of {} scenarios failed", failures, SCENARIOS.len());
    }
    Ok(failures)
}

/// Trial session with PolicyPCR(pcrs) and PolicyPassword
fn trial_policy(tpm: &mut Tpm, pcrs: &[u8]) -> Result<PolicyDigest> {
    let digest = tpm.with_session(SessionKind::Trial, |tpm, session| {
        tpm.apply_pcr_policy(session, pcrs)?;
        tpm.apply_password_policy(session)?;
        tpm.read_policy_digest(session)
    })?;
    Ok(digest)
}

fn unseal_with_policy(
    tpm: &mut Tpm,
    root: &RootKey,
    blob: &SealedBlob,
    auth: &[u8],
    pcrs: &[u8],
) -> std::result::Result<Vec<u8>, Error> {
    tpm.with_session(SessionKind::Policy, |tpm, session| {
        tpm.apply_pcr_policy(session, pcrs)?;
        tpm.apply_password_policy(session)?;
        tpm.unseal(root, blob, auth, Some(session))
    })
}

fn expect_rc<T>(result: std::result::Result<T, Error>, expected: TpmRc) -> Result<()> {
    match result {
        Ok(_) => bail!("succeeded, expected {:?}", expected),
        Err(Error::Protocol(e)) if e.base() == expected as u32 => Ok(()),
        Err(e) => bail!("expected {:?}, got: {}", expected, e),
    }
}

fn seal_with_auth(tpm: &mut Tpm, root: &RootKey) -> Result<()> {
    let data = [b'X'; 64];
    let auth = [b'A'; 15];

    let blob = tpm.seal(root, &data, &auth, None)?;
    let result = tpm.unseal(root, &blob, &auth, None)?;
    ensure!(result == data, "unsealed data differs");
    Ok(())
}

fn seal_with_policy(tpm: &mut Tpm, root: &RootKey) -> Result<()> {
    let data = [b'X'; 64];
    let auth = [b'A'; 15];

    let digest = trial_policy(tpm, &[16])?;
    let blob = tpm.seal(root, &data, &auth, Some(&digest))?;
    let result = unseal_with_policy(tpm, root, &blob, &auth, &[16])?;
    ensure!(result == data, "unsealed data differs");
    Ok(())
}

/// PCR-only policy computed locally; the policy session is handed over by
/// raw handle, as tpm2-pcr-policy does between processes
fn seal_with_released_session(tpm: &mut Tpm, root: &RootKey) -> Result<()> {
    let data = [b'X'; 32];
    let auth = [0u8; 20];
    let bank = tpm.config().pcr_bank;

    let values = tpm.pcr_read(&PcrSelection::new(bank, &[16])?)?;
    let digest = calculate_pcr_policy_digest(tpm.name_alg(), bank, &values)?;
    let blob = tpm.seal(root, &data, &auth, Some(&digest))?;

    let handle = {
        let session = tpm.open_session(SessionKind::Policy)?;
        if let Err(e) = tpm.apply_pcr_policy(&session, &[16]) {
            tpm.flush_session(session).ok();
            return Err(e.into());
        }
        tpm.release_session(session)?
    };

    let session = tpm.adopt_session(handle)?;
    let result = tpm.unseal(root, &blob, &auth, Some(&session));
    tpm.flush_session(session)?;
    ensure!(result? == data, "unsealed data differs");
    Ok(())
}

fn unseal_with_wrong_auth(tpm: &mut Tpm, root: &RootKey) -> Result<()> {
    let data = [b'X'; 64];
    let auth = [b'A'; 20];
    let mut wrong = auth;
    wrong[19] = b'B';

    let blob = tpm.seal(root, &data, &auth, None)?;
    expect_rc(tpm.unseal(root, &blob, &wrong, None), TpmRc::AuthFail)
}

fn unseal_with_wrong_policy(tpm: &mut Tpm, root: &RootKey) -> Result<()> {
    let data = [b'X'; 64];
    let auth = [b'A'; 17];
    let bank = tpm.config().pcr_bank;
    let measurement = vec![b'X'; bank.digest_size().unwrap_or(20)];

    let digest = trial_policy(tpm, &[16])?;
    let blob = tpm.seal(root, &data, &auth, Some(&digest))?;

    // A PCR outside the policy
    tpm.pcr_extend(1, bank, &measurement)?;
    let result = unseal_with_policy(tpm, root, &blob, &auth, &[16])
        .context("after extending PCR 1")?;
    ensure!(result == data, "unsealed data differs");

    // A PCR inside the policy
    tpm.pcr_extend(16, bank, &measurement)?;
    expect_rc(
        unseal_with_policy(tpm, root, &blob, &auth, &[16]),
        TpmRc::PolicyFail,
    )
}

fn seal_with_too_long_auth(tpm: &mut Tpm, root: &RootKey) -> Result<()> {
    let data = [b'X'; 64];
    let auth = vec![b'A'; tpm.config().max_auth_len() + 1];
    expect_rc(tpm.seal(root, &data, &auth, None), TpmRc::Size)
}
