// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end flows against the software TPM
//!
//! Run with `--features simulator`.

#![cfg(feature = "simulator")]

use tpmseal::sim::Simulator;
use tpmseal::{
    calculate_pcr_policy_digest, Config, ErrorKind, PcrOps, PcrSelection, SealedBlob, SessionKind,
    Tpm, TpmAlg,
};

fn connect(config: Config) -> (Tpm, Simulator) {
    let sim = Simulator::new();
    let tpm = Tpm::with_transport(Box::new(sim.clone()), config);
    (tpm, sim)
}

#[test]
fn test_policy_seal_survives_serialisation() {
    let (mut tpm, sim) = connect(Config::default());
    let data = b"disk encryption key".to_vec();

    let stored = tpm
        .with_root_key(|tpm, root| {
            let digest = tpm.with_session(SessionKind::Trial, |tpm, session| {
                tpm.apply_pcr_policy(session, &[7, 16])?;
                tpm.apply_password_policy(session)?;
                tpm.read_policy_digest(session)
            })?;
            let blob = tpm.seal(root, &data, b"passphrase", Some(&digest))?;
            Ok(blob.to_bytes())
        })
        .unwrap();

    let blob = SealedBlob::from_bytes(&stored).unwrap();
    let result = tpm
        .with_root_key(|tpm, root| {
            tpm.with_session(SessionKind::Policy, |tpm, session| {
                tpm.apply_pcr_policy(session, &[16, 7])?;
                tpm.apply_password_policy(session)?;
                tpm.unseal(root, &blob, b"passphrase", Some(session))
            })
        })
        .unwrap();

    assert_eq!(result, data);
    assert!(sim.open_handles().is_empty());
}

#[test]
fn test_locally_computed_policy_matches_device() {
    let config = Config {
        name_alg: TpmAlg::Sha256,
        pcr_bank: TpmAlg::Sha256,
        ..Config::default()
    };
    let (mut tpm, _sim) = connect(config);
    tpm.pcr_extend_data(4, TpmAlg::Sha256, b"bootloader").unwrap();

    let selection = PcrSelection::new(TpmAlg::Sha256, &[4, 5]).unwrap();
    let values = tpm.pcr_read(&selection).unwrap();
    let local = calculate_pcr_policy_digest(TpmAlg::Sha256, TpmAlg::Sha256, &values).unwrap();

    let device = tpm
        .with_session(SessionKind::Trial, |tpm, session| {
            tpm.apply_pcr_policy(session, &[4, 5])?;
            tpm.read_policy_digest(session)
        })
        .unwrap();
    assert_eq!(local, device);
}

#[test]
fn test_measurement_locks_secret() {
    let (mut tpm, sim) = connect(Config::default());

    let err = tpm
        .with_root_key(|tpm, root| {
            let values = tpm.pcr_read(&PcrSelection::new(TpmAlg::Sha1, &[9])?)?;
            let digest = calculate_pcr_policy_digest(TpmAlg::Sha1, TpmAlg::Sha1, &values)?;
            let blob = tpm.seal(root, b"secret", &[], Some(&digest))?;

            tpm.pcr_extend_data(9, TpmAlg::Sha1, b"kernel")?;
            tpm.with_session(SessionKind::Policy, |tpm, session| {
                tpm.apply_pcr_policy(session, &[9])?;
                tpm.unseal(root, &blob, &[], Some(session))
            })
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PolicyFailure);
    assert!(sim.open_handles().is_empty());
}
