// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authorization sessions
//!
//! Trial and policy sessions, the policy assertions applied to them, and
//! their lifecycle:
//!
//! ```text
//! Created --apply_*--> PolicyApplied --read_policy_digest--> DigestRead (trial)
//!                            |
//!                            +--unseal--> Consumed (policy)
//! any state --flush_session--> (handle gone)
//! ```
//!
//! Sessions are only ever referenced through a [`SessionHandle`], which is
//! not `Copy`; flushing takes it by value. The handle's liveness is still
//! checked against the open-set on every command, so a handle that outlived
//! its device context cannot be used either.

use std::fmt;

use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::codec::{Command, CommandBuffer};
use crate::error::{HandleReason, Result};
use crate::pcr::{PcrOps, PcrSelection};
use crate::policy::{pcr_composite_digest, PolicyDigest};
use crate::{
    Slot, Tpm, TpmAlg, TpmCc, TPM_HT_POLICY_SESSION, TPM_RH_NULL, TPM_SE_POLICY, TPM_SE_TRIAL,
};

/// Kind of policy session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Computes a digest, never authorizes anything
    Trial,
    /// Authorizes a command whose object policy it satisfies
    Policy,
}

impl SessionKind {
    /// TPM_SE value for StartAuthSession
    fn session_type(self) -> u8 {
        match self {
            SessionKind::Trial => TPM_SE_TRIAL,
            SessionKind::Policy => TPM_SE_POLICY,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Trial => f.write_str("trial"),
            SessionKind::Policy => f.write_str("policy"),
        }
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    PolicyApplied,
    DigestRead,
    /// Used to authorize a command; can only be flushed now
    Consumed,
}

/// An open session on the device
#[derive(Debug, PartialEq, Eq)]
pub struct SessionHandle {
    handle: u32,
    kind: SessionKind,
}

impl SessionHandle {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

/// Local bookkeeping for an open session
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) kind: SessionKind,
    pub(crate) phase: SessionPhase,
    /// Digest the device should hold, or None when the session was adopted
    /// with unknown history
    pub(crate) mirror: Option<PolicyDigest>,
    pub(crate) assertions: usize,
}

impl Tpm {
    /// Start a trial or policy session (TPM2_StartAuthSession)
    ///
    /// Unsalted, unbound, no parameter encryption, session hash = the
    /// configured name algorithm.
    pub fn open_session(&mut self, kind: SessionKind) -> Result<SessionHandle> {
        let name_alg = self.name_alg();
        let mirror = PolicyDigest::empty(name_alg)?;

        // Some TPMs require a non-empty nonceCaller
        // Use hash of current time as simple entropy source
        let nonce_data = Sha256::digest(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
                .to_le_bytes(),
        );
        let nonce_caller = &nonce_data[..16];

        let command = Command::new(TpmCc::StartAuthSession)
            .handle(TPM_RH_NULL) // tpmKey
            .handle(TPM_RH_NULL) // bind
            .parameters(
                CommandBuffer::new()
                    .write_tpm2b(nonce_caller) // nonceCaller
                    .write_u16(0) // encryptedSalt (no salt)
                    .write_u8(kind.session_type()) // sessionType
                    .write_u16(TpmAlg::Null as u16) // symmetric.algorithm
                    .write_u16(name_alg as u16), // authHash
            );

        let resp = self.execute(&command)?;
        let handle = resp.handles[0];
        debug!("Opened {} session 0x{:08X}", kind, handle);

        self.track(
            handle,
            Slot::Session(SessionState {
                kind,
                phase: SessionPhase::Created,
                mirror: Some(mirror),
                assertions: 0,
            }),
        )?;

        Ok(SessionHandle { handle, kind })
    }

    /// Bind the session to the current values of `pcr_indices` in the
    /// configured bank (TPM2_PolicyPCR)
    ///
    /// Indices are taken as a set: order and duplicates do not change the
    /// resulting digest.
    pub fn apply_pcr_policy(&mut self, session: &SessionHandle, pcr_indices: &[u8]) -> Result<()> {
        self.assertable(session)?;

        let selection = PcrSelection::new(self.config().pcr_bank, pcr_indices)?;
        let values = self.pcr_read(&selection)?;
        let pcr_digest = pcr_composite_digest(self.name_alg(), &values)?;

        let command = Command::new(TpmCc::PolicyPCR)
            .handle(session.handle)
            .parameters(
                selection.encode(CommandBuffer::new().write_tpm2b(&pcr_digest)), // pcrDigest, pcrs
            );
        self.execute(&command)?;

        self.record_assertion(session, |mirror| mirror.extend_pcr(&selection, &pcr_digest))
    }

    /// Require the object's auth value at command time (TPM2_PolicyPassword)
    pub fn apply_password_policy(&mut self, session: &SessionHandle) -> Result<()> {
        self.assertable(session)?;

        let command = Command::new(TpmCc::PolicyPassword).handle(session.handle);
        self.execute(&command)?;

        self.record_assertion(session, PolicyDigest::extend_password)
    }

    /// Current policy digest of the session (TPM2_PolicyGetDigest)
    ///
    /// Requires at least one applied assertion and a session that has not
    /// authorized a command yet. Moves a trial session to
    /// [`SessionPhase::DigestRead`]; the handle stays open.
    pub fn read_policy_digest(&mut self, session: &SessionHandle) -> Result<PolicyDigest> {
        let state = self.session_state(session)?;
        if state.phase == SessionPhase::Consumed {
            return Err(HandleReason::SessionConsumed {
                handle: session.handle,
            }
            .into());
        }
        if state.assertions == 0 {
            return Err(HandleReason::NoAssertions {
                handle: session.handle,
            }
            .into());
        }

        let command = Command::new(TpmCc::PolicyGetDigest).handle(session.handle);
        let mut resp = self.execute(&command)?.parameters;
        let digest = PolicyDigest::from_bytes(self.name_alg(), &resp.read_tpm2b()?)?;

        let state = self.session_state_mut(session)?;
        if let Some(mirror) = &state.mirror {
            if mirror != &digest {
                warn!(
                    "Session 0x{:08X}: device digest {} differs from computed {}",
                    session.handle, digest, mirror
                );
            }
        }
        if state.kind == SessionKind::Trial {
            state.phase = SessionPhase::DigestRead;
        }

        Ok(digest)
    }

    /// Lifecycle phase of an open session
    pub fn session_phase(&self, session: &SessionHandle) -> Result<SessionPhase> {
        Ok(self.session_state(session)?.phase)
    }

    /// Close the session (TPM2_FlushContext)
    pub fn flush_session(&mut self, session: SessionHandle) -> Result<()> {
        self.session_state(&session)?;
        debug!("Flushing {} session 0x{:08X}", session.kind, session.handle);
        self.flush_context(session.handle)
    }

    /// Run `f` with a fresh session, flushing it on every exit path
    ///
    /// An error from `f` takes precedence over an error from the flush.
    pub fn with_session<T>(
        &mut self,
        kind: SessionKind,
        f: impl FnOnce(&mut Tpm, &SessionHandle) -> Result<T>,
    ) -> Result<T> {
        let session = self.open_session(kind)?;
        let result = f(self, &session);
        let flushed = self.flush_session(session);
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(flush_err)) => {
                warn!("Session flush failed after an earlier error: {}", flush_err);
                Err(e)
            }
        }
    }

    /// Take ownership of a policy session opened elsewhere
    ///
    /// Its assertion history is unknown, so no local digest is mirrored and
    /// it is treated as having assertions applied.
    pub fn adopt_session(&mut self, handle: u32) -> Result<SessionHandle> {
        if (handle >> 24) as u8 != TPM_HT_POLICY_SESSION {
            return Err(HandleReason::NotASession { handle }.into());
        }
        self.track(
            handle,
            Slot::Session(SessionState {
                kind: SessionKind::Policy,
                phase: SessionPhase::PolicyApplied,
                mirror: None,
                assertions: 1,
            }),
        )?;
        debug!("Adopted policy session 0x{:08X}", handle);

        Ok(SessionHandle {
            handle,
            kind: SessionKind::Policy,
        })
    }

    /// Stop tracking a session without flushing it, handing the raw handle
    /// to whoever flushes it later
    pub fn release_session(&mut self, session: SessionHandle) -> Result<u32> {
        self.session_state(&session)?;
        self.untrack(session.handle);
        Ok(session.handle)
    }

    pub(crate) fn session_state(&self, session: &SessionHandle) -> Result<&SessionState> {
        match self.slot(session.handle)? {
            Slot::Session(state) => Ok(state),
            _ => Err(HandleReason::NotASession {
                handle: session.handle,
            }
            .into()),
        }
    }

    pub(crate) fn session_state_mut(&mut self, session: &SessionHandle) -> Result<&mut SessionState> {
        match self.slot_mut(session.handle)? {
            Slot::Session(state) => Ok(state),
            _ => Err(HandleReason::NotASession {
                handle: session.handle,
            }
            .into()),
        }
    }

    /// Mark a policy session as having authorized a command
    pub(crate) fn consume_session(&mut self, session: &SessionHandle) -> Result<()> {
        let state = self.session_state_mut(session)?;
        state.phase = SessionPhase::Consumed;
        // The device resets the policy digest once the session authorized
        // a command
        state.mirror = None;
        state.assertions = 0;
        Ok(())
    }

    /// A trial digest, once read, is final
    fn assertable(&self, session: &SessionHandle) -> Result<()> {
        let handle = session.handle;
        match self.session_state(session)?.phase {
            SessionPhase::Consumed => Err(HandleReason::SessionConsumed { handle }.into()),
            SessionPhase::DigestRead => Err(HandleReason::DigestAlreadyRead { handle }.into()),
            SessionPhase::Created | SessionPhase::PolicyApplied => Ok(()),
        }
    }

    fn record_assertion(
        &mut self,
        session: &SessionHandle,
        fold: impl FnOnce(&mut PolicyDigest) -> Result<()>,
    ) -> Result<()> {
        let state = self.session_state_mut(session)?;
        if let Some(mirror) = state.mirror.as_mut() {
            fold(mirror)?;
        }
        state.assertions += 1;
        state.phase = SessionPhase::PolicyApplied;
        Ok(())
    }
}
