// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seal and unseal
//!
//! A sealed object is a keyed-hash object with no signing scheme whose
//! sensitive part carries the caller's data. It is created under the root key
//! (TPM2_Create), and to unseal it is loaded under the same root key
//! (TPM2_Load), read back (TPM2_Unseal) and flushed again.
//!
//! Without a policy the object has `userWithAuth` set and is unsealed with
//! its auth value in a password session. With a policy, `userWithAuth` is
//! clear and only a policy session whose digest matches the object's
//! authPolicy can unseal it.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{AuthCommand, Command, CommandBuffer, ResponseBuffer};
use crate::error::{ArgumentReason, HandleReason, MalformedReason, ProtocolError, Result};
use crate::policy::PolicyDigest;
use crate::root::RootKey;
use crate::session::{SessionHandle, SessionKind, SessionPhase};
use crate::{ObjectAttributes, Slot, Tpm, TpmAlg, TpmCc};

/// Largest payload a sealed object can carry (MAX_SYM_DATA)
pub const MAX_SYM_DATA: usize = 128;

/// Private and public halves of a sealed object, as returned by TPM2_Create
///
/// Opaque to the caller; only the TPM that created it (and the same root
/// key) can load it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// TPM2B_PRIVATE contents (integrity-protected, encrypted)
    #[serde(with = "hex::serde")]
    pub private: Vec<u8>,
    /// TPM2B_PUBLIC contents (TPMT_PUBLIC)
    #[serde(with = "hex::serde")]
    pub public: Vec<u8>,
}

impl SealedBlob {
    /// Serialize as TPM2B_PRIVATE || TPM2B_PUBLIC
    pub fn to_bytes(&self) -> Vec<u8> {
        CommandBuffer::new()
            .write_tpm2b(&self.private)
            .write_tpm2b(&self.public)
            .into_vec()
    }

    /// Parse the output of [`SealedBlob::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(bytes.to_vec());
        let private = buf
            .read_tpm2b()
            .map_err(|_| MalformedReason::SealedBlobLayout)?;
        let public = buf
            .read_tpm2b()
            .map_err(|_| MalformedReason::SealedBlobLayout)?;
        if buf.remaining() != 0 || private.is_empty() || public.is_empty() {
            return Err(MalformedReason::SealedBlobLayout.into());
        }
        Ok(Self { private, public })
    }

    /// The authPolicy recorded in the public area, empty for password-only
    /// objects
    pub fn auth_policy(&self) -> Result<Vec<u8>> {
        let mut buf = ResponseBuffer::new(self.public.clone());
        buf.read_u16()?; // type
        buf.read_u16()?; // nameAlg
        buf.read_u32()?; // objectAttributes
        buf.read_tpm2b()
    }
}

/// Build the TPMT_PUBLIC for a sealed data object
pub(crate) fn build_sealed_public_area(name_alg: TpmAlg, auth_policy: &[u8]) -> Vec<u8> {
    let mut attributes = ObjectAttributes::new().fixed_tpm().fixed_parent();
    if auth_policy.is_empty() {
        attributes = attributes.user_with_auth();
    }

    CommandBuffer::new()
        .write_u16(TpmAlg::KeyedHash as u16) // type
        .write_u16(name_alg as u16) // nameAlg
        .write_u32(attributes.value()) // objectAttributes
        .write_tpm2b(auth_policy) // authPolicy
        .write_u16(TpmAlg::Null as u16) // TPMS_KEYEDHASH_PARMS.scheme
        .write_u16(0) // unique (TPM2B_DIGEST) - empty
        .into_vec()
}

impl Tpm {
    /// Seal `data` under `root_key` (TPM2_Create)
    ///
    /// Without `policy` the blob is unsealed by presenting `auth` directly.
    /// With `policy` it is unsealed by a policy session ending in that digest,
    /// plus `auth` if the policy includes a password assertion.
    ///
    /// An `auth` longer than the name algorithm's digest, or `data` longer
    /// than [`MAX_SYM_DATA`], fails with a size violation before anything is
    /// sent to the device.
    pub fn seal(
        &mut self,
        root_key: &RootKey,
        data: &[u8],
        auth: &[u8],
        policy: Option<&PolicyDigest>,
    ) -> Result<SealedBlob> {
        let name_alg = self.name_alg();
        if auth.len() > self.config().max_auth_len() || data.len() > MAX_SYM_DATA {
            return Err(ProtocolError::size_violation().into());
        }
        if let Some(policy) = policy {
            if policy.alg() != name_alg {
                return Err(ArgumentReason::PolicyAlgorithm {
                    expected: name_alg,
                    got: policy.alg(),
                }
                .into());
            }
        }
        self.check_root_key(root_key)?;

        let auth_policy = policy.map(PolicyDigest::as_bytes).unwrap_or_default();
        let public_area = build_sealed_public_area(name_alg, auth_policy);

        // TPMS_SENSITIVE_CREATE
        let sensitive = CommandBuffer::new()
            .write_tpm2b(auth) // userAuth
            .write_tpm2b(data) // data
            .into_vec();

        let command = Command::new(TpmCc::Create)
            .handle(root_key.handle())
            .auth(AuthCommand::password(&[]))
            .parameters(
                CommandBuffer::new()
                    .write_tpm2b(&sensitive) // inSensitive
                    .write_tpm2b(&public_area) // inPublic
                    .write_u16(0) // outsideInfo (TPM2B_DATA) - empty
                    .write_u32(0), // creationPCR (TPML_PCR_SELECTION) - empty
            );

        let mut resp = self.execute(&command)?.parameters;
        let private = resp.read_tpm2b()?;
        let public = resp.read_tpm2b()?;
        // creationData, creationHash and creationTicket are not needed

        debug!(
            "Sealed {} bytes ({})",
            data.len(),
            if policy.is_some() { "policy" } else { "password" }
        );
        Ok(SealedBlob { private, public })
    }

    /// Recover the data sealed in `blob` (TPM2_Load + TPM2_Unseal)
    ///
    /// With `session` the blob's policy is checked against the session's
    /// digest, and `auth` is checked too if the policy asked for it. Without
    /// `session`, `auth` is checked directly.
    ///
    /// The loaded object is always flushed again. The caller's session is
    /// never flushed here: it moves to [`SessionPhase::Consumed`] on success
    /// and stays as it was on failure.
    pub fn unseal(
        &mut self,
        root_key: &RootKey,
        blob: &SealedBlob,
        auth: &[u8],
        session: Option<&SessionHandle>,
    ) -> Result<Vec<u8>> {
        if auth.len() > self.config().max_auth_len() {
            return Err(ProtocolError::size_violation().into());
        }
        self.check_root_key(root_key)?;
        if let Some(session) = session {
            let state = self.session_state(session)?;
            if state.kind != SessionKind::Policy {
                return Err(HandleReason::WrongSessionKind {
                    handle: session.handle(),
                    expected: SessionKind::Policy,
                    got: state.kind,
                }
                .into());
            }
            if state.phase == SessionPhase::Consumed {
                return Err(HandleReason::SessionConsumed {
                    handle: session.handle(),
                }
                .into());
            }
        }

        let object = self.load_sealed(root_key, blob)?;

        let auth_command = match session {
            Some(session) => AuthCommand::policy_session(session.handle(), auth),
            None => AuthCommand::password(auth),
        };
        let command = Command::new(TpmCc::Unseal)
            .handle(object)
            .auth(auth_command);
        let result = self
            .execute(&command)
            .and_then(|mut resp| resp.parameters.read_tpm2b());

        let flushed = self.flush_context(object);
        let data = match (result, flushed) {
            (Ok(data), Ok(())) => data,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(flush_err)) => {
                warn!("Failed to flush sealed object 0x{:08X}: {}", object, flush_err);
                return Err(e);
            }
        };

        if let Some(session) = session {
            self.consume_session(session)?;
        }
        Ok(data)
    }

    /// Load the sealed object under the root key, tracking its handle
    fn load_sealed(&mut self, root_key: &RootKey, blob: &SealedBlob) -> Result<u32> {
        let command = Command::new(TpmCc::Load)
            .handle(root_key.handle())
            .auth(AuthCommand::password(&[]))
            .parameters(
                CommandBuffer::new()
                    .write_tpm2b(&blob.private) // inPrivate
                    .write_tpm2b(&blob.public), // inPublic
            );

        // The object's name is not needed
        let resp = self.execute(&command)?;
        let handle = resp.handles[0];
        debug!("Loaded sealed object 0x{:08X}", handle);

        self.track(handle, Slot::Object)?;
        Ok(handle)
    }
}
