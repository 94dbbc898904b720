// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory software TPM
//!
//! Implements the command subset this crate issues, with enough of a real
//! TPM's behaviour to exercise every failure path: bounded session and
//! object slots, policy digest checks, auth checks with trailing-zero
//! stripping, and response codes carrying handle/session/parameter numbers.
//!
//! Sealed objects are AES-256-GCM encrypted under a key derived (HKDF) from
//! the simulator seed and the parent's template, with the public area as
//! associated data. A blob therefore loads only under the same root key of a
//! simulator with the same seed, and a modified public area is rejected.
//!
//! The simulator is `Clone`; clones share state, so a test can hand one to
//! [`Tpm::with_transport`](crate::Tpm::with_transport) and inspect the other.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use log::debug;
use sha2::Sha256;

use crate::codec::{AuthCommand, CommandBuffer, ResponseBuffer, TPMA_SESSION_CONTINUE};
use crate::digest;
use crate::pcr::{PcrSelection, PCR_COUNT};
use crate::seal::MAX_SYM_DATA;
use crate::transport::Transport;
use crate::{
    ObjectAttributes, TpmAlg, TpmCc, TpmRc, TpmSt, TPM_HT_POLICY_SESSION, TPM_HT_TRANSIENT,
    TPM_RH_NULL, TPM_RH_OWNER, TPM_RS_PW, TPM_SE_POLICY, TPM_SE_TRIAL,
};

/// Concurrently loaded sessions before TPM_RC_SESSION_MEMORY
pub const MAX_SESSIONS: usize = 3;

/// Concurrently loaded objects before TPM_RC_OBJECT_MEMORY
pub const MAX_OBJECTS: usize = 3;

/// Digests returned by a single PCR_Read
pub const MAX_PCR_READ_DIGESTS: usize = 8;

const DEFAULT_SEED: [u8; 32] = *b"tpmseal simulator storage seed!!";
const KDF_SALT: &[u8] = b"tpmseal-sim storage";
const GCM_NONCE_SIZE: usize = 12;
const FIRST_SESSION_HANDLE: u32 = (TPM_HT_POLICY_SESSION as u32) << 24;
const FIRST_OBJECT_HANDLE: u32 = (TPM_HT_TRANSIENT as u32) << 24;
const TPM_ST_CREATION: u16 = 0x8021;

const RC_BAD_TAG: u32 = 0x01E;
const RC_COMMAND_SIZE: u32 = 0x142;
const RC_AUTHSIZE: u32 = 0x144;

const RC_P: u32 = 0x040;
const RC_S: u32 = 0x800;
const RC_N_SHIFT: u32 = 8;

fn rc_param(base: TpmRc, n: u32) -> u32 {
    base as u32 | RC_P | (n << RC_N_SHIFT)
}

fn rc_handle(base: TpmRc, n: u32) -> u32 {
    base as u32 | (n << RC_N_SHIFT)
}

fn rc_session(base: TpmRc, n: u32) -> u32 {
    base as u32 | RC_S | (n << RC_N_SHIFT)
}

type SimResult<T> = std::result::Result<T, u32>;

/// Turn a parse failure into a response code
trait OrRc<T> {
    fn or_rc(self, rc: u32) -> SimResult<T>;
}

impl<T> OrRc<T> for crate::Result<T> {
    fn or_rc(self, rc: u32) -> SimResult<T> {
        self.map_err(|_| rc)
    }
}

#[derive(Debug)]
struct SimSession {
    trial: bool,
    hash: TpmAlg,
    digest: Vec<u8>,
    /// PolicyPassword was asserted
    auth_needed: bool,
}

#[derive(Debug, Clone)]
struct PublicArea {
    object_type: u16,
    name_alg: TpmAlg,
    attributes: ObjectAttributes,
    auth_policy: Vec<u8>,
}

#[derive(Debug)]
enum SimObject {
    Storage {
        key: [u8; 32],
    },
    Sealed {
        public: PublicArea,
        auth: Vec<u8>,
        data: Vec<u8>,
    },
}

#[derive(Debug)]
struct SimState {
    seed: [u8; 32],
    pcrs: BTreeMap<TpmAlg, Vec<Vec<u8>>>,
    pcr_update_counter: u32,
    sessions: BTreeMap<u32, SimSession>,
    objects: BTreeMap<u32, SimObject>,
    next_session: u32,
    next_object: u32,
    blob_counter: u64,
    opened: BTreeMap<u32, usize>,
    flushed: BTreeMap<u32, usize>,
    commands: Vec<TpmCc>,
    fail_next: bool,
    fail_on: Option<TpmCc>,
}

impl SimState {
    fn new(seed: [u8; 32]) -> Self {
        let mut pcrs = BTreeMap::new();
        pcrs.insert(TpmAlg::Sha1, vec![vec![0u8; 20]; PCR_COUNT]);
        pcrs.insert(TpmAlg::Sha256, vec![vec![0u8; 32]; PCR_COUNT]);

        Self {
            seed,
            pcrs,
            pcr_update_counter: 0,
            sessions: BTreeMap::new(),
            objects: BTreeMap::new(),
            next_session: FIRST_SESSION_HANDLE,
            next_object: FIRST_OBJECT_HANDLE,
            blob_counter: 0,
            opened: BTreeMap::new(),
            flushed: BTreeMap::new(),
            commands: Vec::new(),
            fail_next: false,
            fail_on: None,
        }
    }

    fn allocate_object(&mut self, object: SimObject) -> SimResult<u32> {
        if self.objects.len() >= MAX_OBJECTS {
            return Err(TpmRc::ObjectMemory as u32);
        }
        let handle = self.next_object;
        self.next_object += 1;
        self.objects.insert(handle, object);
        *self.opened.entry(handle).or_default() += 1;
        Ok(handle)
    }

    fn allocate_session(&mut self, session: SimSession) -> SimResult<u32> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(TpmRc::SessionMemory as u32);
        }
        let handle = self.next_session;
        self.next_session += 1;
        self.sessions.insert(handle, session);
        *self.opened.entry(handle).or_default() += 1;
        Ok(handle)
    }

    fn storage_key(&self, handle: u32) -> SimResult<[u8; 32]> {
        match self.objects.get(&handle) {
            Some(SimObject::Storage { key }) => Ok(*key),
            _ => Err(rc_handle(TpmRc::Handle, 1)),
        }
    }

    /// H(value_0 || value_1 || ...) over `indices` of `bank`, hashed with `hash`
    fn pcr_composite(&self, bank: TpmAlg, indices: &[u8], hash: TpmAlg) -> SimResult<Vec<u8>> {
        let values = self.pcrs.get(&bank).ok_or(rc_param(TpmRc::Value, 2))?;
        let parts: Vec<&[u8]> = indices
            .iter()
            .map(|&i| values[i as usize].as_slice())
            .collect();
        digest::hash(hash, &parts).or_rc(TpmRc::Failure as u32)
    }

    fn seal_sensitive(
        &mut self,
        key: &[u8; 32],
        public: &[u8],
        auth: &[u8],
        data: &[u8],
    ) -> SimResult<Vec<u8>> {
        self.blob_counter += 1;
        let mut nonce = [0u8; GCM_NONCE_SIZE];
        nonce[4..].copy_from_slice(&self.blob_counter.to_be_bytes());

        let plaintext = CommandBuffer::new()
            .write_tpm2b(auth)
            .write_tpm2b(data)
            .into_vec();
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TpmRc::Failure as u32)?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: public,
                },
            )
            .map_err(|_| TpmRc::Failure as u32)?;

        let mut private = nonce.to_vec();
        private.extend_from_slice(&ciphertext);
        Ok(private)
    }
}

fn unseal_sensitive(key: &[u8; 32], public: &[u8], private: &[u8]) -> SimResult<(Vec<u8>, Vec<u8>)> {
    if private.len() < GCM_NONCE_SIZE {
        return Err(rc_param(TpmRc::Size, 1));
    }
    let (nonce, ciphertext) = private.split_at(GCM_NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TpmRc::Failure as u32)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: public,
            },
        )
        .map_err(|_| rc_param(TpmRc::Integrity, 1))?;

    let mut buf = ResponseBuffer::new(plaintext);
    let auth = buf.read_tpm2b().or_rc(rc_param(TpmRc::Integrity, 1))?;
    let data = buf.read_tpm2b().or_rc(rc_param(TpmRc::Integrity, 1))?;
    Ok((auth, data))
}

fn derive_storage_key(seed: &[u8; 32], template: &[u8]) -> SimResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), seed);
    let mut key = [0u8; 32];
    hk.expand(template, &mut key)
        .map_err(|_| TpmRc::Failure as u32)?;
    Ok(key)
}

/// TPM auth values are compared with trailing zero bytes removed
fn strip_trailing_zeros(auth: &[u8]) -> Vec<u8> {
    let end = auth.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    auth[..end].to_vec()
}

/// Parse the common head of a TPMT_PUBLIC (type, nameAlg, attributes,
/// authPolicy); `param` is the parameter number for error codes
fn parse_public(bytes: &[u8], param: u32) -> SimResult<PublicArea> {
    let mut buf = ResponseBuffer::new(bytes.to_vec());
    let object_type = buf.read_u16().or_rc(rc_param(TpmRc::Insufficient, param))?;
    let name_alg = buf.read_u16().or_rc(rc_param(TpmRc::Insufficient, param))?;
    let name_alg = TpmAlg::from_u16(name_alg)
        .filter(|alg| alg.digest_size().is_some())
        .ok_or(rc_param(TpmRc::Value, param))?;
    let attributes = buf.read_u32().or_rc(rc_param(TpmRc::Insufficient, param))?;
    let auth_policy = buf.read_tpm2b().or_rc(rc_param(TpmRc::Insufficient, param))?;

    Ok(PublicArea {
        object_type,
        name_alg,
        attributes: ObjectAttributes::from_value(attributes),
        auth_policy,
    })
}

/// Object name: nameAlg || H(TPMT_PUBLIC)
fn object_name(name_alg: TpmAlg, public: &[u8]) -> SimResult<Vec<u8>> {
    let mut name = (name_alg as u16).to_be_bytes().to_vec();
    name.extend(digest::hash(name_alg, &[public]).or_rc(TpmRc::Failure as u32)?);
    Ok(name)
}

struct Request {
    code: TpmCc,
    handles: Vec<u32>,
    auths: Vec<AuthCommand>,
    params: ResponseBuffer,
}

#[derive(Default)]
struct Reply {
    handles: Vec<u32>,
    parameters: CommandBuffer,
}

impl Reply {
    fn empty() -> Self {
        Self::default()
    }

    fn parameters(parameters: CommandBuffer) -> Self {
        Self {
            handles: Vec::new(),
            parameters,
        }
    }
}

fn parse_request(bytes: &[u8]) -> SimResult<Request> {
    let mut buf = ResponseBuffer::new(bytes.to_vec());
    let tag = buf.read_u16().or_rc(RC_COMMAND_SIZE)?;
    let size = buf.read_u32().or_rc(RC_COMMAND_SIZE)? as usize;
    if size != bytes.len() {
        return Err(RC_COMMAND_SIZE);
    }
    let code = buf.read_u32().or_rc(RC_COMMAND_SIZE)?;
    let code = TpmCc::from_u32(code).ok_or(TpmRc::CommandCode as u32)?;

    let mut handles = Vec::with_capacity(code.handle_count());
    for _ in 0..code.handle_count() {
        handles.push(buf.read_u32().or_rc(TpmRc::Insufficient as u32)?);
    }

    let mut auths = Vec::new();
    match TpmSt::from_u16(tag) {
        Some(TpmSt::NoSessions) => {}
        Some(TpmSt::Sessions) => {
            let auth_size = buf.read_u32().or_rc(RC_AUTHSIZE)? as usize;
            if auth_size > buf.remaining() {
                return Err(RC_AUTHSIZE);
            }
            let end = buf.offset() + auth_size;
            while buf.offset() < end {
                auths.push(AuthCommand {
                    session_handle: buf.read_u32().or_rc(RC_AUTHSIZE)?,
                    nonce: buf.read_tpm2b().or_rc(RC_AUTHSIZE)?,
                    attributes: buf.read_u8().or_rc(RC_AUTHSIZE)?,
                    hmac: buf.read_tpm2b().or_rc(RC_AUTHSIZE)?,
                });
            }
            if buf.offset() != end || auths.is_empty() {
                return Err(RC_AUTHSIZE);
            }
        }
        None => return Err(RC_BAD_TAG),
    }

    let rest = buf.remaining();
    let params = ResponseBuffer::new(buf.read_bytes(rest).or_rc(RC_COMMAND_SIZE)?.to_vec());

    Ok(Request {
        code,
        handles,
        auths,
        params,
    })
}

fn build_response(auths: &[AuthCommand], result: SimResult<Reply>) -> Vec<u8> {
    let reply = match result {
        Ok(reply) => reply,
        Err(rc) => return CommandBuffer::new().finalize_raw(TpmSt::NoSessions as u16, rc),
    };

    let mut buf = CommandBuffer::new();
    for handle in &reply.handles {
        buf = buf.write_u32(*handle);
    }

    if auths.is_empty() {
        return buf
            .write_bytes(&reply.parameters.into_vec())
            .finalize_raw(TpmSt::NoSessions as u16, TpmRc::Success as u32);
    }

    buf = buf
        .write_u32(reply.parameters.len() as u32)
        .write_bytes(&reply.parameters.into_vec());
    for auth in auths {
        // TPMS_AUTH_RESPONSE: nonceTPM, sessionAttributes, hmac
        buf = buf
            .write_u16(0)
            .write_u8(auth.attributes & TPMA_SESSION_CONTINUE)
            .write_u16(0);
    }
    buf.finalize_raw(TpmSt::Sessions as u16, TpmRc::Success as u32)
}

fn require_password_auth(request: &Request) -> SimResult<()> {
    match request.auths.first() {
        Some(auth) if auth.session_handle == TPM_RS_PW => Ok(()),
        Some(_) => Err(TpmRc::AuthType as u32),
        None => Err(TpmRc::AuthMissing as u32),
    }
}

fn dispatch(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    match request.code {
        TpmCc::CreatePrimary => sim_create_primary(state, request),
        TpmCc::Create => sim_create(state, request),
        TpmCc::Load => sim_load(state, request),
        TpmCc::Unseal => sim_unseal(state, request),
        TpmCc::FlushContext => sim_flush_context(state, request),
        TpmCc::StartAuthSession => sim_start_auth_session(state, request),
        TpmCc::PcrRead => sim_pcr_read(state, request),
        TpmCc::PcrExtend => sim_pcr_extend(state, request),
        TpmCc::PolicyPCR => sim_policy_pcr(state, request),
        TpmCc::PolicyPassword => sim_policy_password(state, request),
        TpmCc::PolicyGetDigest => sim_policy_get_digest(state, request),
        TpmCc::PolicyAuthValue => Err(TpmRc::CommandCode as u32),
    }
}

fn sim_create_primary(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    require_password_auth(request)?;
    if request.handles[0] != TPM_RH_OWNER {
        return Err(rc_handle(TpmRc::Value, 1));
    }

    let params = &mut request.params;
    params
        .read_tpm2b() // inSensitive
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;
    let template = params
        .read_tpm2b()
        .or_rc(rc_param(TpmRc::Insufficient, 2))?;

    let public = parse_public(&template, 2)?;
    if public.object_type != TpmAlg::Rsa as u16 {
        return Err(rc_param(TpmRc::Value, 2));
    }

    let key = derive_storage_key(&state.seed, &template)?;
    let name = object_name(public.name_alg, &template)?;
    let handle = state.allocate_object(SimObject::Storage { key })?;

    let parameters = CommandBuffer::new()
        .write_tpm2b(&template) // outPublic
        .write_u16(0) // creationData
        .write_u16(0) // creationHash
        .write_u16(TPM_ST_CREATION) // creationTicket
        .write_u32(TPM_RH_OWNER)
        .write_u16(0)
        .write_tpm2b(&name); // name

    Ok(Reply {
        handles: vec![handle],
        parameters,
    })
}

fn sim_create(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    require_password_auth(request)?;
    let key = state.storage_key(request.handles[0])?;

    let params = &mut request.params;
    let sensitive = params
        .read_tpm2b()
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;
    let mut sensitive = ResponseBuffer::new(sensitive);
    let auth = sensitive.read_tpm2b().or_rc(rc_param(TpmRc::Size, 1))?;
    let data = sensitive.read_tpm2b().or_rc(rc_param(TpmRc::Size, 1))?;

    let public_bytes = params
        .read_tpm2b()
        .or_rc(rc_param(TpmRc::Insufficient, 2))?;
    let public = parse_public(&public_bytes, 2)?;
    if public.object_type != TpmAlg::KeyedHash as u16 {
        return Err(rc_param(TpmRc::Value, 2));
    }

    let digest_size = public.name_alg.digest_size().unwrap_or(0);
    if auth.len() > digest_size || data.len() > MAX_SYM_DATA {
        return Err(rc_param(TpmRc::Size, 1));
    }
    if !public.auth_policy.is_empty() && public.auth_policy.len() != digest_size {
        return Err(rc_param(TpmRc::Size, 2));
    }

    let private = state.seal_sensitive(&key, &public_bytes, &strip_trailing_zeros(&auth), &data)?;

    Ok(Reply::parameters(
        CommandBuffer::new()
            .write_tpm2b(&private) // outPrivate
            .write_tpm2b(&public_bytes) // outPublic
            .write_u16(0) // creationData
            .write_u16(0) // creationHash
            .write_u16(TPM_ST_CREATION) // creationTicket
            .write_u32(TPM_RH_OWNER)
            .write_u16(0),
    ))
}

fn sim_load(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    require_password_auth(request)?;
    let key = state.storage_key(request.handles[0])?;

    let params = &mut request.params;
    let private = params
        .read_tpm2b()
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;
    let public_bytes = params
        .read_tpm2b()
        .or_rc(rc_param(TpmRc::Insufficient, 2))?;
    let public = parse_public(&public_bytes, 2)?;
    if public.object_type != TpmAlg::KeyedHash as u16 {
        return Err(rc_param(TpmRc::Value, 2));
    }

    let (auth, data) = unseal_sensitive(&key, &public_bytes, &private)?;
    let name = object_name(public.name_alg, &public_bytes)?;
    let handle = state.allocate_object(SimObject::Sealed { public, auth, data })?;

    Ok(Reply {
        handles: vec![handle],
        parameters: CommandBuffer::new().write_tpm2b(&name),
    })
}

fn sim_unseal(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    let (public, auth, data) = match state.objects.get(&request.handles[0]) {
        Some(SimObject::Sealed { public, auth, data }) => (public, auth, data.clone()),
        _ => return Err(rc_handle(TpmRc::Handle, 1)),
    };

    let command_auth = request
        .auths
        .first()
        .ok_or(TpmRc::AuthMissing as u32)?;
    let presented = strip_trailing_zeros(&command_auth.hmac);

    if command_auth.session_handle == TPM_RS_PW {
        if !public.attributes.has_user_with_auth() {
            return Err(TpmRc::AuthUnavailable as u32);
        }
        if presented != *auth {
            return Err(rc_session(TpmRc::AuthFail, 1));
        }
        return Ok(Reply::parameters(CommandBuffer::new().write_tpm2b(&data)));
    }

    let auth_policy = public.auth_policy.clone();
    let auth = auth.clone();
    let session = state
        .sessions
        .get_mut(&command_auth.session_handle)
        .ok_or(rc_session(TpmRc::Handle, 1))?;
    if session.trial {
        return Err(TpmRc::AuthType as u32);
    }
    if session.digest != auth_policy {
        return Err(rc_session(TpmRc::PolicyFail, 1));
    }
    if session.auth_needed && presented != auth {
        return Err(rc_session(TpmRc::AuthFail, 1));
    }

    // A policy session starts over once it authorized a command
    session.digest = vec![0u8; session.digest.len()];
    session.auth_needed = false;
    if command_auth.attributes & TPMA_SESSION_CONTINUE == 0 {
        state.sessions.remove(&command_auth.session_handle);
    }

    Ok(Reply::parameters(CommandBuffer::new().write_tpm2b(&data)))
}

fn sim_flush_context(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    let handle = request
        .params
        .read_u32()
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;

    let removed = match (handle >> 24) as u8 {
        TPM_HT_POLICY_SESSION => state.sessions.remove(&handle).is_some(),
        TPM_HT_TRANSIENT => state.objects.remove(&handle).is_some(),
        _ => false,
    };
    if !removed {
        return Err(rc_param(TpmRc::Handle, 1));
    }

    *state.flushed.entry(handle).or_default() += 1;
    Ok(Reply::empty())
}

fn sim_start_auth_session(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    if request.handles[0] != TPM_RH_NULL {
        return Err(rc_handle(TpmRc::Handle, 1));
    }
    if request.handles[1] != TPM_RH_NULL {
        return Err(rc_handle(TpmRc::Handle, 2));
    }

    let params = &mut request.params;
    params
        .read_tpm2b() // nonceCaller
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;
    params
        .read_tpm2b() // encryptedSalt
        .or_rc(rc_param(TpmRc::Insufficient, 2))?;
    let trial = match params.read_u8().or_rc(rc_param(TpmRc::Insufficient, 3))? {
        TPM_SE_TRIAL => true,
        TPM_SE_POLICY => false,
        _ => return Err(rc_param(TpmRc::Value, 3)),
    };
    let symmetric = params
        .read_u16()
        .or_rc(rc_param(TpmRc::Insufficient, 4))?;
    if symmetric != TpmAlg::Null as u16 {
        return Err(rc_param(TpmRc::Value, 4));
    }
    let hash = params
        .read_u16()
        .or_rc(rc_param(TpmRc::Insufficient, 5))?;
    let hash = TpmAlg::from_u16(hash)
        .filter(|alg| alg.digest_size().is_some())
        .ok_or(rc_param(TpmRc::Value, 5))?;

    let digest = vec![0u8; hash.digest_size().unwrap_or(0)];
    let handle = state.allocate_session(SimSession {
        trial,
        hash,
        digest,
        auth_needed: false,
    })?;

    let nonce_tpm = digest::hash(TpmAlg::Sha256, &[&handle.to_be_bytes()])
        .or_rc(TpmRc::Failure as u32)?;

    Ok(Reply {
        handles: vec![handle],
        parameters: CommandBuffer::new().write_tpm2b(&nonce_tpm[..16]),
    })
}

fn sim_pcr_read(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    let selections = PcrSelection::decode_list(&mut request.params)
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;

    let mut selection_out = Vec::new();
    let mut values: Vec<&[u8]> = Vec::new();
    for (alg, indices) in selections {
        let Some(bank) = TpmAlg::from_u16(alg).and_then(|alg| state.pcrs.get(&alg)) else {
            continue;
        };
        let mut bitmap = [0u8; 3];
        for index in indices {
            if values.len() == MAX_PCR_READ_DIGESTS {
                break;
            }
            bitmap[index as usize / 8] |= 1 << (index % 8);
            values.push(&bank[index as usize]);
        }
        selection_out.push((alg, bitmap));
    }

    let mut parameters = CommandBuffer::new()
        .write_u32(state.pcr_update_counter)
        .write_u32(selection_out.len() as u32);
    for (alg, bitmap) in &selection_out {
        parameters = parameters.write_u16(*alg).write_u8(3).write_bytes(bitmap);
    }
    parameters = parameters.write_u32(values.len() as u32);
    for value in values {
        parameters = parameters.write_tpm2b(value);
    }

    Ok(Reply::parameters(parameters))
}

fn sim_pcr_extend(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    require_password_auth(request)?;
    let index = request.handles[0] as usize;
    if index >= PCR_COUNT {
        return Err(rc_handle(TpmRc::Value, 1));
    }

    let params = &mut request.params;
    let count = params
        .read_u32()
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;
    let mut updates = Vec::new();
    for _ in 0..count {
        let alg = params
            .read_u16()
            .or_rc(rc_param(TpmRc::Insufficient, 1))?;
        let alg = TpmAlg::from_u16(alg)
            .filter(|alg| alg.digest_size().is_some())
            .ok_or(rc_param(TpmRc::Value, 1))?;
        let size = alg.digest_size().unwrap_or(0);
        let measurement = params
            .read_bytes(size)
            .or_rc(rc_param(TpmRc::Insufficient, 1))?
            .to_vec();
        updates.push((alg, measurement));
    }

    for (alg, measurement) in updates {
        if let Some(bank) = state.pcrs.get_mut(&alg) {
            bank[index] = digest::hash(alg, &[&bank[index], &measurement])
                .or_rc(TpmRc::Failure as u32)?;
        }
    }
    state.pcr_update_counter += 1;

    Ok(Reply::empty())
}

fn sim_policy_pcr(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    let handle = request.handles[0];
    let params = &mut request.params;
    let pcr_digest = params
        .read_tpm2b()
        .or_rc(rc_param(TpmRc::Insufficient, 1))?;
    let selections =
        PcrSelection::decode_list(params).or_rc(rc_param(TpmRc::Insufficient, 2))?;
    let [(bank, indices)] = selections.as_slice() else {
        return Err(rc_param(TpmRc::Value, 2));
    };
    let bank = TpmAlg::from_u16(*bank).ok_or(rc_param(TpmRc::Value, 2))?;
    let selection = PcrSelection::new(bank, indices).or_rc(rc_param(TpmRc::Value, 2))?;

    let (hash, trial) = match state.sessions.get(&handle) {
        Some(session) => (session.hash, session.trial),
        None => return Err(rc_handle(TpmRc::Handle, 1)),
    };

    // An empty pcrDigest means "the current values"; a policy session
    // checks a supplied one against the current values, a trial session
    // takes it as given
    let current = state.pcr_composite(bank, &selection.indices(), hash)?;
    let pcr_digest = if pcr_digest.is_empty() {
        current
    } else if trial || pcr_digest == current {
        pcr_digest
    } else {
        return Err(rc_param(TpmRc::Value, 1));
    };
    if Some(pcr_digest.len()) != hash.digest_size() {
        return Err(rc_param(TpmRc::Size, 1));
    }

    let session = state
        .sessions
        .get_mut(&handle)
        .ok_or(rc_handle(TpmRc::Handle, 1))?;
    session.digest = digest::hash(
        hash,
        &[
            &session.digest,
            &(TpmCc::PolicyPCR as u32).to_be_bytes(),
            &selection.to_bytes(),
            &pcr_digest,
        ],
    )
    .or_rc(TpmRc::Failure as u32)?;

    Ok(Reply::empty())
}

fn sim_policy_password(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    let session = state
        .sessions
        .get_mut(&request.handles[0])
        .ok_or(rc_handle(TpmRc::Handle, 1))?;

    // PolicyPassword extends with the PolicyAuthValue command code
    session.digest = digest::hash(
        session.hash,
        &[
            &session.digest,
            &(TpmCc::PolicyAuthValue as u32).to_be_bytes(),
        ],
    )
    .or_rc(TpmRc::Failure as u32)?;
    session.auth_needed = true;

    Ok(Reply::empty())
}

fn sim_policy_get_digest(state: &mut SimState, request: &mut Request) -> SimResult<Reply> {
    let session = state
        .sessions
        .get(&request.handles[0])
        .ok_or(rc_handle(TpmRc::Handle, 1))?;

    Ok(Reply::parameters(
        CommandBuffer::new().write_tpm2b(&session.digest),
    ))
}

/// Software TPM
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// A simulator whose storage keys derive from `seed`
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(seed))),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value of a PCR, if the bank exists
    pub fn pcr(&self, bank: TpmAlg, index: u8) -> Option<Vec<u8>> {
        self.state()
            .pcrs
            .get(&bank)
            .and_then(|values| values.get(index as usize).cloned())
    }

    /// Sessions and objects currently loaded
    pub fn open_handles(&self) -> Vec<u32> {
        let state = self.state();
        state
            .sessions
            .keys()
            .chain(state.objects.keys())
            .copied()
            .collect()
    }

    /// How many times `handle` was handed out
    pub fn open_count(&self, handle: u32) -> usize {
        self.state().opened.get(&handle).copied().unwrap_or(0)
    }

    /// How many times `handle` was flushed with FlushContext
    pub fn flush_count(&self, handle: u32) -> usize {
        self.state().flushed.get(&handle).copied().unwrap_or(0)
    }

    /// Every handle ever handed out, with its open and flush counts
    pub fn handle_history(&self) -> Vec<(u32, usize, usize)> {
        let state = self.state();
        state
            .opened
            .iter()
            .map(|(&handle, &opened)| {
                (handle, opened, state.flushed.get(&handle).copied().unwrap_or(0))
            })
            .collect()
    }

    /// Commands received so far, in order
    pub fn commands(&self) -> Vec<TpmCc> {
        self.state().commands.clone()
    }

    pub fn command_count(&self) -> usize {
        self.state().commands.len()
    }

    /// Fail the next exchange before the command reaches the device
    pub fn fail_next(&self) {
        self.state().fail_next = true;
    }

    /// Execute the next `code` command, then fail the exchange as if the
    /// response were lost
    pub fn fail_after(&self, code: TpmCc) {
        self.state().fail_on = Some(code);
    }
}

impl Transport for Simulator {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        let mut state = self.state();
        if state.fail_next {
            state.fail_next = false;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected transport failure",
            ));
        }

        let mut request = match parse_request(command) {
            Ok(request) => request,
            Err(rc) => return Ok(build_response(&[], Err(rc))),
        };
        state.commands.push(request.code);

        let result = dispatch(&mut state, &mut request);
        if let Err(rc) = &result {
            debug!("sim: TPM2_{:?} -> 0x{:03X}", request.code, rc);
        }

        if state.fail_on == Some(request.code) {
            state.fail_on = None;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "injected loss of response",
            ));
        }

        Ok(build_response(&request.auths, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Command, Response};
    use crate::{Error, ProtocolError, ResponseCode};

    fn run(sim: &mut Simulator, command: Command) -> crate::Result<Response> {
        let reply = sim.transmit(&command.encode()).unwrap();
        Response::decode(reply, command.code().response_handle_count())
    }

    fn start_session(sim: &mut Simulator, session_type: u8) -> crate::Result<Response> {
        run(
            sim,
            Command::new(TpmCc::StartAuthSession)
                .handle(TPM_RH_NULL)
                .handle(TPM_RH_NULL)
                .parameters(
                    CommandBuffer::new()
                        .write_tpm2b(&[])
                        .write_tpm2b(&[])
                        .write_u8(session_type)
                        .write_u16(TpmAlg::Null as u16)
                        .write_u16(TpmAlg::Sha1 as u16),
                ),
        )
    }

    fn rc_of(result: crate::Result<Response>) -> u32 {
        match result {
            Err(Error::Protocol(ProtocolError { rc, .. })) => rc,
            other => panic!("expected a protocol error, got {:?}", other.map(|r| r.header)),
        }
    }

    #[test]
    fn test_session_slots_are_bounded() {
        let mut sim = Simulator::new();
        for _ in 0..MAX_SESSIONS {
            start_session(&mut sim, TPM_SE_POLICY).unwrap();
        }
        let rc = rc_of(start_session(&mut sim, TPM_SE_POLICY));
        assert_eq!(rc, TpmRc::SessionMemory as u32);
        assert_eq!(ProtocolError::from_rc(rc).kind, ResponseCode::ResourceExhausted);
    }

    #[test]
    fn test_flush_unknown_handle() {
        let mut sim = Simulator::new();
        let rc = rc_of(run(
            &mut sim,
            Command::new(TpmCc::FlushContext)
                .parameters(CommandBuffer::new().write_u32(0x03000042)),
        ));
        assert_eq!(rc, 0x1CB);
    }

    #[test]
    fn test_unsupported_command() {
        let mut sim = Simulator::new();
        let rc = rc_of(run(&mut sim, Command::new(TpmCc::PolicyAuthValue).handle(0x03000000)));
        assert_eq!(rc, TpmRc::CommandCode as u32);
    }

    #[test]
    fn test_pcr_read_returns_at_most_eight() {
        let mut sim = Simulator::new();
        let all: Vec<u8> = (0..PCR_COUNT as u8).collect();
        let selection = PcrSelection::new(TpmAlg::Sha256, &all).unwrap();
        let mut resp = run(
            &mut sim,
            Command::new(TpmCc::PcrRead).parameters(selection.encode(CommandBuffer::new())),
        )
        .unwrap()
        .parameters;

        resp.read_u32().unwrap();
        let returned = PcrSelection::decode_list(&mut resp).unwrap();
        assert_eq!(returned, vec![(TpmAlg::Sha256 as u16, (0..8).collect::<Vec<u8>>())]);
        assert_eq!(resp.read_u32().unwrap(), 8);
    }

    #[test]
    fn test_trial_session_policy_password() {
        let mut sim = Simulator::new();
        let handle = start_session(&mut sim, TPM_SE_TRIAL).unwrap().handles[0];
        run(&mut sim, Command::new(TpmCc::PolicyPassword).handle(handle)).unwrap();
        let mut resp = run(&mut sim, Command::new(TpmCc::PolicyGetDigest).handle(handle))
            .unwrap()
            .parameters;

        let expected = digest::hash(TpmAlg::Sha1, &[&[0u8; 20], &[0x00u8, 0x00, 0x01, 0x6B]]).unwrap();
        assert_eq!(resp.read_tpm2b().unwrap(), expected);
    }

    #[test]
    fn test_injected_failure_leaves_state_alone() {
        let mut sim = Simulator::new();
        sim.fail_next();
        let command = Command::new(TpmCc::PcrRead)
            .parameters(PcrSelection::new(TpmAlg::Sha1, &[0]).unwrap().encode(CommandBuffer::new()));
        assert!(sim.transmit(&command.encode()).is_err());
        assert_eq!(sim.command_count(), 0);
        assert!(sim.transmit(&command.encode()).is_ok());
    }

    #[test]
    fn test_strip_trailing_zeros() {
        assert_eq!(strip_trailing_zeros(&[0u8; 20]), Vec::<u8>::new());
        assert_eq!(strip_trailing_zeros(b"ab\0\0"), b"ab".to_vec());
        assert_eq!(strip_trailing_zeros(b"\0ab"), b"\0ab".to_vec());
    }
}
