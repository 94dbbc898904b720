// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sealed-secret storage on a TPM 2.0
//!
//! Creates a storage root key, seals opaque data under it guarded by a
//! password or a PCR/password policy, and unseals it again once the same
//! authorization is presented. Speaks the TPM 2.0 command/response protocol
//! directly over a [`Transport`] without any C dependencies.
//!
//! Device handles (sessions, root keys, loaded objects) are tracked in an
//! open-set on [`Tpm`]; every command that takes a handle checks it, and
//! every handle must be flushed exactly once. Prefer [`Tpm::with_session`]
//! and [`Tpm::with_root_key`], which flush on every exit path.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};

pub mod codec;
pub mod config;
pub mod digest;
pub mod error;
pub mod pcr;
pub mod policy;
pub mod root;
pub mod seal;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "simulator"))]
pub mod sim;


pub use codec::{AuthCommand, Command, CommandBuffer, Response, ResponseBuffer};
pub use config::Config;
pub use error::{
    ArgumentReason, Error, ErrorKind, HandleReason, MalformedReason, ProtocolError, ResponseCode,
    Result, TransportReason,
};
pub use pcr::{extend_value, PcrOps, PcrSelection, PCR_COUNT};
pub use policy::{calculate_pcr_policy_digest, PolicyDigest};
pub use root::RootKey;
pub use seal::{SealedBlob, MAX_SYM_DATA};
pub use session::{SessionHandle, SessionKind, SessionPhase};
pub use transport::{DeviceTransport, Transport};

/// TPM 2.0 command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmCc {
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Unseal = 0x0000015E,
    FlushContext = 0x00000165,
    PolicyAuthValue = 0x0000016B,
    StartAuthSession = 0x00000176,
    PcrRead = 0x0000017E,
    PolicyPCR = 0x0000017F,
    PcrExtend = 0x00000182,
    PolicyGetDigest = 0x00000189,
    PolicyPassword = 0x0000018C,
}

impl TpmCc {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0x00000131 => Some(TpmCc::CreatePrimary),
            0x00000153 => Some(TpmCc::Create),
            0x00000157 => Some(TpmCc::Load),
            0x0000015E => Some(TpmCc::Unseal),
            0x00000165 => Some(TpmCc::FlushContext),
            0x0000016B => Some(TpmCc::PolicyAuthValue),
            0x00000176 => Some(TpmCc::StartAuthSession),
            0x0000017E => Some(TpmCc::PcrRead),
            0x0000017F => Some(TpmCc::PolicyPCR),
            0x00000182 => Some(TpmCc::PcrExtend),
            0x00000189 => Some(TpmCc::PolicyGetDigest),
            0x0000018C => Some(TpmCc::PolicyPassword),
            _ => None,
        }
    }

    /// Number of handles in the command handle area
    pub fn handle_count(self) -> usize {
        match self {
            TpmCc::FlushContext | TpmCc::PcrRead => 0,
            TpmCc::StartAuthSession => 2,
            _ => 1,
        }
    }

    /// Number of handles in the response handle area
    pub fn response_handle_count(self) -> usize {
        match self {
            TpmCc::CreatePrimary | TpmCc::Load | TpmCc::StartAuthSession => 1,
            _ => 0,
        }
    }
}

/// TPM 2.0 structure tags
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
}

impl TpmSt {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            _ => None,
        }
    }
}

/// TPM 2.0 response codes (base values, without handle/session/parameter bits)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmRc {
    Success = 0x000,
    Attributes = 0x082,
    Value = 0x084,
    Handle = 0x08B,
    AuthFail = 0x08E,
    Size = 0x095,
    PolicyFail = 0x099,
    Insufficient = 0x09A,
    Integrity = 0x09F,
    BadAuth = 0x0A2,
    Failure = 0x101,
    AuthType = 0x124,
    AuthMissing = 0x125,
    Policy = 0x126,
    PcrChanged = 0x128,
    AuthUnavailable = 0x12F,
    CommandCode = 0x143,
    ObjectMemory = 0x902,
    SessionMemory = 0x903,
    Memory = 0x904,
    SessionHandles = 0x905,
    ObjectHandles = 0x906,
}

impl TpmRc {
    pub fn from_u32(val: u32) -> Option<Self> {
        let rc = match val {
            0x000 => TpmRc::Success,
            0x082 => TpmRc::Attributes,
            0x084 => TpmRc::Value,
            0x08B => TpmRc::Handle,
            0x08E => TpmRc::AuthFail,
            0x095 => TpmRc::Size,
            0x099 => TpmRc::PolicyFail,
            0x09A => TpmRc::Insufficient,
            0x09F => TpmRc::Integrity,
            0x0A2 => TpmRc::BadAuth,
            0x101 => TpmRc::Failure,
            0x124 => TpmRc::AuthType,
            0x125 => TpmRc::AuthMissing,
            0x126 => TpmRc::Policy,
            0x128 => TpmRc::PcrChanged,
            0x12F => TpmRc::AuthUnavailable,
            0x143 => TpmRc::CommandCode,
            0x902 => TpmRc::ObjectMemory,
            0x903 => TpmRc::SessionMemory,
            0x904 => TpmRc::Memory,
            0x905 => TpmRc::SessionHandles,
            0x906 => TpmRc::ObjectHandles,
            _ => return None,
        };
        Some(rc)
    }
}

/// TPM 2.0 algorithm identifiers
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TpmAlg {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    Cfb = 0x0043,
}

impl TpmAlg {
    /// Get the digest size in bytes for hash algorithms
    pub fn digest_size(&self) -> Option<usize> {
        match self {
            TpmAlg::Sha1 => Some(20),
            TpmAlg::Sha256 => Some(32),
            TpmAlg::Sha384 => Some(48),
            TpmAlg::Sha512 => Some(64),
            _ => None,
        }
    }

    /// Digest size, or an error for non-hash algorithms
    pub fn hash_size(&self) -> Result<usize> {
        self.digest_size()
            .ok_or_else(|| ArgumentReason::UnsupportedHash { alg: *self as u16 }.into())
    }

    /// Get the algorithm name as a string
    pub fn name(&self) -> &'static str {
        match self {
            TpmAlg::Rsa => "rsa",
            TpmAlg::Sha1 => "sha1",
            TpmAlg::Aes => "aes",
            TpmAlg::KeyedHash => "keyedhash",
            TpmAlg::Sha256 => "sha256",
            TpmAlg::Sha384 => "sha384",
            TpmAlg::Sha512 => "sha512",
            TpmAlg::Null => "null",
            TpmAlg::Cfb => "cfb",
        }
    }

    /// Try to convert a u16 to a TpmAlg
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0001 => Some(TpmAlg::Rsa),
            0x0004 => Some(TpmAlg::Sha1),
            0x0006 => Some(TpmAlg::Aes),
            0x0008 => Some(TpmAlg::KeyedHash),
            0x000B => Some(TpmAlg::Sha256),
            0x000C => Some(TpmAlg::Sha384),
            0x000D => Some(TpmAlg::Sha512),
            0x0010 => Some(TpmAlg::Null),
            0x0043 => Some(TpmAlg::Cfb),
            _ => None,
        }
    }
}

impl std::fmt::Display for TpmAlg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses hash algorithm names ("sha1", "sha256", ...)
impl FromStr for TpmAlg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(TpmAlg::Sha1),
            "sha256" => Ok(TpmAlg::Sha256),
            "sha384" => Ok(TpmAlg::Sha384),
            "sha512" => Ok(TpmAlg::Sha512),
            _ => Err(ArgumentReason::UnknownAlgorithm(s.to_string()).into()),
        }
    }
}

/// TPM handle for the owner hierarchy
pub const TPM_RH_OWNER: u32 = 0x40000001;

/// TPM handle representing a null handle
pub const TPM_RH_NULL: u32 = 0x40000007;

/// Password authorization session handle
pub const TPM_RS_PW: u32 = 0x40000009;

/// Handle type bytes (most significant byte of a handle)
pub const TPM_HT_POLICY_SESSION: u8 = 0x03;
pub const TPM_HT_TRANSIENT: u8 = 0x80;

/// Session types
pub const TPM_SE_POLICY: u8 = 0x01;
pub const TPM_SE_TRIAL: u8 = 0x03;

/// Object attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttributes(u32);

impl Default for ObjectAttributes {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectAttributes {
    const FIXED_TPM: u32 = 1 << 1;
    const FIXED_PARENT: u32 = 1 << 4;
    const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    const USER_WITH_AUTH: u32 = 1 << 6;
    const NO_DA: u32 = 1 << 10;
    const RESTRICTED: u32 = 1 << 16;
    const DECRYPT: u32 = 1 << 17;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_value(value: u32) -> Self {
        Self(value)
    }

    pub fn fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    /// Whether the object can be authorized with its auth value directly
    pub fn has_user_with_auth(&self) -> bool {
        self.0 & Self::USER_WITH_AUTH != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// What an open handle refers to
#[derive(Debug)]
pub(crate) enum Slot {
    Session(session::SessionState),
    RootKey,
    /// Object loaded by the library itself (sealed object during unseal)
    Object,
}

/// TPM 2.0 device context
///
/// Commands are issued one at a time: every operation takes `&mut self`, so
/// a multi-threaded caller has to put the context behind a mutex.
pub struct Tpm {
    transport: Box<dyn Transport>,
    config: Config,
    open: BTreeMap<u32, Slot>,
    poisoned: bool,
}

impl Tpm {
    /// Open the TPM device named by the default configuration (/dev/tpmrm0)
    pub fn open() -> Result<Self> {
        Self::from_config(Config::default())
    }

    /// Open a specific TPM device path
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = Config {
            device: path.as_ref().to_path_buf(),
            ..Config::default()
        };
        Self::from_config(config)
    }

    /// Open the device named in `config`
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = DeviceTransport::open(&config.device)?;
        Ok(Self::with_transport(Box::new(transport), config))
    }

    /// Use an already-connected transport
    pub fn with_transport(transport: Box<dyn Transport>, config: Config) -> Self {
        Self {
            transport,
            config,
            open: BTreeMap::new(),
            poisoned: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Hash algorithm used for sessions and sealed object names
    pub fn name_alg(&self) -> TpmAlg {
        self.config.name_alg
    }

    /// Handles currently tracked as open, in ascending order
    pub fn open_handles(&self) -> Vec<u32> {
        self.open.keys().copied().collect()
    }

    /// Send a command and receive its decoded response
    ///
    /// A transport failure poisons the context: the device state after a
    /// partial exchange is unknown, so no further commands are sent.
    pub fn execute(&mut self, command: &Command) -> Result<Response> {
        if self.poisoned {
            return Err(TransportReason::Poisoned.into());
        }

        let bytes = command.encode();
        debug!(
            "TPM2_{:?}: {} bytes, handles {:08X?}",
            command.code(),
            bytes.len(),
            command.handles()
        );

        let reply = match self.transport.transmit(&bytes) {
            Ok(reply) => reply,
            Err(e) => {
                self.poisoned = true;
                return Err(TransportReason::Io(e).into());
            }
        };

        let response = Response::decode(reply, command.code().response_handle_count());
        if let Err(Error::Protocol(e)) = &response {
            debug!("TPM2_{:?} failed: {}", command.code(), e);
        }
        response
    }

    /// Flush a tracked context (close a handle)
    ///
    /// The handle leaves the open-set even if the device rejects the flush:
    /// a second flush of the same handle is always a local error.
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        if self.open.remove(&handle).is_none() {
            return Err(HandleReason::NotOpen { handle }.into());
        }
        self.flush_untracked(handle)
    }

    fn flush_untracked(&mut self, handle: u32) -> Result<()> {
        let command = Command::new(TpmCc::FlushContext)
            .parameters(CommandBuffer::new().write_u32(handle));
        self.execute(&command)?;
        Ok(())
    }

    pub(crate) fn track(&mut self, handle: u32, slot: Slot) -> Result<()> {
        if self.open.contains_key(&handle) {
            return Err(HandleReason::AlreadyOpen { handle }.into());
        }
        self.open.insert(handle, slot);
        Ok(())
    }

    /// Stop tracking a handle without flushing it
    pub(crate) fn untrack(&mut self, handle: u32) -> Option<Slot> {
        self.open.remove(&handle)
    }

    pub(crate) fn slot(&self, handle: u32) -> Result<&Slot> {
        self.open
            .get(&handle)
            .ok_or_else(|| HandleReason::NotOpen { handle }.into())
    }

    pub(crate) fn slot_mut(&mut self, handle: u32) -> Result<&mut Slot> {
        self.open
            .get_mut(&handle)
            .ok_or_else(|| HandleReason::NotOpen { handle }.into())
    }
}

impl Drop for Tpm {
    fn drop(&mut self) {
        if self.open.is_empty() || self.poisoned {
            return;
        }
        let leaked: Vec<u32> = self.open.keys().copied().collect();
        warn!(
            "Reclaiming {} handle(s) left open: {:08X?}",
            leaked.len(),
            leaked
        );
        for handle in leaked {
            if let Err(e) = self.flush_context(handle) {
                warn!("Failed to flush 0x{:08X}: {}", handle, e);
            }
        }
    }
}
