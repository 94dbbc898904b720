// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command/response wire format
//!
//! Commands: tag, size, command code, handle area, authorization area
//! (only with `TPM_ST_SESSIONS`), parameter area. Responses: tag, size,
//! response code, handle area, parameter size (only with
//! `TPM_ST_SESSIONS`), parameter area, authorization responses.
//! All integers are big-endian.

use crate::error::{MalformedReason, ProtocolError, Result};
use crate::{TpmCc, TpmRc, TpmSt, TPM_RS_PW};

/// Size of the command and response headers
pub const TPM_HEADER_SIZE: usize = 10;

/// `continueSession` bit of TPMA_SESSION
pub const TPMA_SESSION_CONTINUE: u8 = 0x01;

/// TPM 2.0 command header
#[derive(Debug)]
struct CommandHeader {
    tag: TpmSt,
    size: u32,
    code: TpmCc,
}

impl CommandHeader {
    fn new(tag: TpmSt, size: u32, code: TpmCc) -> Self {
        Self { tag, size, code }
    }

    fn to_bytes(&self) -> [u8; TPM_HEADER_SIZE] {
        let mut bytes = [0u8; TPM_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&(self.tag as u16).to_be_bytes());
        bytes[2..6].copy_from_slice(&self.size.to_be_bytes());
        bytes[6..10].copy_from_slice(&(self.code as u32).to_be_bytes());
        bytes
    }
}

/// TPM 2.0 response header
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub tag: u16,
    pub size: u32,
    pub code: u32,
}

impl ResponseHeader {
    /// Parse a response header from a 10-byte buffer
    pub fn from_bytes(bytes: &[u8; TPM_HEADER_SIZE]) -> Self {
        let tag = u16::from_be_bytes([bytes[0], bytes[1]]);
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let code = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Self { tag, size, code }
    }
}

/// Helper for building TPM structures with big-endian serialization
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn write_u8(mut self, val: u8) -> Self {
        self.data.push(val);
        self
    }

    pub fn write_u16(mut self, val: u16) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_u32(mut self, val: u32) -> Self {
        self.data.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Write a TPM2B (size-prefixed buffer)
    pub fn write_tpm2b(mut self, bytes: &[u8]) -> Self {
        self.data
            .extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.data.extend_from_slice(bytes);
        self
    }

    /// Prefix the whole buffer with a header carrying a raw tag and code
    ///
    /// Used for responses, whose code field is a response code rather than
    /// a command code.
    pub fn finalize_raw(mut self, tag: u16, code: u32) -> Vec<u8> {
        let total_size = TPM_HEADER_SIZE + self.data.len();
        let mut result = Vec::with_capacity(total_size);
        result.extend_from_slice(&tag.to_be_bytes());
        result.extend_from_slice(&(total_size as u32).to_be_bytes());
        result.extend_from_slice(&code.to_be_bytes());
        result.append(&mut self.data);
        result
    }

    fn finalize(mut self, tag: TpmSt, code: TpmCc) -> Vec<u8> {
        let total_size = TPM_HEADER_SIZE + self.data.len();
        let header = CommandHeader::new(tag, total_size as u32, code);
        let mut result = Vec::with_capacity(total_size);
        result.extend_from_slice(&header.to_bytes());
        result.append(&mut self.data);
        result
    }

    /// Convert to raw bytes without finalizing as a command
    ///
    /// Use this when building non-command data structures like TPM2B_PUBLIC
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One entry of the command authorization area (TPMS_AUTH_COMMAND)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: u8,
    /// HMAC, or the plain auth value for password and PolicyPassword sessions
    pub hmac: Vec<u8>,
}

impl AuthCommand {
    /// Password authorization (TPM_RS_PW) presenting `auth` in the clear
    pub fn password(auth: &[u8]) -> Self {
        Self {
            session_handle: TPM_RS_PW,
            nonce: Vec::new(),
            attributes: 0,
            hmac: auth.to_vec(),
        }
    }

    /// Authorization through a policy session that stays open afterwards
    pub fn policy_session(session_handle: u32, auth: &[u8]) -> Self {
        Self {
            session_handle,
            nonce: Vec::new(),
            attributes: TPMA_SESSION_CONTINUE,
            hmac: auth.to_vec(),
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        4 + 2 + self.nonce.len() + 1 + 2 + self.hmac.len()
    }

    fn encode(&self, buf: CommandBuffer) -> CommandBuffer {
        buf.write_u32(self.session_handle)
            .write_tpm2b(&self.nonce)
            .write_u8(self.attributes)
            .write_tpm2b(&self.hmac)
    }
}

/// A structured command: handles, authorizations and parameters
#[derive(Debug, Clone)]
pub struct Command {
    code: TpmCc,
    handles: Vec<u32>,
    auths: Vec<AuthCommand>,
    parameters: Vec<u8>,
}

impl Command {
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            auths: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Append a handle to the handle area
    pub fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    /// Append an entry to the authorization area
    pub fn auth(mut self, auth: AuthCommand) -> Self {
        self.auths.push(auth);
        self
    }

    /// Set the parameter area
    pub fn parameters(mut self, parameters: CommandBuffer) -> Self {
        self.parameters = parameters.into_vec();
        self
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    pub fn handles(&self) -> &[u32] {
        &self.handles
    }

    pub fn auths(&self) -> &[AuthCommand] {
        &self.auths
    }

    /// Serialize to wire format
    ///
    /// The tag is `TPM_ST_SESSIONS` exactly when an authorization area is
    /// present.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        for handle in &self.handles {
            buf = buf.write_u32(*handle);
        }

        let tag = if self.auths.is_empty() {
            TpmSt::NoSessions
        } else {
            let auth_size: usize = self.auths.iter().map(AuthCommand::encoded_len).sum();
            buf = buf.write_u32(auth_size as u32);
            for auth in &self.auths {
                buf = auth.encode(buf);
            }
            TpmSt::Sessions
        };

        buf.write_bytes(&self.parameters).finalize(tag, self.code)
    }
}

/// A decoded successful response
#[derive(Debug)]
pub struct Response {
    pub header: ResponseHeader,
    pub handles: Vec<u32>,
    /// Parameter area, positioned at its first byte
    pub parameters: ResponseBuffer,
}

impl Response {
    /// Decode a complete response buffer
    ///
    /// A non-success response code is returned as [`ProtocolError`]; the
    /// body of an error response is not inspected.
    pub fn decode(bytes: Vec<u8>, handle_count: usize) -> Result<Self> {
        if bytes.len() < TPM_HEADER_SIZE {
            return Err(MalformedReason::Truncated {
                offset: 0,
                wanted: TPM_HEADER_SIZE,
                available: bytes.len(),
            }
            .into());
        }

        let mut header_bytes = [0u8; TPM_HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..TPM_HEADER_SIZE]);
        let header = ResponseHeader::from_bytes(&header_bytes);

        if header.size as usize != bytes.len() {
            return Err(MalformedReason::SizeMismatch {
                declared: header.size as usize,
                actual: bytes.len(),
            }
            .into());
        }

        if header.code != TpmRc::Success as u32 {
            return Err(ProtocolError::from_rc(header.code).into());
        }

        let tag = TpmSt::from_u16(header.tag)
            .ok_or(MalformedReason::UnexpectedTag { tag: header.tag })?;

        let mut body = ResponseBuffer::new(bytes[TPM_HEADER_SIZE..].to_vec());
        let mut handles = Vec::with_capacity(handle_count);
        for _ in 0..handle_count {
            handles.push(body.read_u32()?);
        }

        let parameters = match tag {
            TpmSt::NoSessions => body.rest(),
            TpmSt::Sessions => {
                // Authorization responses follow the parameters; skip them
                let parameter_size = body.read_u32()? as usize;
                if parameter_size > body.remaining() {
                    return Err(MalformedReason::ParameterSize {
                        declared: parameter_size,
                        available: body.remaining(),
                    }
                    .into());
                }
                ResponseBuffer::new(body.read_bytes(parameter_size)?.to_vec())
            }
        };

        Ok(Self {
            header,
            handles,
            parameters,
        })
    }
}

/// Helper for parsing TPM structures
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl ResponseBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.remaining() {
            return Err(MalformedReason::Truncated {
                offset: self.offset,
                wanted: len,
                available: self.remaining(),
            }
            .into());
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Read a TPM2B (size-prefixed buffer)
    pub fn read_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.read_u16()? as usize;
        Ok(self.read_bytes(size)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Consume everything after the current offset
    fn rest(mut self) -> ResponseBuffer {
        let data = self.data.split_off(self.offset);
        ResponseBuffer::new(data)
    }
}
