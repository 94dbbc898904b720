// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage root key
//!
//! An ephemeral RSA-2048 storage key created under the owner hierarchy with
//! the standard SRK template. Being a primary key, the same template yields
//! the same key on every call within one owner seed.

use log::{debug, warn};

use crate::codec::{AuthCommand, Command, CommandBuffer};
use crate::error::{HandleReason, Result};
use crate::{ObjectAttributes, Slot, Tpm, TpmAlg, TpmCc, TPM_RH_OWNER};

/// RSA key size of the storage root key
const ROOT_KEY_BITS: u16 = 2048;

/// AES key size for the storage root key's symmetric protection
const ROOT_SYM_BITS: u16 = 128;

/// Handle of a loaded storage root key
#[derive(Debug, PartialEq, Eq)]
pub struct RootKey {
    handle: u32,
}

impl RootKey {
    pub fn handle(&self) -> u32 {
        self.handle
    }
}

/// Build the TPMT_PUBLIC template for an RSA storage parent
pub(crate) fn build_storage_public_area(name_alg: TpmAlg) -> Vec<u8> {
    let attributes = ObjectAttributes::new()
        .fixed_tpm()
        .fixed_parent()
        .sensitive_data_origin()
        .user_with_auth()
        .no_da()
        .restricted()
        .decrypt();

    CommandBuffer::new()
        .write_u16(TpmAlg::Rsa as u16) // type
        .write_u16(name_alg as u16) // nameAlg
        .write_u32(attributes.value()) // objectAttributes
        .write_u16(0) // authPolicy (empty)
        // TPMS_RSA_PARMS
        .write_u16(TpmAlg::Aes as u16) // symmetric.algorithm
        .write_u16(ROOT_SYM_BITS) // symmetric.keyBits
        .write_u16(TpmAlg::Cfb as u16) // symmetric.mode
        .write_u16(TpmAlg::Null as u16) // scheme
        .write_u16(ROOT_KEY_BITS) // keyBits
        .write_u32(0) // exponent (default 65537)
        // unique (TPM2B_PUBLIC_KEY_RSA) - empty
        .write_u16(0)
        .into_vec()
}

impl Tpm {
    /// Create the storage root key under the owner hierarchy
    /// (TPM2_CreatePrimary)
    pub fn create_root_key(&mut self) -> Result<RootKey> {
        let public_area = build_storage_public_area(self.name_alg());

        let command = Command::new(TpmCc::CreatePrimary)
            .handle(TPM_RH_OWNER)
            .auth(AuthCommand::password(&[]))
            .parameters(
                CommandBuffer::new()
                    // inSensitive (TPM2B_SENSITIVE_CREATE)
                    .write_u16(4)
                    .write_u16(0) // userAuth size = 0
                    .write_u16(0) // data size = 0
                    // inPublic (TPM2B_PUBLIC)
                    .write_tpm2b(&public_area)
                    // outsideInfo (TPM2B_DATA) - empty
                    .write_u16(0)
                    // creationPCR (TPML_PCR_SELECTION) - empty
                    .write_u32(0),
            );

        // outPublic, creation data and ticket are not needed
        let resp = self.execute(&command)?;
        let handle = resp.handles[0];
        debug!("Created storage root key 0x{:08X}", handle);

        self.track(handle, Slot::RootKey)?;
        Ok(RootKey { handle })
    }

    /// Unload the root key (TPM2_FlushContext)
    pub fn flush_root_key(&mut self, root_key: RootKey) -> Result<()> {
        self.check_root_key(&root_key)?;
        debug!("Flushing storage root key 0x{:08X}", root_key.handle);
        self.flush_context(root_key.handle)
    }

    /// Run `f` with a fresh root key, flushing it on every exit path
    ///
    /// An error from `f` takes precedence over an error from the flush.
    pub fn with_root_key<T>(
        &mut self,
        f: impl FnOnce(&mut Tpm, &RootKey) -> Result<T>,
    ) -> Result<T> {
        let root_key = self.create_root_key()?;
        let result = f(self, &root_key);
        let flushed = self.flush_root_key(root_key);
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(flush_err)) => {
                warn!("Root key flush failed after an earlier error: {}", flush_err);
                Err(e)
            }
        }
    }

    pub(crate) fn check_root_key(&self, root_key: &RootKey) -> Result<()> {
        match self.slot(root_key.handle)? {
            Slot::RootKey => Ok(()),
            _ => Err(HandleReason::NotARootKey {
                handle: root_key.handle,
            }
            .into()),
        }
    }
}
