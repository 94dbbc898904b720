// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-stream channel to a TPM

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use log::debug;

use crate::codec::{ResponseHeader, TPM_HEADER_SIZE};
use crate::error::{Result, TransportReason};

/// Synchronous command channel
///
/// One exchange at a time: `transmit` sends a complete command buffer and
/// blocks until the complete response buffer (header included) arrives.
pub trait Transport: Send {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>>;
}

/// A TPM character device such as /dev/tpmrm0
pub struct DeviceTransport {
    device: File,
}

impl DeviceTransport {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(TransportReason::Io)?;
        debug!("Opened TPM device {}", path.display());

        Ok(Self { device })
    }
}

impl Transport for DeviceTransport {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        self.device.write_all(command)?;

        // Read response header first (10 bytes)
        let mut header_buf = [0u8; TPM_HEADER_SIZE];
        self.device.read_exact(&mut header_buf)?;
        let header = ResponseHeader::from_bytes(&header_buf);

        if (header.size as usize) < TPM_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid TPM response size: {}", header.size),
            ));
        }

        let mut response = header_buf.to_vec();
        response.resize(header.size as usize, 0);
        self.device.read_exact(&mut response[TPM_HEADER_SIZE..])?;

        Ok(response)
    }
}
