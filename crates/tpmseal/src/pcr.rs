// SPDX-License-Identifier: MIT OR Apache-2.0

//! PCR (Platform Configuration Register) operations
//!
//! Extension trait providing PCR read/extend for TPM, plus the PCR selection
//! structure shared by PCR_Read and PolicyPCR.

use crate::codec::{AuthCommand, Command, CommandBuffer, ResponseBuffer};
use crate::digest;
use crate::error::{ArgumentReason, MalformedReason, Result};
use crate::{Tpm, TpmAlg, TpmCc};

/// Number of PCRs addressable through a 3-byte selection bitmap
pub const PCR_COUNT: usize = 24;

/// Size of the selection bitmap (PCRs 0-23)
const PCR_SELECT_SIZE: u8 = 3;

/// A set of PCR indices in one bank (TPMS_PCR_SELECTION)
///
/// Stored as the bitmap the TPM uses, so indices are always reported in
/// ascending order regardless of the order they were given in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrSelection {
    bank: TpmAlg,
    bitmap: [u8; PCR_SELECT_SIZE as usize],
}

impl PcrSelection {
    /// Select `indices` in `bank`. Duplicates collapse; an empty selection
    /// or an index above 23 is rejected.
    pub fn new(bank: TpmAlg, indices: &[u8]) -> Result<Self> {
        bank.hash_size()?;
        if indices.is_empty() {
            return Err(ArgumentReason::EmptyPcrSelection.into());
        }

        let mut bitmap = [0u8; PCR_SELECT_SIZE as usize];
        for &index in indices {
            if index as usize >= PCR_COUNT {
                return Err(ArgumentReason::PcrIndexOutOfRange { index }.into());
            }
            bitmap[index as usize / 8] |= 1 << (index % 8);
        }
        Ok(Self { bank, bitmap })
    }

    pub fn bank(&self) -> TpmAlg {
        self.bank
    }

    /// Selected indices, ascending
    pub fn indices(&self) -> Vec<u8> {
        bitmap_indices(&self.bitmap)
    }

    pub fn contains(&self, index: u8) -> bool {
        (index as usize) < PCR_COUNT && self.bitmap[index as usize / 8] & (1 << (index % 8)) != 0
    }

    /// Append as a TPML_PCR_SELECTION with a single entry
    pub fn encode(&self, buf: CommandBuffer) -> CommandBuffer {
        buf.write_u32(1) // count
            .write_u16(self.bank as u16) // hash
            .write_u8(PCR_SELECT_SIZE) // sizeofSelect
            .write_bytes(&self.bitmap) // pcrSelect
    }

    /// TPML_PCR_SELECTION bytes, as folded into the PolicyPCR digest
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode(CommandBuffer::new()).into_vec()
    }

    /// Parse a TPML_PCR_SELECTION
    ///
    /// Returns `(bank algorithm id, selected indices)` per entry; bits beyond
    /// PCR 23 are ignored.
    pub fn decode_list(buf: &mut ResponseBuffer) -> Result<Vec<(u16, Vec<u8>)>> {
        let count = buf.read_u32()?;
        let mut selections = Vec::new();
        for _ in 0..count {
            let hash_alg = buf.read_u16()?;
            let select_size = buf.read_u8()? as usize;
            let pcr_select = buf.read_bytes(select_size)?;
            let indices = bitmap_indices(pcr_select)
                .into_iter()
                .filter(|&i| (i as usize) < PCR_COUNT)
                .collect();
            selections.push((hash_alg, indices));
        }
        Ok(selections)
    }
}

fn bitmap_indices(bitmap: &[u8]) -> Vec<u8> {
    let mut indices = Vec::new();
    for (byte_idx, byte) in bitmap.iter().enumerate() {
        for bit_idx in 0..8 {
            if byte & (1 << bit_idx) != 0 {
                indices.push((byte_idx * 8 + bit_idx) as u8);
            }
        }
    }
    indices
}

/// Compute the value a PCR holds after an extend: H(old || measurement)
pub fn extend_value(alg: TpmAlg, old: &[u8], measurement: &[u8]) -> Result<Vec<u8>> {
    digest::check_size(alg, old)?;
    digest::check_size(alg, measurement)?;
    digest::hash(alg, &[old, measurement])
}

/// Extension trait for PCR operations
pub trait PcrOps {
    /// Read the selected PCRs
    /// Returns (pcr_index, value) tuples in ascending index order
    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<Vec<(u8, Vec<u8>)>>;

    /// Extend a PCR in a specific bank with a digest value
    fn pcr_extend(&mut self, pcr_index: u8, bank: TpmAlg, digest: &[u8]) -> Result<()>;

    /// Hash `data` with the bank's algorithm, then extend
    fn pcr_extend_data(&mut self, pcr_index: u8, bank: TpmAlg, data: &[u8]) -> Result<()>;
}

impl PcrOps for Tpm {
    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<Vec<(u8, Vec<u8>)>> {
        let digest_size = selection.bank().hash_size()?;
        let mut pending = selection.indices();
        let mut results = Vec::with_capacity(pending.len());

        // A TPM returns at most eight digests per PCR_Read; keep asking for
        // whatever is still missing until the selection is complete
        while !pending.is_empty() {
            let request = PcrSelection::new(selection.bank(), &pending)?;
            let command = Command::new(TpmCc::PcrRead)
                .parameters(request.encode(CommandBuffer::new()));
            let mut resp = self.execute(&command)?.parameters;

            // Skip pcrUpdateCounter
            resp.read_u32()?;

            // pcrSelectionOut tells which PCRs are actually in the response
            let mut returned = Vec::new();
            for (hash_alg, indices) in PcrSelection::decode_list(&mut resp)? {
                if hash_alg == selection.bank() as u16 {
                    returned.extend(indices);
                }
            }

            // TPML_DIGEST - these correspond to the returned PCRs in order
            let digest_count = resp.read_u32()? as usize;
            if returned.is_empty() || digest_count != returned.len() {
                return Err(MalformedReason::MissingPcr { index: pending[0] }.into());
            }

            let before = pending.len();
            for index in returned {
                let value = resp.read_tpm2b()?;
                if value.len() != digest_size {
                    return Err(MalformedReason::DigestLength {
                        expected: digest_size,
                        got: value.len(),
                    }
                    .into());
                }
                if let Some(pos) = pending.iter().position(|&p| p == index) {
                    pending.remove(pos);
                    results.push((index, value));
                }
            }
            if pending.len() == before {
                return Err(MalformedReason::MissingPcr { index: pending[0] }.into());
            }
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results)
    }

    fn pcr_extend(&mut self, pcr_index: u8, bank: TpmAlg, digest: &[u8]) -> Result<()> {
        if pcr_index as usize >= PCR_COUNT {
            return Err(ArgumentReason::PcrIndexOutOfRange { index: pcr_index }.into());
        }
        digest::check_size(bank, digest)?;

        // PCR_Extend needs authorization for every PCR (empty password)
        let command = Command::new(TpmCc::PcrExtend)
            .handle(pcr_index as u32)
            .auth(AuthCommand::password(&[]))
            .parameters(
                CommandBuffer::new()
                    // TPML_DIGEST_VALUES with a single entry
                    .write_u32(1)
                    .write_u16(bank as u16)
                    // TPMU_HA is raw digest bytes, not a TPM2B
                    .write_bytes(digest),
            );
        self.execute(&command)?;

        Ok(())
    }

    fn pcr_extend_data(&mut self, pcr_index: u8, bank: TpmAlg, data: &[u8]) -> Result<()> {
        let measurement = digest::hash(bank, &[data])?;
        self.pcr_extend(pcr_index, bank, &measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_is_canonical() {
        let a = PcrSelection::new(TpmAlg::Sha1, &[16, 0, 7, 16]).unwrap();
        let b = PcrSelection::new(TpmAlg::Sha1, &[0, 7, 16]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.indices(), vec![0, 7, 16]);
        assert!(a.contains(7));
        assert!(!a.contains(8));
    }

    #[test]
    fn test_selection_bytes() {
        let sel = PcrSelection::new(TpmAlg::Sha256, &[16]).unwrap();
        assert_eq!(
            sel.to_bytes(),
            vec![0x00, 0x00, 0x00, 0x01, 0x00, 0x0B, 0x03, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_selection_rejects_bad_input() {
        assert!(PcrSelection::new(TpmAlg::Sha1, &[]).is_err());
        assert!(PcrSelection::new(TpmAlg::Sha1, &[24]).is_err());
        assert!(PcrSelection::new(TpmAlg::Rsa, &[0]).is_err());
    }

    #[test]
    fn test_decode_list() {
        let sel = PcrSelection::new(TpmAlg::Sha1, &[1, 16, 23]).unwrap();
        let mut buf = ResponseBuffer::new(sel.to_bytes());
        let decoded = PcrSelection::decode_list(&mut buf).unwrap();
        assert_eq!(decoded, vec![(TpmAlg::Sha1 as u16, vec![1, 16, 23])]);
    }

    #[test]
    fn test_extend_value() {
        let zero = [0u8; 20];
        let measurement = [b'X'; 20];
        let once = extend_value(TpmAlg::Sha1, &zero, &measurement).unwrap();
        let expected = digest::hash(TpmAlg::Sha1, &[&zero, &measurement]).unwrap();
        assert_eq!(once, expected);

        // Extending is not idempotent
        let twice = extend_value(TpmAlg::Sha1, &once, &measurement).unwrap();
        assert_ne!(once, twice);
    }

    #[test]
    fn test_extend_value_rejects_wrong_size() {
        assert!(extend_value(TpmAlg::Sha1, &[0u8; 20], &[0u8; 32]).is_err());
        assert!(extend_value(TpmAlg::Sha256, &[0u8; 20], &[0u8; 32]).is_err());
    }
}
