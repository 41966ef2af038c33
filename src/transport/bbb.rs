//! Bulk Only Transport (BBB/BOT) wire format

use crate::transport::{CommandStatus, DataDirection};

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

pub const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
pub const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

const CBW_FLAGS_DIRECTION_IN: u8 = 1 << 7;

/// The bytes received are not a meaningful CBW. Spec. 6.2.1
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidCbwError;

/// Command Block Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block_len: usize,
    pub block: [u8; 16],
}

impl CommandBlockWrapper {
    /// Parses a complete CBW transfer.
    ///
    /// # Errors
    /// Returns [InvalidCbwError] if `raw` is not exactly [CBW_LEN] bytes long, the
    /// signature does not match or the command block length is out of range
    pub fn from_le_bytes(raw: &[u8]) -> Result<Self, InvalidCbwError> {
        const MIN_CB_LEN: u8 = 1;
        const MAX_CB_LEN: u8 = 16;

        if raw.len() != CBW_LEN || !raw.starts_with(&CBW_SIGNATURE_LE) {
            return Err(InvalidCbwError);
        }
        let value = &raw[4..]; // skipping signature

        let block_len = value[10];
        if !(MIN_CB_LEN..=MAX_CB_LEN).contains(&block_len) {
            return Err(InvalidCbwError);
        }

        let data_transfer_len = u32::from_le_bytes([value[4], value[5], value[6], value[7]]);
        let mut block = [0u8; 16];
        block.copy_from_slice(&value[11..]);

        Ok(CommandBlockWrapper {
            tag: u32::from_le_bytes([value[0], value[1], value[2], value[3]]),
            data_transfer_len,
            direction: if data_transfer_len != 0 {
                if (value[8] & CBW_FLAGS_DIRECTION_IN) > 0 {
                    DataDirection::In
                } else {
                    DataDirection::Out
                }
            } else {
                DataDirection::NotExpected
            },
            lun: value[9] & 0b00001111,
            block_len: block_len as usize,
            block,
        })
    }

    /// Command Block bytes, truncated to the declared length
    pub fn block(&self) -> &[u8] {
        &self.block[..self.block_len]
    }

    /// Checks what the host announced against what the command needs. Spec. 6.7
    ///
    /// Returns the data residue, or `None` when the command must end with a
    /// phase error (cases 2, 3, 7, 8, 10 and 13).
    pub fn residue(&self, needed: u32, direction: DataDirection) -> Option<u32> {
        if self.data_transfer_len < needed {
            return None;
        }
        if needed != 0 && self.direction != direction {
            return None;
        }
        Some(self.data_transfer_len - needed)
    }
}

/// Command Status Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    pub fn to_le_bytes(&self) -> [u8; CSW_LEN] {
        let mut csw = [0u8; CSW_LEN];
        csw[..4].copy_from_slice(CSW_SIGNATURE_LE.as_slice());
        csw[4..8].copy_from_slice(self.tag.to_le_bytes().as_slice());
        csw[8..12].copy_from_slice(self.data_residue.to_le_bytes().as_slice());
        csw[12] = self.status as u8;
        csw
    }
}
