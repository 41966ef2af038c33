//! SCSI sense data. Refer to SPC-3 4.5.3

/// Length of fixed format sense data
pub const SENSE_DATA_LEN: usize = 18;

const SENSE_VALID: u8 = 0x80;
const SENSE_CURRENT: u8 = 0x70;

/// Sense key
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

/// Additional sense code and qualifier pairs, ASC in the high byte
pub mod asc {
    pub const NO_ADDITIONAL_SENSE_INFORMATION: u16 = 0x0000;
    pub const LOGICAL_UNIT_BECOMING_READY: u16 = 0x0401;
    pub const WRITE_ERROR: u16 = 0x0C00;
    pub const UNRECOVERED_READ_ERROR: u16 = 0x1100;
    pub const INVALID_COMMAND_OPERATION_CODE: u16 = 0x2000;
    pub const LBA_OUT_OF_RANGE: u16 = 0x2100;
    pub const INVALID_FIELD_IN_CDB: u16 = 0x2400;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u16 = 0x2500;
    pub const WRITE_PROTECTED: u16 = 0x2700;
    pub const NOT_READY_TO_READY_CHANGE: u16 = 0x2800;
    pub const MEDIUM_NOT_PRESENT: u16 = 0x3A00;
}

/// The outcome of the last failed command, kept until the host asks for it
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenseData {
    pub key: SenseKey,
    pub asc: u16,
    /// LBA of the first failed block, 0 if not applicable
    pub information: u32,
}

impl SenseData {
    pub const fn new(key: SenseKey, asc: u16, information: u32) -> Self {
        SenseData {
            key,
            asc,
            information,
        }
    }

    pub const fn no_sense() -> Self {
        Self::new(SenseKey::NoSense, asc::NO_ADDITIONAL_SENSE_INFORMATION, 0)
    }

    pub fn to_bytes(&self) -> [u8; SENSE_DATA_LEN] {
        let mut data = [0u8; SENSE_DATA_LEN];
        data[0] = SENSE_VALID | SENSE_CURRENT;
        data[2] = self.key as u8;
        data[3..7].copy_from_slice(&self.information.to_be_bytes());
        data[7] = (SENSE_DATA_LEN - 8) as u8; // additional sense length
        data[12..14].copy_from_slice(&self.asc.to_be_bytes());
        data
    }
}

impl Default for SenseData {
    fn default() -> Self {
        Self::no_sense()
    }
}
