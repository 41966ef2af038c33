//! USB SCSI
//!
//! Command Block decoding and the fixed-format response data the mass
//! storage driver sends back.

use core::cmp::min;
use num_enum::TryFromPrimitive;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/* SCSI codes */

/* SPC */
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const MODE_SENSE_6: u8 = 0x1A;
const MODE_SENSE_10: u8 = 0x5A;

/* SBC */
const READ_6: u8 = 0x08;
const WRITE_6: u8 = 0x0A;
const READ_CAPACITY_10: u8 = 0x25;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2A;
const VERIFY_10: u8 = 0x2F;

/* VPD pages */
pub const VPD_SUPPORTED_PAGES: u8 = 0x00;
pub const VPD_UNIT_SERIAL_NUMBER: u8 = 0x80;
pub const VPD_DEVICE_IDENTIFICATION: u8 = 0x83;

/// Mode page code asking for every supported page
pub const MODE_PAGE_ALL: u8 = 0x3F;

pub const INQUIRY_DATA_LEN: usize = 36;
pub const READ_CAPACITY_10_LEN: usize = 8;
pub const VPD_SUPPORTED_PAGES_LEN: usize = 7;
pub const VPD_SERIAL_NUMBER_LEN: usize = 24;
pub const VPD_DEVICE_IDENTIFICATION_LEN: usize = 52;

/// Length of the serial number field in the VPD pages
pub const MAX_SERIAL_LEN: usize = 20;

const PERIPHERAL_DIRECT_ACCESS: u8 = 0x00; // connected, direct access block device
const INQUIRY_RMB: u8 = 0x80;
const INQUIRY_VERSION_SPC3: u8 = 0x05;
const INQUIRY_HISUP_RSP_SPC2: u8 = 0x12;
const MODE_DEVICE_SPECIFIC_WP: u8 = 0x80;
const BLOCK_DESCRIPTOR_LEN: usize = 8;
const CODE_SET_ASCII: u8 = 0x02;
const DESIGNATOR_T10_VENDOR_ID: u8 = 0x01;

/// SCSI command
///
/// Refer to specifications (SPC,SAM,SBC,MMC,etc.)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    Unknown {
        opcode: u8,
    },

    /* SPC */
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    TestUnitReady,
    RequestSense {
        desc: bool,
        alloc_len: u8,
    },
    ModeSense6 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u8,
    },
    ModeSense10 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u16,
    },

    /* SBC */
    ReadCapacity10,
    Read {
        lba: u32,
        len: u32,
    },
    Write {
        lba: u32,
        len: u32,
    },
    Verify {
        lba: u32,
        len: u32,
        bytchk: bool,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

impl PageControl {
    fn from_cb(byte: u8) -> Self {
        // two bits, every value is covered
        PageControl::try_from_primitive(byte >> 6).unwrap_or(PageControl::CurrentValues)
    }
}

impl ScsiCommand {
    /// Decodes a Command Block. Bytes past the declared length are zero
    pub fn parse(cb: &[u8; 16]) -> Self {
        match cb[0] {
            TEST_UNIT_READY => ScsiCommand::TestUnitReady,
            INQUIRY => ScsiCommand::Inquiry {
                evpd: (cb[1] & 0b00000001) != 0,
                page_code: cb[2],
                alloc_len: u16::from_be_bytes([cb[3], cb[4]]),
            },
            REQUEST_SENSE => ScsiCommand::RequestSense {
                desc: (cb[1] & 0b00000001) != 0,
                alloc_len: cb[4],
            },
            READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
            READ_6 => ScsiCommand::Read {
                lba: cdb6_lba(cb),
                len: cdb6_len(cb),
            },
            WRITE_6 => ScsiCommand::Write {
                lba: cdb6_lba(cb),
                len: cdb6_len(cb),
            },
            READ_10 => ScsiCommand::Read {
                lba: cdb10_lba(cb),
                len: cdb10_len(cb),
            },
            WRITE_10 => ScsiCommand::Write {
                lba: cdb10_lba(cb),
                len: cdb10_len(cb),
            },
            VERIFY_10 => ScsiCommand::Verify {
                lba: cdb10_lba(cb),
                len: cdb10_len(cb),
                bytchk: (cb[1] & 0b00000010) != 0,
            },
            MODE_SENSE_6 => ScsiCommand::ModeSense6 {
                dbd: (cb[1] & 0b00001000) != 0,
                page_control: PageControl::from_cb(cb[2]),
                page_code: cb[2] & 0b00111111,
                subpage_code: cb[3],
                alloc_len: cb[4],
            },
            MODE_SENSE_10 => ScsiCommand::ModeSense10 {
                dbd: (cb[1] & 0b00001000) != 0,
                page_control: PageControl::from_cb(cb[2]),
                page_code: cb[2] & 0b00111111,
                subpage_code: cb[3],
                alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
            },
            opcode => ScsiCommand::Unknown { opcode },
        }
    }
}

fn cdb6_lba(cb: &[u8; 16]) -> u32 {
    u32::from_be_bytes([0, cb[1] & 0b00011111, cb[2], cb[3]])
}

/// A transfer length of 0 means 256 blocks in the 6 byte commands
fn cdb6_len(cb: &[u8; 16]) -> u32 {
    match cb[4] {
        0 => 256,
        len => len as u32,
    }
}

fn cdb10_lba(cb: &[u8; 16]) -> u32 {
    u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]])
}

fn cdb10_len(cb: &[u8; 16]) -> u32 {
    u16::from_be_bytes([cb[7], cb[8]]) as u32
}

/// Device identification strings reported by INQUIRY
#[derive(Copy, Clone, Debug)]
pub struct Identification<'a> {
    pub vendor_id: &'a [u8; 8],
    pub product_id: &'a [u8; 16],
    pub product_rev: &'a [u8; 4],
    pub serial_number: &'a str,
}

/// Standard INQUIRY data. Returns the number of bytes written
pub fn inquiry_data(id: &Identification, removable: bool, out: &mut [u8]) -> usize {
    let data = &mut out[..INQUIRY_DATA_LEN];
    data.fill(0);
    data[0] = PERIPHERAL_DIRECT_ACCESS;
    data[1] = if removable { INQUIRY_RMB } else { 0 };
    data[2] = INQUIRY_VERSION_SPC3;
    data[3] = INQUIRY_HISUP_RSP_SPC2;
    data[4] = (INQUIRY_DATA_LEN - 5) as u8;
    data[8..16].copy_from_slice(id.vendor_id);
    data[16..32].copy_from_slice(id.product_id);
    data[32..36].copy_from_slice(id.product_rev);
    INQUIRY_DATA_LEN
}

/// Builds VPD page `page_code`. Returns `None` if the page is not supported
pub fn vpd_page(page_code: u8, id: &Identification, out: &mut [u8]) -> Option<usize> {
    match page_code {
        VPD_SUPPORTED_PAGES => {
            out[..VPD_SUPPORTED_PAGES_LEN].copy_from_slice(&[
                PERIPHERAL_DIRECT_ACCESS,
                VPD_SUPPORTED_PAGES,
                0x00,
                3,
                VPD_SUPPORTED_PAGES,
                VPD_UNIT_SERIAL_NUMBER,
                VPD_DEVICE_IDENTIFICATION,
            ]);
            Some(VPD_SUPPORTED_PAGES_LEN)
        }
        VPD_UNIT_SERIAL_NUMBER => {
            let page = &mut out[..VPD_SERIAL_NUMBER_LEN];
            page[..4].copy_from_slice(&[
                PERIPHERAL_DIRECT_ACCESS,
                VPD_UNIT_SERIAL_NUMBER,
                0x00,
                MAX_SERIAL_LEN as u8,
            ]);
            right_aligned(id.serial_number.as_bytes(), &mut page[4..]);
            Some(VPD_SERIAL_NUMBER_LEN)
        }
        VPD_DEVICE_IDENTIFICATION => {
            let page = &mut out[..VPD_DEVICE_IDENTIFICATION_LEN];
            let designator_len = VPD_DEVICE_IDENTIFICATION_LEN - 8;
            page[..8].copy_from_slice(&[
                PERIPHERAL_DIRECT_ACCESS,
                VPD_DEVICE_IDENTIFICATION,
                0x00,
                (VPD_DEVICE_IDENTIFICATION_LEN - 4) as u8,
                CODE_SET_ASCII,
                DESIGNATOR_T10_VENDOR_ID,
                0x00,
                designator_len as u8,
            ]);
            page[8..16].copy_from_slice(id.vendor_id);
            page[16..32].copy_from_slice(id.product_id);
            right_aligned(id.serial_number.as_bytes(), &mut page[32..]);
            Some(VPD_DEVICE_IDENTIFICATION_LEN)
        }
        _ => None,
    }
}

/// Space-pads `src` on the left to fill `out`. Long input is truncated
fn right_aligned(src: &[u8], out: &mut [u8]) {
    out.fill(b' ');
    let count = min(src.len(), out.len());
    let start = out.len() - count;
    out[start..].copy_from_slice(&src[..count]);
}

/// What a MODE SENSE reply describes
#[derive(Copy, Clone, Debug)]
pub struct ModeParameters {
    pub write_protect: bool,
    /// Append a short LBA block descriptor
    pub block_descriptor: bool,
    pub nr_blocks: u32,
    pub block_len: u32,
}

/// Mode parameter header (6 or 10 byte flavour) and optional block
/// descriptor. No mode pages are reported. Returns the number of bytes written
pub fn mode_parameters(ten: bool, params: &ModeParameters, out: &mut [u8]) -> usize {
    let header_len = if ten { 8 } else { 4 };
    let desc_len = if params.block_descriptor {
        BLOCK_DESCRIPTOR_LEN
    } else {
        0
    };
    let total = header_len + desc_len;
    let data = &mut out[..total];
    data.fill(0);

    let device_specific = if params.write_protect {
        MODE_DEVICE_SPECIFIC_WP
    } else {
        0
    };
    if ten {
        data[..2].copy_from_slice(&((total - 2) as u16).to_be_bytes());
        data[3] = device_specific;
        data[6..8].copy_from_slice(&(desc_len as u16).to_be_bytes());
    } else {
        data[0] = (total - 1) as u8;
        data[2] = device_specific;
        data[3] = desc_len as u8;
    }

    if params.block_descriptor {
        let desc = &mut data[header_len..];
        desc[..4].copy_from_slice(&params.nr_blocks.to_be_bytes());
        desc[4..8].copy_from_slice(&params.block_len.to_be_bytes());
    }
    total
}

/// READ CAPACITY (10) data. Returns the number of bytes written
pub fn read_capacity_10(nr_blocks: u32, block_len: u32, out: &mut [u8]) -> usize {
    let max_lba = nr_blocks.saturating_sub(1);
    out[..4].copy_from_slice(&max_lba.to_be_bytes());
    out[4..8].copy_from_slice(&block_len.to_be_bytes());
    READ_CAPACITY_10_LEN
}
