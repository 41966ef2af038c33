//! Control transfer SETUP packet

use num_enum::TryFromPrimitive;
use usb_device::UsbDirection;

pub const SETUP_LEN: usize = 8;

/// Control request type. Refer to USB 2.0 spec. 9.3
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

/// Control request recipient. Refer to USB 2.0 spec. 9.3
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// A decoded SETUP packet
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(raw: &[u8; SETUP_LEN]) -> Self {
        SetupPacket {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; SETUP_LEN] {
        let mut raw = [0u8; SETUP_LEN];
        raw[0] = self.request_type;
        raw[1] = self.request;
        raw[2..4].copy_from_slice(&self.value.to_le_bytes());
        raw[4..6].copy_from_slice(&self.index.to_le_bytes());
        raw[6..8].copy_from_slice(&self.length.to_le_bytes());
        raw
    }

    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn is_in(&self) -> bool {
        matches!(self.direction(), UsbDirection::In)
    }

    pub fn kind(&self) -> RequestType {
        // two bits, every value is covered
        RequestType::try_from_primitive((self.request_type >> 5) & 0b11)
            .unwrap_or(RequestType::Reserved)
    }

    /// `None` for reserved recipients
    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::try_from_primitive(self.request_type & 0b1_1111).ok()
    }
}
