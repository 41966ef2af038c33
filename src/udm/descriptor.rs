//! Standard descriptor encoding

use usb_device::descriptor::descriptor_type;

pub const DEVICE_DESC_LEN: usize = 18;
pub const QUALIFIER_DESC_LEN: usize = 10;
pub const CONFIG_DESC_LEN: usize = 9;
pub const INTERFACE_DESC_LEN: usize = 9;
pub const ENDPOINT_DESC_LEN: usize = 7;

/// Descriptor types usb-device does not define
pub const DEVICE_QUALIFIER: u8 = 6;
pub const OTHER_SPEED_CONFIGURATION: u8 = 7;

/// bmAttributes bit 7 is reserved and must be set
pub const CONFIG_ATTR_RESERVED: u8 = 0x80;
pub const CONFIG_ATTR_SELF_POWERED: u8 = 0x40;
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 0x20;

const USB_VERSION: u16 = 0x0200;

/// Application supplied device identity
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_release: u16,
    /// String descriptor indices, 0 for none
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    /// Answer DEVICE_QUALIFIER and OTHER_SPEED_CONFIGURATION requests
    pub high_speed_capable: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            vendor_id: 0x03EB,
            product_id: 0x2FFF,
            device_release: 0x0100,
            manufacturer: 0,
            product: 0,
            serial_number: 0,
            high_speed_capable: false,
        }
    }
}

pub fn device(config: &DeviceConfig, max_packet_size_0: u8, nr_configs: u8, out: &mut [u8]) {
    let [vid_lo, vid_hi] = config.vendor_id.to_le_bytes();
    let [pid_lo, pid_hi] = config.product_id.to_le_bytes();
    let [rel_lo, rel_hi] = config.device_release.to_le_bytes();
    let [bcd_lo, bcd_hi] = USB_VERSION.to_le_bytes();
    out[..DEVICE_DESC_LEN].copy_from_slice(&[
        DEVICE_DESC_LEN as u8,
        descriptor_type::DEVICE,
        bcd_lo,
        bcd_hi,
        0x00, // class defined per interface
        0x00,
        0x00,
        max_packet_size_0,
        vid_lo,
        vid_hi,
        pid_lo,
        pid_hi,
        rel_lo,
        rel_hi,
        config.manufacturer,
        config.product,
        config.serial_number,
        nr_configs,
    ]);
}

pub fn device_qualifier(max_packet_size_0: u8, nr_configs: u8, out: &mut [u8]) {
    let [bcd_lo, bcd_hi] = USB_VERSION.to_le_bytes();
    out[..QUALIFIER_DESC_LEN].copy_from_slice(&[
        QUALIFIER_DESC_LEN as u8,
        DEVICE_QUALIFIER,
        bcd_lo,
        bcd_hi,
        0x00,
        0x00,
        0x00,
        max_packet_size_0,
        nr_configs,
        0x00,
    ]);
}

#[allow(clippy::too_many_arguments)]
pub fn configuration(
    desc_type: u8,
    total_len: u16,
    nr_ifaces: u8,
    value: u8,
    attributes: u8,
    max_power: u8,
    out: &mut [u8],
) {
    let [total_lo, total_hi] = total_len.to_le_bytes();
    out[..CONFIG_DESC_LEN].copy_from_slice(&[
        CONFIG_DESC_LEN as u8,
        desc_type,
        total_lo,
        total_hi,
        nr_ifaces,
        value,
        0x00,
        attributes,
        max_power,
    ]);
}

pub fn interface(
    number: u8,
    setting: u8,
    nr_endpoints: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
    out: &mut [u8],
) {
    out[..INTERFACE_DESC_LEN].copy_from_slice(&[
        INTERFACE_DESC_LEN as u8,
        descriptor_type::INTERFACE,
        number,
        setting,
        nr_endpoints,
        class,
        subclass,
        protocol,
        0x00,
    ]);
}

pub fn endpoint(addr: u8, attributes: u8, max_packet_size: u16, interval: u8, out: &mut [u8]) {
    let [mps_lo, mps_hi] = max_packet_size.to_le_bytes();
    out[..ENDPOINT_DESC_LEN].copy_from_slice(&[
        ENDPOINT_DESC_LEN as u8,
        descriptor_type::ENDPOINT,
        addr,
        attributes,
        mps_lo,
        mps_hi,
        interval,
    ]);
}

/// String descriptor zero: the supported language
pub fn langid(langid: u16, out: &mut [u8]) -> usize {
    let [lo, hi] = langid.to_le_bytes();
    out[..4].copy_from_slice(&[4, descriptor_type::STRING, lo, hi]);
    4
}

/// ASCII string as UTF-16LE, truncated to what fits `out`. Returns the descriptor length
pub fn string(s: &str, out: &mut [u8]) -> usize {
    let max_chars = (out.len().min(255) - 2) / 2;
    let mut len = 2;
    for (i, c) in s.bytes().take(max_chars).enumerate() {
        out[2 + 2 * i] = c;
        out[3 + 2 * i] = 0;
        len += 2;
    }
    out[0] = len as u8;
    out[1] = descriptor_type::STRING;
    len
}
