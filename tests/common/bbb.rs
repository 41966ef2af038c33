use super::device::{setup_packet, TestDevice, RECIPIENT_ENDPOINT, RECIPIENT_INTERFACE, TYPE_CLASS};
use super::leak;
use super::mem::MemBlockDevice;
use usb_device::control::Request;
use usbd_msc::block::BlockDevice;
use usbd_msc::subclass::msc::{Msc, MscConfig, DATA_BUFFER_SIZE, MIN_MEM_LEN};
use usbd_msc::udc::UdcConfig;
use usbd_msc::udm::descriptor::DeviceConfig;

pub const BULK_IN: usize = 1;
pub const BULK_OUT: usize = 2;
pub const BLOCK_SIZE: usize = 512;
pub const NR_BLOCKS: usize = 64;

pub const CSW_PASSED: u8 = 0;
pub const CSW_FAILED: u8 = 1;
pub const CSW_PHASE_ERROR: u8 = 2;

const MAX_POLLS: usize = 10_000;

pub type MscDevice<D = MemBlockDevice> = TestDevice<Msc<D>>;

/// An enumerated device with eight data buffers over `block`
pub fn msc_device<D: BlockDevice>(block: D) -> MscDevice<D> {
    let mem = leak(MIN_MEM_LEN + 7 * DATA_BUFFER_SIZE);
    let msc = Msc::new(MscConfig::default(), block, mem).unwrap();
    let mut dev = TestDevice::new(DeviceConfig::default(), UdcConfig::default(), msc);
    dev.enumerate();
    assert!(dev.iface.is_enabled());
    dev
}

pub fn default_device() -> MscDevice {
    msc_device(MemBlockDevice::new(NR_BLOCKS, BLOCK_SIZE))
}

pub fn cbw(tag: u32, data_len: u32, dir_in: bool, cb: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; 31];
    raw[..4].copy_from_slice(b"USBC");
    raw[4..8].copy_from_slice(&tag.to_le_bytes());
    raw[8..12].copy_from_slice(&data_len.to_le_bytes());
    raw[12] = if dir_in { 0x80 } else { 0x00 };
    raw[13] = 0;
    raw[14] = cb.len() as u8;
    raw[15..15 + cb.len()].copy_from_slice(cb);
    raw
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub residue: u32,
    pub status: u8,
}

impl Csw {
    pub fn parse(raw: &[u8]) -> Option<Csw> {
        if raw.len() != 13 || !raw.starts_with(b"USBS") {
            return None;
        }
        Some(Csw {
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            residue: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            status: raw[12],
        })
    }
}

/* Command blocks */

pub fn test_unit_ready() -> [u8; 6] {
    [0x00, 0, 0, 0, 0, 0]
}

pub fn request_sense(alloc_len: u8) -> [u8; 6] {
    [0x03, 0, 0, 0, alloc_len, 0]
}

pub fn inquiry(alloc_len: u16) -> [u8; 6] {
    let [hi, lo] = alloc_len.to_be_bytes();
    [0x12, 0, 0, hi, lo, 0]
}

pub fn inquiry_vpd(page: u8, alloc_len: u16) -> [u8; 6] {
    let [hi, lo] = alloc_len.to_be_bytes();
    [0x12, 0x01, page, hi, lo, 0]
}

pub fn mode_sense6(page: u8, alloc_len: u8) -> [u8; 6] {
    [0x1A, 0, page, 0, alloc_len, 0]
}

pub fn read_capacity() -> [u8; 10] {
    [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

fn cdb10(opcode: u8, lba: u32, len: u16) -> [u8; 10] {
    let [l0, l1, l2, l3] = lba.to_be_bytes();
    let [n0, n1] = len.to_be_bytes();
    [opcode, 0, l0, l1, l2, l3, 0, n0, n1, 0]
}

pub fn read10(lba: u32, len: u16) -> [u8; 10] {
    cdb10(0x28, lba, len)
}

pub fn write10(lba: u32, len: u16) -> [u8; 10] {
    cdb10(0x2A, lba, len)
}

pub fn verify10(lba: u32, len: u16) -> [u8; 10] {
    cdb10(0x2F, lba, len)
}

/* Host side */

pub fn clear_halt<D: BlockDevice>(dev: &mut MscDevice<D>, ep: u8) {
    dev.control(setup_packet(
        RECIPIENT_ENDPOINT,
        Request::CLEAR_FEATURE,
        Request::FEATURE_ENDPOINT_HALT,
        ep as u16,
        0,
    ))
    .expect("CLEAR_FEATURE");
}

pub fn bulk_only_reset<D: BlockDevice>(dev: &mut MscDevice<D>) -> bool {
    dev.control(setup_packet(TYPE_CLASS | RECIPIENT_INTERFACE, 0xFF, 0, 0, 0))
        .is_some()
}

/// Runs one command: sends the CBW and `data_out`, collects the IN data
/// and the CSW, clearing halts the way a host does. `None` if no CSW came
/// back, e.g. the endpoints are wedged
pub fn transact<D: BlockDevice>(
    dev: &mut MscDevice<D>,
    cbw: &[u8],
    data_out: &[u8],
) -> Option<(Vec<u8>, Csw)> {
    dev.bus.write(BULK_OUT, cbw);
    if !data_out.is_empty() {
        dev.bus.write(BULK_OUT, data_out);
    }

    let mut data = Vec::new();
    for _ in 0..MAX_POLLS {
        dev.poll();
        for packet in dev.bus.read_packets(BULK_IN) {
            if let Some(csw) = Csw::parse(&packet) {
                if dev.bus.is_stalled_out(BULK_OUT) {
                    clear_halt(dev, BULK_OUT as u8);
                }
                return Some((data, csw));
            }
            data.extend(packet);
        }
        if dev.bus.is_stalled_in(BULK_IN) {
            clear_halt(dev, 0x80 | BULK_IN as u8);
            if dev.bus.is_stalled_in(BULK_IN) {
                return None;
            }
        }
    }
    None
}

/// [transact] for a command that must produce a CSW with a matching tag
pub fn command<D: BlockDevice>(
    dev: &mut MscDevice<D>,
    tag: u32,
    data_len: u32,
    dir_in: bool,
    cb: &[u8],
    data_out: &[u8],
) -> (Vec<u8>, Csw) {
    let (data, csw) = transact(dev, &cbw(tag, data_len, dir_in, cb), data_out).expect("no CSW");
    assert_eq!(tag, csw.tag);
    (data, csw)
}

/// REQUEST SENSE, returns (key, asc and ascq, information)
pub fn sense<D: BlockDevice>(dev: &mut MscDevice<D>) -> (u8, u16, u32) {
    let (data, csw) = command(dev, 0x5E45E, 18, true, &request_sense(18), &[]);
    assert_eq!(CSW_PASSED, csw.status);
    assert_eq!(18, data.len());
    (
        data[2] & 0x0F,
        u16::from_be_bytes([data[12], data[13]]),
        u32::from_be_bytes([data[3], data[4], data[5], data[6]]),
    )
}
