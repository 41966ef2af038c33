//! AT45 DataFlash command set

use crate::fmt::{info, warn};
use embedded_hal::spi::{Operation, SpiDevice};

/// Atmel JEDEC manufacturer id
pub const JEDEC_ID_ATMEL: u8 = 0x1F;
pub const FAMILY_CODE_DATAFLASH: u8 = 0x20;
const FAMILY_CODE_MASK: u8 = 0xE0;
const DENSITY_CODE_MASK: u8 = 0x1F;
const DENSITY_CODE_MIN: u8 = 2;
const DENSITY_CODE_MAX: u8 = 8;
const DENSITY_CODE_0_SIZE: u32 = 0x8000;

/// Length of the manufacturer and device id response
pub const ID_LEN: usize = 4;

pub const STATUS_READY: u8 = 1 << 7;
pub const STATUS_PROTECT: u8 = 1 << 1;
/// Pages are a power of two in size, otherwise 8 bytes per 256 longer
pub const STATUS_PAGE_SIZE_POW2: u8 = 1 << 0;

mod cmd {
    pub const CONTINUOUS_ARRAY_READ: u8 = 0x0B;
    pub const MAIN_MEMORY_TO_BUFFER_1: u8 = 0x53;
    pub const BUFFER_1_PROGRAM_WITH_ERASE: u8 = 0x83;
    pub const BUFFER_1_WRITE: u8 = 0x84;
    pub const READ_ID: u8 = 0x9F;
    pub const READ_STATUS: u8 = 0xD7;
}

/// Outcome of a non-blocking readiness check
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Poll {
    /// The chip is busy, ask again later
    NotReady,
    Ready,
    /// The chip cannot be talked to
    Error,
}

/// AT45 bus error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum At45Error {
    Spi,
}

/// Chip geometry decoded from the id
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct At45Info {
    /// Capacity in bytes
    pub size: u32,
    pub page_size: u16,
}

impl At45Info {
    /// Decodes the response of the READ ID command.
    /// Returns `None` if this is not a supported DataFlash
    pub fn from_id(id: &[u8; ID_LEN]) -> Option<Self> {
        let density = id[1] & DENSITY_CODE_MASK;
        if id[0] != JEDEC_ID_ATMEL
            || id[1] & FAMILY_CODE_MASK != FAMILY_CODE_DATAFLASH
            || !(DENSITY_CODE_MIN..=DENSITY_CODE_MAX).contains(&density)
        {
            return None;
        }

        let page_size = match density {
            2..=5 => 256,
            6 | 7 => 512,
            _ => 1024,
        };
        Some(At45Info {
            size: DENSITY_CODE_0_SIZE << density,
            page_size,
        })
    }

    /// Geometry of a chip left in its default page size (264, 528 or 1056
    /// bytes). The extra bytes are not counted in `size`
    pub fn with_extended_pages(self) -> Self {
        At45Info {
            page_size: self.page_size + self.page_size / 32,
            ..self
        }
    }

    pub fn nr_pages(&self) -> u32 {
        self.size / self.page_size as u32
    }
}

/// A byte position inside a flash page.
///
/// Commands address the chip as a page number followed by the byte offset,
/// with one spare offset bit above the page size.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PageAddr {
    pub page: u32,
    pub pos: u16,
    pos_bits: u8,
}

impl PageAddr {
    pub fn new(page: u32, pos: u16, page_size: u16) -> Self {
        PageAddr {
            page,
            pos,
            pos_bits: page_size.trailing_zeros() as u8 + 1,
        }
    }

    fn to_bytes(self) -> [u8; 3] {
        let addr = (self.page << self.pos_bits) | self.pos as u32;
        [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
    }
}

/// Low level access to an AT45 chip.
///
/// Every command is a complete chip select cycle. Commands that start an
/// internal operation return once it is started; completion is observed
/// with [At45::wait_ready].
pub trait At45 {
    fn read_status(&mut self) -> Result<u8, At45Error>;

    fn read_id(&mut self) -> Result<[u8; ID_LEN], At45Error>;

    /// Continuous array read starting at `addr`
    fn read(&mut self, addr: PageAddr, out: &mut [u8]) -> Result<(), At45Error>;

    /// Copies a flash page into buffer 1
    fn page_to_buffer(&mut self, page: u32, page_size: u16) -> Result<(), At45Error>;

    /// Writes `data` into buffer 1 at `pos`
    fn write_buffer(&mut self, pos: u16, data: &[u8]) -> Result<(), At45Error>;

    /// Erases a flash page and programs it from buffer 1
    fn program_buffer(&mut self, page: u32, page_size: u16) -> Result<(), At45Error>;

    /// Checks whether the previous operation finished
    fn wait_ready(&mut self) -> Poll {
        match self.read_status() {
            Ok(status) if status & STATUS_READY != 0 => Poll::Ready,
            Ok(_) => Poll::NotReady,
            Err(_) => Poll::Error,
        }
    }
}

/// An AT45 chip on an SPI bus
pub struct SpiAt45<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> SpiAt45<SPI> {
    pub fn new(spi: SPI) -> Self {
        SpiAt45 { spi }
    }

    pub fn release(self) -> SPI {
        self.spi
    }

    fn command(&mut self, op: u8, addr: [u8; 3]) -> Result<(), At45Error> {
        let header = [op, addr[0], addr[1], addr[2]];
        self.spi.write(&header).map_err(|_| At45Error::Spi)
    }
}

impl<SPI: SpiDevice> At45 for SpiAt45<SPI> {
    fn read_status(&mut self) -> Result<u8, At45Error> {
        let mut status = [0u8; 1];
        self.spi
            .transaction(&mut [
                Operation::Write(&[cmd::READ_STATUS]),
                Operation::Read(&mut status),
            ])
            .map_err(|_| At45Error::Spi)?;
        Ok(status[0])
    }

    fn read_id(&mut self) -> Result<[u8; ID_LEN], At45Error> {
        let mut id = [0u8; ID_LEN];
        self.spi
            .transaction(&mut [Operation::Write(&[cmd::READ_ID]), Operation::Read(&mut id)])
            .map_err(|_| At45Error::Spi)?;
        Ok(id)
    }

    fn read(&mut self, addr: PageAddr, out: &mut [u8]) -> Result<(), At45Error> {
        let [a0, a1, a2] = addr.to_bytes();
        // one don't care byte before the data
        let header = [cmd::CONTINUOUS_ARRAY_READ, a0, a1, a2, 0];
        self.spi
            .transaction(&mut [Operation::Write(&header), Operation::Read(out)])
            .map_err(|_| At45Error::Spi)
    }

    fn page_to_buffer(&mut self, page: u32, page_size: u16) -> Result<(), At45Error> {
        let addr = PageAddr::new(page, 0, page_size).to_bytes();
        self.command(cmd::MAIN_MEMORY_TO_BUFFER_1, addr)
    }

    fn write_buffer(&mut self, pos: u16, data: &[u8]) -> Result<(), At45Error> {
        let header = [cmd::BUFFER_1_WRITE, 0, (pos >> 8) as u8, pos as u8];
        self.spi
            .transaction(&mut [Operation::Write(&header), Operation::Write(data)])
            .map_err(|_| At45Error::Spi)
    }

    fn program_buffer(&mut self, page: u32, page_size: u16) -> Result<(), At45Error> {
        let addr = PageAddr::new(page, 0, page_size).to_bytes();
        self.command(cmd::BUFFER_1_PROGRAM_WITH_ERASE, addr)
    }
}

/// Result of [identify]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// Raw manufacturer and device id
    pub id: [u8; ID_LEN],
    /// `None` if no supported DataFlash answered
    pub info: Option<At45Info>,
    pub protected: bool,
}

/// Identifies the chip once it reports ready
pub fn identify<A: At45>(at45: &mut A) -> Result<Option<Identity>, At45Error> {
    let status = at45.read_status()?;
    if status & STATUS_READY == 0 {
        return Ok(None);
    }
    let protected = status & STATUS_PROTECT != 0;

    let id = at45.read_id()?;
    let mut info = At45Info::from_id(&id);
    if status & STATUS_PAGE_SIZE_POW2 == 0 {
        info = info.map(At45Info::with_extended_pages);
    }
    match info {
        Some(info) => info!(
            "at45: id {:02x}, {} bytes, page size {}",
            id,
            info.size,
            info.page_size
        ),
        None => warn!("at45: No valid DataFlash detected, id {:02x}", id),
    }
    Ok(Some(Identity {
        id,
        info,
        protected,
    }))
}
