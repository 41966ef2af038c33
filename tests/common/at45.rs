use usbd_msc::block::at45::{
    At45, At45Error, PageAddr, ID_LEN, STATUS_PAGE_SIZE_POW2, STATUS_PROTECT, STATUS_READY,
};

/// Behavioural model of an AT45 chip: flat memory, one SRAM buffer and a
/// busy period after every internal operation
pub struct SimAt45 {
    pub mem: Vec<u8>,
    pub page_size: usize,
    id: [u8; ID_LEN],
    buffer: Vec<u8>,
    busy: usize,
    /// Status reads answered busy after a page operation
    pub busy_cycles: usize,
    pub protected: bool,
    /// Configured for power of two pages. Off, the chip reports the
    /// default 264/528/1056 byte pages
    pub binary_pages: bool,
    /// Every command fails on the bus
    pub broken: bool,
    /// Number of page program cycles run
    pub programs: usize,
    /// Number of page to buffer transfers run
    pub page_reads: usize,
}

impl SimAt45 {
    /// A chip with density code `density` (2..=8)
    pub fn new(density: u8) -> Self {
        let page_size = match density {
            2..=5 => 256,
            6 | 7 => 512,
            _ => 1024,
        };
        let size = 0x8000usize << density;
        SimAt45 {
            mem: vec![0xFF; size],
            page_size,
            id: [0x1F, 0x20 | density, 0x00, 0x00],
            buffer: vec![0xFF; page_size],
            busy: 0,
            busy_cycles: 0,
            protected: false,
            binary_pages: true,
            broken: false,
            programs: 0,
            page_reads: 0,
        }
    }

    /// Answers READ ID with `id`
    pub fn with_id(mut self, id: [u8; ID_LEN]) -> Self {
        self.id = id;
        self
    }

    /// Reports busy for the next `cycles` status reads
    pub fn set_busy(&mut self, cycles: usize) {
        self.busy = cycles;
    }

    fn check(&self) -> Result<(), At45Error> {
        if self.broken {
            return Err(At45Error::Spi);
        }
        assert_eq!(0, self.busy, "command while the chip is busy");
        Ok(())
    }

    fn page_range(&self, page: u32, page_size: u16) -> std::ops::Range<usize> {
        assert_eq!(self.page_size, page_size as usize, "wrong page size");
        let start = page as usize * self.page_size;
        start..start + self.page_size
    }
}

impl At45 for SimAt45 {
    fn read_status(&mut self) -> Result<u8, At45Error> {
        if self.broken {
            return Err(At45Error::Spi);
        }
        let mut status = if self.protected { STATUS_PROTECT } else { 0 };
        if self.binary_pages {
            status |= STATUS_PAGE_SIZE_POW2;
        }
        if self.busy > 0 {
            self.busy -= 1;
        } else {
            status |= STATUS_READY;
        }
        Ok(status)
    }

    fn read_id(&mut self) -> Result<[u8; ID_LEN], At45Error> {
        self.check()?;
        Ok(self.id)
    }

    fn read(&mut self, addr: PageAddr, out: &mut [u8]) -> Result<(), At45Error> {
        self.check()?;
        assert!((addr.pos as usize) < self.page_size);
        let start = addr.page as usize * self.page_size + addr.pos as usize;
        out.copy_from_slice(&self.mem[start..start + out.len()]);
        Ok(())
    }

    fn page_to_buffer(&mut self, page: u32, page_size: u16) -> Result<(), At45Error> {
        self.check()?;
        let range = self.page_range(page, page_size);
        self.buffer.copy_from_slice(&self.mem[range]);
        self.busy = self.busy_cycles;
        self.page_reads += 1;
        Ok(())
    }

    fn write_buffer(&mut self, pos: u16, data: &[u8]) -> Result<(), At45Error> {
        self.check()?;
        let pos = pos as usize;
        self.buffer[pos..pos + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn program_buffer(&mut self, page: u32, page_size: u16) -> Result<(), At45Error> {
        self.check()?;
        let range = self.page_range(page, page_size);
        if !self.protected {
            self.mem[range].copy_from_slice(&self.buffer);
        }
        self.busy = self.busy_cycles;
        self.programs += 1;
        Ok(())
    }
}
