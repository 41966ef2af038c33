//! Mass Storage function: SCSI transparent command set over Bulk-Only Transport
//!
//! [Msc] is an [Interface] driver. Plug it into a [Udm] configuration and
//! poll the multiplexer: commands arrive as CBWs on the bulk OUT endpoint,
//! data moves between the bulk endpoints and the [BlockDevice] without
//! copying, and every command ends with a CSW on the bulk IN endpoint.
//!
//! A single logical unit is exposed.
//!
//! [Udm]: crate::udm::Udm

mod stream;

use crate::block::{BlockDevice, BlockError, BlockEvent, BlockRequestId};
use crate::buffer::{BufList, Buffer};
use crate::fmt::{debug, error, info, trace, warn};
use crate::subclass::scsi::{
    self, Identification, ModeParameters, PageControl, ScsiCommand, MAX_SERIAL_LEN,
    MODE_PAGE_ALL, READ_CAPACITY_10_LEN, SUBCLASS_SCSI,
};
use crate::subclass::sense::{asc, SenseData, SenseKey, SENSE_DATA_LEN};
use crate::transport::bbb::{
    CommandBlockWrapper, CommandStatusWrapper, InvalidCbwError, CBW_LEN,
    CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET, CLASS_SPECIFIC_GET_MAX_LUN, CSW_LEN,
    TRANSPORT_BBB,
};
use crate::transport::{CommandStatus, DataDirection};
use crate::udc::request::{Completion, Owner, Request, RequestId};
use crate::udc::setup::{RequestType, SetupPacket};
use crate::udc::{EpKind, Udc, UdcError, UsbSpeed};
use crate::udm::descriptor::{self, ENDPOINT_DESC_LEN, INTERFACE_DESC_LEN};
use crate::udm::{Interface, UdmError};
use crate::CLASS_MASS_STORAGE;
use heapless::Vec;
use stream::{Stream, StreamOp};
use usb_device::bus::UsbBus;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Size of one data buffer. Block sizes must divide it
pub const DATA_BUFFER_SIZE: usize = 512;
/// Data buffers beyond this count are left unused
pub const MAX_DATA_BUFFERS: usize = 8;

const CBW_BUFFER_LEN: usize = 32;
const RESPONSE_BUFFER_LEN: usize = 64;
const DESC_BUFFER_LEN: usize = 32;

/// Smallest memory block [Msc::new] accepts: the fixed buffers plus one data buffer
pub const MIN_MEM_LEN: usize =
    CBW_BUFFER_LEN + RESPONSE_BUFFER_LEN + DESC_BUFFER_LEN + DATA_BUFFER_SIZE;

const MAX_DATA_REQUESTS: usize = 4;
const MSC_DESC_LEN: usize = INTERFACE_DESC_LEN + 2 * ENDPOINT_DESC_LEN;
const HIGH_SPEED_PACKET_SIZE: u16 = 512;
const EP_ATTR_BULK: u8 = 0x02;
const EP_DIR_IN: u8 = 0x80;

/// Mass Storage driver error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MscError {
    /// Not enough memory for the buffers, or the block size does not divide
    /// [DATA_BUFFER_SIZE]
    BufferTooSmall,
    Udc(UdcError),
    Block(BlockError),
}

impl From<UdcError> for MscError {
    fn from(err: UdcError) -> Self {
        MscError::Udc(err)
    }
}

impl From<BlockError> for MscError {
    fn from(err: BlockError) -> Self {
        MscError::Block(err)
    }
}

impl From<MscError> for UdmError {
    fn from(err: MscError) -> Self {
        match err {
            MscError::Udc(err) => UdmError::Udc(err),
            _ => UdmError::Rejected,
        }
    }
}

/// Identification and endpoint layout of the function
#[derive(Copy, Clone, Debug)]
pub struct MscConfig {
    /// T10 vendor identification, space padded
    pub vendor_id: [u8; 8],
    /// Product identification, space padded
    pub product_id: [u8; 16],
    /// Product revision level, space padded
    pub product_rev: [u8; 4],
    /// Reported in the Unit Serial Number VPD page. See [serial_number_is_valid]
    pub serial_number: &'static str,
    pub removable: bool,
    /// Bulk IN endpoint number
    pub bulk_in_ep: u8,
    /// Bulk OUT endpoint number
    pub bulk_out_ep: u8,
    /// Bulk packet size below high speed
    pub packet_size: u16,
    /// Reserve endpoints big enough for high speed operation
    pub high_speed_capable: bool,
}

impl Default for MscConfig {
    fn default() -> Self {
        MscConfig {
            vendor_id: *b"usbd-msc",
            product_id: *b"Mass Storage    ",
            product_rev: *b"0.1 ",
            serial_number: "",
            removable: true,
            bulk_in_ep: 1,
            bulk_out_ep: 2,
            packet_size: 64,
            high_speed_capable: false,
        }
    }
}

impl MscConfig {
    fn identification(&self) -> Identification<'_> {
        Identification {
            vendor_id: &self.vendor_id,
            product_id: &self.product_id,
            product_rev: &self.product_rev,
            serial_number: self.serial_number,
        }
    }
}

/// Whether `serial` can be reported as a unit serial number: printable
/// ASCII, at most 20 characters
pub fn serial_number_is_valid(serial: &str) -> bool {
    serial.len() <= MAX_SERIAL_LEN && serial.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// What a bulk data request carries
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DataKind {
    /// Command response built in the response buffer
    Response,
    /// Sense data, consumed once sent
    Sense,
    /// Block data of a READ, WRITE or VERIFY
    Stream,
}

/// Mass Storage Bulk-Only SCSI function
pub struct Msc<D: BlockDevice> {
    config: MscConfig,
    block: D,
    number: u8,
    enabled: bool,

    cbw_req: Option<RequestId>,
    cbw_buf: Option<Buffer>,
    resp_buf: Option<Buffer>,
    desc_buf: Option<Buffer>,
    desc_lent: bool,
    free_bufs: Vec<Buffer, MAX_DATA_BUFFERS>,
    nr_bufs: usize,
    data_reqs: Vec<(RequestId, DataKind), MAX_DATA_REQUESTS>,
    breq: Option<BlockRequestId>,

    cbw: CommandBlockWrapper,
    csw: CommandStatusWrapper,
    sense: SenseData,
    stream: Option<Stream>,

    xfer_in_progress: bool,
    not_ready: bool,
    busy_asc: u16,
    busy_cb: Option<fn()>,
}

fn split_off(rest: &mut &'static mut [u8], len: usize) -> &'static mut [u8] {
    let (head, tail) = core::mem::take(rest).split_at_mut(len);
    *rest = tail;
    head
}

impl<D: BlockDevice> Msc<D> {
    /// Creates a function on top of `block`, carving its buffers out of `mem`.
    ///
    /// # Errors
    /// * [MscError::BufferTooSmall] - if `mem` is shorter than [MIN_MEM_LEN],
    ///   or the block size of `block` does not divide [DATA_BUFFER_SIZE]
    pub fn new(config: MscConfig, block: D, mem: &'static mut [u8]) -> Result<Self, MscError> {
        let block_size = block.block_size();
        if mem.len() < MIN_MEM_LEN || block_size == 0 || DATA_BUFFER_SIZE % block_size != 0 {
            return Err(MscError::BufferTooSmall);
        }
        if !serial_number_is_valid(config.serial_number) {
            warn!("usb: scsi: Serial number is not reportable");
        }

        let mut rest = mem;
        let cbw_buf = Buffer::new(split_off(&mut rest, CBW_BUFFER_LEN));
        let resp_buf = Buffer::new(split_off(&mut rest, RESPONSE_BUFFER_LEN));
        let desc_buf = Buffer::new(split_off(&mut rest, DESC_BUFFER_LEN));
        let mut free_bufs = Vec::new();
        while rest.len() >= DATA_BUFFER_SIZE && !free_bufs.is_full() {
            let _ = free_bufs.push(Buffer::new(split_off(&mut rest, DATA_BUFFER_SIZE)));
        }
        let nr_bufs = free_bufs.len();
        debug!("usb: scsi: {} data buffers", nr_bufs);

        Ok(Msc {
            config,
            block,
            number: 0,
            enabled: false,
            cbw_req: None,
            cbw_buf: Some(cbw_buf),
            resp_buf: Some(resp_buf),
            desc_buf: Some(desc_buf),
            desc_lent: false,
            free_bufs,
            nr_bufs,
            data_reqs: Vec::new(),
            breq: None,
            cbw: Default::default(),
            csw: Default::default(),
            sense: SenseData::no_sense(),
            stream: None,
            xfer_in_progress: false,
            not_ready: false,
            busy_asc: asc::LOGICAL_UNIT_BECOMING_READY,
            busy_cb: None,
        })
    }

    pub fn block(&self) -> &D {
        &self.block
    }

    pub fn block_mut(&mut self) -> &mut D {
        &mut self.block
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Reports the unit as not ready with additional sense `asc` until
    /// [Msc::set_ready]. `on_drained` runs once no block transfer is in
    /// progress, right away if none is.
    pub fn set_busy(&mut self, asc: u16, on_drained: fn()) {
        info!("usb: scsi: Busy, asc {:04x}", asc);
        self.not_ready = true;
        self.busy_asc = asc;
        if self.xfer_in_progress {
            self.busy_cb = Some(on_drained);
        } else {
            self.busy_cb = None;
            on_drained();
        }
    }

    pub fn set_ready(&mut self) {
        info!("usb: scsi: Ready");
        self.not_ready = false;
        self.busy_cb = None;
    }

    fn bulk_in(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.config.bulk_in_ep as usize, UsbDirection::In)
    }

    fn bulk_out(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.config.bulk_out_ep as usize, UsbDirection::Out)
    }

    fn packet_size(&self, speed: UsbSpeed) -> u16 {
        match speed {
            UsbSpeed::High => HIGH_SPEED_PACKET_SIZE,
            _ => self.config.packet_size,
        }
    }

    /* Lifecycle */

    fn start<B: UsbBus>(&mut self, udc: &mut Udc<B>) -> Result<(), MscError> {
        let packet_size = self.packet_size(udc.speed());
        let bulk_in = udc.create_bulk_endpoint(self.bulk_in(), packet_size)?;
        let bulk_out = match udc.create_bulk_endpoint(self.bulk_out(), packet_size) {
            Ok(addr) => addr,
            Err(err) => {
                let _ = udc.destroy_endpoint(bulk_in);
                return Err(err.into());
            }
        };
        match self.block.alloc_request() {
            Ok(id) => self.breq = Some(id),
            Err(err) => {
                let _ = udc.destroy_endpoint(bulk_out);
                let _ = udc.destroy_endpoint(bulk_in);
                return Err(err.into());
            }
        }

        self.enabled = true;
        self.drain_block_events(udc);
        self.sense = SenseData::no_sense();
        self.queue_empty();
        if let Err(err) = self.arm_cbw(udc) {
            self.stop(udc);
            return Err(err);
        }
        Ok(())
    }

    fn stop<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        self.cancel(udc);
        let _ = udc.destroy_endpoint(self.bulk_out());
        let _ = udc.destroy_endpoint(self.bulk_in());
        if let Some(breq) = self.breq.take() {
            self.block.free_request(breq);
        }
        self.drain_block_events(udc);
        self.enabled = false;
    }

    /// Drops every transfer in flight and takes all buffers back
    fn cancel<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        let _ = udc.flush(self.bulk_in());
        let _ = udc.flush(self.bulk_out());

        while let Some((id, kind)) = self.data_reqs.pop() {
            if let Some(mut req) = udc.free_request(id) {
                self.reclaim(kind, req.take_buffers());
            }
        }
        if let Some(id) = self.cbw_req.take() {
            if let Some(mut req) = udc.free_request(id) {
                self.cbw_buf = req.pop_buffer();
            }
        }

        if let Some(stream) = self.stream.take() {
            self.release_bufs(stream.into_held());
        }
        if let Some(breq) = self.breq {
            self.block.abort_req(breq);
        }
        self.drain_block_events(udc);
        self.queue_empty();
    }

    fn reclaim(&mut self, kind: DataKind, bufs: BufList) {
        match kind {
            DataKind::Response | DataKind::Sense => {
                if let Some(buf) = bufs.into_iter().next() {
                    self.resp_buf = Some(buf);
                }
            }
            DataKind::Stream => self.release_bufs(bufs),
        }
    }

    fn release_bufs(&mut self, bufs: BufList) {
        for buf in bufs {
            let _ = self.free_bufs.push(buf);
        }
    }

    fn drain_block_events<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        while let Some(event) = self.block.take_event() {
            self.block_event(udc, event);
        }
    }

    fn block_event<B: UsbBus>(&mut self, udc: &mut Udc<B>, event: BlockEvent) {
        match event {
            BlockEvent::Started(id) => {
                if self.is_streaming(id) {
                    self.refill(udc);
                }
            }
            BlockEvent::BufListDone(id, bufs) => self.block_bufs_done(udc, id, bufs),
            BlockEvent::Done(id) => self.block_done(udc, id),
        }
    }

    /// Nothing is left to transfer
    fn queue_empty(&mut self) {
        self.xfer_in_progress = false;
        if self.not_ready {
            if let Some(on_drained) = self.busy_cb.take() {
                on_drained();
            }
        }
    }

    fn bulk_reset<B: UsbBus>(&mut self, udc: &mut Udc<B>) -> Result<(), UdmError> {
        info!("usb: bbb: Bulk-Only Mass Storage Reset");
        if !self.enabled {
            return Err(UdmError::Rejected);
        }
        self.cancel(udc);
        let _ = udc.clear_wedge(self.bulk_in());
        let _ = udc.clear_wedge(self.bulk_out());
        self.arm_cbw(udc)?;
        Ok(())
    }

    /* CBW and CSW */

    /// Queues the command request for the next CBW
    fn arm_cbw<B: UsbBus>(&mut self, udc: &mut Udc<B>) -> Result<(), MscError> {
        let id = match self.cbw_req {
            Some(id) => id,
            None => {
                let id = udc.alloc_request(Owner::Interface(self.number))?;
                if let Some(req) = udc.request_mut(id) {
                    if let Some(buf) = self.cbw_buf.take() {
                        if let Err(buf) = req.add_buffer(buf) {
                            self.cbw_buf = Some(buf);
                        }
                    }
                }
                self.cbw_req = Some(id);
                id
            }
        };

        let buf = udc
            .request_mut(id)
            .and_then(Request::first_buffer_mut)
            .ok_or(MscError::BufferTooSmall)?;
        buf.set_len(CBW_LEN);
        udc.submit_out(self.bulk_out(), id)?;
        Ok(())
    }

    fn cbw_received<B: UsbBus>(&mut self, udc: &mut Udc<B>, completion: Completion) {
        if !completion.status.is_ok() {
            return;
        }
        let parsed = match udc.request(completion.req) {
            Some(req) if req.bytes_xfered == CBW_LEN => match req.first_buffer() {
                Some(buf) => CommandBlockWrapper::from_le_bytes(buf.as_slice()),
                None => Err(InvalidCbwError),
            },
            _ => Err(InvalidCbwError),
        };

        match parsed {
            Ok(cbw) => {
                trace!("usb: bbb: Recv CBW: {}", cbw);
                self.cbw = cbw;
                self.execute(udc);
            }
            Err(_) => {
                // stays wedged until a Bulk-Only Mass Storage Reset
                info!("usb: bbb: Invalid CBW");
                let _ = udc.set_wedge(self.bulk_in());
                let _ = udc.set_wedge(self.bulk_out());
            }
        }
    }

    fn csw_sent<B: UsbBus>(&mut self, udc: &mut Udc<B>, completion: Completion) {
        self.queue_empty();
        if !completion.status.is_ok() {
            return;
        }
        if let Err(err) = self.arm_cbw(udc) {
            error!("usb: bbb: Can't queue CBW request: {}", err);
        }
    }

    fn prepare_csw(&mut self, residue: u32, status: CommandStatus) {
        self.csw = CommandStatusWrapper {
            tag: self.cbw.tag,
            data_residue: residue,
            status,
        };
    }

    /// Ends the data stage and sends the prepared CSW
    fn finish_command<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        if self.csw.data_residue != 0 {
            let ep = match self.cbw.direction {
                DataDirection::In => self.bulk_in(),
                _ => self.bulk_out(),
            };
            let _ = udc.set_halt(ep);
        }

        let Some(id) = self.cbw_req else {
            error!("usb: bbb: No request for CSW");
            return;
        };
        let csw = self.csw.to_le_bytes();
        if let Some(buf) = udc.request_mut(id).and_then(Request::first_buffer_mut) {
            buf.set_len(CSW_LEN);
            buf.as_mut_slice().copy_from_slice(&csw);
        }
        debug!("usb: bbb: Send CSW: {}", self.csw);
        if let Err(err) = udc.submit_in(self.bulk_in(), id) {
            error!("usb: bbb: Can't send CSW: {}", err);
        }
    }

    fn request_failed<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        residue: u32,
        key: SenseKey,
        asc: u16,
    ) {
        warn!(
            "usb: scsi: Command {:02x} failed: {}, asc {:04x}",
            self.cbw.block[0],
            key,
            asc
        );
        self.sense = SenseData::new(key, asc, 0);
        self.prepare_csw(residue, CommandStatus::Failed);
        self.finish_command(udc);
    }

    fn phase_error<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        error!("usb: bbb: Phase error, command {:02x}", self.cbw.block[0]);
        self.prepare_csw(self.cbw.data_transfer_len, CommandStatus::PhaseError);
        self.finish_command(udc);
    }

    fn out_of_memory<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        error!("usb: scsi: Out of transfer memory");
        self.phase_error(udc);
    }

    /// Matches the host's expectation against what the command moves.
    /// Ends the command with a phase error on mismatch
    fn check_data_stage<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        needed: u32,
        direction: DataDirection,
    ) -> Option<u32> {
        let residue = self.cbw.residue(needed, direction);
        if residue.is_none() {
            self.phase_error(udc);
        }
        residue
    }

    /* Data requests */

    /// Queues `bufs` on `ep` in a request of their own. Hands the buffers
    /// back if that fails
    fn submit_data<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ep: EndpointAddress,
        kind: DataKind,
        bufs: BufList,
    ) -> Result<(), BufList> {
        if self.data_reqs.is_full() {
            return Err(bufs);
        }
        let Ok(id) = udc.alloc_request(Owner::Interface(self.number)) else {
            return Err(bufs);
        };
        let Some(req) = udc.request_mut(id) else {
            let _ = udc.free_request(id);
            return Err(bufs);
        };
        for buf in bufs {
            if let Err(buf) = req.add_buffer(buf) {
                let _ = self.free_bufs.push(buf);
            }
        }

        let res = if ep.is_in() {
            udc.submit_in(ep, id)
        } else {
            udc.submit_out(ep, id)
        };
        match res {
            Ok(()) => {
                let _ = self.data_reqs.push((id, kind));
                Ok(())
            }
            Err(err) => {
                warn!("usb: bbb: Can't queue data on ep {}: {}", ep, err);
                Err(udc
                    .free_request(id)
                    .map(|mut req| req.take_buffers())
                    .unwrap_or_default())
            }
        }
    }

    fn take_response_buf<B: UsbBus>(&mut self, udc: &mut Udc<B>) -> Option<Buffer> {
        match self.resp_buf.take() {
            Some(mut buf) => {
                buf.set_len(buf.capacity());
                Some(buf)
            }
            None => {
                self.out_of_memory(udc);
                None
            }
        }
    }

    /// Sends the first `len` bytes of `buf`, cut to the allocation length,
    /// and passes once they are out
    fn send_response<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        residue: u32,
        alloc_len: u32,
        kind: DataKind,
        mut buf: Buffer,
        len: usize,
    ) {
        let len = len.min(alloc_len as usize);
        self.prepare_csw(residue + (alloc_len - len as u32), CommandStatus::Passed);
        if len == 0 {
            self.resp_buf = Some(buf);
            self.finish_command(udc);
            return;
        }

        buf.set_len(len);
        let mut bufs = BufList::new();
        let _ = bufs.push(buf);
        if let Err(bufs) = self.submit_data(udc, self.bulk_in(), kind, bufs) {
            self.reclaim(DataKind::Response, bufs);
            self.out_of_memory(udc);
        }
    }

    /* Commands */

    fn execute<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        if self.cbw.lun != 0 {
            self.request_failed(
                udc,
                self.cbw.data_transfer_len,
                SenseKey::IllegalRequest,
                asc::LOGICAL_UNIT_NOT_SUPPORTED,
            );
            return;
        }

        let command = ScsiCommand::parse(&self.cbw.block);
        debug!("usb: scsi: Command: {}", command);
        match command {
            ScsiCommand::TestUnitReady => self.test_unit_ready(udc),
            ScsiCommand::RequestSense { alloc_len, .. } => self.request_sense(udc, alloc_len),
            ScsiCommand::Inquiry {
                evpd,
                page_code,
                alloc_len,
            } => self.inquiry(udc, evpd, page_code, alloc_len),
            ScsiCommand::ModeSense6 {
                dbd,
                page_control,
                page_code,
                alloc_len,
                ..
            } => self.mode_sense(udc, false, dbd, page_control, page_code, alloc_len as u32),
            ScsiCommand::ModeSense10 {
                dbd,
                page_control,
                page_code,
                alloc_len,
                ..
            } => self.mode_sense(udc, true, dbd, page_control, page_code, alloc_len as u32),
            ScsiCommand::ReadCapacity10 => self.read_capacity(udc),
            ScsiCommand::Read { lba, len } => self.transfer(udc, StreamOp::Read, lba, len, false),
            ScsiCommand::Write { lba, len } => {
                self.transfer(udc, StreamOp::Write, lba, len, false)
            }
            ScsiCommand::Verify { lba, len, bytchk } => {
                self.transfer(udc, StreamOp::Verify, lba, len, bytchk)
            }
            ScsiCommand::Unknown { opcode } => {
                debug!("usb: scsi: Unsupported opcode {:02x}", opcode);
                self.request_failed(
                    udc,
                    self.cbw.data_transfer_len,
                    SenseKey::IllegalRequest,
                    asc::INVALID_COMMAND_OPERATION_CODE,
                );
            }
        }
    }

    fn test_unit_ready<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        let residue = self.cbw.data_transfer_len;
        if self.not_ready {
            self.request_failed(udc, residue, SenseKey::NotReady, self.busy_asc);
            return;
        }
        if self.unit_attention(udc, residue) {
            return;
        }
        if self.block.flags().present {
            self.prepare_csw(residue, CommandStatus::Passed);
            self.finish_command(udc);
        } else {
            self.request_failed(udc, residue, SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT);
        }
    }

    /// Fails the command once after the medium changed
    fn unit_attention<B: UsbBus>(&mut self, udc: &mut Udc<B>, residue: u32) -> bool {
        if !self.block.flags().unit_attention {
            return false;
        }
        debug!("usb: scsi: Medium changed");
        self.block.clear_unit_attention();
        self.request_failed(
            udc,
            residue,
            SenseKey::UnitAttention,
            asc::NOT_READY_TO_READY_CHANGE,
        );
        true
    }

    fn request_sense<B: UsbBus>(&mut self, udc: &mut Udc<B>, alloc_len: u8) {
        let alloc_len = alloc_len as u32;
        let Some(residue) = self.check_data_stage(udc, alloc_len, DataDirection::In) else {
            return;
        };
        trace!("usb: scsi: Sense: {}", self.sense);
        if alloc_len == 0 {
            self.sense = SenseData::no_sense();
            self.prepare_csw(residue, CommandStatus::Passed);
            self.finish_command(udc);
            return;
        }

        let sense = self.sense.to_bytes();
        let Some(mut buf) = self.take_response_buf(udc) else {
            return;
        };
        buf.as_mut_slice()[..SENSE_DATA_LEN].copy_from_slice(&sense);
        self.send_response(udc, residue, alloc_len, DataKind::Sense, buf, SENSE_DATA_LEN);
    }

    fn inquiry<B: UsbBus>(&mut self, udc: &mut Udc<B>, evpd: bool, page_code: u8, alloc_len: u16) {
        let alloc_len = alloc_len as u32;
        let Some(residue) = self.check_data_stage(udc, alloc_len, DataDirection::In) else {
            return;
        };
        if !evpd && page_code != 0 {
            self.request_failed(
                udc,
                self.cbw.data_transfer_len,
                SenseKey::IllegalRequest,
                asc::INVALID_FIELD_IN_CDB,
            );
            return;
        }

        let Some(mut buf) = self.take_response_buf(udc) else {
            return;
        };
        let id = self.config.identification();
        let len = if evpd {
            scsi::vpd_page(page_code, &id, buf.as_mut_slice())
        } else {
            Some(scsi::inquiry_data(&id, self.config.removable, buf.as_mut_slice()))
        };

        match len {
            Some(len) => self.send_response(udc, residue, alloc_len, DataKind::Response, buf, len),
            None => {
                self.resp_buf = Some(buf);
                self.request_failed(
                    udc,
                    self.cbw.data_transfer_len,
                    SenseKey::IllegalRequest,
                    asc::INVALID_FIELD_IN_CDB,
                );
            }
        }
    }

    fn mode_sense<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ten: bool,
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        alloc_len: u32,
    ) {
        let Some(residue) = self.check_data_stage(udc, alloc_len, DataDirection::In) else {
            return;
        };
        // only the header and block descriptor are reported, nothing is changeable
        if page_control == PageControl::ChangeableValues
            || (page_code != 0 && page_code != MODE_PAGE_ALL)
        {
            self.request_failed(
                udc,
                self.cbw.data_transfer_len,
                SenseKey::IllegalRequest,
                asc::INVALID_FIELD_IN_CDB,
            );
            return;
        }

        let params = ModeParameters {
            write_protect: !self.block.flags().writeable,
            block_descriptor: !dbd,
            nr_blocks: self.block.nr_blocks(),
            block_len: self.block.block_size() as u32,
        };
        let Some(mut buf) = self.take_response_buf(udc) else {
            return;
        };
        let len = scsi::mode_parameters(ten, &params, buf.as_mut_slice());
        self.send_response(udc, residue, alloc_len, DataKind::Response, buf, len);
    }

    fn read_capacity<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        let needed = READ_CAPACITY_10_LEN as u32;
        let Some(residue) = self.check_data_stage(udc, needed, DataDirection::In) else {
            return;
        };
        if !self.block.flags().present {
            self.request_failed(
                udc,
                self.cbw.data_transfer_len,
                SenseKey::NotReady,
                asc::MEDIUM_NOT_PRESENT,
            );
            return;
        }

        let Some(mut buf) = self.take_response_buf(udc) else {
            return;
        };
        let len = scsi::read_capacity_10(
            self.block.nr_blocks(),
            self.block.block_size() as u32,
            buf.as_mut_slice(),
        );
        self.send_response(udc, residue, needed, DataKind::Response, buf, len);
    }
}

impl<B: UsbBus, D: BlockDevice> Interface<B> for Msc<D> {
    fn reserve_endpoints(&mut self, udc: &mut Udc<B>) -> Result<(), UdmError> {
        let packet_size = if self.config.high_speed_capable {
            HIGH_SPEED_PACKET_SIZE
        } else {
            self.config.packet_size
        };
        udc.reserve_endpoint(self.bulk_in(), EpKind::Bulk, packet_size, 0)?;
        udc.reserve_endpoint(self.bulk_out(), EpKind::Bulk, packet_size, 0)?;
        Ok(())
    }

    fn enable(&mut self, udc: &mut Udc<B>, number: u8, setting: u8) -> Result<(), UdmError> {
        if setting != 0 {
            return Err(UdmError::InvalidInterface);
        }
        if self.enabled {
            self.stop(udc);
        }
        self.number = number;
        match self.start(udc) {
            Ok(()) => {
                info!("usb: bbb: Enabled interface {}", number);
                Ok(())
            }
            Err(err) => {
                error!("usb: bbb: Enable failed: {}", err);
                Err(err.into())
            }
        }
    }

    fn disable(&mut self, udc: &mut Udc<B>) {
        if !self.enabled {
            return;
        }
        self.stop(udc);
        info!("usb: bbb: Disabled interface {}", self.number);
    }

    fn setup(&mut self, udc: &mut Udc<B>, setup: &SetupPacket) -> Result<(), UdmError> {
        if setup.kind() != RequestType::Class {
            return Err(UdmError::Rejected);
        }

        match setup.request {
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET => {
                if setup.value != 0 || setup.length != 0 || setup.is_in() {
                    return Err(UdmError::Rejected);
                }
                self.bulk_reset(udc)?;
                udc.ep0_send_status();
                Ok(())
            }
            CLASS_SPECIFIC_GET_MAX_LUN => {
                if setup.value != 0 || setup.length != 1 || !setup.is_in() {
                    return Err(UdmError::Rejected);
                }
                udc.ep0_write_sync(&[0])?;
                udc.ep0_expect_status();
                Ok(())
            }
            _ => Err(UdmError::Rejected),
        }
    }

    fn get_iface_descriptor(
        &mut self,
        number: u8,
        speed: UsbSpeed,
        max_len: usize,
        req: &mut Request,
    ) -> usize {
        if max_len == 0 {
            return MSC_DESC_LEN;
        }
        let Some(mut buf) = self.desc_buf.take() else {
            return MSC_DESC_LEN;
        };

        let packet_size = self.packet_size(speed);
        buf.set_len(buf.capacity());
        let out = buf.as_mut_slice();
        descriptor::interface(
            number,
            0,
            2,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            TRANSPORT_BBB,
            out,
        );
        let out = &mut out[INTERFACE_DESC_LEN..];
        descriptor::endpoint(self.config.bulk_in_ep | EP_DIR_IN, EP_ATTR_BULK, packet_size, 0, out);
        let out = &mut out[ENDPOINT_DESC_LEN..];
        descriptor::endpoint(self.config.bulk_out_ep, EP_ATTR_BULK, packet_size, 0, out);
        buf.set_len(MSC_DESC_LEN.min(max_len));

        match req.add_buffer(buf) {
            Ok(()) => self.desc_lent = true,
            Err(buf) => self.desc_buf = Some(buf),
        }
        MSC_DESC_LEN
    }

    fn free_descriptor(&mut self, req: &mut Request) {
        if self.desc_lent {
            self.desc_buf = req.pop_buffer();
            self.desc_lent = false;
        }
    }

    fn complete(&mut self, udc: &mut Udc<B>, completion: Completion) {
        if Some(completion.req) == self.cbw_req {
            if completion.ep.is_out() {
                self.cbw_received(udc, completion);
            } else {
                self.csw_sent(udc, completion);
            }
            return;
        }

        let Some(pos) = self
            .data_reqs
            .iter()
            .position(|(id, _)| *id == completion.req)
        else {
            warn!("usb: bbb: Stray completion on ep {}", completion.ep);
            return;
        };
        let (id, kind) = self.data_reqs.swap_remove(pos);
        let Some(mut req) = udc.free_request(id) else {
            return;
        };
        let bufs = req.take_buffers();

        match kind {
            DataKind::Stream => self.stream_data_done(udc, completion, bufs),
            DataKind::Response | DataKind::Sense => {
                self.reclaim(kind, bufs);
                if kind == DataKind::Sense {
                    self.sense = SenseData::no_sense();
                }
                if completion.status.is_ok() {
                    self.finish_command(udc);
                }
            }
        }
    }

    fn poll(&mut self, udc: &mut Udc<B>) {
        if !self.enabled {
            return;
        }
        self.block.poll();
        self.drain_block_events(udc);
    }
}
