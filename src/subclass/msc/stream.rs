//! READ, WRITE and VERIFY data streams
//!
//! Data buffers circulate between the block device and the bulk endpoints.
//! A READ hands free buffers to the device and sends each batch it fills; a
//! WRITE receives into free buffers and hands each batch to the device. At
//! most [MAX_NR_SEGS] batches are in flight on either side, and the CSW goes
//! out only after the device reported the end of the operation and no bulk
//! transfer is pending.

use super::{DataKind, Msc, DATA_BUFFER_SIZE};
use crate::block::{BlockAddr, BlockDevice, BlockLen, BlockOp, BlockRequestId, BlockStatus};
use crate::buffer::{buf_list_len, BufList};
use crate::fmt::{debug, warn};
use crate::subclass::sense::{asc, SenseData, SenseKey};
use crate::transport::{CommandStatus, DataDirection};
use crate::udc::request::Completion;
use crate::udc::Udc;
use usb_device::bus::UsbBus;

/// Batches in flight per side
pub(super) const MAX_NR_SEGS: usize = 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(super) enum StreamOp {
    Read,
    Write,
    Verify,
}

pub(super) struct Stream {
    op: StreamOp,
    lba: BlockAddr,
    total: BlockLen,
    /// Blocks handed out, to the device (read) or to the bulk OUT endpoint (write)
    queued: BlockLen,
    /// Blocks the device holds buffers for
    blk_pending: BlockLen,
    /// Bulk requests in flight
    usb_pending: usize,
    /// Bytes of read data passed on to the bulk IN side
    sent: usize,
    /// Read data waiting for a bulk IN request
    held: BufList,
    /// The device reported the end of the operation
    done: bool,
}

impl Stream {
    pub(super) fn into_held(self) -> BufList {
        self.held
    }
}

impl<D: BlockDevice> Msc<D> {
    fn bufs_per_seg(&self) -> usize {
        (self.nr_bufs / MAX_NR_SEGS).max(1)
    }

    fn blocks_per_buf(&self) -> BlockLen {
        (DATA_BUFFER_SIZE / self.block.block_size()) as BlockLen
    }

    fn seg_blocks(&self, bufs: &BufList) -> BlockLen {
        (buf_list_len(bufs) / self.block.block_size()) as BlockLen
    }

    /// Takes free buffers sized for up to `nr_blocks` blocks
    fn take_segment(&mut self, nr_blocks: BlockLen) -> BufList {
        let block_size = self.block.block_size();
        let blocks_per_buf = self.blocks_per_buf();
        let bufs_per_seg = self.bufs_per_seg();

        let mut remaining = nr_blocks;
        let mut seg = BufList::new();
        while remaining > 0 && seg.len() < bufs_per_seg {
            let Some(mut buf) = self.free_bufs.pop() else {
                break;
            };
            let n = remaining.min(blocks_per_buf);
            buf.set_len(n as usize * block_size);
            remaining -= n;
            if let Err(buf) = seg.push(buf) {
                let _ = self.free_bufs.push(buf);
                break;
            }
        }
        seg
    }

    pub(super) fn is_streaming(&self, id: BlockRequestId) -> bool {
        self.breq == Some(id) && self.stream.as_ref().map_or(false, |s| !s.done)
    }

    /// Starts a READ, WRITE or VERIFY of `nr_blocks` blocks at `lba`
    pub(super) fn transfer<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        op: StreamOp,
        lba: BlockAddr,
        nr_blocks: BlockLen,
        bytchk: bool,
    ) {
        let block_size = self.block.block_size() as u32;
        let (needed, direction) = match op {
            StreamOp::Read => (nr_blocks.checked_mul(block_size), DataDirection::In),
            StreamOp::Write => (nr_blocks.checked_mul(block_size), DataDirection::Out),
            StreamOp::Verify if bytchk => (nr_blocks.checked_mul(block_size), DataDirection::Out),
            StreamOp::Verify => (Some(0), DataDirection::NotExpected),
        };
        let Some(needed) = needed else {
            self.phase_error(udc);
            return;
        };
        let Some(residue) = self.check_data_stage(udc, needed, direction) else {
            return;
        };

        let cbw_len = self.cbw.data_transfer_len;
        if self.not_ready {
            self.request_failed(udc, cbw_len, SenseKey::NotReady, self.busy_asc);
            return;
        }
        if self.unit_attention(udc, cbw_len) {
            return;
        }
        let flags = self.block.flags();
        if !flags.present {
            self.request_failed(udc, cbw_len, SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT);
            return;
        }

        self.xfer_in_progress = true;
        self.prepare_csw(residue, CommandStatus::Passed);
        if nr_blocks == 0 {
            self.finish_command(udc);
            return;
        }
        if bytchk {
            self.request_failed(udc, cbw_len, SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
            return;
        }
        if lba
            .checked_add(nr_blocks)
            .map_or(true, |end| end > self.block.nr_blocks())
        {
            self.request_failed(udc, cbw_len, SenseKey::IllegalRequest, asc::LBA_OUT_OF_RANGE);
            return;
        }
        if op == StreamOp::Write && !flags.writeable {
            self.request_failed(udc, cbw_len, SenseKey::DataProtect, asc::WRITE_PROTECTED);
            return;
        }

        let Some(breq) = self.breq else {
            self.out_of_memory(udc);
            return;
        };
        let block_op = match op {
            StreamOp::Write => BlockOp::Write,
            StreamOp::Read | StreamOp::Verify => BlockOp::Read,
        };
        if let Err(err) = self.block.queue_req(breq, lba, nr_blocks, block_op) {
            warn!("usb: scsi: Can't queue block request: {}", err);
            self.out_of_memory(udc);
            return;
        }

        debug!("usb: scsi: {} {} blocks at {}", op, nr_blocks, lba);
        self.stream = Some(Stream {
            op,
            lba,
            total: nr_blocks,
            queued: 0,
            blk_pending: 0,
            usb_pending: 0,
            sent: 0,
            held: BufList::new(),
            done: false,
        });
        self.refill(udc);

        if self.stream.as_ref().map_or(false, |s| s.queued == 0) {
            warn!("usb: scsi: No buffers for {}", op);
            self.block.abort_req(breq);
            self.stream_phase_error();
            self.drain_block_events(udc);
        }
    }

    /// The stream can't go on. Its CSW reports a phase error once it drains
    fn stream_phase_error(&mut self) {
        self.csw.status = CommandStatus::PhaseError;
        self.csw.data_residue = self.cbw.data_transfer_len;
    }

    /// Hands out as many free buffers as the stream can take
    pub(super) fn refill<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        match self.stream.as_ref().map(|s| s.op) {
            Some(StreamOp::Read) => {
                self.fill_block();
                self.send_held(udc);
            }
            Some(StreamOp::Verify) => self.fill_block(),
            Some(StreamOp::Write) => self.fill_usb(udc),
            None => {}
        }
    }

    /// Feeds empty buffers to the device for reading
    fn fill_block(&mut self) {
        let Some(breq) = self.breq else {
            return;
        };
        let window = (MAX_NR_SEGS * self.bufs_per_seg()) as BlockLen * self.blocks_per_buf();

        loop {
            let Some(s) = self.stream.as_ref() else {
                return;
            };
            if s.done || s.queued >= s.total || s.blk_pending >= window {
                return;
            }
            let remaining = s.total - s.queued;
            let seg = self.take_segment(remaining);
            if seg.is_empty() {
                return;
            }
            let nr_blocks = self.seg_blocks(&seg);
            match self.block.submit_buf_list(breq, seg) {
                Ok(()) => {
                    if let Some(s) = self.stream.as_mut() {
                        s.queued += nr_blocks;
                        s.blk_pending += nr_blocks;
                    }
                }
                Err((_, seg)) => {
                    self.release_bufs(seg);
                    return;
                }
            }
        }
    }

    /// Queues empty buffers on the bulk OUT endpoint for writing
    fn fill_usb<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        loop {
            let Some(s) = self.stream.as_ref() else {
                return;
            };
            if s.done || s.queued >= s.total || s.usb_pending >= MAX_NR_SEGS {
                return;
            }
            let nothing_in_flight = s.usb_pending == 0 && s.blk_pending == 0;
            let remaining = s.total - s.queued;
            let seg = self.take_segment(remaining);
            if seg.is_empty() {
                return;
            }
            let nr_blocks = self.seg_blocks(&seg);
            match self.submit_data(udc, self.bulk_out(), DataKind::Stream, seg) {
                Ok(()) => {
                    if let Some(s) = self.stream.as_mut() {
                        s.queued += nr_blocks;
                        s.usb_pending += 1;
                    }
                }
                Err(seg) => {
                    self.release_bufs(seg);
                    if nothing_in_flight {
                        self.abort_stream(udc);
                        self.stream_phase_error();
                    }
                    return;
                }
            }
        }
    }

    /// Sends the read data collected so far
    fn send_held<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        let Some(s) = self.stream.as_mut() else {
            return;
        };
        if s.held.is_empty() || s.usb_pending >= MAX_NR_SEGS {
            return;
        }
        let bufs = core::mem::take(&mut s.held);
        match self.submit_data(udc, self.bulk_in(), DataKind::Stream, bufs) {
            Ok(()) => {
                if let Some(s) = self.stream.as_mut() {
                    s.usb_pending += 1;
                }
            }
            Err(bufs) => {
                self.release_bufs(bufs);
                self.abort_stream(udc);
                self.stream_phase_error();
            }
        }
    }

    fn abort_stream<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        if let Some(breq) = self.breq {
            self.block.abort_req(breq);
            self.drain_block_events(udc);
        }
    }

    /// Keeps the read data of `bufs` that the device actually transferred
    fn hold_read_data(&mut self, id: BlockRequestId, bufs: BufList) {
        let limit = if self.block.status(id).is_failure() {
            self.block.blocks_xfered(id) as usize * self.block.block_size()
        } else {
            usize::MAX
        };

        let Some(s) = self.stream.as_mut() else {
            self.release_bufs(bufs);
            return;
        };
        for mut buf in bufs {
            let len = limit.saturating_sub(s.sent).min(buf.len());
            if len == 0 {
                let _ = self.free_bufs.push(buf);
                continue;
            }
            buf.set_len(len);
            s.sent += len;
            if let Err(buf) = s.held.push(buf) {
                let _ = self.free_bufs.push(buf);
            }
        }
    }

    pub(super) fn block_bufs_done<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        id: BlockRequestId,
        bufs: BufList,
    ) {
        if !self.is_streaming(id) {
            self.release_bufs(bufs);
            return;
        }
        let nr_blocks = self.seg_blocks(&bufs);
        let Some(s) = self.stream.as_mut() else {
            return;
        };
        s.blk_pending = s.blk_pending.saturating_sub(nr_blocks);
        let op = s.op;

        match op {
            StreamOp::Read => self.hold_read_data(id, bufs),
            StreamOp::Write | StreamOp::Verify => self.release_bufs(bufs),
        }
        self.refill(udc);
    }

    pub(super) fn block_done<B: UsbBus>(&mut self, udc: &mut Udc<B>, id: BlockRequestId) {
        if !self.is_streaming(id) {
            return;
        }
        let status = self.block.status(id);
        let xfered = self.block.blocks_xfered(id);
        let Some(s) = self.stream.as_mut() else {
            return;
        };
        s.done = true;
        let (op, lba, sent) = (s.op, s.lba, s.sent);

        if status.is_failure() && self.csw.status == CommandStatus::Passed {
            warn!(
                "usb: scsi: {} failed after {} blocks: {}",
                op,
                xfered,
                status
            );
            let cbw_len = self.cbw.data_transfer_len;
            let block_size = self.block.block_size() as u32;
            let info = lba.wrapping_add(xfered);
            self.csw.status = CommandStatus::Failed;
            match op {
                StreamOp::Read => {
                    self.sense =
                        SenseData::new(SenseKey::MediumError, asc::UNRECOVERED_READ_ERROR, info);
                    self.csw.data_residue = cbw_len.saturating_sub(sent as u32);
                }
                StreamOp::Write => {
                    self.sense = SenseData::new(SenseKey::MediumError, asc::WRITE_ERROR, info);
                    self.csw.data_residue =
                        cbw_len.saturating_sub(block_size.saturating_mul(xfered));
                    // the host stops sending, data already queued goes nowhere
                    let _ = udc.set_halt(self.bulk_out());
                    let _ = udc.flush(self.bulk_out());
                }
                StreamOp::Verify => {
                    self.sense =
                        SenseData::new(SenseKey::MediumError, asc::UNRECOVERED_READ_ERROR, info);
                }
            }
        } else if status == BlockStatus::Done {
            debug!("usb: scsi: {} of {} blocks done", op, xfered);
        }

        self.maybe_finish(udc);
    }

    /// A bulk request of the stream completed
    pub(super) fn stream_data_done<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        completion: Completion,
        bufs: BufList,
    ) {
        let nr_blocks = self.seg_blocks(&bufs);
        let Some(s) = self.stream.as_mut() else {
            self.release_bufs(bufs);
            return;
        };
        s.usb_pending = s.usb_pending.saturating_sub(1);
        let op = s.op;

        if !completion.status.is_ok() {
            warn!("usb: bbb: Data stage ended with {}", completion.status);
            self.release_bufs(bufs);
            self.abort_stream(udc);
        } else if op == StreamOp::Write {
            match self.breq {
                Some(breq) if self.is_streaming(breq) => {
                    match self.block.submit_buf_list(breq, bufs) {
                        Ok(()) => {
                            if let Some(s) = self.stream.as_mut() {
                                s.blk_pending += nr_blocks;
                            }
                        }
                        Err((_, bufs)) => self.release_bufs(bufs),
                    }
                }
                _ => self.release_bufs(bufs),
            }
        } else {
            self.release_bufs(bufs);
        }

        self.refill(udc);
        self.maybe_finish(udc);
    }

    /// Sends the CSW once the device and both bulk sides are done
    fn maybe_finish<B: UsbBus>(&mut self, udc: &mut Udc<B>) {
        let Some(s) = self.stream.as_ref() else {
            return;
        };
        if !s.done || s.usb_pending > 0 || !s.held.is_empty() {
            return;
        }
        self.stream = None;
        self.finish_command(udc);
    }
}
