//! DataFlash block device
//!
//! Exposes an AT45 chip as 512 byte logical blocks. The chip page may be
//! half, equal to or double the block size; the difference is kept as
//! `page_block_shift`.
//!
//! Every request walks the chip one page segment at a time:
//!
//! ```text
//! Idle -> Start -> SetupRead ------------------------------------> Transfer -> PageDone
//!               -> SetupWrite -> [WriteBuffered -> WriteBufferedWait]
//!                             -> WriteReady -> Transfer -> WriteDone -> WriteWait -> PageDone
//! PageDone -> SetupRead | SetupWrite while blocks remain, else Idle
//! ```
//!
//! A write that does not cover a whole page first copies the page into the
//! chip's buffer so the untouched part survives the program cycle.

use super::at45::{self, At45, PageAddr, Poll};
use super::{
    BlockAddr, BlockDevice, BlockError, BlockEvent, BlockLen, BlockOp, BlockRequestId,
    BlockStatus, DeviceFlags,
};
use crate::buffer::{BufList, Buffer, MAX_BUFS};
use crate::fmt::{debug, error, info, trace, warn};
use crate::pool::Pool;
use heapless::Deque;

/// Logical block size
pub const DATAFLASH_BLOCK_SIZE: usize = 512;

const NR_REQUESTS: usize = 2;
/// Buffers a request may hold that the device has not consumed yet
const MAX_PENDING_BUFS: usize = 16;
/// Events a request ends with: the buffers in use, the pending ones and `Done`
const END_EVENTS: usize = 2 + MAX_PENDING_BUFS.div_ceil(MAX_BUFS);
/// Most events one state machine step pushes
const STEP_EVENTS: usize = END_EVENTS + 1;
/// Room kept for requests ended by [BlockDevice::abort_req] or
/// [BlockDevice::submit_req] between two drains
const RESERVED_EVENTS: usize = END_EVENTS * NR_REQUESTS;
const NR_EVENTS: usize = 32;
/// State machine steps taken by one [DataFlash::poll]
const MAX_STEPS: usize = 64;

/// DataFlash state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Identifying the chip
    Detect,
    Idle,
    Start,
    SetupRead,
    SetupWrite,
    WriteBuffered,
    WriteBufferedWait,
    WriteReady,
    Transfer,
    PageDone,
    WriteDone,
    WriteWait,
}

struct DfRequest {
    lba: BlockAddr,
    nr_blocks: BlockLen,
    op: BlockOp,
    status: BlockStatus,
    submitted: bool,
    bytes_xfered: usize,
    pending: Deque<Buffer, MAX_PENDING_BUFS>,
}

impl DfRequest {
    fn new() -> Self {
        DfRequest {
            lba: 0,
            nr_blocks: 0,
            op: BlockOp::Read,
            status: BlockStatus::Idle,
            submitted: false,
            bytes_xfered: 0,
            pending: Deque::new(),
        }
    }

    fn total_bytes(&self) -> usize {
        self.nr_blocks as usize * DATAFLASH_BLOCK_SIZE
    }

    /// Flash byte address of the next byte to transfer
    fn addr(&self) -> usize {
        self.lba as usize * DATAFLASH_BLOCK_SIZE + self.bytes_xfered
    }
}

/// The part of one flash page the current request covers
#[derive(Copy, Clone, Default)]
struct Segment {
    page: u32,
    offset: usize,
    len: usize,
    /// bytes of the segment transferred so far
    pos: usize,
}

/// AT45 DataFlash exposed as a [BlockDevice]
pub struct DataFlash<A: At45> {
    at45: A,
    state: State,
    flags: DeviceFlags,
    nr_blocks: BlockLen,
    dev_id: u32,
    page_block_shift: i8,
    requests: Pool<DfRequest, NR_REQUESTS>,
    queue: Deque<BlockRequestId, NR_REQUESTS>,
    active: Option<BlockRequestId>,
    segment: Segment,
    current: BufList,
    events: Deque<BlockEvent, NR_EVENTS>,
}

enum Step {
    Continue,
    Yield,
}

impl<A: At45> DataFlash<A> {
    /// Creates the device. The chip is identified by the following [DataFlash::poll] calls
    pub fn new(at45: A) -> Self {
        DataFlash {
            at45,
            state: State::Detect,
            flags: DeviceFlags::default(),
            nr_blocks: 0,
            dev_id: 0,
            page_block_shift: 0,
            requests: Pool::new(),
            queue: Deque::new(),
            active: None,
            segment: Segment::default(),
            current: BufList::new(),
            events: Deque::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether identification finished, successfully or not
    pub fn is_detected(&self) -> bool {
        self.state != State::Detect
    }

    /// Page size relative to the block size: -1 half, 0 equal, 1 double
    pub fn page_block_shift(&self) -> i8 {
        self.page_block_shift
    }

    pub fn at45(&self) -> &A {
        &self.at45
    }

    pub fn at45_mut(&mut self) -> &mut A {
        &mut self.at45
    }

    fn page_size(&self) -> usize {
        if self.page_block_shift >= 0 {
            DATAFLASH_BLOCK_SIZE << self.page_block_shift
        } else {
            DATAFLASH_BLOCK_SIZE >> -self.page_block_shift
        }
    }

    fn store_page_size(&mut self, page_size: u16) -> bool {
        self.page_block_shift = match page_size {
            256 => -1,
            512 => 0,
            1024 => 1,
            _ => return false,
        };
        true
    }

    fn detect(&mut self) -> Step {
        let identity = match at45::identify(&mut self.at45) {
            Ok(Some(identity)) => identity,
            Ok(None) => return Step::Yield,
            Err(_) => {
                warn!("dataflash: Identification failed");
                self.state = State::Idle;
                return Step::Continue;
            }
        };

        if let Some(info) = identity.info {
            self.flags.writeable = !identity.protected;
            self.nr_blocks = info.size / DATAFLASH_BLOCK_SIZE as u32;
            self.dev_id = u32::from_be_bytes(identity.id);
            if self.store_page_size(info.page_size) {
                self.flags.present = true;
                self.flags.unit_attention = true;
                info!(
                    "dataflash: {} blocks, page shift {}, writeable: {}",
                    self.nr_blocks,
                    self.page_block_shift,
                    self.flags.writeable
                );
            } else {
                warn!("dataflash: Unsupported page size {}", info.page_size);
            }
        }
        self.state = State::Idle;
        Step::Continue
    }

    /// Computes the page segment starting at the request's next byte
    fn setup_segment(&mut self, id: BlockRequestId) {
        let page_size = self.page_size();
        let Some(req) = self.requests.get(id.index()) else {
            return;
        };
        let addr = req.addr();
        let offset = addr % page_size;
        self.segment = Segment {
            page: (addr / page_size) as u32,
            offset,
            len: (page_size - offset).min(req.total_bytes() - req.bytes_xfered),
            pos: 0,
        };
    }

    fn is_page_aligned(&self) -> bool {
        self.segment.offset == 0 && self.segment.len == self.page_size()
    }

    fn step(&mut self) -> Step {
        if self.state == State::Detect {
            return self.detect();
        }
        if self.state == State::Idle {
            return match self.queue.pop_front() {
                Some(id) => {
                    self.active = Some(id);
                    self.state = State::Start;
                    Step::Continue
                }
                None => Step::Yield,
            };
        }
        let Some(id) = self.active else {
            self.state = State::Idle;
            return Step::Continue;
        };
        let page_size = self.page_size() as u16;

        match self.state {
            State::Start => {
                // a program cycle of the previous request may still run
                match self.at45.wait_ready() {
                    Poll::NotReady => return Step::Yield,
                    Poll::Error => return self.fail(id, BlockStatus::IoError),
                    Poll::Ready => {}
                }
                let Some(req) = self.requests.get(id.index()) else {
                    self.active = None;
                    self.state = State::Idle;
                    return Step::Continue;
                };
                let (op, lba, nr_blocks) = (req.op, req.lba, req.nr_blocks);
                self.push_event(BlockEvent::Started(id));
                if nr_blocks == 0 {
                    return self.finish(id);
                }
                match op {
                    BlockOp::Read => {
                        debug!("dataflash: Reading {} blocks @ {:#x}", nr_blocks, lba);
                        self.state = State::SetupRead;
                    }
                    BlockOp::Write => {
                        debug!("dataflash: Writing {} blocks @ {:#x}", nr_blocks, lba);
                        self.state = State::SetupWrite;
                    }
                }
            }
            State::SetupRead => {
                self.setup_segment(id);
                self.state = State::Transfer;
            }
            State::SetupWrite => {
                self.setup_segment(id);
                if self.is_page_aligned() {
                    self.state = State::WriteReady;
                } else {
                    trace!("dataflash: Partial page {}, read back", self.segment.page);
                    if self.at45.page_to_buffer(self.segment.page, page_size).is_err() {
                        return self.fail(id, BlockStatus::IoError);
                    }
                    self.state = State::WriteBuffered;
                }
            }
            State::WriteBuffered => self.state = State::WriteBufferedWait,
            State::WriteBufferedWait => match self.at45.wait_ready() {
                Poll::NotReady => return Step::Yield,
                Poll::Ready => self.state = State::WriteReady,
                Poll::Error => return self.fail(id, BlockStatus::IoError),
            },
            State::WriteReady => self.state = State::Transfer,
            State::Transfer => return self.transfer(id, page_size),
            State::WriteDone => {
                if self.at45.program_buffer(self.segment.page, page_size).is_err() {
                    return self.fail(id, BlockStatus::IoError);
                }
                self.state = State::WriteWait;
            }
            State::WriteWait => match self.at45.wait_ready() {
                Poll::NotReady => return Step::Yield,
                Poll::Ready => self.state = State::PageDone,
                Poll::Error => return self.fail(id, BlockStatus::IoError),
            },
            State::PageDone => return self.page_done(id),
            State::Detect | State::Idle => {}
        }
        Step::Continue
    }

    /// Moves one buffer's worth of the segment between the chip and memory
    fn transfer(&mut self, id: BlockRequestId, page_size: u16) -> Step {
        let segment = self.segment;
        if segment.pos == segment.len {
            self.state = match self.requests.get(id.index()).map(|req| req.op) {
                Some(BlockOp::Write) => State::WriteDone,
                _ => State::PageDone,
            };
            return Step::Continue;
        }

        let Some(req) = self.requests.get_mut(id.index()) else {
            return self.fail(id, BlockStatus::IoError);
        };
        let op = req.op;
        let Some(buf) = req.pending.front_mut() else {
            // sleep until more buffers are submitted
            return Step::Yield;
        };

        let count = buf.remaining().min(segment.len - segment.pos);
        let pos = segment.offset + segment.pos;
        let at45 = &mut self.at45;
        let res = buf.advance(|window| {
            let window = &mut window[..count];
            match op {
                BlockOp::Read => at45.read(PageAddr::new(segment.page, pos as u16, page_size), window),
                BlockOp::Write => at45.write_buffer(pos as u16, window),
            }
            .map(|_| count)
        });
        if res.is_err() {
            error!("dataflash: Transfer failed on page {}", segment.page);
            return self.fail(id, BlockStatus::IoError);
        }
        self.segment.pos += count;

        if buf.is_done() {
            if let Some(done) = req.pending.pop_front() {
                if let Err(done) = self.current.push(done) {
                    // return what is finished so far to make room
                    let list = core::mem::take(&mut self.current);
                    self.push_event(BlockEvent::BufListDone(id, list));
                    let _ = self.current.push(done);
                }
            }
        }
        Step::Continue
    }

    fn page_done(&mut self, id: BlockRequestId) -> Step {
        if !self.current.is_empty() {
            let list = core::mem::take(&mut self.current);
            self.push_event(BlockEvent::BufListDone(id, list));
        }

        let Some(req) = self.requests.get_mut(id.index()) else {
            return self.fail(id, BlockStatus::IoError);
        };
        req.bytes_xfered += self.segment.len;
        if req.bytes_xfered < req.total_bytes() {
            self.state = match req.op {
                BlockOp::Read => State::SetupRead,
                BlockOp::Write => State::SetupWrite,
            };
            return Step::Continue;
        }
        trace!("dataflash: Request done");
        self.finish(id)
    }

    fn finish(&mut self, id: BlockRequestId) -> Step {
        self.end_request(id, BlockStatus::Done);
        Step::Continue
    }

    fn fail(&mut self, id: BlockRequestId, status: BlockStatus) -> Step {
        warn!("dataflash: Request failed: {}", status);
        self.end_request(id, status);
        Step::Continue
    }

    /// Hands back every buffer the request still holds and reports it done
    fn end_request(&mut self, id: BlockRequestId, status: BlockStatus) {
        if self.active == Some(id) {
            self.active = None;
            self.state = State::Idle;
            if !self.current.is_empty() {
                let list = core::mem::take(&mut self.current);
                self.push_event(BlockEvent::BufListDone(id, list));
            }
        }

        let Some(req) = self.requests.get_mut(id.index()) else {
            return;
        };
        req.status = status;
        req.submitted = false;
        let mut pending = core::mem::replace(&mut req.pending, Deque::new());
        let mut list = BufList::new();
        while let Some(buf) = pending.pop_front() {
            if let Err(buf) = list.push(buf) {
                self.push_event(BlockEvent::BufListDone(id, core::mem::take(&mut list)));
                let _ = list.push(buf);
            }
        }
        if !list.is_empty() {
            self.push_event(BlockEvent::BufListDone(id, list));
        }
        self.push_event(BlockEvent::Done(id));
    }

    /// Whether one more step cannot overrun the event queue
    fn has_event_room(&self) -> bool {
        self.events.capacity() - self.events.len() >= STEP_EVENTS + RESERVED_EVENTS
    }

    fn push_event(&mut self, event: BlockEvent) {
        if self.events.push_back(event).is_err() {
            error!("dataflash: Event queue full");
        }
    }
}

impl<A: At45> BlockDevice for DataFlash<A> {
    fn block_size(&self) -> usize {
        DATAFLASH_BLOCK_SIZE
    }

    fn nr_blocks(&self) -> BlockLen {
        self.nr_blocks
    }

    fn flags(&self) -> DeviceFlags {
        self.flags
    }

    fn dev_id(&self) -> u32 {
        self.dev_id
    }

    fn clear_unit_attention(&mut self) {
        self.flags.unit_attention = false;
    }

    fn alloc_request(&mut self) -> Result<BlockRequestId, BlockError> {
        self.requests
            .alloc(DfRequest::new())
            .map(|idx| BlockRequestId::new(idx as u8))
            .map_err(|_| BlockError::NoRequest)
    }

    fn free_request(&mut self, req: BlockRequestId) {
        if self.status(req) == BlockStatus::InProgress {
            self.abort_req(req);
        }
        self.requests.free(req.index());
    }

    fn prepare_req(
        &mut self,
        req: BlockRequestId,
        lba: BlockAddr,
        nr_blocks: BlockLen,
        op: BlockOp,
    ) -> Result<(), BlockError> {
        let device_blocks = self.nr_blocks;
        let r = self
            .requests
            .get_mut(req.index())
            .ok_or(BlockError::NoRequest)?;
        if r.submitted {
            return Err(BlockError::Busy);
        }
        if !self.flags.present {
            return Err(BlockError::NotPresent);
        }
        if lba.checked_add(nr_blocks).map_or(true, |end| end > device_blocks) {
            return Err(BlockError::OutOfRange);
        }
        r.lba = lba;
        r.nr_blocks = nr_blocks;
        r.op = op;
        r.bytes_xfered = 0;
        r.status = BlockStatus::InProgress;
        Ok(())
    }

    fn submit_req(&mut self, req: BlockRequestId) -> Result<(), BlockError> {
        let r = self
            .requests
            .get_mut(req.index())
            .ok_or(BlockError::NoRequest)?;
        if r.submitted {
            return Err(BlockError::Busy);
        }
        if r.status != BlockStatus::InProgress {
            return Err(BlockError::InvalidRequest);
        }
        if r.op == BlockOp::Write && !self.flags.writeable {
            warn!("dataflash: Write to protected device");
            self.end_request(req, BlockStatus::IoError);
            return Ok(());
        }
        r.submitted = true;
        self.queue.push_back(req).map_err(|_| BlockError::Busy)
    }

    fn submit_buf_list(
        &mut self,
        req: BlockRequestId,
        bufs: BufList,
    ) -> Result<(), (BlockError, BufList)> {
        let Some(r) = self.requests.get_mut(req.index()) else {
            return Err((BlockError::NoRequest, bufs));
        };
        if r.status != BlockStatus::InProgress {
            return Err((BlockError::InvalidRequest, bufs));
        }
        if r.pending.capacity() - r.pending.len() < bufs.len() {
            return Err((BlockError::Busy, bufs));
        }
        for buf in bufs {
            let _ = r.pending.push_back(buf);
        }
        trace!("dataflash: {} buffers pending", r.pending.len());
        Ok(())
    }

    fn abort_req(&mut self, req: BlockRequestId) {
        if self.status(req) != BlockStatus::InProgress {
            return;
        }
        debug!("dataflash: Abort request");
        for _ in 0..self.queue.len() {
            if let Some(queued) = self.queue.pop_front() {
                if queued != req {
                    let _ = self.queue.push_back(queued);
                }
            }
        }
        self.end_request(req, BlockStatus::Aborted);
    }

    fn status(&self, req: BlockRequestId) -> BlockStatus {
        self.requests
            .get(req.index())
            .map_or(BlockStatus::Idle, |r| r.status)
    }

    fn bytes_xfered(&self, req: BlockRequestId) -> usize {
        self.requests.get(req.index()).map_or(0, |r| r.bytes_xfered)
    }

    fn poll(&mut self) {
        for _ in 0..MAX_STEPS {
            // the consumer has to drain first
            if !self.has_event_room() {
                trace!("dataflash: Event queue backlog");
                break;
            }
            if let Step::Yield = self.step() {
                break;
            }
        }
    }

    fn take_event(&mut self) -> Option<BlockEvent> {
        self.events.pop_front()
    }
}
