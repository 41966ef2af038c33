use std::collections::VecDeque;
use usbd_msc::block::{
    BlockAddr, BlockDevice, BlockError, BlockEvent, BlockLen, BlockOp, BlockRequestId,
    BlockStatus, DeviceFlags,
};
use usbd_msc::buffer::BufList;

const NR_REQUESTS: usize = 2;

struct Slot {
    status: BlockStatus,
    op: BlockOp,
    lba: BlockAddr,
    nr_blocks: BlockLen,
    submitted: bool,
    started: bool,
    pending: VecDeque<BufList>,
    bytes: usize,
}

impl Slot {
    fn new() -> Self {
        Slot {
            status: BlockStatus::Idle,
            op: BlockOp::Read,
            lba: 0,
            nr_blocks: 0,
            submitted: false,
            started: false,
            pending: VecDeque::new(),
            bytes: 0,
        }
    }
}

/// RAM backed block device. Transfers one buffer list per poll
pub struct MemBlockDevice {
    pub data: Vec<u8>,
    block_size: usize,
    pub flags: DeviceFlags,
    /// Transferring this block ends the request with [BlockStatus::IoError]
    pub fail_at: Option<BlockAddr>,
    slots: [Option<Slot>; NR_REQUESTS],
    queue: VecDeque<BlockRequestId>,
    events: VecDeque<BlockEvent>,
}

impl MemBlockDevice {
    pub fn new(nr_blocks: usize, block_size: usize) -> Self {
        MemBlockDevice {
            data: vec![0u8; nr_blocks * block_size],
            block_size,
            flags: DeviceFlags {
                unit_attention: false,
                present: true,
                writeable: true,
            },
            fail_at: None,
            slots: [None, None],
            queue: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn block(&self, lba: usize) -> &[u8] {
        &self.data[lba * self.block_size..(lba + 1) * self.block_size]
    }

    fn slot_mut(&mut self, req: BlockRequestId) -> Option<&mut Slot> {
        self.slots.get_mut(req.index()).and_then(Option::as_mut)
    }

    fn slot(&self, req: BlockRequestId) -> Option<&Slot> {
        self.slots.get(req.index()).and_then(Option::as_ref)
    }

    fn end_request(&mut self, req: BlockRequestId, status: BlockStatus) {
        self.queue.retain(|id| *id != req);
        let Some(slot) = self.slot_mut(req) else {
            return;
        };
        slot.status = status;
        slot.submitted = false;
        let pending: Vec<BufList> = slot.pending.drain(..).collect();
        for bufs in pending {
            self.events.push_back(BlockEvent::BufListDone(req, bufs));
        }
        self.events.push_back(BlockEvent::Done(req));
    }

    /// Moves the data of one buffer list. Returns false on a failed block
    fn transfer(&mut self, req: BlockRequestId, bufs: &mut BufList) -> bool {
        let block_size = self.block_size;
        let Some(slot) = self.slot(req) else {
            return false;
        };
        let (op, lba, total) = (slot.op, slot.lba, slot.nr_blocks as usize * block_size);
        let mut bytes = slot.bytes;

        let mut ok = true;
        'bufs: for buf in bufs.iter_mut() {
            let window = buf.as_mut_slice();
            for chunk in window.chunks_mut(block_size) {
                if bytes >= total {
                    break 'bufs;
                }
                let block = lba + (bytes / block_size) as BlockAddr;
                if self.fail_at == Some(block) {
                    ok = false;
                    break 'bufs;
                }
                let offset = block as usize * block_size;
                let media = &mut self.data[offset..offset + chunk.len()];
                match op {
                    BlockOp::Read => chunk.copy_from_slice(media),
                    BlockOp::Write => media.copy_from_slice(chunk),
                }
                bytes += chunk.len();
            }
        }

        if let Some(slot) = self.slot_mut(req) {
            slot.bytes = bytes;
        }
        ok
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn nr_blocks(&self) -> BlockLen {
        (self.data.len() / self.block_size) as BlockLen
    }

    fn flags(&self) -> DeviceFlags {
        self.flags
    }

    fn clear_unit_attention(&mut self) {
        self.flags.unit_attention = false;
    }

    fn alloc_request(&mut self) -> Result<BlockRequestId, BlockError> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(BlockError::NoRequest)?;
        self.slots[idx] = Some(Slot::new());
        Ok(BlockRequestId::new(idx as u8))
    }

    fn free_request(&mut self, req: BlockRequestId) {
        self.abort_req(req);
        if let Some(slot) = self.slots.get_mut(req.index()) {
            *slot = None;
        }
    }

    fn prepare_req(
        &mut self,
        req: BlockRequestId,
        lba: BlockAddr,
        nr_blocks: BlockLen,
        op: BlockOp,
    ) -> Result<(), BlockError> {
        let nr_total = self.nr_blocks();
        let slot = self.slot_mut(req).ok_or(BlockError::NoRequest)?;
        if slot.submitted {
            return Err(BlockError::Busy);
        }
        if lba.checked_add(nr_blocks).map_or(true, |end| end > nr_total) {
            return Err(BlockError::OutOfRange);
        }
        *slot = Slot {
            status: BlockStatus::InProgress,
            op,
            lba,
            nr_blocks,
            ..Slot::new()
        };
        Ok(())
    }

    fn submit_req(&mut self, req: BlockRequestId) -> Result<(), BlockError> {
        let writeable = self.flags.writeable;
        let slot = self.slot_mut(req).ok_or(BlockError::NoRequest)?;
        if slot.submitted {
            return Err(BlockError::Busy);
        }
        if slot.status != BlockStatus::InProgress {
            return Err(BlockError::InvalidRequest);
        }
        slot.submitted = true;
        if slot.op == BlockOp::Write && !writeable {
            self.end_request(req, BlockStatus::IoError);
            return Ok(());
        }
        self.queue.push_back(req);
        Ok(())
    }

    fn submit_buf_list(
        &mut self,
        req: BlockRequestId,
        bufs: BufList,
    ) -> Result<(), (BlockError, BufList)> {
        match self.slot_mut(req) {
            Some(slot) if slot.status == BlockStatus::InProgress => {
                slot.pending.push_back(bufs);
                Ok(())
            }
            _ => Err((BlockError::InvalidRequest, bufs)),
        }
    }

    fn abort_req(&mut self, req: BlockRequestId) {
        if self.status(req) == BlockStatus::InProgress {
            self.end_request(req, BlockStatus::Aborted);
        }
    }

    fn status(&self, req: BlockRequestId) -> BlockStatus {
        self.slot(req).map_or(BlockStatus::Idle, |slot| slot.status)
    }

    fn bytes_xfered(&self, req: BlockRequestId) -> usize {
        self.slot(req).map_or(0, |slot| slot.bytes)
    }

    fn poll(&mut self) {
        let Some(&req) = self.queue.front() else {
            return;
        };
        let block_size = self.block_size;
        let Some(slot) = self.slot_mut(req) else {
            self.queue.pop_front();
            return;
        };
        if !slot.started {
            slot.started = true;
            self.events.push_back(BlockEvent::Started(req));
            return;
        }
        if slot.bytes >= slot.nr_blocks as usize * block_size {
            self.end_request(req, BlockStatus::Done);
            return;
        }
        let Some(mut bufs) = slot.pending.pop_front() else {
            return;
        };


        let ok = self.transfer(req, &mut bufs);
        self.events.push_back(BlockEvent::BufListDone(req, bufs));
        let done = self
            .slot(req)
            .map_or(true, |slot| slot.bytes >= slot.nr_blocks as usize * block_size);
        if !ok {
            self.end_request(req, BlockStatus::IoError);
        } else if done {
            self.end_request(req, BlockStatus::Done);
        }
    }

    fn take_event(&mut self) -> Option<BlockEvent> {
        self.events.pop_front()
    }
}
