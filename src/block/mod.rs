//! Asynchronous block device contract
//!
//! A consumer allocates a request once, then for every operation prepares
//! it with an address range, submits it and feeds it buffers with
//! [BlockDevice::submit_buf_list] as memory becomes available. The device
//! reports progress through [BlockEvent]s drained with
//! [BlockDevice::take_event]: buffers come back in the order they were
//! consumed, and the request finishes with exactly one [BlockEvent::Done].
//!
//! Requests on one device are serviced in submission order.

#[cfg(feature = "dataflash")]
pub mod at45;
#[cfg(feature = "dataflash")]
pub mod dataflash;

use crate::buffer::BufList;

/// Logical block address
pub type BlockAddr = u32;
/// Number of logical blocks
pub type BlockLen = u32;

/// Block device error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockError {
    /// Request pool exhausted or request handle is stale
    NoRequest,
    /// The request is already submitted
    Busy,
    /// The request is not prepared, or is no longer in progress
    InvalidRequest,
    /// The address range does not fit the device
    OutOfRange,
    /// No usable medium
    NotPresent,
}

/// Block operation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockOp {
    Read,
    Write,
}

/// Block request status
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockStatus {
    /// Allocated, not prepared
    Idle,
    /// Prepared or submitted, not finished
    InProgress,
    /// Every block transferred
    Done,
    /// Stopped by [BlockDevice::abort_req]
    Aborted,
    /// The medium failed
    IoError,
}

impl BlockStatus {
    /// Whether the request ended without transferring every block
    pub fn is_failure(self) -> bool {
        matches!(self, BlockStatus::Aborted | BlockStatus::IoError)
    }
}

/// Device state flags
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceFlags {
    /// Information about the device changed
    pub unit_attention: bool,
    /// A medium is present and usable
    pub present: bool,
    /// The medium can be written to
    pub writeable: bool,
}

/// Handle of a block request allocated from a device's request pool
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockRequestId(u8);

impl BlockRequestId {
    /// Handle for slot `index` of a device's request pool
    pub fn new(index: u8) -> Self {
        BlockRequestId(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Request progress reported by a block device
pub enum BlockEvent {
    /// The request reached the head of the device queue and its first
    /// buffers are being transferred
    Started(BlockRequestId),
    /// A batch of buffers is transferred and belongs to the consumer again.
    /// Buffers returned after a failure carry no valid data
    BufListDone(BlockRequestId, BufList),
    /// The whole operation finished, see [BlockDevice::status]
    Done(BlockRequestId),
}

/// An asynchronous block device
pub trait BlockDevice {
    /// Size of a logical block in bytes
    fn block_size(&self) -> usize;

    /// Total number of logical blocks
    fn nr_blocks(&self) -> BlockLen;

    fn flags(&self) -> DeviceFlags;

    /// Identifier of the medium, changes when the medium does
    fn dev_id(&self) -> u32 {
        0
    }

    /// Acknowledges [DeviceFlags::unit_attention] once it was reported
    fn clear_unit_attention(&mut self) {}

    fn alloc_request(&mut self) -> Result<BlockRequestId, BlockError>;

    fn free_request(&mut self, req: BlockRequestId);

    /// Sets up `req` for transferring `nr_blocks` blocks starting at `lba`
    fn prepare_req(
        &mut self,
        req: BlockRequestId,
        lba: BlockAddr,
        nr_blocks: BlockLen,
        op: BlockOp,
    ) -> Result<(), BlockError>;

    /// Queues a prepared request
    fn submit_req(&mut self, req: BlockRequestId) -> Result<(), BlockError>;

    fn queue_req(
        &mut self,
        req: BlockRequestId,
        lba: BlockAddr,
        nr_blocks: BlockLen,
        op: BlockOp,
    ) -> Result<(), BlockError> {
        self.prepare_req(req, lba, nr_blocks, op)?;
        self.submit_req(req)
    }

    /// Appends buffers to a request that is in progress.
    ///
    /// # Errors
    /// If the request already finished the buffers are handed back untouched
    fn submit_buf_list(
        &mut self,
        req: BlockRequestId,
        bufs: BufList,
    ) -> Result<(), (BlockError, BufList)>;

    /// Stops the request. Its buffers come back through
    /// [BlockEvent::BufListDone] and it finishes with [BlockStatus::Aborted]
    fn abort_req(&mut self, req: BlockRequestId);

    fn status(&self, req: BlockRequestId) -> BlockStatus;

    /// Number of bytes transferred so far
    fn bytes_xfered(&self, req: BlockRequestId) -> usize;

    /// Number of whole blocks transferred so far
    fn blocks_xfered(&self, req: BlockRequestId) -> BlockLen {
        (self.bytes_xfered(req) / self.block_size()) as BlockLen
    }

    /// Advances the device. Never blocks on the medium, and makes no
    /// progress while too many events wait in [BlockDevice::take_event]
    fn poll(&mut self);

    /// Next queued event, oldest first
    fn take_event(&mut self) -> Option<BlockEvent>;
}
