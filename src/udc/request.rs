//! USB transfer requests

use crate::buffer::{buf_list_len, BufList, Buffer};
use usb_device::endpoint::EndpointAddress;

/// Handle of a [Request] allocated from the controller's request pool
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestId(pub(crate) u8);

impl RequestId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Who gets notified when a request completes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Owner {
    /// The device multiplexer itself (standard requests, descriptors)
    Device,
    /// An interface driver, by interface number
    Interface(u8),
}

/// Completion status of a request
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// Handed to an endpoint and not finished yet
    InProgress,
    /// All data transferred, or a short packet ended an OUT transfer
    Ok,
    /// Aborted by an endpoint flush or destroy
    Flushed,
    /// Aborted by the control protocol (new SETUP, STALL)
    Protocol,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// One asynchronous USB transfer.
///
/// Buffers are transferred in list order. The request owns its buffers until
/// the owner takes them back with [Request::take_buffers].
pub struct Request {
    bufs: BufList,
    cur: usize,
    /// Terminate an IN transfer that ends on a packet boundary with a zero length packet
    pub short_pkt: bool,
    pub status: Status,
    pub bytes_xfered: usize,
    owner: Owner,
}

impl Request {
    pub(crate) fn new(owner: Owner) -> Self {
        Request {
            bufs: BufList::new(),
            cur: 0,
            short_pkt: false,
            status: Status::Ok,
            bytes_xfered: 0,
            owner,
        }
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Appends a buffer. Gives it back if the list is full
    pub fn add_buffer(&mut self, buf: Buffer) -> Result<(), Buffer> {
        self.bufs.push(buf)
    }

    pub fn first_buffer(&self) -> Option<&Buffer> {
        self.bufs.first()
    }

    pub fn first_buffer_mut(&mut self) -> Option<&mut Buffer> {
        self.bufs.first_mut()
    }

    pub fn buffers(&self) -> &BufList {
        &self.bufs
    }

    pub fn take_buffers(&mut self) -> BufList {
        self.cur = 0;
        core::mem::take(&mut self.bufs)
    }

    pub fn pop_buffer(&mut self) -> Option<Buffer> {
        self.bufs.pop()
    }

    /// Total number of bytes the buffer list describes
    pub fn len(&self) -> usize {
        buf_list_len(&self.bufs)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prepares the request for being handed to an endpoint
    pub(crate) fn start(&mut self) {
        self.bufs.iter_mut().for_each(Buffer::rewind);
        self.cur = 0;
        self.bytes_xfered = 0;
        self.status = Status::InProgress;
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bufs[self.cur.min(self.bufs.len())..]
            .iter()
            .map(Buffer::remaining)
            .sum()
    }

    /// Gathers up to `dst.len()` untransferred bytes without consuming them
    pub(crate) fn peek_tx(&self, dst: &mut [u8]) -> usize {
        let mut count = 0;
        for buf in self.bufs.iter().skip(self.cur) {
            if count == dst.len() {
                break;
            }
            count += buf.peek(0, &mut dst[count..]);
        }
        count
    }

    /// Marks `count` bytes as sent
    pub(crate) fn consume_tx(&mut self, mut count: usize) {
        self.bytes_xfered += count;
        while count > 0 && self.cur < self.bufs.len() {
            let buf = &mut self.bufs[self.cur];
            let n = buf.advance(|window| Ok::<usize, ()>(window.len().min(count)));
            count -= n.unwrap_or(0);
            if buf.is_done() {
                self.cur += 1;
            }
        }
        self.skip_done();
    }

    /// Scatters received bytes across the buffers. Returns number of bytes stored
    pub(crate) fn fill_rx(&mut self, mut src: &[u8]) -> usize {
        let mut count = 0;
        self.skip_done();
        while !src.is_empty() && self.cur < self.bufs.len() {
            let buf = &mut self.bufs[self.cur];
            let n = buf.fill(src);
            src = &src[n..];
            count += n;
            if buf.is_done() {
                self.cur += 1;
            }
        }
        self.bytes_xfered += count;
        count
    }

    fn skip_done(&mut self) {
        while self.cur < self.bufs.len() && self.bufs[self.cur].is_done() {
            self.cur += 1;
        }
    }
}

/// Completion of a request on an endpoint
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    pub ep: EndpointAddress,
    pub req: RequestId,
    pub status: Status,
}
