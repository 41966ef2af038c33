use core::cmp::min;

/// Maximum number of buffers a single buffer list can carry
pub const MAX_BUFS: usize = 8;

/// An ordered list of buffers owned by whoever currently holds the list
pub type BufList = heapless::Vec<Buffer, MAX_BUFS>;

/// A contiguous memory region handed between the USB and the storage side.
///
/// `len` is the size of the transfer window, `pos` is how far the current
/// holder has progressed through it. A buffer lives in exactly one list at a
/// time; moving it moves the ownership.
pub struct Buffer {
    inner: &'static mut [u8],
    len: usize, // transfer window
    pos: usize, // next byte to transfer
}

impl Buffer {
    pub fn new(inner: &'static mut [u8]) -> Buffer {
        let len = inner.len();
        Buffer { inner, len, pos: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resizes the transfer window and rewinds the cursor
    pub fn set_len(&mut self, len: usize) {
        self.len = min(len, self.inner.len());
        self.pos = 0;
    }

    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos == self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.inner[..self.len]
    }

    /// Hands the untransferred part of the window to `f` and advances the
    /// cursor by the number of bytes `f` reports as transferred
    pub fn advance<E>(
        &mut self,
        f: impl FnOnce(&mut [u8]) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let boundary = self.len;
        f(&mut self.inner[self.pos..boundary]).map(|count| {
            let advance_by = min(count, boundary - self.pos);
            self.pos += advance_by;
            debug_assert!(self.pos <= self.len);
            advance_by
        })
    }

    /// Copies from `src` into the untransferred part of the window.
    /// Returns number of bytes actually copied
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let count = min(self.remaining(), src.len());
        self.inner[self.pos..self.pos + count].copy_from_slice(&src[..count]);
        self.pos += count;
        count
    }

    /// Copies the untransferred part of the window into `dst`.
    /// Returns number of bytes actually copied
    pub fn drain(&mut self, dst: &mut [u8]) -> usize {
        let count = min(self.remaining(), dst.len());
        dst[..count].copy_from_slice(&self.inner[self.pos..self.pos + count]);
        self.pos += count;
        count
    }

    /// Copies bytes starting at `offset` past the cursor without moving it
    pub fn peek(&self, offset: usize, dst: &mut [u8]) -> usize {
        let start = min(self.pos + offset, self.len);
        let count = min(self.len - start, dst.len());
        dst[..count].copy_from_slice(&self.inner[start..start + count]);
        count
    }

    pub fn into_inner(self) -> &'static mut [u8] {
        self.inner
    }
}

/// Total size of the transfer windows in `list`
pub fn buf_list_len(list: &BufList) -> usize {
    list.iter().map(Buffer::len).sum()
}
