#![allow(dead_code)]

use std::sync::mpsc::sync_channel;
use std::thread;
use std::time::Duration;
use usbd_msc::buffer::Buffer;

#[cfg(feature = "dataflash")]
pub mod at45;
#[cfg(all(feature = "scsi", feature = "bbb"))]
pub mod bbb;
pub mod bus;
pub mod device;
pub mod mem;

/// Memory that lives as long as the test process, the way a `static mut`
/// buffer does on the target
pub fn leak(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

pub fn buffer(len: usize) -> Buffer {
    Buffer::new(leak(len))
}

/// Buffer holding a copy of `data`
pub fn buffer_with(data: &[u8]) -> Buffer {
    let mut buf = buffer(data.len());
    buf.as_mut_slice().copy_from_slice(data);
    buf
}

/// Deterministic test pattern
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}
