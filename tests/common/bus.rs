use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::bus::{PollResult, UsbBus};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

pub const NR_EPS: usize = 8;

#[derive(Default)]
struct DummyEp {
    allocated: bool,
    max_packet_size: u16,
    stalled: bool,
    /// host to device, (packet, is SETUP)
    rx: VecDeque<(Vec<u8>, bool)>,
    /// device to host
    tx: VecDeque<Vec<u8>>,
    in_complete: bool,
}

/// Bus state change reported ahead of any data
#[derive(Copy, Clone)]
enum Signal {
    Reset,
    Suspend,
    Resume,
}

#[derive(Default)]
struct Inner {
    enabled: bool,
    signals: VecDeque<Signal>,
    address: u8,
    ep_in: [DummyEp; NR_EPS],
    ep_out: [DummyEp; NR_EPS],
}

impl Inner {
    fn ep(&mut self, addr: EndpointAddress) -> &mut DummyEp {
        match addr.direction() {
            UsbDirection::In => &mut self.ep_in[addr.index()],
            UsbDirection::Out => &mut self.ep_out[addr.index()],
        }
    }
}

/// A bus that a test drives from the host side. Every packet the device
/// writes is acknowledged on the next poll
#[derive(Clone, Default)]
pub struct DummyUsbBus {
    inner: Arc<Mutex<Inner>>,
}

impl DummyUsbBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    pub fn address(&self) -> u8 {
        self.inner.lock().unwrap().address
    }

    /// Signals a bus reset on the next poll
    pub fn bus_reset(&self) {
        self.inner.lock().unwrap().signals.push_back(Signal::Reset);
    }

    /// Signals a suspend, one per poll after those already signalled
    pub fn signal_suspend(&self) {
        self.inner.lock().unwrap().signals.push_back(Signal::Suspend);
    }

    pub fn signal_resume(&self) {
        self.inner.lock().unwrap().signals.push_back(Signal::Resume);
    }

    /// Sends a SETUP packet to ep0
    pub fn setup(&self, raw: [u8; 8]) {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_out[0].rx.push_back((raw.to_vec(), true));
    }

    /// Sends `data` to OUT endpoint `ep`, split into packets
    pub fn write(&self, ep: usize, data: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        let ep = &mut lock.ep_out[ep];
        let max_packet_size = ep.max_packet_size.max(8) as usize;
        if data.is_empty() {
            ep.rx.push_back((vec![], false));
        }
        for chunk in data.chunks(max_packet_size) {
            ep.rx.push_back((chunk.to_vec(), false));
        }
    }

    /// Packets sent to OUT endpoint `ep` the device has not read yet
    pub fn pending_out(&self, ep: usize) -> usize {
        self.inner.lock().unwrap().ep_out[ep].rx.len()
    }

    /// Takes every packet the device wrote to IN endpoint `ep`
    pub fn read_packets(&self, ep: usize) -> Vec<Vec<u8>> {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_in[ep].tx.drain(..).collect()
    }

    /// Takes everything the device wrote to IN endpoint `ep`
    pub fn read(&self, ep: usize) -> Vec<u8> {
        self.read_packets(ep).concat()
    }

    pub fn is_stalled_in(&self, ep: usize) -> bool {
        self.inner.lock().unwrap().ep_in[ep].stalled
    }

    pub fn is_stalled_out(&self, ep: usize) -> bool {
        self.inner.lock().unwrap().ep_out[ep].stalled
    }

    pub fn max_packet_size(&self, ep: usize) -> u16 {
        self.inner.lock().unwrap().ep_in[ep].max_packet_size
    }
}

impl UsbBus for DummyUsbBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        let mut lock = self.inner.lock().unwrap();
        if lock.enabled {
            return Err(UsbError::InvalidState);
        }

        let addr = match ep_addr {
            Some(addr) => addr,
            None => {
                let eps = match ep_dir {
                    UsbDirection::In => &lock.ep_in,
                    UsbDirection::Out => &lock.ep_out,
                };
                let idx = (1..NR_EPS)
                    .find(|idx| !eps[*idx].allocated)
                    .ok_or(UsbError::EndpointOverflow)?;
                EndpointAddress::from_parts(idx, ep_dir)
            }
        };
        if addr.index() >= NR_EPS {
            return Err(UsbError::InvalidEndpoint);
        }

        let ep = lock.ep(addr);
        if ep.allocated {
            return Err(UsbError::InvalidEndpoint);
        }
        ep.allocated = true;
        ep.max_packet_size = max_packet_size;
        Ok(addr)
    }

    fn enable(&mut self) {
        self.inner.lock().unwrap().enabled = true;
    }

    fn reset(&self) {
        let mut lock = self.inner.lock().unwrap();
        let inner = &mut *lock;
        inner.address = 0;
        for ep in inner.ep_in.iter_mut().chain(inner.ep_out.iter_mut()) {
            ep.stalled = false;
            ep.in_complete = false;
        }
    }

    fn set_device_address(&self, addr: u8) {
        self.inner.lock().unwrap().address = addr;
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep(ep_addr);
        if !ep.allocated || ep_addr.is_out() {
            return Err(UsbError::InvalidEndpoint);
        }
        if buf.len() > ep.max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }
        ep.tx.push_back(buf.to_vec());
        ep.in_complete = true;
        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep(ep_addr);
        if !ep.allocated || ep_addr.is_in() {
            return Err(UsbError::InvalidEndpoint);
        }
        let Some((packet, setup)) = ep.rx.pop_front() else {
            return Err(UsbError::WouldBlock);
        };
        if packet.len() > buf.len() {
            ep.rx.push_front((packet, setup));
            return Err(UsbError::BufferOverflow);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        self.inner.lock().unwrap().ep(ep_addr).stalled = stalled;
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        self.inner.lock().unwrap().ep(ep_addr).stalled
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        let mut lock = self.inner.lock().unwrap();
        if let Some(signal) = lock.signals.pop_front() {
            return match signal {
                Signal::Reset => PollResult::Reset,
                Signal::Suspend => PollResult::Suspend,
                Signal::Resume => PollResult::Resume,
            };
        }

        let (mut ep_out, mut ep_in_complete, mut ep_setup) = (0u16, 0u16, 0u16);
        for idx in 0..NR_EPS {
            match lock.ep_out[idx].rx.front() {
                Some((_, true)) => ep_setup |= 1 << idx,
                Some((_, false)) => ep_out |= 1 << idx,
                None => {}
            }
            let ep = &mut lock.ep_in[idx];
            if ep.in_complete {
                ep.in_complete = false;
                ep_in_complete |= 1 << idx;
            }
        }

        if ep_out | ep_in_complete | ep_setup == 0 {
            return PollResult::None;
        }
        PollResult::Data {
            ep_out,
            ep_in_complete,
            ep_setup,
        }
    }
}
