//! Default control endpoint state machine

use super::request::{RequestId, Status};
use super::setup::{SetupPacket, SETUP_LEN};
use super::{Udc, UdcError, UdcEvent, MAX_PACKET_SIZE};
use crate::fmt::{debug, info, trace, warn};
use usb_device::bus::UsbBus;
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};

#[inline]
fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

#[inline]
fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

const WRITE_SYNC_SPINS: usize = 100_000;

/// Control transfer progress
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ep0State {
    /// Waiting for SETUP
    Setup,
    /// IN data being sent
    DataIn,
    /// Zero length packet terminating the IN data being sent
    DataZlp,
    /// Waiting for OUT data
    DataOut,
    /// IN status sent
    StatusIn,
    /// Waiting for OUT status
    StatusOut,
}

pub(super) struct Ep0 {
    state: Ep0State,
    req: Option<RequestId>,
    in_flight: Option<usize>,
    pending_address: Option<u8>,
}

impl Ep0 {
    pub(super) fn new() -> Self {
        Ep0 {
            state: Ep0State::Setup,
            req: None,
            in_flight: None,
            pending_address: None,
        }
    }
}

impl<B: UsbBus> Udc<B> {
    pub fn ep0_state(&self) -> Ep0State {
        self.ep0.state
    }

    /// Starts the IN data stage of the current control transfer
    pub fn ep0_submit_in(&mut self, id: RequestId) -> Result<(), UdcError> {
        self.ep0_submit(id, Ep0State::DataIn)?;
        self.ep0_pump_in();
        Ok(())
    }

    /// Starts the OUT data stage of the current control transfer
    pub fn ep0_submit_out(&mut self, id: RequestId) -> Result<(), UdcError> {
        self.ep0_submit(id, Ep0State::DataOut)?;
        // the host may have sent the data already
        self.ep0_out();
        Ok(())
    }

    fn ep0_submit(&mut self, id: RequestId, state: Ep0State) -> Result<(), UdcError> {
        if self.ep0.req.is_some() {
            return Err(UdcError::Busy);
        }
        let req = self
            .requests
            .get_mut(id.index())
            .ok_or(UdcError::NoRequest)?;
        req.start();
        trace!("usb: udc: ep0 submit {} bytes, {}", req.len(), state);

        self.ep0.req = Some(id);
        self.ep0.in_flight = None;
        self.ep0.state = state;
        Ok(())
    }

    /// Writes at most one packet to ep0 IN, spinning while the FIFO is busy.
    /// Returns number of bytes written
    pub fn ep0_write_sync(&mut self, data: &[u8]) -> Result<usize, UdcError> {
        let len = data.len().min(self.config.max_packet_size_0 as usize);
        for _ in 0..WRITE_SYNC_SPINS {
            match self.bus.write(ep0_in(), &data[..len]) {
                Ok(count) => {
                    trace!("usb: udc: ep0 wrote {} bytes", count);
                    return Ok(count);
                }
                Err(UsbError::WouldBlock) => continue,
                Err(_) => return Err(UdcError::InvalidArg),
            }
        }
        Err(UdcError::Busy)
    }

    /// Completes a control transfer without data or with OUT data
    pub fn ep0_send_status(&mut self) {
        self.ep0.in_flight = None;
        self.ep0.state = Ep0State::StatusIn;
        self.ep0_pump_in();
    }

    /// Completes a control transfer with IN data. The host's status packet
    /// is not waited for
    pub fn ep0_expect_status(&mut self) {
        self.ep0.state = Ep0State::StatusOut;
    }

    /// Rejects the current control transfer
    pub fn ep0_stall(&mut self) {
        self.ep0_flush(Status::Protocol);
        self.bus.set_stalled(ep0_in(), true);
        self.bus.set_stalled(ep0_out(), true);
        debug!("usb: udc: ep0 stall");
    }

    /// Latches a new device address once the status stage is through
    pub fn set_address(&mut self, addr: u8) {
        if B::QUIRK_SET_ADDRESS_BEFORE_STATUS {
            self.apply_address(addr);
        } else {
            self.ep0.pending_address = Some(addr);
        }
    }

    fn apply_address(&mut self, addr: u8) {
        self.bus.set_device_address(addr);
        self.address = addr;
        info!("usb: udc: Address {}", addr);
    }

    pub(super) fn ep0_reset(&mut self) {
        self.ep0.pending_address = None;
        self.ep0_flush(Status::Flushed);
    }

    fn ep0_flush(&mut self, status: Status) {
        let ep = match self.ep0.state {
            Ep0State::DataOut => ep0_out(),
            _ => ep0_in(),
        };
        self.ep0.in_flight = None;
        self.ep0.state = Ep0State::Setup;
        if let Some(id) = self.ep0.req.take() {
            self.complete(ep, id, status);
        }
    }

    pub(super) fn ep0_setup(&mut self) {
        // a SETUP ends whatever the previous control transfer was doing
        if let Some(id) = self.ep0.req.take() {
            let (ep, status) = match self.ep0.state {
                Ep0State::DataIn | Ep0State::DataZlp => {
                    let sent = self
                        .requests
                        .get(id.index())
                        .map(|req| req.remaining() == 0)
                        .unwrap_or(false);
                    (ep0_in(), if sent { Status::Ok } else { Status::Protocol })
                }
                Ep0State::DataOut => (ep0_out(), Status::Protocol),
                _ => (ep0_in(), Status::Protocol),
            };
            self.complete(ep, id, status);
        }
        self.ep0.in_flight = None;
        self.ep0.state = Ep0State::Setup;

        let mut raw = [0u8; SETUP_LEN];
        match self.bus.read(ep0_out(), &mut raw) {
            Ok(SETUP_LEN) => {}
            Ok(count) => {
                warn!("usb: udc: Invalid SETUP length {}", count);
                self.ep0_stall();
                return;
            }
            Err(UsbError::WouldBlock) => return,
            Err(_) => {
                warn!("usb: udc: SETUP read failed");
                self.ep0_stall();
                return;
            }
        }

        self.bus.set_stalled(ep0_in(), false);
        self.bus.set_stalled(ep0_out(), false);

        let setup = SetupPacket::from_bytes(&raw);
        trace!("usb: udc: SETUP {}", setup);
        self.push_event(UdcEvent::Setup(setup));
    }

    pub(super) fn ep0_pump_in(&mut self) {
        if self.ep0.in_flight.is_some() {
            return;
        }

        let mut packet = [0u8; MAX_PACKET_SIZE];
        let count = match self.ep0.state {
            Ep0State::DataIn => match self.ep0.req.and_then(|id| self.requests.get(id.index())) {
                Some(req) => req.peek_tx(&mut packet[..self.config.max_packet_size_0 as usize]),
                None => return,
            },
            Ep0State::DataZlp | Ep0State::StatusIn => 0,
            _ => return,
        };

        match self.bus.write(ep0_in(), &packet[..count]) {
            Ok(_) => self.ep0.in_flight = Some(count),
            Err(UsbError::WouldBlock) => {}
            Err(_) => {
                warn!("usb: udc: ep0 write failed");
                self.ep0_stall();
            }
        }
    }

    pub(super) fn ep0_in_complete(&mut self) {
        let Some(count) = self.ep0.in_flight.take() else {
            return;
        };

        match self.ep0.state {
            Ep0State::StatusIn => {
                if let Some(addr) = self.ep0.pending_address.take() {
                    self.apply_address(addr);
                }
                self.ep0.state = Ep0State::Setup;
            }
            Ep0State::DataIn | Ep0State::DataZlp => {
                let Some(id) = self.ep0.req else {
                    return;
                };
                let max_packet_size = self.config.max_packet_size_0 as usize;
                let (remaining, short_pkt) = match self.requests.get_mut(id.index()) {
                    Some(req) => {
                        req.consume_tx(count);
                        (req.remaining(), req.short_pkt)
                    }
                    None => (0, false),
                };

                if remaining > 0 {
                    self.ep0_pump_in();
                } else if count == max_packet_size && short_pkt {
                    self.ep0.state = Ep0State::DataZlp;
                    self.ep0_pump_in();
                } else {
                    self.ep0.req = None;
                    self.ep0.state = Ep0State::Setup;
                    self.complete(ep0_in(), id, Status::Ok);
                }
            }
            _ => {}
        }
    }

    pub(super) fn ep0_out(&mut self) {
        let max_packet_size = self.config.max_packet_size_0 as usize;
        let mut packet = [0u8; MAX_PACKET_SIZE];
        let count = match self.bus.read(ep0_out(), &mut packet[..max_packet_size]) {
            Ok(count) => count,
            Err(UsbError::WouldBlock) => return,
            Err(_) => {
                warn!("usb: udc: ep0 read failed");
                self.ep0_stall();
                return;
            }
        };

        match (self.ep0.state, self.ep0.req) {
            (Ep0State::DataOut, Some(id)) => {
                let remaining = match self.requests.get_mut(id.index()) {
                    Some(req) => {
                        req.fill_rx(&packet[..count]);
                        req.remaining()
                    }
                    None => 0,
                };
                if count < max_packet_size || remaining == 0 {
                    self.ep0.req = None;
                    self.ep0.state = Ep0State::Setup;
                    self.complete(ep0_out(), id, Status::Ok);
                }
            }
            (_, _) if count == 0 => {
                // status stage of an IN transfer
                if self.ep0.state == Ep0State::StatusOut {
                    self.ep0.state = Ep0State::Setup;
                }
            }
            _ => {
                warn!("usb: udc: Unexpected {} bytes on ep0", count);
                self.ep0_stall();
            }
        }
    }
}
