//! USB Device Controller
//!
//! Owns the [UsbBus], the endpoint table and the request pool. Every
//! completion, SETUP packet and bus event is queued as an [UdcEvent] and
//! drained by the owner with [Udc::take_event]; nothing is called back
//! from inside the controller.
//!
//! Non-control endpoints carry a FIFO queue of [Request]s. At most one
//! packet per endpoint is handed to the hardware at a time, so requests are
//! never interleaved.

mod ep0;
pub mod request;
pub mod setup;

use crate::fmt::{debug, error, info, trace, warn};
use crate::pool::Pool;
use heapless::Deque;
use usb_device::bus::{PollResult, UsbBus};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

pub use ep0::Ep0State;
use ep0::Ep0;
use request::{Completion, Owner, Request, RequestId, Status};
use setup::SetupPacket;

/// Number of endpoint numbers (per direction) the controller keeps track of
pub const NR_ENDPOINTS: usize = 8;
/// Size of the request pool
pub const NR_REQUESTS: usize = 16;

const EP_QUEUE_LEN: usize = 4;
/// Completions of every request twice over, and the three bus events kept
const NR_EVENTS: usize = 2 * NR_REQUESTS + 3;
const MAX_PACKET_SIZE: usize = 1024;
const MAX_DRAIN_PACKETS: usize = 64;

/// Endpoint controller error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UdcError {
    /// Endpoint address is out of range, has the wrong direction or is not created
    InvalidEndpoint,
    /// Endpoint already created, request queue full or ep0 already has a transfer
    Busy,
    /// Packet size or endpoint type rejected
    InvalidArg,
    /// Operation is not supported by this controller
    Unsupported,
    /// Request pool exhausted or request handle is stale
    NoRequest,
}

/// Bus speed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSpeed {
    Unknown,
    Low,
    Full,
    High,
}

/// Non-control endpoint transfer type
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpKind {
    Bulk,
    Interrupt,
}

/// Controller configuration
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UdcConfig {
    /// Max packet size of the default control endpoint. Allowed values: 8,16,32,64
    pub max_packet_size_0: u8,
    /// Speed reported after a bus reset
    pub speed: UsbSpeed,
    /// Wait for [Udc::vbus_on] before attaching
    pub vbus_sensing: bool,
}

impl Default for UdcConfig {
    fn default() -> Self {
        UdcConfig {
            max_packet_size_0: 64,
            speed: UsbSpeed::Full,
            vbus_sensing: false,
        }
    }
}

/// Something the owner of the controller has to react to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UdcEvent {
    Reset,
    Setup(SetupPacket),
    Complete(Completion),
    Suspend,
    Resume,
}

#[derive(Default)]
struct Flags {
    bus_enabled: bool,
    has_power: bool,
    autoattach: bool,
    attached: bool,
    suspended: bool,
}

#[derive(Copy, Clone)]
struct HwEndpoint {
    kind: EpKind,
    max_packet_size: u16,
}

#[derive(Default)]
struct Endpoint {
    hw: Option<HwEndpoint>,
    allocated: bool,
    enabled: bool,
    halted: bool,
    wedged: bool,
    stall_pending: bool,
    max_packet_size: u16,
    queue: Deque<RequestId, EP_QUEUE_LEN>,
    in_flight: Option<usize>, // IN packet handed to hardware
}

impl Endpoint {
    fn reset_flags(&mut self) {
        self.allocated = false;
        self.enabled = false;
        self.halted = false;
        self.wedged = false;
        self.stall_pending = false;
        self.in_flight = None;
    }
}

/// USB Device Controller
pub struct Udc<B: UsbBus> {
    bus: B,
    config: UdcConfig,
    flags: Flags,
    address: u8,
    speed: UsbSpeed,
    ep_in: [Endpoint; NR_ENDPOINTS],
    ep_out: [Endpoint; NR_ENDPOINTS],
    ep0: Ep0,
    requests: Pool<Request, NR_REQUESTS>,
    events: Deque<UdcEvent, NR_EVENTS>,
}

impl<B: UsbBus> Udc<B> {
    /// Creates a controller and allocates the default control endpoint
    ///
    /// # Errors
    /// * [UdcError::InvalidArg] - if `max_packet_size_0` is not 8,16,32,64 or the bus rejects ep0
    pub fn new(mut bus: B, config: UdcConfig) -> Result<Self, UdcError> {
        if !matches!(config.max_packet_size_0, 8 | 16 | 32 | 64) {
            return Err(UdcError::InvalidArg);
        }

        for dir in [UsbDirection::Out, UsbDirection::In] {
            bus.alloc_ep(
                dir,
                Some(EndpointAddress::from_parts(0, dir)),
                EndpointType::Control,
                config.max_packet_size_0 as u16,
                0,
            )
            .map_err(|_| UdcError::InvalidArg)?;
        }

        Ok(Udc {
            bus,
            config,
            flags: Flags {
                has_power: !config.vbus_sensing,
                ..Default::default()
            },
            address: 0,
            speed: UsbSpeed::Unknown,
            ep_in: Default::default(),
            ep_out: Default::default(),
            ep0: Ep0::new(),
            requests: Pool::new(),
            events: Deque::new(),
        })
    }

    /// Underlying bus
    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn is_attached(&self) -> bool {
        self.flags.attached
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.suspended
    }

    pub fn max_packet_size_0(&self) -> u16 {
        self.config.max_packet_size_0 as u16
    }

    /// Next queued event, oldest first
    pub fn take_event(&mut self) -> Option<UdcEvent> {
        self.events.pop_front()
    }

    /* Power management */

    /// Allows the controller to connect to the host as soon as VBUS is present
    pub fn attach(&mut self) {
        self.flags.autoattach = true;
        self.maybe_attach();
    }

    /// Disconnects from the host. The bus is not serviced until the next [Udc::attach]
    pub fn detach(&mut self) {
        self.flags.autoattach = false;
        if self.flags.attached {
            info!("usb: udc: Detached");
            self.flags.attached = false;
        }
    }

    pub fn vbus_on(&mut self) {
        debug!("usb: udc: VBUS on");
        self.flags.has_power = true;
        self.maybe_attach();
    }

    /// VBUS is gone: acts as a bus reset and stops servicing the bus
    pub fn vbus_off(&mut self) {
        debug!("usb: udc: VBUS off");
        self.flags.has_power = false;
        if self.flags.attached {
            self.flags.attached = false;
            self.reset_state();
        }
    }

    fn maybe_attach(&mut self) {
        if self.flags.attached || !self.flags.autoattach || !self.flags.has_power {
            return;
        }
        if !self.flags.bus_enabled {
            self.bus.enable();
            self.flags.bus_enabled = true;
        }
        info!("usb: udc: Attached");
        self.flags.attached = true;
    }

    /* Endpoint management */

    /// Reserves hardware for a non-control endpoint.
    ///
    /// Must be called before the first [Udc::attach]: the bus cannot allocate
    /// endpoints once it is enabled. `max_packet_size` is the largest size any
    /// later create call may ask for.
    ///
    /// # Errors
    /// * [UdcError::Unsupported] - if the bus is already enabled
    /// * [UdcError::InvalidEndpoint] - if the address is out of range
    /// * [UdcError::InvalidArg] - if the bus rejects the endpoint
    pub fn reserve_endpoint(
        &mut self,
        addr: EndpointAddress,
        kind: EpKind,
        max_packet_size: u16,
        interval: u8,
    ) -> Result<(), UdcError> {
        if self.flags.bus_enabled {
            return Err(UdcError::Unsupported);
        }
        if self.endpoint(addr)?.hw.is_some() {
            return Ok(());
        }

        let ep_type = match kind {
            EpKind::Bulk => EndpointType::Bulk,
            EpKind::Interrupt => EndpointType::Interrupt,
        };
        self.bus
            .alloc_ep(
                addr.direction(),
                Some(addr),
                ep_type,
                max_packet_size,
                interval,
            )
            .map_err(|_| UdcError::InvalidArg)?;

        self.endpoint_mut(addr)?.hw = Some(HwEndpoint {
            kind,
            max_packet_size,
        });
        trace!("usb: udc: Reserved ep {}", addr);
        Ok(())
    }

    /// Creates a bulk endpoint. Allowed packet sizes: 8,16,32,64,128,256,512
    pub fn create_bulk_endpoint(
        &mut self,
        addr: EndpointAddress,
        max_packet_size: u16,
    ) -> Result<EndpointAddress, UdcError> {
        if !max_packet_size.is_power_of_two() || !(8..=512).contains(&max_packet_size) {
            return Err(UdcError::InvalidArg);
        }
        self.create_endpoint(addr, EpKind::Bulk, max_packet_size)
    }

    /// Creates an interrupt endpoint. Packet size must not exceed 1024
    pub fn create_interrupt_endpoint(
        &mut self,
        addr: EndpointAddress,
        max_packet_size: u16,
    ) -> Result<EndpointAddress, UdcError> {
        if max_packet_size == 0 || max_packet_size as usize > MAX_PACKET_SIZE {
            return Err(UdcError::InvalidArg);
        }
        self.create_endpoint(addr, EpKind::Interrupt, max_packet_size)
    }

    fn create_endpoint(
        &mut self,
        addr: EndpointAddress,
        kind: EpKind,
        max_packet_size: u16,
    ) -> Result<EndpointAddress, UdcError> {
        let ep = self.endpoint_mut(addr)?;
        if ep.allocated {
            return Err(UdcError::Busy);
        }
        match ep.hw {
            Some(hw) if hw.kind == kind && max_packet_size <= hw.max_packet_size => {}
            _ => {
                warn!("usb: udc: Hardware rejected ep {}", addr);
                return Err(UdcError::InvalidArg);
            }
        }

        ep.reset_flags();
        ep.allocated = true;
        ep.enabled = true;
        ep.max_packet_size = max_packet_size;
        self.bus.set_stalled(addr, false);

        debug!("usb: udc: Created ep {}, mps: {}", addr, max_packet_size);
        Ok(addr)
    }

    /// Flushes the endpoint and releases it
    pub fn destroy_endpoint(&mut self, addr: EndpointAddress) -> Result<(), UdcError> {
        self.flush(addr)?;
        self.endpoint_mut(addr)?.reset_flags();
        self.bus.set_stalled(addr, false);
        debug!("usb: udc: Destroyed ep {}", addr);
        Ok(())
    }

    /// Queues an IN request. The transfer starts right away if the endpoint is idle
    pub fn submit_in(&mut self, addr: EndpointAddress, id: RequestId) -> Result<(), UdcError> {
        if !addr.is_in() {
            return Err(UdcError::InvalidEndpoint);
        }
        self.submit(addr, id)?;
        self.pump_in(addr.index());
        Ok(())
    }

    /// Queues an OUT request. The transfer starts right away if the endpoint is idle
    pub fn submit_out(&mut self, addr: EndpointAddress, id: RequestId) -> Result<(), UdcError> {
        if !addr.is_out() {
            return Err(UdcError::InvalidEndpoint);
        }
        self.submit(addr, id)?;
        self.pump_out(addr.index());
        Ok(())
    }

    fn submit(&mut self, addr: EndpointAddress, id: RequestId) -> Result<(), UdcError> {
        let ep = self.endpoint(addr)?;
        if !ep.allocated {
            return Err(UdcError::InvalidEndpoint);
        }
        let enabled = ep.enabled;

        let req = self
            .requests
            .get_mut(id.index())
            .ok_or(UdcError::NoRequest)?;
        req.start();
        trace!("usb: udc: Submit {} bytes on ep {}", req.len(), addr);

        if !enabled {
            // disabled endpoints complete everything right away
            self.complete(addr, id, Status::Flushed);
            return Ok(());
        }

        self.endpoint_mut(addr)?
            .queue
            .push_back(id)
            .map_err(|_| UdcError::Busy)
    }

    /// Aborts every queued request with [Status::Flushed], in submission order
    pub fn flush(&mut self, addr: EndpointAddress) -> Result<(), UdcError> {
        let ep = self.endpoint_mut(addr)?;
        let was_enabled = ep.enabled;
        ep.enabled = false;
        ep.in_flight = None;
        ep.stall_pending = false;

        if addr.is_out() {
            self.drain_out(addr);
        }

        while let Some(id) = self.endpoint_mut(addr)?.queue.pop_front() {
            self.complete(addr, id, Status::Flushed);
        }

        self.endpoint_mut(addr)?.enabled = was_enabled;
        debug!("usb: udc: Flushed ep {}", addr);
        Ok(())
    }

    /// Halts the endpoint.
    ///
    /// An IN endpoint stalls once the packet currently handed to the hardware
    /// is gone. An OUT endpoint stalls right away and drops what the hardware
    /// has already received.
    pub fn set_halt(&mut self, addr: EndpointAddress) -> Result<(), UdcError> {
        let ep = self.endpoint_mut(addr)?;
        ep.halted = true;
        if addr.is_in() && ep.in_flight.is_some() {
            ep.stall_pending = true;
            debug!("usb: udc: Deferred stall on ep {}", addr);
            return Ok(());
        }

        self.bus.set_stalled(addr, true);
        if addr.is_out() {
            self.drain_out(addr);
        }
        info!("usb: udc: Stall ep {}", addr);
        Ok(())
    }

    /// Clears the halt unless the endpoint is wedged
    pub fn clear_halt(&mut self, addr: EndpointAddress) -> Result<(), UdcError> {
        let ep = self.endpoint_mut(addr)?;
        if ep.wedged {
            debug!("usb: udc: Ep {} wedged, halt kept", addr);
            return Ok(());
        }
        ep.halted = false;
        ep.stall_pending = false;
        self.bus.set_stalled(addr, false);
        info!("usb: udc: Unstall ep {}", addr);

        if addr.is_in() {
            self.pump_in(addr.index());
        } else {
            self.pump_out(addr.index());
        }
        Ok(())
    }

    pub fn is_halted(&self, addr: EndpointAddress) -> Result<bool, UdcError> {
        self.endpoint(addr).map(|ep| ep.halted)
    }

    /// Halts the endpoint and makes it ignore [Udc::clear_halt]
    pub fn set_wedge(&mut self, addr: EndpointAddress) -> Result<(), UdcError> {
        self.endpoint_mut(addr)?.wedged = true;
        self.set_halt(addr)
    }

    /// Makes the endpoint honour [Udc::clear_halt] again. The halt itself stays
    pub fn clear_wedge(&mut self, addr: EndpointAddress) -> Result<(), UdcError> {
        self.endpoint_mut(addr)?.wedged = false;
        Ok(())
    }

    pub fn is_wedged(&self, addr: EndpointAddress) -> Result<bool, UdcError> {
        self.endpoint(addr).map(|ep| ep.wedged)
    }

    /// Whether `addr` is a created non-control endpoint or ep0
    pub fn is_valid_endpoint(&self, addr: EndpointAddress) -> bool {
        addr.index() == 0 || self.endpoint(addr).map(|ep| ep.allocated).unwrap_or(false)
    }

    /* Requests */

    pub fn alloc_request(&mut self, owner: Owner) -> Result<RequestId, UdcError> {
        self.requests
            .alloc(Request::new(owner))
            .map(|idx| RequestId(idx as u8))
            .map_err(|_| {
                error!("usb: udc: Out of requests");
                UdcError::NoRequest
            })
    }

    /// Releases a request and drops any of its completions still queued
    pub fn free_request(&mut self, id: RequestId) -> Option<Request> {
        let req = self.requests.free(id.index())?;
        self.drop_events(|event| matches!(event, UdcEvent::Complete(c) if c.req == id));
        Some(req)
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id.index())
    }

    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(id.index())
    }

    /* Test modes */

    /// USB 2.0 high-speed test modes are not implemented by the bus abstraction
    pub fn enter_test_mode(&mut self, mode: u8) -> Result<(), UdcError> {
        warn!("usb: udc: Test mode {} not supported", mode);
        Err(UdcError::Unsupported)
    }

    /* Interrupt handling */

    /// Services the bus. Call from the USB interrupt or the main loop
    pub fn poll(&mut self) {
        if !self.flags.attached {
            return;
        }

        match self.bus.poll() {
            PollResult::None => {}
            PollResult::Reset => {
                info!("usb: udc: Bus reset");
                self.bus.reset();
                self.reset_state();
            }
            PollResult::Suspend => {
                debug!("usb: udc: Suspend");
                self.bus.suspend();
                self.flags.suspended = true;
                self.push_event(UdcEvent::Suspend);
            }
            PollResult::Resume => {
                debug!("usb: udc: Resume");
                self.bus.resume();
                self.flags.suspended = false;
                self.push_event(UdcEvent::Resume);
            }
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            } => {
                if ep_in_complete & 1 != 0 {
                    self.ep0_in_complete();
                }
                if ep_setup & 1 != 0 {
                    self.ep0_setup();
                } else if ep_out & 1 != 0 {
                    self.ep0_out();
                }

                for idx in 1..NR_ENDPOINTS {
                    let bit = 1u16 << idx;
                    if ep_in_complete & bit != 0 {
                        self.in_complete(idx);
                    }
                    if ep_out & bit != 0 {
                        self.pump_out(idx);
                    }
                }
            }
        }

        // packets refused with WouldBlock are retried here
        self.ep0_pump_in();
        for idx in 1..NR_ENDPOINTS {
            self.pump_in(idx);
        }
    }

    fn reset_state(&mut self) {
        self.address = 0;
        self.speed = self.config.speed;
        self.flags.suspended = false;
        self.ep0_reset();
        self.push_event(UdcEvent::Reset);
    }

    fn pump_in(&mut self, idx: usize) {
        let addr = EndpointAddress::from_parts(idx, UsbDirection::In);
        let ep = &mut self.ep_in[idx];
        if !ep.enabled || ep.halted || ep.in_flight.is_some() {
            return;
        }
        let Some(&id) = ep.queue.front() else {
            return;
        };
        let Some(req) = self.requests.get(id.index()) else {
            ep.queue.pop_front();
            return;
        };

        let mut packet = [0u8; MAX_PACKET_SIZE];
        let count = req.peek_tx(&mut packet[..ep.max_packet_size as usize]);
        match self.bus.write(addr, &packet[..count]) {
            Ok(_) => {
                trace!("usb: udc: Wrote {} bytes on ep {}", count, addr);
                ep.in_flight = Some(count);
            }
            Err(UsbError::WouldBlock) => {}
            Err(err) => {
                error!("usb: udc: Write on ep {} failed: {}", addr, err);
                ep.queue.pop_front();
                self.complete(addr, id, Status::Protocol);
            }
        }
    }

    fn in_complete(&mut self, idx: usize) {
        let addr = EndpointAddress::from_parts(idx, UsbDirection::In);
        let ep = &mut self.ep_in[idx];
        let Some(count) = ep.in_flight.take() else {
            return;
        };
        if ep.stall_pending {
            ep.stall_pending = false;
            self.bus.set_stalled(addr, true);
            info!("usb: udc: Stall ep {}", addr);
        }

        let Some(&id) = ep.queue.front() else {
            return;
        };
        let max_packet_size = ep.max_packet_size as usize;
        let done = match self.requests.get_mut(id.index()) {
            Some(req) => {
                req.consume_tx(count);
                req.remaining() == 0 && (count < max_packet_size || !req.short_pkt)
            }
            None => true,
        };

        if done {
            self.ep_in[idx].queue.pop_front();
            self.complete(addr, id, Status::Ok);
        }
        self.pump_in(idx);
    }

    fn pump_out(&mut self, idx: usize) {
        let addr = EndpointAddress::from_parts(idx, UsbDirection::Out);
        let mut packet = [0u8; MAX_PACKET_SIZE];
        loop {
            let ep = &mut self.ep_out[idx];
            if !ep.enabled || ep.halted {
                return;
            }
            let Some(&id) = ep.queue.front() else {
                return;
            };
            let max_packet_size = ep.max_packet_size as usize;

            let count = match self.bus.read(addr, &mut packet[..max_packet_size]) {
                Ok(count) => count,
                Err(UsbError::WouldBlock) => return,
                Err(err) => {
                    error!("usb: udc: Read on ep {} failed: {}", addr, err);
                    return;
                }
            };
            trace!("usb: udc: Read {} bytes on ep {}", count, addr);

            let Some(req) = self.requests.get_mut(id.index()) else {
                self.ep_out[idx].queue.pop_front();
                continue;
            };
            let stored = req.fill_rx(&packet[..count]);
            if stored < count {
                warn!("usb: udc: Ep {} overrun, {} bytes dropped", addr, count - stored);
                // received, not stored: the owner sees the real transfer size
                req.bytes_xfered += count - stored;
            }

            if count < max_packet_size || req.remaining() == 0 {
                self.ep_out[idx].queue.pop_front();
                self.complete(addr, id, Status::Ok);
            }
        }
    }

    fn drain_out(&mut self, addr: EndpointAddress) {
        let mut packet = [0u8; MAX_PACKET_SIZE];
        for _ in 0..MAX_DRAIN_PACKETS {
            match self.bus.read(addr, &mut packet) {
                Ok(count) => trace!("usb: udc: Dropped {} bytes on ep {}", count, addr),
                Err(_) => break,
            }
        }
    }

    fn complete(&mut self, ep: EndpointAddress, id: RequestId, status: Status) {
        if let Some(req) = self.requests.get_mut(id.index()) {
            req.status = status;
        }
        self.push_event(UdcEvent::Complete(Completion {
            ep,
            req: id,
            status,
        }));
    }

    /// Queues `event`. Only the latest reset, SETUP and suspend or resume
    /// stay queued, the rest of the queue belongs to completions
    fn push_event(&mut self, event: UdcEvent) {
        match event {
            // nothing the bus reported before a reset is still true
            UdcEvent::Reset => self.drop_events(|e| !matches!(e, UdcEvent::Complete(_))),
            UdcEvent::Suspend | UdcEvent::Resume => {
                self.drop_events(|e| matches!(e, UdcEvent::Suspend | UdcEvent::Resume))
            }
            // a SETUP aborts the control transfer of the one before
            UdcEvent::Setup(_) => self.drop_events(|e| matches!(e, UdcEvent::Setup(_))),
            UdcEvent::Complete(_) => {}
        }
        if self.events.push_back(event).is_err() {
            error!("usb: udc: Event queue full, dropped {}", event);
        }
    }

    fn drop_events(&mut self, stale: impl Fn(&UdcEvent) -> bool) {
        for _ in 0..self.events.len() {
            if let Some(event) = self.events.pop_front() {
                if !stale(&event) {
                    let _ = self.events.push_back(event);
                }
            }
        }
    }

    fn endpoint(&self, addr: EndpointAddress) -> Result<&Endpoint, UdcError> {
        let idx = addr.index();
        if idx == 0 || idx >= NR_ENDPOINTS {
            return Err(UdcError::InvalidEndpoint);
        }
        Ok(if addr.is_in() {
            &self.ep_in[idx]
        } else {
            &self.ep_out[idx]
        })
    }

    fn endpoint_mut(&mut self, addr: EndpointAddress) -> Result<&mut Endpoint, UdcError> {
        let idx = addr.index();
        if idx == 0 || idx >= NR_ENDPOINTS {
            return Err(UdcError::InvalidEndpoint);
        }
        Ok(if addr.is_in() {
            &mut self.ep_in[idx]
        } else {
            &mut self.ep_out[idx]
        })
    }
}
