//! USB Device Multiplexer
//!
//! Owns the device and configuration descriptors, answers standard control
//! requests and routes class/vendor requests and endpoint completions to the
//! [Interface] drivers of the active configuration.
//!
//! Interface drivers are not stored here: the application keeps them and
//! passes them to [Udm::poll] as a slice. A configuration maps each of its
//! interface numbers to a position in that slice.

pub mod descriptor;
mod std_req;

use crate::buffer::Buffer;
use crate::fmt::{debug, error, info, trace, warn};
use crate::udc::request::{Completion, Owner, Request, RequestId};
use crate::udc::setup::{Recipient, RequestType, SetupPacket};
use crate::udc::{Udc, UdcError, UdcEvent, UsbSpeed};
use descriptor::{DeviceConfig, CONFIG_ATTR_RESERVED, CONFIG_ATTR_SELF_POWERED};
use heapless::Vec;
use usb_device::bus::UsbBus;

/// Maximum number of configurations
pub const MAX_CONFIGS: usize = 2;
/// Maximum number of interfaces per configuration
pub const MAX_INTERFACES: usize = 4;

const MIN_DESC_MEM: usize = descriptor::DEVICE_DESC_LEN;
const DEFAULT_MAX_POWER_MA: u16 = 4;

/// Device multiplexer error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UdmError {
    /// No such configuration, or configuration value out of range
    InvalidConfig,
    /// No such interface in the active configuration
    InvalidInterface,
    /// The request is not supported in the current state
    Rejected,
    /// Endpoint controller error
    Udc(UdcError),
    /// Descriptor memory cannot fit a device descriptor
    BufferTooSmall,
}

impl From<UdcError> for UdmError {
    fn from(err: UdcError) -> Self {
        UdmError::Udc(err)
    }
}

/// A USB interface driver
pub trait Interface<B: UsbBus> {
    /// Reserves the endpoints the driver will create on enable. Called before the bus is attached
    fn reserve_endpoints(&mut self, _udc: &mut Udc<B>) -> Result<(), UdmError> {
        Ok(())
    }

    /// Brings up alternate `setting` of interface `number`
    fn enable(&mut self, udc: &mut Udc<B>, number: u8, setting: u8) -> Result<(), UdmError>;

    /// Tears down whatever `enable` set up
    fn disable(&mut self, udc: &mut Udc<B>);

    /// Handles a class or vendor control request addressed to the interface
    fn setup(&mut self, _udc: &mut Udc<B>, _setup: &SetupPacket) -> Result<(), UdmError> {
        Err(UdmError::Rejected)
    }

    /// Adds the interface and endpoint descriptors for `speed` to `req`,
    /// truncated to `max_len` bytes. Returns the full descriptor length
    fn get_iface_descriptor(
        &mut self,
        number: u8,
        speed: UsbSpeed,
        max_len: usize,
        req: &mut Request,
    ) -> usize;

    /// Takes back the buffer added by `get_iface_descriptor`
    fn free_descriptor(&mut self, _req: &mut Request) {}

    /// A request owned by the interface completed
    fn complete(&mut self, udc: &mut Udc<B>, completion: Completion);

    /// Background work, called on every [Udm::poll] while the interface is enabled
    fn poll(&mut self, _udc: &mut Udc<B>) {}
}

struct Config {
    value: u8,
    nr_ifaces: u8,
    attributes: u8,
    max_power: u8,
    slots: [Option<usize>; MAX_INTERFACES],
}

/// What the ep0 request currently carries
#[derive(Copy, Clone, Eq, PartialEq)]
enum CtrlData {
    None,
    Descriptor,
    ConfigDescriptor(usize),
}

/// USB Device Multiplexer
pub struct Udm {
    device: DeviceConfig,
    configs: Vec<Config, MAX_CONFIGS>,
    current: u8,
    settings: [u8; MAX_INTERFACES],
    strings: &'static [&'static str],
    langid: u16,
    remote_wakeup: bool,
    desc_buf: Option<Buffer>,
    ctrl_req: Option<RequestId>,
    ctrl_data: CtrlData,
}

impl Udm {
    /// Creates a multiplexer building its descriptors in `desc_mem`
    ///
    /// # Errors
    /// * [UdmError::BufferTooSmall] - if `desc_mem` cannot hold a device descriptor
    pub fn new(device: DeviceConfig, desc_mem: &'static mut [u8]) -> Result<Self, UdmError> {
        if desc_mem.len() < MIN_DESC_MEM {
            return Err(UdmError::BufferTooSmall);
        }
        Ok(Udm {
            device,
            configs: Vec::new(),
            current: 0,
            settings: [0; MAX_INTERFACES],
            strings: &[],
            langid: 0x0409,
            remote_wakeup: false,
            desc_buf: Some(Buffer::new(desc_mem)),
            ctrl_req: None,
            ctrl_data: CtrlData::None,
        })
    }

    /// Installs a string table. Index 0 is answered with `langid`, index N
    /// with `strings[N - 1]`. Without a table every string request is rejected
    pub fn with_strings(mut self, strings: &'static [&'static str], langid: u16) -> Self {
        self.strings = strings;
        self.langid = langid;
        self
    }

    /// Declares configuration `value` with `nr_ifaces` interfaces
    pub fn create_config(&mut self, value: u8, nr_ifaces: u8) -> Result<(), UdmError> {
        if value == 0
            || value as usize > MAX_CONFIGS
            || nr_ifaces as usize > MAX_INTERFACES
            || self.configs.iter().any(|c| c.value == value)
        {
            return Err(UdmError::InvalidConfig);
        }
        self.configs
            .push(Config {
                value,
                nr_ifaces,
                attributes: CONFIG_ATTR_RESERVED | CONFIG_ATTR_SELF_POWERED,
                max_power: (DEFAULT_MAX_POWER_MA / 2) as u8,
                slots: [None; MAX_INTERFACES],
            })
            .map_err(|_| UdmError::InvalidConfig)
    }

    /// Maps interface `number` of configuration `value` to `slot` in the
    /// interface slice passed to [Udm::poll]
    pub fn add_interface(&mut self, value: u8, number: u8, slot: usize) -> Result<(), UdmError> {
        let config = self.config_mut(value)?;
        if number >= config.nr_ifaces {
            return Err(UdmError::InvalidInterface);
        }
        config.slots[number as usize] = Some(slot);
        Ok(())
    }

    /// Power drawn from the bus in configuration `value`, in mA
    pub fn set_max_power(&mut self, value: u8, milliamps: u16) -> Result<(), UdmError> {
        self.config_mut(value)?.max_power = (milliamps.min(500) / 2) as u8;
        Ok(())
    }

    pub fn set_self_powered(&mut self, value: u8) -> Result<(), UdmError> {
        self.config_mut(value)?.attributes |= CONFIG_ATTR_SELF_POWERED;
        Ok(())
    }

    pub fn set_bus_powered(&mut self, value: u8) -> Result<(), UdmError> {
        self.config_mut(value)?.attributes &= !CONFIG_ATTR_SELF_POWERED;
        Ok(())
    }

    /// Active configuration value, 0 if unconfigured
    pub fn configuration(&self) -> u8 {
        self.current
    }

    /// Active alternate setting of interface `number`
    pub fn interface_setting(&self, number: u8) -> Option<u8> {
        let config = self.active_config()?;
        (number < config.nr_ifaces).then(|| self.settings[number as usize])
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    /// Reserves the endpoints of every registered interface. Call before [Udc::attach]
    pub fn reserve_endpoints<B: UsbBus>(
        &self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
    ) -> Result<(), UdmError> {
        for iface in ifaces.iter_mut() {
            iface.reserve_endpoints(udc)?;
        }
        Ok(())
    }

    /// Services the controller and dispatches everything it reported
    pub fn poll<B: UsbBus>(&mut self, udc: &mut Udc<B>, ifaces: &mut [&mut dyn Interface<B>]) {
        udc.poll();
        self.dispatch_events(udc, ifaces);

        if let Some(config) = self.active_config() {
            let slots = config.slots;
            for slot in slots.iter().take(config.nr_ifaces as usize).flatten() {
                if let Some(iface) = ifaces.get_mut(*slot) {
                    iface.poll(udc);
                }
            }
            self.dispatch_events(udc, ifaces);
        }
    }

    fn dispatch_events<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
    ) {
        while let Some(event) = udc.take_event() {
            match event {
                UdcEvent::Reset => {
                    self.remote_wakeup = false;
                    if self.current != 0 {
                        let _ = self.set_configuration(udc, ifaces, 0);
                    }
                }
                UdcEvent::Setup(setup) => {
                    if let Err(err) = self.process_setup(udc, ifaces, &setup) {
                        debug!("usb: udm: Rejected {}: {}", setup, err);
                        udc.ep0_stall();
                    }
                }
                UdcEvent::Complete(completion) => {
                    match udc.request(completion.req).map(Request::owner) {
                        Some(Owner::Device) => self.ctrl_complete(udc, ifaces, completion),
                        Some(Owner::Interface(number)) => {
                            match self.iface_slot(number).and_then(|slot| ifaces.get_mut(slot)) {
                                Some(iface) => iface.complete(udc, completion),
                                None => warn!("usb: udm: No interface {} for completion", number),
                            }
                        }
                        None => {}
                    }
                }
                UdcEvent::Suspend | UdcEvent::Resume => {}
            }
        }
    }

    fn process_setup<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        setup: &SetupPacket,
    ) -> Result<(), UdmError> {
        trace!("usb: udm: Setup {}", setup);

        if setup.kind() == RequestType::Standard {
            return self.standard_request(udc, ifaces, setup);
        }

        // class and vendor requests go to the addressed interface
        if setup.recipient() != Some(Recipient::Interface) {
            return Err(UdmError::Rejected);
        }
        let number = (setup.index & 0xFF) as u8;
        let slot = self.iface_slot(number).ok_or(UdmError::InvalidInterface)?;
        let iface = ifaces.get_mut(slot).ok_or(UdmError::InvalidInterface)?;
        iface.setup(udc, setup)
    }

    /// Switches to configuration `value`, 0 to unconfigure.
    ///
    /// The old configuration's interfaces are disabled in reverse order, the
    /// new ones enabled in order. If one fails to enable, those already
    /// enabled are disabled again and the device stays unconfigured.
    pub fn set_configuration<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        value: u8,
    ) -> Result<(), UdmError> {
        let new = match value {
            0 => None,
            value => Some(self.config_index(value).ok_or(UdmError::InvalidConfig)?),
        };

        if let Some(old) = self.active_config() {
            let slots = old.slots;
            for slot in slots.iter().take(old.nr_ifaces as usize).rev().flatten() {
                if let Some(iface) = ifaces.get_mut(*slot) {
                    iface.disable(udc);
                }
            }
        }
        self.current = 0;
        self.settings = [0; MAX_INTERFACES];

        let Some(new) = new else {
            info!("usb: udm: Unconfigured");
            return Ok(());
        };

        let config = &self.configs[new];
        let (nr_ifaces, slots) = (config.nr_ifaces, config.slots);
        for number in 0..nr_ifaces {
            let res = match slots[number as usize].and_then(|slot| ifaces.get_mut(slot)) {
                Some(iface) => iface.enable(udc, number, 0),
                None => Err(UdmError::InvalidInterface),
            };
            if let Err(err) = res {
                error!("usb: udm: Interface {} enable failed: {}", number, err);
                for slot in slots.iter().take(number as usize).rev().flatten() {
                    if let Some(iface) = ifaces.get_mut(*slot) {
                        iface.disable(udc);
                    }
                }
                return Err(err);
            }
        }

        self.current = value;
        info!("usb: udm: Configuration {}", value);
        Ok(())
    }

    /// Switches interface `number` of the active configuration to `setting`
    fn set_interface<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        number: u8,
        setting: u8,
    ) -> Result<(), UdmError> {
        let slot = self.iface_slot(number).ok_or(UdmError::InvalidInterface)?;
        let iface = ifaces.get_mut(slot).ok_or(UdmError::InvalidInterface)?;

        iface.disable(udc);
        match iface.enable(udc, number, setting) {
            Ok(()) => {
                self.settings[number as usize] = setting;
                debug!("usb: udm: Interface {} setting {}", number, setting);
                Ok(())
            }
            Err(err) => {
                let previous = self.settings[number as usize];
                let _ = iface.enable(udc, number, previous);
                Err(err)
            }
        }
    }

    /* Descriptors */

    fn get_descriptor<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        setup: &SetupPacket,
    ) -> Result<(), UdmError> {
        let desc_type = (setup.value >> 8) as u8;
        let desc_index = (setup.value & 0xFF) as usize;
        let max_len = setup.length as usize;

        // no data stage
        if max_len == 0 {
            let known = match desc_type {
                usb_device::descriptor::descriptor_type::DEVICE
                | usb_device::descriptor::descriptor_type::CONFIGURATION
                | usb_device::descriptor::descriptor_type::STRING => true,
                descriptor::DEVICE_QUALIFIER | descriptor::OTHER_SPEED_CONFIGURATION => {
                    self.device.high_speed_capable
                }
                _ => false,
            };
            if !known {
                return Err(UdmError::Rejected);
            }
            udc.ep0_send_status();
            return Ok(());
        }

        let id = self.ctrl_request(udc)?;
        let mut buf = self.desc_buf.take().ok_or(UdmError::Rejected)?;
        buf.set_len(buf.capacity());
        let speed = udc.speed();
        let mps0 = udc.max_packet_size_0() as u8;
        let nr_configs = self.configs.len() as u8;

        let built = match desc_type {
            usb_device::descriptor::descriptor_type::DEVICE => {
                descriptor::device(&self.device, mps0, nr_configs, buf.as_mut_slice());
                Ok(descriptor::DEVICE_DESC_LEN)
            }
            descriptor::DEVICE_QUALIFIER if self.device.high_speed_capable => {
                descriptor::device_qualifier(mps0, nr_configs, buf.as_mut_slice());
                Ok(descriptor::QUALIFIER_DESC_LEN)
            }
            usb_device::descriptor::descriptor_type::CONFIGURATION => {
                self.prep_config_desc(udc, ifaces, id, buf, desc_type, desc_index, speed, max_len)?;
                return self.submit_descriptor(udc, id, max_len);
            }
            descriptor::OTHER_SPEED_CONFIGURATION if self.device.high_speed_capable => {
                let other = match speed {
                    UsbSpeed::High => UsbSpeed::Full,
                    _ => UsbSpeed::High,
                };
                self.prep_config_desc(udc, ifaces, id, buf, desc_type, desc_index, other, max_len)?;
                return self.submit_descriptor(udc, id, max_len);
            }
            usb_device::descriptor::descriptor_type::STRING => {
                self.string_descriptor(desc_index, setup.index, buf.as_mut_slice())
            }
            _ => Err(UdmError::Rejected),
        };

        let len = match built {
            Ok(len) => len,
            Err(err) => {
                self.desc_buf = Some(buf);
                return Err(err);
            }
        };

        buf.set_len(len.min(max_len));
        if let Some(req) = udc.request_mut(id) {
            if let Err(buf) = req.add_buffer(buf) {
                self.desc_buf = Some(buf);
                return Err(UdmError::Rejected);
            }
        }
        self.ctrl_data = CtrlData::Descriptor;
        self.submit_descriptor(udc, id, max_len)
    }

    fn string_descriptor(&self, index: usize, langid: u16, out: &mut [u8]) -> Result<usize, UdmError> {
        if self.strings.is_empty() {
            return Err(UdmError::Rejected);
        }
        if index == 0 {
            return Ok(descriptor::langid(self.langid, out));
        }
        if langid != self.langid {
            return Err(UdmError::Rejected);
        }
        let s = self.strings.get(index - 1).ok_or(UdmError::Rejected)?;
        Ok(descriptor::string(s, out))
    }

    #[allow(clippy::too_many_arguments)]
    fn prep_config_desc<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        id: RequestId,
        mut buf: Buffer,
        desc_type: u8,
        index: usize,
        speed: UsbSpeed,
        max_len: usize,
    ) -> Result<(), UdmError> {
        let Some(config) = self.configs.get(index) else {
            self.desc_buf = Some(buf);
            return Err(UdmError::InvalidConfig);
        };
        let Some(req) = udc.request_mut(id) else {
            self.desc_buf = Some(buf);
            return Err(UdmError::Rejected);
        };

        let mut total_len = descriptor::CONFIG_DESC_LEN;
        let mut len = max_len.min(total_len);
        buf.set_len(len);
        if let Err(buf) = req.add_buffer(buf) {
            self.desc_buf = Some(buf);
            return Err(UdmError::Rejected);
        }

        for number in 0..config.nr_ifaces {
            let Some(iface) = config.slots[number as usize].and_then(|slot| ifaces.get_mut(slot)) else {
                continue;
            };
            let remaining = max_len - len;
            let iface_len = iface.get_iface_descriptor(number, speed, remaining, req);
            total_len += iface_len;
            len += iface_len.min(remaining);
        }

        if let Some(header) = req.first_buffer_mut() {
            let mut raw = [0u8; descriptor::CONFIG_DESC_LEN];
            descriptor::configuration(
                desc_type,
                total_len as u16,
                config.nr_ifaces,
                config.value,
                config.attributes,
                config.max_power,
                &mut raw,
            );
            let header_len = header.len();
            header.as_mut_slice().copy_from_slice(&raw[..header_len]);
        }

        trace!("usb: udm: Config descriptor {} of {} bytes", len, total_len);
        self.ctrl_data = CtrlData::ConfigDescriptor(index);
        Ok(())
    }

    fn submit_descriptor<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        id: RequestId,
        max_len: usize,
    ) -> Result<(), UdmError> {
        if let Some(req) = udc.request_mut(id) {
            req.short_pkt = req.len() < max_len;
        }
        udc.ep0_submit_in(id)?;
        Ok(())
    }

    fn ctrl_complete<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        completion: Completion,
    ) {
        let Some(req) = udc.request_mut(completion.req) else {
            return;
        };

        if let CtrlData::ConfigDescriptor(index) = self.ctrl_data {
            if let Some(config) = self.configs.get(index) {
                for slot in config.slots.iter().take(config.nr_ifaces as usize).rev().flatten() {
                    if let Some(iface) = ifaces.get_mut(*slot) {
                        iface.free_descriptor(req);
                    }
                }
            }
        }
        if self.ctrl_data != CtrlData::None {
            self.desc_buf = req.take_buffers().into_iter().next();
            self.ctrl_data = CtrlData::None;
        }

        if completion.status.is_ok() {
            udc.ep0_expect_status();
        }
    }

    fn ctrl_request<B: UsbBus>(&mut self, udc: &mut Udc<B>) -> Result<RequestId, UdmError> {
        match self.ctrl_req {
            Some(id) => Ok(id),
            None => {
                let id = udc.alloc_request(Owner::Device)?;
                self.ctrl_req = Some(id);
                Ok(id)
            }
        }
    }

    /* Lookup */

    fn config_index(&self, value: u8) -> Option<usize> {
        self.configs.iter().position(|c| c.value == value)
    }

    fn config_mut(&mut self, value: u8) -> Result<&mut Config, UdmError> {
        self.configs
            .iter_mut()
            .find(|c| c.value == value)
            .ok_or(UdmError::InvalidConfig)
    }

    fn active_config(&self) -> Option<&Config> {
        match self.current {
            0 => None,
            value => self.configs.iter().find(|c| c.value == value),
        }
    }

    fn iface_slot(&self, number: u8) -> Option<usize> {
        let config = self.active_config()?;
        if number >= config.nr_ifaces {
            return None;
        }
        config.slots[number as usize]
    }
}
