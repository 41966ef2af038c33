use super::bus::DummyUsbBus;
use super::leak;
use usb_device::control::Request;
use usbd_msc::udc::{Udc, UdcConfig};
use usbd_msc::udm::descriptor::DeviceConfig;
use usbd_msc::udm::{Interface, Udm};

/// Polls per host step, enough for every queued transfer to settle
pub const POLLS: usize = 64;
pub const ADDRESS: u8 = 5;

pub const DIR_IN: u8 = 0x80;
pub const TYPE_CLASS: u8 = 0x20;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;

pub fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [v0, v1] = value.to_le_bytes();
    let [i0, i1] = index.to_le_bytes();
    let [l0, l1] = length.to_le_bytes();
    [request_type, request, v0, v1, i0, i1, l0, l1]
}

/// A device with a single configuration holding `iface` as interface 0
pub struct TestDevice<I: Interface<DummyUsbBus>> {
    pub bus: DummyUsbBus,
    pub udc: Udc<DummyUsbBus>,
    pub udm: Udm,
    pub iface: I,
}

impl<I: Interface<DummyUsbBus>> TestDevice<I> {
    pub fn new(device: DeviceConfig, udc_config: UdcConfig, iface: I) -> Self {
        let udm = Udm::new(device, leak(256)).unwrap();
        Self::with_udm(udm, udc_config, iface)
    }

    pub fn with_udm(mut udm: Udm, udc_config: UdcConfig, iface: I) -> Self {
        let bus = DummyUsbBus::new();
        let udc = Udc::new(bus.clone(), udc_config).unwrap();
        udm.create_config(1, 1).unwrap();
        udm.add_interface(1, 0, 0).unwrap();

        let mut dev = TestDevice {
            bus,
            udc,
            udm,
            iface,
        };
        {
            let mut ifaces: [&mut dyn Interface<DummyUsbBus>; 1] = [&mut dev.iface];
            dev.udm.reserve_endpoints(&mut dev.udc, &mut ifaces).unwrap();
        }
        dev.udc.attach();
        dev
    }

    pub fn poll(&mut self) {
        let mut ifaces: [&mut dyn Interface<DummyUsbBus>; 1] = [&mut self.iface];
        self.udm.poll(&mut self.udc, &mut ifaces);
    }

    pub fn run(&mut self) {
        for _ in 0..POLLS {
            self.poll();
        }
    }

    /// Runs a control transfer. Returns the IN data, empty for OUT
    /// transfers, or `None` if the device stalled
    pub fn control(&mut self, setup: [u8; 8]) -> Option<Vec<u8>> {
        self.bus.setup(setup);
        self.run();
        let data = self.bus.read(0);
        if self.bus.is_stalled_in(0) {
            return None;
        }
        if setup[0] & DIR_IN != 0 {
            // status stage
            self.bus.write(0, &[]);
            self.run();
        }
        Some(data)
    }

    /// Bus reset, SET_ADDRESS and SET_CONFIGURATION 1
    pub fn enumerate(&mut self) {
        self.bus.bus_reset();
        self.run();
        self.control(setup_packet(0, Request::SET_ADDRESS, ADDRESS as u16, 0, 0))
            .expect("SET_ADDRESS");
        assert_eq!(ADDRESS, self.udc.address());
        self.control(setup_packet(0, Request::SET_CONFIGURATION, 1, 0, 0))
            .expect("SET_CONFIGURATION");
        assert_eq!(1, self.udm.configuration());
    }
}
