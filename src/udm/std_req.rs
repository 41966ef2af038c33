//! Standard device requests. Refer to USB 2.0 spec. 9.4

use super::descriptor::CONFIG_ATTR_SELF_POWERED;
use super::{Interface, Udm, UdmError};
use crate::fmt::{debug, warn};
use crate::udc::setup::{Recipient, SetupPacket};
use crate::udc::{Udc, UsbSpeed};
use usb_device::bus::UsbBus;
use usb_device::control::Request as StdRequest;
use usb_device::endpoint::EndpointAddress;

const FEATURE_TEST_MODE: u16 = 2;

const STATUS_SELF_POWERED: u8 = 1 << 0;
const STATUS_REMOTE_WAKEUP: u8 = 1 << 1;
const STATUS_HALT: u8 = 1 << 0;

const MAX_ADDRESS: u16 = 127;

impl Udm {
    pub(super) fn standard_request<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        setup: &SetupPacket,
    ) -> Result<(), UdmError> {
        let recipient = setup.recipient().ok_or(UdmError::Rejected)?;

        match (setup.request, recipient) {
            (StdRequest::GET_STATUS, recipient) => self.get_status(udc, recipient, setup.index),
            (StdRequest::CLEAR_FEATURE, recipient) => {
                self.clear_feature(udc, recipient, setup.value, setup.index)
            }
            (StdRequest::SET_FEATURE, recipient) => {
                self.set_feature(udc, ifaces, recipient, setup.value, setup.index)
            }
            (StdRequest::SET_ADDRESS, Recipient::Device) => {
                if setup.value > MAX_ADDRESS {
                    return Err(UdmError::Rejected);
                }
                udc.set_address(setup.value as u8);
                udc.ep0_send_status();
                Ok(())
            }
            (StdRequest::GET_DESCRIPTOR, Recipient::Device) => {
                self.get_descriptor(udc, ifaces, setup)
            }
            (StdRequest::GET_CONFIGURATION, Recipient::Device) => {
                udc.ep0_write_sync(&[self.current])?;
                udc.ep0_expect_status();
                Ok(())
            }
            (StdRequest::SET_CONFIGURATION, Recipient::Device) => {
                if udc.address() == 0 || setup.value > u8::MAX as u16 {
                    return Err(UdmError::Rejected);
                }
                self.set_configuration(udc, ifaces, setup.value as u8)?;
                udc.ep0_send_status();
                Ok(())
            }
            (StdRequest::GET_INTERFACE, Recipient::Interface) => {
                let setting = self
                    .interface_setting(setup.index as u8)
                    .ok_or(UdmError::InvalidInterface)?;
                udc.ep0_write_sync(&[setting])?;
                udc.ep0_expect_status();
                Ok(())
            }
            (StdRequest::SET_INTERFACE, Recipient::Interface) => {
                if self.current == 0 {
                    return Err(UdmError::Rejected);
                }
                self.set_interface(udc, ifaces, setup.index as u8, setup.value as u8)?;
                udc.ep0_send_status();
                Ok(())
            }
            // SET_DESCRIPTOR, SYNCH_FRAME and unknown requests
            _ => Err(UdmError::Rejected),
        }
    }

    fn get_status<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        recipient: Recipient,
        index: u16,
    ) -> Result<(), UdmError> {
        let status = match recipient {
            Recipient::Device => {
                let mut status = 0;
                if self.self_powered() {
                    status |= STATUS_SELF_POWERED;
                }
                if self.remote_wakeup {
                    status |= STATUS_REMOTE_WAKEUP;
                }
                status
            }
            Recipient::Interface => {
                self.interface_setting(index as u8)
                    .ok_or(UdmError::InvalidInterface)?;
                0
            }
            Recipient::Endpoint => {
                let addr = endpoint_address(udc, index)?;
                if addr.index() != 0 && udc.is_halted(addr)? {
                    STATUS_HALT
                } else {
                    0
                }
            }
            Recipient::Other => return Err(UdmError::Rejected),
        };

        udc.ep0_write_sync(&[status, 0])?;
        udc.ep0_expect_status();
        Ok(())
    }

    fn clear_feature<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        recipient: Recipient,
        feature: u16,
        index: u16,
    ) -> Result<(), UdmError> {
        match (recipient, feature) {
            (Recipient::Endpoint, StdRequest::FEATURE_ENDPOINT_HALT) => {
                let addr = endpoint_address(udc, index)?;
                if addr.index() != 0 {
                    udc.clear_halt(addr)?;
                }
            }
            (Recipient::Device, StdRequest::FEATURE_DEVICE_REMOTE_WAKEUP) => {
                debug!("usb: udm: Remote wakeup disabled");
                self.remote_wakeup = false;
            }
            _ => return Err(UdmError::Rejected),
        }
        udc.ep0_send_status();
        Ok(())
    }

    fn set_feature<B: UsbBus>(
        &mut self,
        udc: &mut Udc<B>,
        ifaces: &mut [&mut dyn Interface<B>],
        recipient: Recipient,
        feature: u16,
        index: u16,
    ) -> Result<(), UdmError> {
        match (recipient, feature) {
            (Recipient::Endpoint, StdRequest::FEATURE_ENDPOINT_HALT) => {
                let addr = endpoint_address(udc, index)?;
                if addr.index() != 0 {
                    udc.set_halt(addr)?;
                }
            }
            (Recipient::Device, StdRequest::FEATURE_DEVICE_REMOTE_WAKEUP) => {
                debug!("usb: udm: Remote wakeup enabled");
                self.remote_wakeup = true;
            }
            (Recipient::Device, FEATURE_TEST_MODE) => {
                if udc.speed() != UsbSpeed::High || index & 0xFF != 0 {
                    return Err(UdmError::Rejected);
                }
                udc.enter_test_mode((index >> 8) as u8)?;
                // the device must not be configured while in a test mode
                self.set_configuration(udc, ifaces, 0)?;
            }
            _ => return Err(UdmError::Rejected),
        }
        udc.ep0_send_status();
        Ok(())
    }

    fn self_powered(&self) -> bool {
        match self.active_config() {
            Some(config) => config.attributes & CONFIG_ATTR_SELF_POWERED != 0,
            None => self
                .configs
                .first()
                .map(|config| config.attributes & CONFIG_ATTR_SELF_POWERED != 0)
                .unwrap_or(false),
        }
    }
}

fn endpoint_address<B: UsbBus>(udc: &Udc<B>, index: u16) -> Result<EndpointAddress, UdmError> {
    let addr = EndpointAddress::from(index as u8);
    if !udc.is_valid_endpoint(addr) {
        warn!("usb: udm: No endpoint {}", addr);
        return Err(UdmError::Rejected);
    }
    Ok(addr)
}
