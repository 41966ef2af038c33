//! USB Mass Storage device stack for [usb-device]
//!
//! # Layers:
//! * [Udc] - endpoint controller: request queues, ep0 state machine, halts
//! * [Udm] - device multiplexer: descriptors, standard requests, configurations
//! * [Msc] - SCSI transparent command set over Bulk Only Transport
//! * [BlockDevice] - asynchronous block device contract, with a [DataFlash] backend
//!
//! Nothing is called back from inside a layer: the controller queues
//! events, the multiplexer drains them and hands them to interface drivers,
//! block devices queue their own events for the driver to drain.
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `bbb` | Include Bulk Only Transport           |
//! | `scsi` | Include SCSI subclass and the mass storage function |
//! | `dataflash` | Include the AT45 DataFlash block device |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [Udc]: crate::udc::Udc
//! [Udm]: crate::udm::Udm
//! [Msc]: crate::subclass::msc::Msc
//! [BlockDevice]: crate::block::BlockDevice
//! [DataFlash]: crate::block::dataflash::DataFlash

#![no_std]

pub mod block;
pub mod buffer;
pub(crate) mod fmt;
pub(crate) mod pool;
pub mod subclass;
pub mod transport;
pub mod udc;
pub mod udm;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
