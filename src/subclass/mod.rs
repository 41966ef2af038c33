//! USB Mass Storage subclasses

#[cfg(all(feature = "scsi", feature = "bbb"))]
pub mod msc;
#[cfg(feature = "scsi")]
pub mod scsi;
#[cfg(feature = "scsi")]
pub mod sense;

/// Interface subclass for specific command sets
pub const SUBCLASS_VENDOR_SPECIFIC: u8 = 0xFF;
