//! Hardware drivers.
//!
//! The EHCI USB host controller driver lives here; PCI discovery and the
//! serial console sit at the crate root (`crate::pci`, `crate::serial`)
//! since they are shared platform plumbing rather than USB-specific.

pub mod usb;
