//! Main entry point for the EHCI USB host controller driver.
//!
//! This is the binary entry point when the driver is booted directly as a
//! coreboot payload, standing in for the larger firmware the donor would
//! chain-load next (out of scope here, see `SPEC_FULL.md` §1 Non-goals).

#![no_std]
#![no_main]

use ehci_usb_host as driver;

/// Rust entry point called from assembly after the 32-to-64-bit mode
/// transition and page table setup.
#[unsafe(no_mangle)]
pub extern "C" fn rust_main() -> ! {
    driver::init();
    driver::run();
}
