//! EHCI USB host controller driver and device-enumeration state machine.
//!
//! This crate drives a USB host port directly: it discovers an EHCI
//! controller on the PCI bus, brings it up, and runs the enumeration state
//! machine that takes a newly attached device from address 0 to mounted,
//! all through asynchronous and periodic schedules interpreted by the
//! controller hardware over DMA. It targets a `no_std`, single-core,
//! bare-metal environment booted directly by firmware (a coreboot payload),
//! with no heap and an identity page mapping already established by the
//! time `init` runs.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod arch;
pub mod drivers;
pub mod logger;
pub mod pci;
pub mod platform;
pub mod serial;
pub mod time;

use core::panic::PanicInfo;

/// Global panic handler.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}

/// Bring up the driver stack: serial console, logging, then every EHCI
/// controller found on the PCI bus.
///
/// Called once from the coreboot-payload entry point after the 32-to-64-bit
/// mode transition. Returns the number of controllers successfully
/// initialized so the caller can decide whether to enter the poll loop.
pub fn init() -> usize {
    serial::init_early();
    logger::init();

    log::info!("ehci-usb-host v{} starting...", env!("CARGO_PKG_VERSION"));

    match drivers::usb::init() {
        Ok(count) => {
            log::info!("usb: {count} controller(s) initialized");
            count
        }
        Err(e) => {
            log::error!("usb: controller discovery failed: {e:?}");
            0
        }
    }
}

/// Cooperative main loop: repeatedly poll every registered controller.
///
/// This target wires no interrupt vector for the EHCI IRQ, so `hcd_isr` and
/// the enumeration task are both driven from this loop rather than from a
/// real interrupt context; see the Open Questions entry in DESIGN.md.
pub fn run() -> ! {
    loop {
        drivers::usb::poll_all();
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}
