//! Hardware Abstraction (§4.A): typed MMIO register access, controller
//! lifecycle, and port control. Grounded on the donor's `usb::ehci`
//! `EhciController::new`/`init`/`cleanup` sequence and on the `Timeout`
//! spin-wait idiom used throughout `sdhci::SdhciController`.

use core::sync::atomic::{fence, Ordering};

use super::error::{UsbError, UsbResult};
use super::regs::{
    qh_link, usblegsup, EhciCapRegs, EhciOpRegs, EhciPortRegs, CAPLENGTH_HCIVERSION, HCSPARAMS,
    OP_PORTSC_BASE, PORTSC,
};
use crate::pci::PciDevice;
use crate::time::{wait_until, Timeout};

/// EHCI reset/stop handshakes must complete within 2 frames (EHCI §2.3.1).
const CONTROLLER_TIMEOUT_MS: u64 = 2;
/// Port reset hold time per USB 2.0 §7.1.7.5.
const PORT_RESET_MS: u64 = 50;
/// Settle time after releasing port reset before reading PE.
const PORT_RESET_RECOVERY_MS: u64 = 10;

pub struct EhciHal {
    cap: *const EhciCapRegs,
    op: *mut EhciOpRegs,
    num_ports: u8,
}

// SAFETY: the HAL is only ever driven from a single controller-owning task
// and the ISR, which never execute concurrently on this single-core target
// (§5 "Shared-resource policy").
unsafe impl Send for EhciHal {}

impl EhciHal {
    /// Map the capability/operational register blocks from an MMIO base
    /// address discovered via PCI BAR0.
    ///
    /// # Safety
    /// `mmio_base` must be the valid, enabled MMIO BAR0 of an EHCI controller.
    pub unsafe fn new(mmio_base: u64) -> Self {
        let cap = mmio_base as *const EhciCapRegs;
        let caplength = (*cap).caplength_hciversion.read(CAPLENGTH_HCIVERSION::CAPLENGTH) as u64;
        let op = (mmio_base + caplength) as *mut EhciOpRegs;
        let num_ports = (*cap).hcsparams.read(HCSPARAMS::N_PORTS) as u8;
        EhciHal { cap, op, num_ports }
    }

    pub fn num_ports(&self) -> u8 {
        self.num_ports
    }

    fn cap(&self) -> &EhciCapRegs {
        unsafe { &*self.cap }
    }

    fn op(&self) -> &EhciOpRegs {
        unsafe { &*self.op }
    }

    fn port(&self, port: u8) -> &EhciPortRegs {
        debug_assert!(port < self.num_ports);
        let op_base = self.op as u64;
        unsafe { &*((op_base + OP_PORTSC_BASE + port as u64 * 4) as *const EhciPortRegs) }
    }

    /// Take ownership of the controller from BIOS/SMM via the USBLEGSUP
    /// extended capability, if present (EHCI §2.1.7). Not all controllers
    /// implement legacy support; absence of the capability means the OS
    /// already owns the controller.
    pub fn handoff_from_bios(&self, pci_dev: &PciDevice) {
        let eecp = self.cap().hccparams.read(super::regs::HCCPARAMS::EECP) as u8;
        if eecp < 0x40 {
            return;
        }
        let cap_id = pci_dev.address.read32(eecp) & 0xFF;
        if cap_id as u8 != super::regs::USBLEGSUP_CAP_ID {
            return;
        }
        let legsup_offset = eecp;
        let mut legsup = pci_dev.address.read32(legsup_offset);
        legsup |= usblegsup::HC_OS_OWNED;
        pci_dev.address.write32(legsup_offset, legsup);

        let timeout = Timeout::from_ms(100);
        wait_until(timeout, || {
            pci_dev.address.read32(legsup_offset) & usblegsup::HC_BIOS_OWNED == 0
        });
    }

    /// Stop the controller: clear run/stop and wait for `HCHALTED` (used
    /// before reset, matching `hcd_controller_stop`/the donor's `cleanup`).
    pub fn controller_stop(&self) -> UsbResult<()> {
        self.op().usbcmd.modify(super::regs::USBCMD::RS::CLEAR);
        let timeout = Timeout::from_ms(CONTROLLER_TIMEOUT_MS);
        let halted = wait_until(timeout, || self.op().usbsts.is_set(super::regs::USBSTS::HCHALTED));
        if halted {
            Ok(())
        } else {
            Err(UsbError::Timeout)
        }
    }

    /// Reset the controller (`HCRESET`) and wait for hardware to clear it.
    pub fn controller_reset(&self) -> UsbResult<()> {
        self.op().usbcmd.modify(super::regs::USBCMD::HCRESET::SET);
        let timeout = Timeout::from_ms(500);
        let done = wait_until(timeout, || !self.op().usbcmd.is_set(super::regs::USBCMD::HCRESET));
        if done {
            Ok(())
        } else {
            Err(UsbError::Timeout)
        }
    }

    /// Full controller bring-up (§4.A): stop if running, reset, install the
    /// async/periodic list bases, clear and arm the interrupt-enable mask,
    /// then set run/stop and async-schedule-enable and power every port.
    pub fn controller_init(&self, async_head_addr: u32, periodic_list_addr: u32) -> UsbResult<()> {
        if !self.op().usbsts.is_set(super::regs::USBSTS::HCHALTED) {
            self.controller_stop()?;
        }
        self.controller_reset()?;

        self.op().usbsts.set(0xFFFF_FFFF);
        self.op().usbintr.write(
            super::regs::USBINTR::USBIE::SET
                + super::regs::USBINTR::USBEIE::SET
                + super::regs::USBINTR::PCIE::SET
                + super::regs::USBINTR::IAAE::SET,
        );

        self.op().ctrldssegment.set(0);
        self.op().periodiclistbase.set(periodic_list_addr);
        self.op().asynclistaddr.set(async_head_addr | qh_link::TYPE_QH);
        fence(Ordering::SeqCst);

        self.op().configflag.write(super::regs::CONFIGFLAG::CF::SET);

        self.op().usbcmd.write(
            super::regs::USBCMD::RS::SET
                + super::regs::USBCMD::ASE::SET
                + super::regs::USBCMD::PSE::SET
                + super::regs::USBCMD::FLS::Size1024
                + super::regs::USBCMD::ITC::Micro8,
        );

        crate::time::delay_ms(100);

        for port in 0..self.num_ports {
            self.port(port).portsc.modify(PORTSC::PP::SET);
        }

        Ok(())
    }

    /// Assert and hold port reset for the USB-mandated 50 ms, then release
    /// and allow 10 ms recovery before the caller checks `PE` (§4.F step 1 /
    /// USB 2.0 §7.1.7.5).
    pub fn port_reset(&self, port: u8) {
        self.port(port).portsc.modify(PORTSC::PR::SET);
        crate::time::delay_ms(PORT_RESET_MS);
        self.port(port).portsc.modify(PORTSC::PR::CLEAR);
        crate::time::delay_ms(PORT_RESET_RECOVERY_MS);
    }

    pub fn port_connect_status(&self, port: u8) -> bool {
        self.port(port).portsc.is_set(PORTSC::CCS)
    }

    pub fn port_enabled(&self, port: u8) -> bool {
        self.port(port).portsc.is_set(PORTSC::PE)
    }

    pub fn port_low_speed(&self, port: u8) -> bool {
        self.port(port).portsc.read(PORTSC::LS) == PORTSC::LS::KState.value
    }

    /// Clear the write-1-to-clear status bits (CSC|PEC|OCC) without
    /// disturbing the read/write bits sharing the register: writing back the
    /// value just read clears any W1C bit currently set and leaves every
    /// other bit exactly as it was.
    pub fn port_clear_status_changes(&self, port: u8) {
        let current = self.port(port).portsc.get();
        self.port(port).portsc.set(current);
    }

    /// Release ownership of a low/full-speed port to a companion controller
    /// (EHCI §4.2). No-op when there is no companion controller wired up.
    pub fn port_release_ownership(&self, port: u8) {
        self.port(port).portsc.modify(PORTSC::PO::SET);
    }

    pub fn status_raw(&self) -> u32 {
        self.op().usbsts.get()
    }

    pub fn status_ack(&self, bits: u32) {
        self.op().usbsts.set(bits);
    }

    pub fn interrupt_enable_mask(&self) -> u32 {
        self.op().usbintr.get()
    }

    pub fn ring_async_doorbell(&self) {
        self.op().usbcmd.modify(super::regs::USBCMD::IAAD::SET);
    }
}
