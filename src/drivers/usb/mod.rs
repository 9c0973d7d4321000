//! EHCI USB host controller driver and device-enumeration state machine.
//!
//! Module layout mirrors the component table: [`hal`] (A), [`pool`] (B),
//! [`list`] (C), [`pipe`] (D), [`isr`] (E), [`enumerate`] (F), [`shim`] (G),
//! plus the supporting [`regs`], [`desc`], [`qh`], and [`error`] modules.

pub mod desc;
pub mod enumerate;
pub mod error;
pub mod hal;
pub mod isr;
pub mod list;
pub mod pipe;
pub mod pool;
pub mod qh;
pub mod regs;
pub mod shim;

use heapless::spsc::Queue;
use spin::Mutex;

use desc::EndpointType;
use error::{UsbError, UsbResult};
use hal::EhciHal;
use pool::{DevicePools, PoolIndex, HOST_DEVICE_MAX};
use qh::QueueHead;
use shim::{DeviceTable, NullStackCallbacks, PipeHandle, PipeKind, PortEvent, UsbStackCallbacks};

/// Periodic framelist size (matches `USBCMD::FLS::Size1024` in `hal::controller_init`).
const PERIODIC_LIST_SIZE: usize = 1024;

#[repr(align(4096))]
struct Framelist([u32; PERIODIC_LIST_SIZE]);

/// One EHCI host controller, its schedules, device table, and enumeration
/// task. Constructed once per discovered controller and kept in
/// [`CONTROLLERS`] for the lifetime of the firmware, matching the
/// always-on singleton-registry pattern the donor uses for its other
/// host-controller drivers.
pub struct EhciController {
    hal: EhciHal,
    async_head: QueueHead,
    periodic_head: QueueHead,
    framelist: Framelist,
    devices: DevicePools,
    device_table: DeviceTable,
    port_events: Queue<PortEvent, 8>,
    enumeration: enumerate::EnumerationTask,
    core_id: u8,
}

impl EhciController {
    /// Discover, take ownership of, and bring up an EHCI controller
    /// (`hcd_init`, §6). `core_id` identifies this controller among any
    /// others present, matching the donor's multi-controller device table
    /// fields (`hub_addr`/`core_id`).
    pub fn new(pci_dev: crate::pci::PciDevice, core_id: u8) -> UsbResult<Self> {
        pci_dev.enable();
        let mmio_base = pci_dev.mmio_base().ok_or(UsbError::PciDeviceNotFound)?;
        let hal = unsafe { EhciHal::new(mmio_base) };
        hal.handoff_from_bios(&pci_dev);

        let mut controller = EhciController {
            hal,
            async_head: QueueHead::empty(),
            periodic_head: QueueHead::empty(),
            framelist: Framelist([0; PERIODIC_LIST_SIZE]),
            devices: DevicePools::empty(),
            device_table: DeviceTable::empty(),
            port_events: Queue::new(),
            enumeration: enumerate::EnumerationTask::new(),
            core_id,
        };

        controller.async_head.init_async_head();
        controller.periodic_head.init_async_head();

        let periodic_entry = list::periodic_entry_for(&controller.periodic_head);
        for slot in controller.framelist.0.iter_mut() {
            *slot = periodic_entry;
        }

        let async_addr = list::link_address(&controller.async_head);
        let framelist_addr = controller.framelist.0.as_ptr() as u32;
        controller.hal.controller_init(async_addr, framelist_addr)?;

        log::info!(
            "usb: controller {} initialized, {} ports",
            core_id,
            controller.hal.num_ports()
        );

        Ok(controller)
    }

    pub fn num_ports(&self) -> u8 {
        self.hal.num_ports()
    }

    /// Reset a single port and report whether it came up enabled
    /// (`hcd_port_reset`, §6).
    pub fn port_reset(&self, port: u8) -> bool {
        self.hal.port_reset(port);
        self.hal.port_enabled(port)
    }

    pub fn port_connect_status(&self, port: u8) -> bool {
        self.hal.port_connect_status(port)
    }

    /// Interrupt-vector (or poll-loop) entry point, `hcd_isr` (§6).
    pub fn hcd_isr(&mut self, callbacks: &mut dyn UsbStackCallbacks) {
        let mut ctx = isr::IsrContext {
            hal: &self.hal,
            async_head: &mut self.async_head,
            periodic_head: &mut self.periodic_head,
            devices: &mut self.devices.devices,
            device_table: &mut self.device_table,
            port_events: &mut self.port_events,
            core_id: self.core_id,
        };
        isr::hcd_isr(&mut ctx, callbacks);
    }

    /// Step the enumeration state machine, consuming one queued port event
    /// if present (§4.F, §5 "suspension points").
    pub fn poll_enumeration(&mut self, callbacks: &mut dyn UsbStackCallbacks) {
        let event = self.port_events.dequeue();
        let mut ctx = enumerate::EnumContext {
            hal: &self.hal,
            async_head: &mut self.async_head,
            devices: &mut self.devices.devices,
            device_table: &mut self.device_table,
        };
        self.enumeration.poll(event, &mut ctx, callbacks);
    }

    /// Run one full cooperative tick: service the controller's interrupt
    /// status, then drive enumeration. Intended to be called from the
    /// platform's main loop when no interrupt vector is wired up.
    pub fn poll(&mut self, callbacks: &mut dyn UsbStackCallbacks) {
        self.hcd_isr(callbacks);
        self.poll_enumeration(callbacks);
    }

    /// Open a control pipe at `dev_addr` with default NullStackCallbacks-free
    /// direct use (`hcd_pipe_control_open`, §6). Exposed for upper layers
    /// that manage their own device's control pipe outside of enumeration
    /// (e.g. re-opening after a class driver changes `wMaxPacketSize`).
    pub fn pipe_control_open(&mut self, dev_addr: u8, max_packet_size: u16) -> UsbResult<()> {
        if dev_addr == 0 {
            pipe::pipe_control_open_address_zero(&mut self.async_head, max_packet_size, false, false, 0, 0);
            return Ok(());
        }
        let entry = self.device_table.get(dev_addr).ok_or(UsbError::InvalidParameter)?;
        let (is_high_speed, is_low_speed, hub_addr, hub_port) = (
            matches!(entry.speed, shim::UsbSpeed::High),
            matches!(entry.speed, shim::UsbSpeed::Low),
            entry.hub_addr,
            entry.hub_port,
        );
        let slot = self.devices.slot_mut(dev_addr).ok_or(UsbError::InvalidParameter)?;
        pipe::pipe_control_open(
            &mut slot.control_qhd,
            &mut self.async_head,
            dev_addr,
            max_packet_size,
            is_high_speed,
            is_low_speed,
            hub_addr,
            hub_port,
        );
        Ok(())
    }

    /// `hcd_pipe_control_xfer` (§6): run a control transfer to completion.
    pub fn pipe_control_xfer(
        &mut self,
        dev_addr: u8,
        setup: &desc::SetupPacket,
        setup_phys: u32,
        data_phys: Option<u32>,
    ) -> UsbResult<()> {
        if dev_addr == 0 {
            let mut qtds = [qh::QueueTransferDescriptor::empty(); 3];
            return pipe::pipe_control_xfer(&mut self.async_head, &mut qtds, setup, setup_phys, data_phys);
        }
        let slot = self.devices.slot_mut(dev_addr).ok_or(UsbError::InvalidParameter)?;
        pipe::pipe_control_xfer(&mut slot.control_qhd, &mut slot.control_qtd, setup, setup_phys, data_phys)
    }

    /// `hcd_pipe_control_close`.
    pub fn pipe_control_close(&mut self, dev_addr: u8) -> UsbResult<()> {
        let slot = self.devices.slot_mut(dev_addr).ok_or(UsbError::InvalidParameter)?;
        pipe::pipe_close(&self.hal, &mut self.async_head, &mut slot.control_qhd, true)
    }

    /// `hcd_pipe_open` (§6): open a bulk or interrupt pipe.
    #[allow(clippy::too_many_arguments)]
    pub fn pipe_open(
        &mut self,
        dev_addr: u8,
        endpoint_number: u8,
        max_packet_size: u16,
        xfer_type: EndpointType,
        direction: desc::Direction,
        class_code: u8,
    ) -> UsbResult<PipeHandle> {
        let entry = self.device_table.get(dev_addr).ok_or(UsbError::InvalidParameter)?;
        let (is_high_speed, is_low_speed, hub_addr, hub_port) = (
            matches!(entry.speed, shim::UsbSpeed::High),
            matches!(entry.speed, shim::UsbSpeed::Low),
            entry.hub_addr,
            entry.hub_port,
        );
        let is_interrupt = matches!(xfer_type, EndpointType::Interrupt);
        let schedule_head = if is_interrupt { &mut self.periodic_head } else { &mut self.async_head };
        let slot = self.devices.slot_mut(dev_addr).ok_or(UsbError::InvalidParameter)?;
        let index = pipe::pipe_open(
            slot,
            schedule_head,
            dev_addr,
            endpoint_number,
            max_packet_size,
            xfer_type,
            direction,
            is_high_speed,
            is_low_speed,
            hub_addr,
            hub_port,
            class_code,
        )?;
        Ok(PipeHandle {
            dev_addr,
            xfer_type: shim::pipe_kind_for_endpoint(xfer_type, endpoint_number),
            index,
        })
    }

    /// `hcd_pipe_xfer` (§6): queue one bulk/interrupt transfer.
    pub fn pipe_xfer(&mut self, handle: PipeHandle, buffer_phys: u32, bytes: usize, int_on_complete: bool) -> UsbResult<()> {
        let slot = self.devices.slot_mut(handle.dev_addr).ok_or(UsbError::InvalidParameter)?;
        pipe::pipe_xfer(slot, handle.index, buffer_phys, bytes, int_on_complete)?;
        Ok(())
    }

    /// `hcd_pipe_close` (§6).
    pub fn pipe_close(&mut self, handle: PipeHandle) -> UsbResult<()> {
        let is_async = handle.xfer_type != PipeKind::Interrupt;
        let schedule_head = if is_async { &mut self.async_head } else { &mut self.periodic_head };
        let slot = self.devices.slot_mut(handle.dev_addr).ok_or(UsbError::InvalidParameter)?;
        let qhd = slot.qhd_at_mut(handle.index);
        pipe::pipe_close(&self.hal, schedule_head, qhd, is_async)
    }

}

/// Maximum number of EHCI controllers this crate will drive simultaneously.
const MAX_CONTROLLERS: usize = 2;

static CONTROLLERS: Mutex<heapless::Vec<EhciController, MAX_CONTROLLERS>> = Mutex::new(heapless::Vec::new());

/// Discover every EHCI controller on the PCI bus and bring each one up
/// (`hcd_init`, §6 top-level entry point). Mirrors the donor's
/// `sdhci::init()` bus-scan-then-register-globally pattern.
pub fn init() -> UsbResult<usize> {
    let found = crate::pci::find_ehci_controllers();
    if found.is_empty() {
        return Err(UsbError::PciDeviceNotFound);
    }
    let mut controllers = CONTROLLERS.lock();
    let mut count = 0;
    for (core_id, pci_dev) in found.into_iter().enumerate() {
        match EhciController::new(pci_dev, core_id as u8) {
            Ok(controller) => {
                if controllers.push(controller).is_err() {
                    log::warn!("usb: more EHCI controllers than MAX_CONTROLLERS, ignoring the rest");
                    break;
                }
                count += 1;
            }
            Err(e) => log::error!("usb: failed to initialize EHCI controller {core_id}: {e:?}"),
        }
    }
    Ok(count)
}

/// Run one cooperative tick across every registered controller, using the
/// default logging-only stack callbacks. Upper layers that need real class
/// drivers should instead lock [`controllers`] and drive `poll` themselves
/// with their own [`UsbStackCallbacks`] implementation.
pub fn poll_all() {
    let mut callbacks = NullStackCallbacks;
    let mut controllers = CONTROLLERS.lock();
    for controller in controllers.iter_mut() {
        controller.poll(&mut callbacks);
    }
}

/// Access the global controller registry directly.
pub fn controllers() -> &'static Mutex<heapless::Vec<EhciController, MAX_CONTROLLERS>> {
    &CONTROLLERS
}
