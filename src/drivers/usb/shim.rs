//! The stable interface the rest of the USB stack consumes (§4.G).
//!
//! Class drivers (HID, mass storage, ...) live outside this crate per the
//! Non-goals; they plug in by implementing [`UsbStackCallbacks`].

use super::desc::EndpointType;
use super::pool::{PoolIndex, HOST_DEVICE_MAX};

/// Lifecycle state of a device-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unplugged,
    Addressed,
    Configured,
    Mounted,
}

/// Negotiated USB signaling speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

bitflags::bitflags! {
    /// `flag_supported_class` bits (§3 Data Model).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SupportedClass: u8 {
        const HID = 1 << 0;
    }
}

/// One entry of the driver's device table (§3 Data Model).
#[derive(Debug, Clone, Copy)]
pub struct DeviceTableEntry {
    pub state: DeviceState,
    pub speed: UsbSpeed,
    pub core_id: u8,
    pub hub_addr: u8,
    pub hub_port: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub configure_count: u8,
    pub interface_count: u8,
    pub flag_supported_class: SupportedClass,
}

impl DeviceTableEntry {
    pub const fn unplugged() -> Self {
        DeviceTableEntry {
            state: DeviceState::Unplugged,
            speed: UsbSpeed::Full,
            core_id: 0,
            hub_addr: 0,
            hub_port: 0,
            address: 0,
            vendor_id: 0,
            product_id: 0,
            configure_count: 0,
            interface_count: 0,
            flag_supported_class: SupportedClass::empty(),
        }
    }
}

/// Fixed-size device table, one entry per address slot 1..=HOST_DEVICE_MAX.
pub struct DeviceTable {
    pub entries: [DeviceTableEntry; HOST_DEVICE_MAX],
}

impl DeviceTable {
    pub const fn empty() -> Self {
        const ENTRY: DeviceTableEntry = DeviceTableEntry::unplugged();
        DeviceTable {
            entries: [ENTRY; HOST_DEVICE_MAX],
        }
    }

    /// First address slot (1-based) currently unplugged, if any.
    pub fn first_free_address(&self) -> Option<u8> {
        self.entries
            .iter()
            .position(|e| e.state == DeviceState::Unplugged)
            .map(|i| (i + 1) as u8)
    }

    pub fn get(&self, address: u8) -> Option<&DeviceTableEntry> {
        if address == 0 {
            return None;
        }
        self.entries.get(address as usize - 1)
    }

    pub fn get_mut(&mut self, address: u8) -> Option<&mut DeviceTableEntry> {
        if address == 0 {
            return None;
        }
        self.entries.get_mut(address as usize - 1)
    }
}

/// Which schedule/pool a pipe handle's QHD lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Control,
    Bulk,
    Interrupt,
}

/// Opaque, stable reference to a QHD (§3 "Pipe handle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHandle {
    pub dev_addr: u8,
    pub xfer_type: PipeKind,
    pub index: PoolIndex,
}

/// Completion event delivered through [`UsbStackCallbacks::xfer_complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferEvent {
    Complete,
    Error,
}

/// Port-attach event queued by the ISR for the enumeration task (§4.F).
#[derive(Debug, Clone, Copy)]
pub struct PortEvent {
    pub core_id: u8,
    pub hub_addr: u8,
    pub hub_port: u8,
    pub speed: UsbSpeed,
}

/// Reason a mount attempt failed, passed to `device_mount_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFailureReason {
    DeviceNotResponding,
    SetAddressFailed,
    DescriptorReadFailed,
    SetConfigurationFailed,
}

/// Upward callback contract implemented by the rest of the USB stack.
///
/// A no-op implementation (used by the demo binary and by tests that only
/// care about driver-internal state) is provided as [`NullStackCallbacks`].
pub trait UsbStackCallbacks {
    fn device_plugged_isr(&mut self, core_id: u8, speed: UsbSpeed) {
        let _ = (core_id, speed);
    }

    fn device_unplugged_isr(&mut self, core_id: u8, address: u8) {
        let _ = (core_id, address);
    }

    fn xfer_complete(&mut self, pipe: PipeHandle, class_code: u8, event: XferEvent) {
        let _ = (pipe, class_code, event);
    }

    /// Called once the full device descriptor has been read; returns the
    /// configuration index to request (0 for "first configuration").
    fn device_attached(&mut self, address: u8, descriptor_vendor_id: u16, descriptor_product_id: u16) -> u8 {
        let _ = (address, descriptor_vendor_id, descriptor_product_id);
        0
    }

    fn device_mount_succeed(&mut self, address: u8) {
        let _ = address;
    }

    fn device_mount_failed(&mut self, address: u8, reason: MountFailureReason) {
        let _ = (address, reason);
    }

    /// Consume the descriptor range for a recognized interface class,
    /// returning how many bytes of `buf` it claimed (0 if unrecognized).
    fn install_class_driver(&mut self, address: u8, interface_class: u8, buf: &[u8]) -> usize {
        let _ = (address, interface_class, buf);
        0
    }
}

/// Default, logging-only stack implementation.
#[derive(Default)]
pub struct NullStackCallbacks;

impl UsbStackCallbacks for NullStackCallbacks {
    fn device_plugged_isr(&mut self, core_id: u8, speed: UsbSpeed) {
        log::info!("usb: controller {core_id}: device plugged ({speed:?})");
    }

    fn device_unplugged_isr(&mut self, core_id: u8, address: u8) {
        log::info!("usb: controller {core_id}: device at address {address} unplugged");
    }

    fn device_mount_succeed(&mut self, address: u8) {
        log::info!("usb: device at address {address} mounted");
    }

    fn device_mount_failed(&mut self, address: u8, reason: MountFailureReason) {
        log::warn!("usb: device at address {address} failed to mount: {reason:?}");
    }
}

/// Translate an endpoint type into the pipe-handle kind used to route a
/// completion (§4.E: "control if endpoint_number==0 else bulk/interrupt").
pub fn pipe_kind_for_endpoint(xfer_type: EndpointType, endpoint_number: u8) -> PipeKind {
    if endpoint_number == 0 {
        return PipeKind::Control;
    }
    match xfer_type {
        EndpointType::Interrupt => PipeKind::Interrupt,
        _ => PipeKind::Bulk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_zero_is_always_control_regardless_of_type() {
        assert_eq!(pipe_kind_for_endpoint(EndpointType::Bulk, 0), PipeKind::Control);
        assert_eq!(pipe_kind_for_endpoint(EndpointType::Interrupt, 0), PipeKind::Control);
    }

    #[test]
    fn nonzero_endpoint_maps_bulk_and_interrupt() {
        assert_eq!(pipe_kind_for_endpoint(EndpointType::Bulk, 1), PipeKind::Bulk);
        assert_eq!(pipe_kind_for_endpoint(EndpointType::Interrupt, 1), PipeKind::Interrupt);
    }

    #[test]
    fn device_table_starts_fully_unplugged() {
        let table = DeviceTable::empty();
        assert_eq!(table.first_free_address(), Some(1));
        assert_eq!(table.get(0), None);
        assert_eq!(table.get(1).unwrap().state, DeviceState::Unplugged);
    }

    #[test]
    fn device_table_first_free_address_skips_occupied_slots() {
        let mut table = DeviceTable::empty();
        table.get_mut(1).unwrap().state = DeviceState::Mounted;
        table.get_mut(2).unwrap().state = DeviceState::Mounted;
        assert_eq!(table.first_free_address(), Some(3));
    }

    #[test]
    fn device_table_rejects_address_zero() {
        let mut table = DeviceTable::empty();
        assert!(table.get(0).is_none());
        assert!(table.get_mut(0).is_none());
    }

    #[test]
    fn supported_class_bitflags_round_trip() {
        let mut flags = SupportedClass::empty();
        assert!(!flags.contains(SupportedClass::HID));
        flags |= SupportedClass::HID;
        assert!(flags.contains(SupportedClass::HID));
    }
}
