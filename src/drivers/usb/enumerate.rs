//! Enumeration State Machine (§4.F).
//!
//! There is no RTOS task scheduler on this target, so the "enumeration
//! task" of the distilled spec is realized as an [`EnumerationTask`] object
//! whose [`EnumerationTask::poll`] is stepped from the platform's main loop
//! (or directly from tests). Each step's control transfer already blocks
//! with its own bounded timeout (`pipe::pipe_control_xfer`), so a full
//! enumeration runs to completion (or to its first failing step) within one
//! `poll` call — there is no cooperative yielding mid-sequence, since
//! nothing else on this single-core target could make progress while it
//! waits anyway. Invariant 6 (one enumeration at a time) follows directly:
//! `poll` only dequeues a new port event once the previous one has fully
//! resolved.

use super::desc::{ConfigurationInfo, DeviceDescriptor, SetupPacket};
use super::hal::EhciHal;
use super::pool::{DeviceSlot, HOST_DEVICE_MAX};
use super::qh::QueueHead;
use super::shim::{DeviceState, DeviceTable, MountFailureReason, PortEvent, UsbSpeed, UsbStackCallbacks};
use crate::drivers::usb::desc::{self, class};
use crate::drivers::usb::error::UsbResult;
use crate::drivers::usb::pipe;
use crate::platform::dma;

/// Largest configuration descriptor this driver can parse in one pass
/// (matches the donor's fixed DMA scratch buffer philosophy).
const ENUM_BUFFER_SIZE: usize = 512;

struct EnumScratch {
    setup_phys: u32,
    data_phys: u32,
}

impl EnumScratch {
    fn alloc() -> UsbResult<Self> {
        let setup_phys = dma::alloc_zeroed(8, 8)? as u32;
        let data_phys = dma::alloc_zeroed(ENUM_BUFFER_SIZE, 32)? as u32;
        Ok(EnumScratch { setup_phys, data_phys })
    }

    fn data_slice(&self, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data_phys as *const u8, len.min(ENUM_BUFFER_SIZE)) }
    }
}

/// Everything the enumeration task needs a live reference to for one
/// controller.
pub struct EnumContext<'a> {
    pub hal: &'a EhciHal,
    pub async_head: &'a mut QueueHead,
    pub devices: &'a mut [DeviceSlot; HOST_DEVICE_MAX],
    pub device_table: &'a mut DeviceTable,
}

pub struct EnumerationTask {
    scratch: Option<EnumScratch>,
}

impl EnumerationTask {
    pub const fn new() -> Self {
        EnumerationTask { scratch: None }
    }

    /// Drive one queued port-attach event to completion, if any is pending.
    pub fn poll(
        &mut self,
        event: Option<PortEvent>,
        ctx: &mut EnumContext,
        callbacks: &mut dyn UsbStackCallbacks,
    ) {
        let Some(event) = event else { return };
        if self.scratch.is_none() {
            self.scratch = match EnumScratch::alloc() {
                Ok(s) => Some(s),
                Err(_) => {
                    log::error!("usb: enumeration scratch buffer allocation failed");
                    return;
                }
            };
        }
        let scratch = self.scratch.as_ref().unwrap();
        run_enumeration(event, ctx, scratch, callbacks);
    }
}

impl Default for EnumerationTask {
    fn default() -> Self {
        Self::new()
    }
}

fn run_enumeration(
    event: PortEvent,
    ctx: &mut EnumContext,
    scratch: &EnumScratch,
    callbacks: &mut dyn UsbStackCallbacks,
) {
    let is_high_speed = matches!(event.speed, UsbSpeed::High);
    let is_low_speed = matches!(event.speed, UsbSpeed::Low);

    // Step 1: assert the port is still connected (it may have been unplugged
    // again between the ISR queuing this event and this poll dequeuing it),
    // then open the address-0 control pipe (reuses the async head per
    // invariant 5).
    if !ctx.hal.port_connect_status(event.hub_port) {
        log::warn!("usb: controller {}: port {} disconnected before enumeration started", event.core_id, event.hub_port);
        callbacks.device_mount_failed(0, MountFailureReason::DeviceNotResponding);
        return;
    }
    pipe::pipe_control_open_address_zero(
        ctx.async_head,
        8,
        is_high_speed,
        is_low_speed,
        event.hub_addr,
        event.hub_port,
    );

    // Step 2: GET_DESCRIPTOR(device, 8).
    let get8 = SetupPacket::get_descriptor(desc::desc_type::DEVICE, 0, 8);
    let mut addr0_qtds = [super::qh::QueueTransferDescriptor::empty(); 3];
    if pipe::pipe_control_xfer(ctx.async_head, &mut addr0_qtds, &get8, scratch.setup_phys, Some(scratch.data_phys))
        .is_err()
    {
        log::warn!("usb: controller {}: device did not respond to initial GET_DESCRIPTOR", event.core_id);
        callbacks.device_mount_failed(0, MountFailureReason::DeviceNotResponding);
        return;
    }
    let partial_desc = DeviceDescriptor::from_partial(scratch.data_slice(8));

    // Step 3: SET_ADDRESS to the next free slot.
    let Some(address) = ctx.device_table.first_free_address() else {
        log::warn!("usb: controller {}: device table full, dropping attach", event.core_id);
        callbacks.device_mount_failed(0, MountFailureReason::DeviceNotResponding);
        return;
    };
    let set_addr = SetupPacket::set_address(address);
    if pipe::pipe_control_xfer(ctx.async_head, &mut addr0_qtds, &set_addr, scratch.setup_phys, None).is_err() {
        callbacks.device_mount_failed(0, MountFailureReason::SetAddressFailed);
        return;
    }
    crate::time::delay_ms(2);

    if let Some(entry) = ctx.device_table.get_mut(address) {
        entry.state = DeviceState::Addressed;
        entry.speed = event.speed;
        entry.core_id = event.core_id;
        entry.hub_addr = event.hub_addr;
        entry.hub_port = event.hub_port;
        entry.address = address;
    }

    // Step 4: open the control pipe at the new address.
    let slot = &mut ctx.devices[address as usize - 1];
    pipe::pipe_control_open(
        &mut slot.control_qhd,
        ctx.async_head,
        address,
        partial_desc.b_max_packet_size0.max(8) as u16,
        is_high_speed,
        is_low_speed,
        event.hub_addr,
        event.hub_port,
    );

    // Step 5: GET_DESCRIPTOR(device, 18).
    let get18 = SetupPacket::get_descriptor(desc::desc_type::DEVICE, 0, 18);
    let slot = &mut ctx.devices[address as usize - 1];
    if pipe::pipe_control_xfer(
        &mut slot.control_qhd,
        &mut slot.control_qtd,
        &get18,
        scratch.setup_phys,
        Some(scratch.data_phys),
    )
    .is_err()
    {
        if let Some(entry) = ctx.device_table.get_mut(address) {
            entry.state = DeviceState::Unplugged;
        }
        callbacks.device_mount_failed(address, MountFailureReason::DescriptorReadFailed);
        return;
    }
    let full_desc = DeviceDescriptor::from_full(scratch.data_slice(18));
    if let Some(entry) = ctx.device_table.get_mut(address) {
        entry.vendor_id = full_desc.id_vendor;
        entry.product_id = full_desc.id_product;
        entry.configure_count = full_desc.b_num_configurations;
    }
    let config_index = callbacks.device_attached(address, full_desc.id_vendor, full_desc.id_product);

    // Step 6: GET_DESCRIPTOR(config, 9).
    let get_cfg9 = SetupPacket::get_descriptor(desc::desc_type::CONFIGURATION, config_index, 9);
    let slot = &mut ctx.devices[address as usize - 1];
    if pipe::pipe_control_xfer(
        &mut slot.control_qhd,
        &mut slot.control_qtd,
        &get_cfg9,
        scratch.setup_phys,
        Some(scratch.data_phys),
    )
    .is_err()
    {
        callbacks.device_mount_failed(address, MountFailureReason::DescriptorReadFailed);
        return;
    }
    let (total_length, _) = desc::parse_configuration_header(scratch.data_slice(9));

    // Step 7: GET_DESCRIPTOR(config, wTotalLength).
    let full_len = (total_length as usize).min(ENUM_BUFFER_SIZE);
    let get_cfg_full = SetupPacket::get_descriptor(desc::desc_type::CONFIGURATION, config_index, full_len as u16);
    let slot = &mut ctx.devices[address as usize - 1];
    if pipe::pipe_control_xfer(
        &mut slot.control_qhd,
        &mut slot.control_qtd,
        &get_cfg_full,
        scratch.setup_phys,
        Some(scratch.data_phys),
    )
    .is_err()
    {
        callbacks.device_mount_failed(address, MountFailureReason::DescriptorReadFailed);
        return;
    }
    let config_info: ConfigurationInfo = desc::parse_configuration(scratch.data_slice(full_len));
    install_recognized_classes(address, &config_info, scratch, callbacks);
    if let Some(entry) = ctx.device_table.get_mut(address) {
        entry.interface_count = config_info.interfaces.len() as u8;
        if config_info.interfaces.iter().any(|i| i.interface_class == class::HID) {
            entry.flag_supported_class |= super::shim::SupportedClass::HID;
        }
    }

    // Step 8: SET_CONFIGURATION.
    let set_cfg = SetupPacket::set_configuration(config_info.config_value);
    let slot = &mut ctx.devices[address as usize - 1];
    if pipe::pipe_control_xfer(&mut slot.control_qhd, &mut slot.control_qtd, &set_cfg, scratch.setup_phys, None)
        .is_err()
    {
        callbacks.device_mount_failed(address, MountFailureReason::SetConfigurationFailed);
        return;
    }

    if let Some(entry) = ctx.device_table.get_mut(address) {
        entry.state = DeviceState::Configured;
    }
    callbacks.device_mount_succeed(address);
}

fn install_recognized_classes(
    address: u8,
    config_info: &ConfigurationInfo,
    scratch: &EnumScratch,
    callbacks: &mut dyn UsbStackCallbacks,
) {
    for iface in &config_info.interfaces {
        if iface.interface_class == class::HID {
            let _ = callbacks.install_class_driver(address, iface.interface_class, scratch.data_slice(ENUM_BUFFER_SIZE));
        }
    }
}
