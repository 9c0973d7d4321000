//! Interrupt Handler (§4.E).
//!
//! Acknowledge-then-dispatch (§9 resolved open question): read `USBSTS`, AND
//! with the enable mask, write the result back to acknowledge, then dispatch
//! per-bit handlers. This closes the window where a second interrupt could
//! arrive between read and acknowledge and be silently dropped.

use super::hal::EhciHal;
use super::list;
use super::pool::{DeviceSlot, HOST_DEVICE_MAX};
use super::qh::QueueHead;
use super::regs::{qh_link, usbsts_bits};
use super::shim::{pipe_kind_for_endpoint, DeviceState, PipeHandle, PortEvent, UsbSpeed, UsbStackCallbacks, XferEvent};
use crate::drivers::usb::desc::EndpointType;

/// Bound on how many QHDs the ISR will walk per list per interrupt, guarding
/// against a corrupted list producing an unbounded walk.
const MAX_LIST_WALK: usize = HOST_DEVICE_MAX * 8 + 4;

/// Everything the ISR needs a live reference to. Built fresh by the
/// controller's `poll_isr`/interrupt-vector entry point each time it runs.
pub struct IsrContext<'a> {
    pub hal: &'a EhciHal,
    pub async_head: &'a mut QueueHead,
    pub periodic_head: &'a mut QueueHead,
    pub devices: &'a mut [DeviceSlot; HOST_DEVICE_MAX],
    pub device_table: &'a mut super::shim::DeviceTable,
    pub port_events: &'a mut heapless::spsc::Queue<PortEvent, 8>,
    pub core_id: u8,
}

/// Run one pass of the interrupt handler (`hcd_isr`, §6 upward API). Safe to
/// call either from a real interrupt vector or, absent IOAPIC/MSI wiring, a
/// poll loop observing `USBSTS` (§5 scheduling model).
pub fn hcd_isr(ctx: &mut IsrContext, callbacks: &mut dyn UsbStackCallbacks) {
    let raw = ctx.hal.status_raw();
    let enabled = ctx.hal.interrupt_enable_mask();
    let pending = raw & enabled;
    if pending == 0 {
        return;
    }
    ctx.hal.status_ack(pending);

    if pending & usbsts_bits::USBINT != 0 {
        async_list_process_isr(ctx, callbacks);
        period_list_process_isr(ctx, callbacks);
    }
    if pending & usbsts_bits::USBERRINT != 0 {
        xfer_error_isr(ctx, callbacks);
    }
    if pending & usbsts_bits::PCD != 0 {
        port_connect_status_change_isr(ctx, callbacks);
    }
    if pending & usbsts_bits::IAA != 0 {
        async_advance_isr(ctx, callbacks);
    }
}

fn xfer_error_isr(ctx: &mut IsrContext, callbacks: &mut dyn UsbStackCallbacks) {
    walk_and_retire(ctx.async_head, ctx.devices, callbacks, true);
}

fn async_list_process_isr(ctx: &mut IsrContext, callbacks: &mut dyn UsbStackCallbacks) {
    walk_and_retire(ctx.async_head, ctx.devices, callbacks, false);
}

fn period_list_process_isr(ctx: &mut IsrContext, callbacks: &mut dyn UsbStackCallbacks) {
    walk_and_retire(ctx.periodic_head, ctx.devices, callbacks, false);
}

/// Walk a circular/forward QHD chain, retiring completed qTDs from each
/// non-halted QHD's private qTD list and delivering completion callbacks in
/// enqueue order (§5 "Completion ordering"). `errors_only` restricts
/// delivery to QHDs currently reporting a transaction/buffer/babble error
/// (the `USBERRINT` path, which otherwise shares this walk).
fn walk_and_retire(
    head: &mut QueueHead,
    devices: &mut [DeviceSlot; HOST_DEVICE_MAX],
    callbacks: &mut dyn UsbStackCallbacks,
    errors_only: bool,
) {
    let head_addr = list::link_address(head);
    let mut current_addr = head_addr;

    for _ in 0..MAX_LIST_WALK {
        let qhd = unsafe { &mut *(current_addr as *mut QueueHead) };
        let next_addr = qhd.horizontal_link & !(qh_link::TYPE_MASK | 1);

        if qhd.used && !qhd.is_removing {
            let has_error = qhd.overlay.has_error();
            if errors_only && !has_error {
                // fallthrough to next node without delivering a completion
            } else if !qhd.overlay.is_active() {
                let event = if has_error { XferEvent::Error } else { XferEvent::Complete };
                let device_address = qhd.device_address();
                if device_address != 0 {
                    if let Some(slot) = devices.get_mut(device_address as usize - 1) {
                        retire_qhd_qtds(slot, qhd, device_address, event, callbacks);
                    }
                }
            }
        }

        if next_addr == head_addr || next_addr == 0 {
            break;
        }
        current_addr = next_addr;
    }
}

/// Translate a qTD's own link-field address back into its index within
/// `slot.qtd`, or `None` if it carries the terminate bit (end of chain).
fn qtd_index_for_addr(slot: &DeviceSlot, addr: u32) -> Option<u8> {
    if addr & super::regs::QTD_TERMINATE != 0 {
        return None;
    }
    slot.qtd
        .iter()
        .position(|qtd| core::ptr::addr_of!(*qtd) as u32 == addr)
        .map(|i| i as u8)
}

/// Retire completed qTDs from `qhd`'s own chain head, in enqueue order (§3
/// invariant 3, §5 "Completion ordering"), delivering exactly one completion
/// callback per retired qTD with `int_on_complete` set. Stops at the first
/// qTD still `active` — the controller hasn't reached it yet.
fn retire_qhd_qtds(
    slot: &mut DeviceSlot,
    qhd: &mut QueueHead,
    device_address: u8,
    event: XferEvent,
    callbacks: &mut dyn UsbStackCallbacks,
) {
    let endpoint_number = ((qhd.endpoint_chars >> super::regs::qh_ep_chars::ENDPT_SHIFT)
        & (super::regs::qh_ep_chars::ENDPT_MASK >> super::regs::qh_ep_chars::ENDPT_SHIFT)) as u8;
    let xfer_type = if qhd.endpoint_caps & (0xFF << super::regs::qh_ep_caps::SMASK_SHIFT) != 0 {
        EndpointType::Interrupt
    } else {
        EndpointType::Bulk
    };
    let pipe = PipeHandle {
        dev_addr: device_address,
        xfer_type: pipe_kind_for_endpoint(xfer_type, endpoint_number),
        index: 0,
    };

    while let Some(index) = qhd.p_qtd_list_head {
        let qtd = slot.qtd_at(index);
        if qtd.is_active() {
            break;
        }
        let ioc = qtd.token & super::regs::qtd_token::IOC != 0;
        let next_addr = qtd.next_qtd;
        slot.qtd_at_mut(index).used = false;

        qhd.p_qtd_list_head = qtd_index_for_addr(slot, next_addr);
        if qhd.p_qtd_list_head.is_none() {
            qhd.p_qtd_list_tail = None;
        }

        if ioc {
            callbacks.xfer_complete(pipe, qhd.class_code, event);
        }
    }
}

/// Port-change dispatch: connect queues a port event for the enumeration
/// task; disconnect notifies the stack and rings the async-advance doorbell
/// so any of that device's QHDs can be safely reclaimed.
fn port_connect_status_change_isr(ctx: &mut IsrContext, callbacks: &mut dyn UsbStackCallbacks) {
    for port in 0..ctx.hal.num_ports() {
        if ctx.hal.port_connect_status(port) {
            // Low-speed devices identify themselves by line state (K-state)
            // at connect time, before any reset; full/high-speed devices
            // only separate after the reset's chirp handshake, so the
            // speed read must follow `port_reset`, not precede it.
            let is_low_speed = ctx.hal.port_low_speed(port);
            ctx.hal.port_reset(port);
            let speed = if is_low_speed {
                UsbSpeed::Low
            } else if ctx.hal.port_enabled(port) {
                UsbSpeed::High
            } else {
                UsbSpeed::Full
            };
            callbacks.device_plugged_isr(ctx.core_id, speed);
            let _ = ctx.port_events.enqueue(PortEvent {
                core_id: ctx.core_id,
                hub_addr: 0,
                hub_port: port,
                speed,
            });
        } else {
            if let Some(entry) = ctx
                .device_table
                .entries
                .iter_mut()
                .find(|e| e.hub_port == port && e.state != DeviceState::Unplugged)
            {
                let address = entry.address;
                entry.state = DeviceState::Unplugged;
                callbacks.device_unplugged_isr(ctx.core_id, address);
            }
            ctx.hal.ring_async_doorbell();
        }
        ctx.hal.port_clear_status_changes(port);
    }
}

/// Completes deferred removal: any QHD marked `is_removing` has now been
/// confirmed drained from the controller's cache. This mirrors `pipe_close`'s
/// synchronous doorbell wait for the common case; this path additionally
/// covers `is_removing` QHDs whose owning call already timed out and moved
/// on, so their pool slot is still reclaimed instead of leaking.
fn async_advance_isr(ctx: &mut IsrContext, callbacks: &mut dyn UsbStackCallbacks) {
    for (i, slot) in ctx.devices.iter_mut().enumerate() {
        let address = (i + 1) as u8;
        let mut any_removing = false;
        if slot.control_qhd.is_removing {
            slot.control_qhd.used = false;
            slot.control_qhd.is_removing = false;
            any_removing = true;
        }
        for qhd in slot.qhd.iter_mut() {
            if qhd.is_removing {
                qhd.used = false;
                qhd.is_removing = false;
                any_removing = true;
            }
        }
        if any_removing {
            if let Some(entry) = ctx.device_table.get_mut(address) {
                if entry.state == DeviceState::Unplugged {
                    slot.release_all();
                    callbacks.device_unplugged_isr(ctx.core_id, address);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::desc::Direction;
    use super::super::pool::DeviceSlot;
    use super::super::qh::pid_for_direction;

    #[derive(Default)]
    struct RecordingCallbacks {
        completions: heapless::Vec<(PipeHandle, u8, XferEvent), 8>,
    }

    impl UsbStackCallbacks for RecordingCallbacks {
        fn xfer_complete(&mut self, pipe: PipeHandle, class_code: u8, event: XferEvent) {
            let _ = self.completions.push((pipe, class_code, event));
        }
    }

    fn endpoint_slot(class_code: u8, endpoint_number: u8, direction: Direction) -> (DeviceSlot, u8) {
        let mut slot = DeviceSlot::empty();
        let index = slot.qhd_find_free().unwrap();
        let qhd = slot.qhd_at_mut(index);
        qhd.init_device(5, endpoint_number, 512, true, false, false, false, 0, 0);
        qhd.pid_non_control = pid_for_direction(direction);
        qhd.class_code = class_code;
        (slot, index)
    }

    fn queue_completed_qtd(slot: &mut DeviceSlot, qhd_index: u8, buffer: u32, ioc: bool) -> u8 {
        let qtd_index = super::super::pipe::pipe_xfer(slot, qhd_index, buffer, 64, ioc).unwrap();
        // Simulate hardware retiring the transfer: clear STATUS_ACTIVE.
        slot.qtd_at_mut(qtd_index).token &= !super::super::regs::qtd_token::STATUS_ACTIVE;
        qtd_index
    }

    #[test]
    fn qtd_index_for_addr_resolves_own_pool_slot_and_rejects_terminate() {
        let slot = DeviceSlot::empty();
        assert_eq!(qtd_index_for_addr(&slot, super::super::regs::QTD_TERMINATE), None);
        let addr = core::ptr::addr_of!(slot.qtd[2]) as u32;
        assert_eq!(qtd_index_for_addr(&slot, addr), Some(2));
    }

    #[test]
    fn retire_qhd_qtds_only_retires_and_reports_this_qhds_own_chain() {
        // Two endpoints share one device slot's qTD pool (§3 Data Model);
        // retiring one QHD must not touch or report the other's completion.
        let (mut slot, bulk_out_index) = endpoint_slot(8, 1, Direction::Out);
        let bulk_out_qtd = queue_completed_qtd(&mut slot, bulk_out_index, 0x1000, true);

        let interrupt_index = slot.qhd_find_free().unwrap();
        {
            let qhd = slot.qhd_at_mut(interrupt_index);
            qhd.init_device(5, 2, 8, true, false, false, true, 0, 0);
            qhd.pid_non_control = pid_for_direction(Direction::In);
            qhd.class_code = 3;
        }
        let _interrupt_qtd = queue_completed_qtd(&mut slot, interrupt_index, 0x2000, false);

        let mut callbacks = RecordingCallbacks::default();
        let mut bulk_qhd = *slot.qhd_at(bulk_out_index);
        retire_qhd_qtds(&mut slot, &mut bulk_qhd, 5, XferEvent::Complete, &mut callbacks);

        assert_eq!(callbacks.completions.len(), 1);
        let (pipe, class_code, event) = callbacks.completions[0];
        assert_eq!(pipe.dev_addr, 5);
        assert_eq!(class_code, 8);
        assert_eq!(event, XferEvent::Complete);
        assert!(bulk_qhd.p_qtd_list_head.is_none());
        assert!(bulk_qhd.p_qtd_list_tail.is_none());
        assert!(!slot.qtd_at(bulk_out_qtd).used);

        // The interrupt endpoint's own qTD is untouched: still owned, and
        // nothing was reported for it since its QHD was never walked here.
        assert!(slot.qtd_at(_interrupt_qtd).used);
    }

    #[test]
    fn retire_qhd_qtds_stops_at_the_first_still_active_qtd() {
        let (mut slot, index) = endpoint_slot(8, 1, Direction::Out);
        let first = queue_completed_qtd(&mut slot, index, 0x1000, true);
        // Second transfer left active, simulating hardware still processing it.
        let second = super::super::pipe::pipe_xfer(&mut slot, index, 0x2000, 64, true).unwrap();
        assert!(slot.qtd_at(second).is_active());

        let mut callbacks = RecordingCallbacks::default();
        let mut qhd = *slot.qhd_at(index);
        retire_qhd_qtds(&mut slot, &mut qhd, 5, XferEvent::Complete, &mut callbacks);

        assert_eq!(callbacks.completions.len(), 1);
        assert!(!slot.qtd_at(first).used);
        assert!(slot.qtd_at(second).used);
        assert_eq!(qhd.p_qtd_list_head, Some(second));
        assert_eq!(qhd.p_qtd_list_tail, Some(second));
    }
}
