//! Pipe Engine (§4.D): builds qTD chains for control/bulk/interrupt
//! transfers and links/unlinks their owning QHDs into the async or periodic
//! schedule.

use core::sync::atomic::{fence, Ordering};

use super::desc::{Direction, EndpointType, SetupPacket};
use super::error::{UsbError, UsbResult};
use super::hal::EhciHal;
use super::list;
use super::pool::{DeviceSlot, PoolIndex};
use super::qh::{pid_for_direction, QueueHead, QueueTransferDescriptor};
use super::regs::qtd_token;
use crate::time::{wait_until, Timeout};

/// Per-step control-transfer timeout (§4.F "per-step timeout budget").
const CONTROL_XFER_TIMEOUT_MS: u64 = 1000;
/// Timeout awaiting the async-advance interrupt after ringing the doorbell.
const ASYNC_ADVANCE_TIMEOUT_MS: u64 = 100;

/// Initialize (or reinitialize) a device control QHD and link it into the
/// async list immediately after `async_head`. `device_address` must be
/// nonzero; address 0 reuses the async head itself (invariant 5) and is
/// opened through [`pipe_control_open_address_zero`] instead, since that
/// path only has one QHD to touch and must not alias a `&mut` to it twice.
#[allow(clippy::too_many_arguments)]
pub fn pipe_control_open(
    qhd: &mut QueueHead,
    async_head: &mut QueueHead,
    device_address: u8,
    max_packet_size: u16,
    is_high_speed: bool,
    is_low_speed: bool,
    hub_address: u8,
    hub_port: u8,
) {
    debug_assert_ne!(device_address, 0, "address 0 must use pipe_control_open_address_zero");
    qhd.init_device(
        device_address,
        0,
        max_packet_size,
        is_high_speed,
        is_low_speed,
        true,
        false,
        hub_address,
        hub_port,
    );
    unsafe { list::list_insert(async_head, qhd) };
}

/// Open (or reopen) the address-0 control pipe by reusing the async list's
/// head-of-list QHD directly (invariant 5) — there is no separate QHD to
/// link, so this takes exactly one `&mut QueueHead` borrow rather than the
/// two-parameter `qhd`/`async_head` shape `pipe_control_open` needs for a
/// real device address. `QueueHead::init_device` leaves the head's
/// `horizontal_link`, `head_list_flag`, and halted overlay untouched for
/// `device_address == 0` (invariant 1 / testable property 2).
pub fn pipe_control_open_address_zero(
    async_head: &mut QueueHead,
    max_packet_size: u16,
    is_high_speed: bool,
    is_low_speed: bool,
    hub_address: u8,
    hub_port: u8,
) {
    async_head.init_device(0, 0, max_packet_size, is_high_speed, is_low_speed, true, false, hub_address, hub_port);
}

/// Run a three-phase (SETUP [+ DATA] + STATUS) control transfer to
/// completion, busy-waiting up to [`CONTROL_XFER_TIMEOUT_MS`] (§4.D, §5
/// "suspension points" realized as a bounded spin-wait).
///
/// `setup_phys`/`data_phys` are physical (== virtual, identity-mapped)
/// addresses of caller-owned DMA buffers; `data_phys` is `None` for a
/// no-data control request.
pub fn pipe_control_xfer(
    qhd: &mut QueueHead,
    qtds: &mut [QueueTransferDescriptor; 3],
    setup: &SetupPacket,
    setup_phys: u32,
    data_phys: Option<u32>,
) -> UsbResult<()> {
    let has_data = data_phys.is_some() && setup.w_length > 0;
    let data_dir = if setup.is_device_to_host() {
        Direction::In
    } else {
        Direction::Out
    };
    let status_dir = if has_data {
        match data_dir {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    } else {
        Direction::In
    };

    // The SETUP stage's qTD buffer pointer is only an address; the actual
    // request bytes must be copied into that DMA-visible memory before the
    // controller is allowed to fetch it (published ahead of the qTD link
    // write below, same ordering rule as the overlay publication).
    let setup_bytes = setup.as_bytes();
    unsafe {
        core::ptr::copy_nonoverlapping(setup_bytes.as_ptr(), setup_phys as *mut u8, setup_bytes.len());
    }

    qtds[0] = QueueTransferDescriptor::setup(setup_phys);
    if has_data {
        qtds[1] = QueueTransferDescriptor::data(
            pid_for_direction(data_dir),
            data_phys.unwrap(),
            setup.w_length as usize,
            true,
            false,
        );
        qtds[2] = QueueTransferDescriptor::status(pid_for_direction(status_dir));
        link_qtd_chain(&mut qtds[0..3]);
    } else {
        qtds[1] = QueueTransferDescriptor::status(pid_for_direction(status_dir));
        qtds[0].next_qtd = core::ptr::addr_of!(qtds[1]) as u32;
        fence(Ordering::SeqCst);
    }

    qhd.overlay = qtds[0];
    qhd.current_qtd = 0;
    fence(Ordering::SeqCst);

    // The controller streams each qTD's fields into the overlay in turn as
    // it walks `next_qtd`; the overlay is idle (`active == 0`) only once the
    // whole chain has completed or a qTD halted it.
    let timeout = Timeout::from_ms(CONTROL_XFER_TIMEOUT_MS);
    let completed = wait_until(timeout, || qhd.overlay.is_complete());

    if !completed {
        return Err(UsbError::DeviceNotResponding);
    }
    if qhd.overlay.is_halted() {
        if qhd.device_address() != 0 {
            return Err(UsbError::Stall);
        }
        return Err(UsbError::XferError);
    }
    if qhd.overlay.has_error() {
        return Err(UsbError::XferError);
    }
    Ok(())
}

fn link_qtd_chain(qtds: &mut [QueueTransferDescriptor]) {
    for i in 0..qtds.len() - 1 {
        let next_addr = core::ptr::addr_of!(qtds[i + 1]) as u32;
        qtds[i].next_qtd = next_addr;
    }
    fence(Ordering::SeqCst);
}

/// Open a bulk or interrupt pipe (§4.D `pipe_open`). Isochronous is rejected
/// explicitly rather than falling out of an if/else-if chain (§9 resolved
/// open question).
#[allow(clippy::too_many_arguments)]
pub fn pipe_open(
    slot: &mut DeviceSlot,
    schedule_head: &mut QueueHead,
    device_address: u8,
    endpoint_number: u8,
    max_packet_size: u16,
    xfer_type: EndpointType,
    direction: Direction,
    is_high_speed: bool,
    is_low_speed: bool,
    hub_address: u8,
    hub_port: u8,
    class_code: u8,
) -> UsbResult<PoolIndex> {
    match xfer_type {
        EndpointType::Control => return Err(UsbError::InvalidParameter),
        EndpointType::Isochronous => return Err(UsbError::Unsupported),
        EndpointType::Bulk | EndpointType::Interrupt => {}
    }

    let index = slot.qhd_find_free().ok_or(UsbError::PoolExhausted)?;
    let qhd = slot.qhd_at_mut(index);
    qhd.init_device(
        device_address,
        endpoint_number,
        max_packet_size,
        is_high_speed,
        is_low_speed,
        false,
        matches!(xfer_type, EndpointType::Interrupt),
        hub_address,
        hub_port,
    );
    qhd.pid_non_control = pid_for_direction(direction);
    qhd.class_code = class_code;

    unsafe { list::list_insert(schedule_head, qhd) };
    Ok(index)
}

/// Queue a single bulk/interrupt transfer (§4.D `pipe_xfer`). Does not block;
/// completion is observed by the ISR (§4.E "Async completion"/"Periodic
/// completion"), which retires qTDs from `qhd.p_qtd_list_head` in enqueue
/// order (§5 "Completion ordering"). Appends to the QHD's existing chain
/// rather than overwriting it, so more than one transfer may be in flight on
/// the same endpoint at once.
pub fn pipe_xfer(
    slot: &mut DeviceSlot,
    qhd_index: PoolIndex,
    buffer_phys: u32,
    bytes: usize,
    int_on_complete: bool,
) -> UsbResult<PoolIndex> {
    let qtd_index = slot.qtd_find_free().ok_or(UsbError::PoolExhausted)?;
    let qhd = slot.qhd_at_mut(qhd_index);
    let pid = qhd.pid_non_control;
    let toggle = qhd.overlay.token & qtd_token::TOGGLE != 0;
    // High-speed bulk OUT asserts PING per EHCI §4.11; interrupt endpoints
    // never ping, and IN transfers have no OUT data phase to ping before.
    let assert_ping = qhd.is_high_speed() && !qhd.is_interrupt() && pid == qtd_token::PID_OUT;
    let was_idle = qhd.p_qtd_list_tail.is_none();
    let prev_tail = qhd.p_qtd_list_tail;

    let qtd = slot.qtd_at_mut(qtd_index);
    qtd.init(pid, buffer_phys, bytes, toggle, int_on_complete);
    if assert_ping {
        qtd.token |= qtd_token::PING_STATE;
    }
    let qtd_addr = core::ptr::addr_of!(*qtd) as u32;

    if let Some(prev_index) = prev_tail {
        // Chain was already non-empty: splice onto the existing tail's
        // `next_qtd` so the controller picks it up once it retires the
        // qTD currently ahead of it.
        let prev_qtd = slot.qtd_at_mut(prev_index);
        prev_qtd.next_qtd = qtd_addr;
        fence(Ordering::SeqCst);
    }

    let qhd = slot.qhd_at_mut(qhd_index);
    qhd.p_qtd_list_tail = Some(qtd_index);
    if qhd.p_qtd_list_head.is_none() {
        qhd.p_qtd_list_head = Some(qtd_index);
    }

    if was_idle && !qhd.overlay.is_active() {
        qhd.current_qtd = qtd_addr;
        qhd.overlay = *slot.qtd_at(qtd_index);
        fence(Ordering::SeqCst);
    }

    Ok(qtd_index)
}

/// Close a pipe: mark its QHD for removal and unlink it from the schedule.
/// The pool slot is released later by the ISR's async-advance handler once
/// hardware has acknowledged the doorbell, or after one periodic frame for
/// interrupt pipes (invariant 4).
pub fn pipe_close(hal: &EhciHal, schedule_head: &mut QueueHead, qhd: &mut QueueHead, is_async: bool) -> UsbResult<()> {
    qhd.is_removing = true;
    unsafe { list::list_remove_qhd(schedule_head, qhd) };

    if !is_async {
        // Periodic list: one frame's delay is sufficient (invariant 4).
        crate::time::delay_ms(1);
        qhd.used = false;
        qhd.is_removing = false;
        qhd.p_qtd_list_head = None;
        qhd.p_qtd_list_tail = None;
        return Ok(());
    }

    hal.ring_async_doorbell();
    let timeout = Timeout::from_ms(ASYNC_ADVANCE_TIMEOUT_MS);
    let acked = wait_until(timeout, || {
        hal.status_raw() & super::regs::usbsts_bits::IAA != 0
    });
    if !acked {
        return Err(UsbError::Timeout);
    }
    hal.status_ack(super::regs::usbsts_bits::IAA);
    qhd.used = false;
    qhd.is_removing = false;
    qhd.p_qtd_list_head = None;
    qhd.p_qtd_list_tail = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::pool::DeviceSlot;

    fn bulk_out_slot(is_high_speed: bool) -> (DeviceSlot, PoolIndex) {
        let mut slot = DeviceSlot::empty();
        let index = slot.qhd_find_free().unwrap();
        let qhd = slot.qhd_at_mut(index);
        qhd.init_device(3, 1, 512, is_high_speed, false, false, false, 0, 0);
        qhd.pid_non_control = qtd_token::PID_OUT;
        (slot, index)
    }

    #[test]
    fn pipe_open_rejects_control_and_isochronous() {
        let mut slot = DeviceSlot::empty();
        let mut head = QueueHead::empty();
        head.init_async_head();

        let control = pipe_open(&mut slot, &mut head, 3, 0, 64, EndpointType::Control, Direction::Out, true, false, 0, 0, 0);
        assert_eq!(control, Err(UsbError::InvalidParameter));

        let iso = pipe_open(&mut slot, &mut head, 3, 1, 1024, EndpointType::Isochronous, Direction::In, true, false, 0, 0, 0);
        assert_eq!(iso, Err(UsbError::Unsupported));
    }

    #[test]
    fn pipe_open_bulk_links_into_schedule_and_returns_handle_index() {
        let mut slot = DeviceSlot::empty();
        let mut head = QueueHead::empty();
        head.init_async_head();

        let index = pipe_open(&mut slot, &mut head, 3, 1, 512, EndpointType::Bulk, Direction::Out, true, false, 0, 0, 7)
            .unwrap();
        let qhd = slot.qhd_at(index);
        assert_eq!(qhd.device_address(), 3);
        assert_eq!(qhd.class_code, 7);
        assert_eq!(target_address_of(head.horizontal_link), list::link_address(qhd));
    }

    fn target_address_of(link: u32) -> u32 {
        link & !(super::super::regs::qh_link::TYPE_MASK | super::super::regs::QTD_TERMINATE)
    }

    #[test]
    fn pipe_xfer_starts_an_idle_qhd_immediately() {
        let (mut slot, index) = bulk_out_slot(true);
        let qtd_index = pipe_xfer(&mut slot, index, 0x2000, 512, true).unwrap();

        let qhd = slot.qhd_at(index);
        assert_eq!(qhd.p_qtd_list_head, Some(qtd_index));
        assert_eq!(qhd.p_qtd_list_tail, Some(qtd_index));
        assert!(qhd.overlay.is_active());
        assert_eq!(qhd.overlay.buffer_ptrs[0], 0x2000);
    }

    #[test]
    fn pipe_xfer_appends_a_second_transfer_to_the_tail_without_disturbing_the_active_overlay() {
        let (mut slot, index) = bulk_out_slot(true);
        let first = pipe_xfer(&mut slot, index, 0x2000, 512, false).unwrap();
        let overlay_before = slot.qhd_at(index).overlay;

        let second = pipe_xfer(&mut slot, index, 0x3000, 256, true).unwrap();

        let qhd = slot.qhd_at(index);
        assert_eq!(qhd.p_qtd_list_head, Some(first));
        assert_eq!(qhd.p_qtd_list_tail, Some(second));
        // The already-active overlay (standing in for hardware's in-flight
        // transfer) must not be rewritten by queuing a second transfer.
        assert_eq!(qhd.overlay.buffer_ptrs[0], overlay_before.buffer_ptrs[0]);

        let first_qtd = slot.qtd_at(first);
        assert_eq!(first_qtd.next_qtd, core::ptr::addr_of!(*slot.qtd_at(second)) as u32);
    }

    #[test]
    fn pipe_xfer_asserts_ping_for_high_speed_bulk_out_only() {
        let (mut slot, index) = bulk_out_slot(true);
        let qtd_index = pipe_xfer(&mut slot, index, 0x1000, 64, false).unwrap();
        assert_ne!(slot.qtd_at(qtd_index).token & qtd_token::PING_STATE, 0);

        let (mut fs_slot, fs_index) = bulk_out_slot(false);
        let fs_qtd_index = pipe_xfer(&mut fs_slot, fs_index, 0x1000, 64, false).unwrap();
        assert_eq!(fs_slot.qtd_at(fs_qtd_index).token & qtd_token::PING_STATE, 0);
    }

    #[test]
    fn pipe_xfer_reports_pool_exhausted_once_every_qtd_slot_is_used() {
        let (mut slot, index) = bulk_out_slot(true);
        for _ in 0..super::super::pool::QTD_PER_DEVICE {
            pipe_xfer(&mut slot, index, 0x1000, 64, false).unwrap();
        }
        assert_eq!(pipe_xfer(&mut slot, index, 0x1000, 64, false), Err(UsbError::PoolExhausted));
    }

    #[test]
    fn pipe_control_open_for_address_zero_reuses_the_async_head_in_place() {
        let mut head = QueueHead::empty();
        head.init_async_head();
        let original_link = head.horizontal_link;

        pipe_control_open_address_zero(&mut head, 8, false, false, 0, 0);

        assert_eq!(head.device_address(), 0);
        assert!(head.used);
        // Reusing the head for address 0 must not destroy the invariants
        // that make it the async list's permanent head: its self-link
        // (invariant 1), head-of-list flag, and permanently-halted overlay
        // (testable property 2) all survive the reinitialization.
        assert_eq!(head.horizontal_link, original_link);
        assert!(head.is_head_of_list());
        assert!(head.overlay.is_halted());
    }
}
