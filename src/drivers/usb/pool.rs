//! Fixed-capacity QHD/qTD pools, one per device slot.
//!
//! No heap is available; every pool is a plain array sized at compile time,
//! matching the fixed-capacity philosophy of the rest of the driver (and of
//! `heapless` elsewhere in this crate). Allocation is "first `used == false`
//! slot wins"; freeing is a single `used = false` write performed by the ISR
//! (§4.B), with no further synchronization needed because producer (task)
//! and consumer (ISR) only ever touch a slot when they, respectively, own it.

use super::qh::{QueueHead, QueueTransferDescriptor};

/// Maximum number of concurrently enumerated/attached devices (address 1..N).
pub const HOST_DEVICE_MAX: usize = 8;
/// Non-control QHDs per device slot (e.g. bulk-in, bulk-out, interrupt-in).
pub const QHD_PER_DEVICE: usize = 3;
/// qTDs available per device slot for non-control transfers.
pub const QTD_PER_DEVICE: usize = 8;

/// The index of a qHD or qTD within a [`DeviceSlot`]'s pools.
pub type PoolIndex = u8;

/// All schedulable state owned by one USB address (1..=`HOST_DEVICE_MAX`).
///
/// Address 0 is special-cased: it has no `DeviceSlot` of its own and reuses
/// the async list's head QHD (invariant 5).
pub struct DeviceSlot {
    pub control_qhd: QueueHead,
    pub control_qtd: [QueueTransferDescriptor; 3],
    pub qhd: [QueueHead; QHD_PER_DEVICE],
    pub qtd: [QueueTransferDescriptor; QTD_PER_DEVICE],
}

impl DeviceSlot {
    pub const fn empty() -> Self {
        DeviceSlot {
            control_qhd: QueueHead::empty(),
            control_qtd: [QueueTransferDescriptor::empty(); 3],
            qhd: [QueueHead::empty(); QHD_PER_DEVICE],
            qtd: [QueueTransferDescriptor::empty(); QTD_PER_DEVICE],
        }
    }

    /// Release every QHD/qTD owned by this slot. Used by the ISR's
    /// async-advance handler once a device's control QHD has been reclaimed
    /// (§4.E "Async advance").
    pub fn release_all(&mut self) {
        self.control_qhd.used = false;
        self.control_qhd.p_qtd_list_head = None;
        self.control_qhd.p_qtd_list_tail = None;
        for qtd in &mut self.control_qtd {
            qtd.used = false;
        }
        for qhd in &mut self.qhd {
            qhd.used = false;
            qhd.p_qtd_list_head = None;
            qhd.p_qtd_list_tail = None;
        }
        for qtd in &mut self.qtd {
            qtd.used = false;
        }
    }

    /// Find a free non-control QHD slot (§4.B `qhd_find_free`).
    pub fn qhd_find_free(&self) -> Option<PoolIndex> {
        self.qhd
            .iter()
            .position(|qhd| !qhd.used)
            .map(|i| i as PoolIndex)
    }

    /// Find a free qTD slot (§4.B `qtd_find_free`).
    pub fn qtd_find_free(&self) -> Option<PoolIndex> {
        self.qtd
            .iter()
            .position(|qtd| !qtd.used)
            .map(|i| i as PoolIndex)
    }

    pub fn qhd_at(&self, index: PoolIndex) -> &QueueHead {
        &self.qhd[index as usize]
    }

    pub fn qhd_at_mut(&mut self, index: PoolIndex) -> &mut QueueHead {
        &mut self.qhd[index as usize]
    }

    pub fn qtd_at(&self, index: PoolIndex) -> &QueueTransferDescriptor {
        &self.qtd[index as usize]
    }

    pub fn qtd_at_mut(&mut self, index: PoolIndex) -> &mut QueueTransferDescriptor {
        &mut self.qtd[index as usize]
    }
}

/// Fixed-size table of per-device pools, indexed by device address (1-based;
/// `devices[0]` backs address 1, etc).
pub struct DevicePools {
    pub devices: [DeviceSlot; HOST_DEVICE_MAX],
}

impl DevicePools {
    pub const fn empty() -> Self {
        const EMPTY: DeviceSlot = DeviceSlot::empty();
        DevicePools {
            devices: [EMPTY; HOST_DEVICE_MAX],
        }
    }

    pub fn slot(&self, address: u8) -> Option<&DeviceSlot> {
        if address == 0 || address as usize > HOST_DEVICE_MAX {
            return None;
        }
        Some(&self.devices[address as usize - 1])
    }

    pub fn slot_mut(&mut self, address: u8) -> Option<&mut DeviceSlot> {
        if address == 0 || address as usize > HOST_DEVICE_MAX {
            return None;
        }
        Some(&mut self.devices[address as usize - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qhd_find_free_returns_first_unused_slot() {
        let mut slot = DeviceSlot::empty();
        assert_eq!(slot.qhd_find_free(), Some(0));
        slot.qhd[0].used = true;
        assert_eq!(slot.qhd_find_free(), Some(1));
        for qhd in &mut slot.qhd {
            qhd.used = true;
        }
        assert_eq!(slot.qhd_find_free(), None);
    }

    #[test]
    fn qtd_find_free_returns_first_unused_slot() {
        let mut slot = DeviceSlot::empty();
        slot.qtd[0].used = true;
        slot.qtd[1].used = true;
        assert_eq!(slot.qtd_find_free(), Some(2));
    }

    #[test]
    fn release_all_clears_every_qhd_and_qtd_in_the_slot() {
        let mut slot = DeviceSlot::empty();
        slot.control_qhd.used = true;
        slot.qhd[0].used = true;
        slot.qtd[0].used = true;
        slot.control_qtd[0].used = true;

        slot.release_all();

        assert!(!slot.control_qhd.used);
        assert!(slot.qhd.iter().all(|q| !q.used));
        assert!(slot.qtd.iter().all(|q| !q.used));
        assert!(slot.control_qtd.iter().all(|q| !q.used));
    }

    #[test]
    fn device_pools_reject_address_zero_and_out_of_range() {
        let pools = DevicePools::empty();
        assert!(pools.slot(0).is_none());
        assert!(pools.slot(HOST_DEVICE_MAX as u8 + 1).is_none());
        assert!(pools.slot(1).is_some());
        assert!(pools.slot(HOST_DEVICE_MAX as u8).is_some());
    }

    #[test]
    fn device_pools_addresses_map_to_distinct_slots() {
        let mut pools = DevicePools::empty();
        pools.slot_mut(1).unwrap().control_qhd.used = true;
        assert!(!pools.slot(2).unwrap().control_qhd.used);
    }
}
