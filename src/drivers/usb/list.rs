//! Asynchronous and periodic schedule linkage (§4.C).
//!
//! QHDs live in statically allocated DMA memory and reference each other by
//! physical address (identity-mapped on this target, so a Rust reference's
//! address doubles as the hardware-visible link value) rather than by any
//! owned/borrowed Rust graph — the controller is a second, concurrent writer
//! of the `horizontal_link` word, so ordinary borrow-checked aliasing rules
//! don't apply to it. All linking code here is `unsafe` for that reason and
//! is the only code in the crate allowed to walk these pointers.

use core::sync::atomic::{fence, Ordering};

use super::qh::QueueHead;
use super::regs::{qh_link, QTD_TERMINATE};

/// Hardware link-field address of a QHD (masking off type/terminate bits is
/// the caller's responsibility when reading one back).
pub fn link_address(qhd: &QueueHead) -> u32 {
    qhd as *const QueueHead as u32
}

fn target_address(link: u32) -> u32 {
    link & !(qh_link::TYPE_MASK | qh_link::TERMINATE)
}

/// # Safety
/// `addr` must be a valid, non-terminate QHD link value produced by
/// [`link_address`], still alive for `'a`.
unsafe fn qh_at<'a>(addr: u32) -> &'a mut QueueHead {
    &mut *(addr as *mut QueueHead)
}

/// Splice `new` into the list immediately after `current` (§4.C
/// `list_insert`). Publishes `new`'s own link before publishing the pointer
/// to `new`, so the controller never observes a partially-linked node.
///
/// # Safety
/// `current` and `new` must both be live, hardware-visible QHDs in the same
/// circular list; `new` must not already be linked.
pub unsafe fn list_insert(current: &mut QueueHead, new: &mut QueueHead) {
    crate::platform::critical_section(|| {
        new.horizontal_link = current.horizontal_link;
        fence(Ordering::SeqCst);
        current.horizontal_link = link_address(new) | qh_link::TYPE_QH;
    });
}

/// Walk the circular list starting at `head`, returning the QHD whose
/// `horizontal_link` points at `target` (§4.C `list_find_previous_qhd`).
/// Bounded by `max_hops` to guard against a corrupted list ever producing an
/// infinite walk.
///
/// # Safety
/// `head` must be the permanently-linked head of a circular QHD list.
pub unsafe fn list_find_previous_qhd<'a>(
    head: &'a mut QueueHead,
    target: u32,
    max_hops: usize,
) -> Option<&'a mut QueueHead> {
    let head_addr = link_address(head);
    let mut current_addr = head_addr;
    for _ in 0..max_hops {
        let current = qh_at::<'a>(current_addr);
        let next_addr = target_address(current.horizontal_link);
        if next_addr == target {
            return Some(qh_at::<'a>(current_addr));
        }
        if next_addr == head_addr {
            return None;
        }
        current_addr = next_addr;
    }
    None
}

/// Unlink `target` from the circular list rooted at `head` (§4.C
/// `list_remove_qhd`). The previous QHD's link skips over `target`; `target`
/// itself is then pointed back at `head` so that if the controller had
/// already cached `target`'s address, it converges back onto the list
/// instead of running off into freed memory (invariant 4's "not touched
/// until async-advance/one frame" still governs when the pool slot may be
/// reused — this only makes the transient window safe).
///
/// # Safety
/// Same requirements as [`list_find_previous_qhd`]; `target` must currently
/// be linked into the list rooted at `head`.
pub unsafe fn list_remove_qhd(head: &mut QueueHead, target: &mut QueueHead) {
    let target_addr = link_address(target);
    let head_addr = link_address(head);
    crate::platform::critical_section(|| {
        if let Some(prev) = list_find_previous_qhd(head, target_addr, super::pool::HOST_DEVICE_MAX * 4 + 4) {
            prev.horizontal_link = target.horizontal_link;
        }
        fence(Ordering::SeqCst);
        target.horizontal_link = head_addr | qh_link::TYPE_QH;
    });
}

/// Periodic framelist entry: every slot links either to the periodic head or
/// terminates (invariant 2).
pub fn periodic_entry_for(head: &QueueHead) -> u32 {
    link_address(head) | qh_link::TYPE_QH
}

/// A terminated framelist entry, used before the periodic head is installed.
pub const PERIODIC_ENTRY_TERMINATE: u32 = QTD_TERMINATE;

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_head() -> QueueHead {
        let mut qhd = QueueHead::empty();
        qhd.init_async_head();
        qhd
    }

    #[test]
    fn insert_splices_new_node_immediately_after_current() {
        let mut head = fresh_head();
        head.horizontal_link = link_address(&head) | qh_link::TYPE_QH;
        let mut new = QueueHead::empty();

        unsafe { list_insert(&mut head, &mut new) };

        assert_eq!(target_address(head.horizontal_link), link_address(&new));
        assert_eq!(target_address(new.horizontal_link), link_address(&head));
    }

    #[test]
    fn insert_two_nodes_forms_three_element_ring() {
        let mut head = fresh_head();
        head.horizontal_link = link_address(&head) | qh_link::TYPE_QH;
        let mut a = QueueHead::empty();
        let mut b = QueueHead::empty();

        unsafe {
            list_insert(&mut head, &mut a);
            list_insert(&mut head, &mut b);
        }

        // head -> b -> a -> head
        assert_eq!(target_address(head.horizontal_link), link_address(&b));
        assert_eq!(target_address(b.horizontal_link), link_address(&a));
        assert_eq!(target_address(a.horizontal_link), link_address(&head));
    }

    #[test]
    fn find_previous_qhd_locates_predecessor() {
        let mut head = fresh_head();
        head.horizontal_link = link_address(&head) | qh_link::TYPE_QH;
        let mut a = QueueHead::empty();
        let mut b = QueueHead::empty();
        unsafe {
            list_insert(&mut head, &mut a);
            list_insert(&mut a, &mut b);
        }

        let b_addr = link_address(&b);
        let prev = unsafe { list_find_previous_qhd(&mut head, b_addr, 8) };
        assert_eq!(prev.map(|qhd| qhd as *mut QueueHead as u32), Some(link_address(&a)));
    }

    #[test]
    fn remove_qhd_reknits_list_and_self_points_at_head() {
        let mut head = fresh_head();
        head.horizontal_link = link_address(&head) | qh_link::TYPE_QH;
        let mut a = QueueHead::empty();
        let mut b = QueueHead::empty();
        unsafe {
            list_insert(&mut head, &mut a);
            list_insert(&mut a, &mut b);
        }

        unsafe { list_remove_qhd(&mut head, &mut a) };

        // head -> b -> head, with a pointed back at head (invariant 4's
        // transient-safety window).
        assert_eq!(target_address(head.horizontal_link), link_address(&b));
        assert_eq!(target_address(b.horizontal_link), link_address(&head));
        assert_eq!(target_address(a.horizontal_link), link_address(&head));
    }

    #[test]
    fn periodic_entry_carries_qh_type_bit() {
        let head = fresh_head();
        let entry = periodic_entry_for(&head);
        assert_eq!(entry & qh_link::TYPE_MASK, qh_link::TYPE_QH);
        assert_eq!(target_address(entry), link_address(&head));
    }
}
