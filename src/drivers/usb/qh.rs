//! Queue Head (QHD) and Queue Element Transfer Descriptor (qTD) layouts.
//!
//! Hardware-visible fields follow EHCI spec §3.6/§3.5 bit-for-bit; this is
//! grounded on the donor `usb::ehci` module's `QueueHead`/
//! `QueueTransferDescriptor` definitions, generalized to the device-table
//! driven initialization this crate's enumeration state machine needs.

use super::desc::Direction;
use super::regs::{qh_ep_caps, qh_ep_chars, qh_link, qtd_token, QTD_TERMINATE};

/// Page size used when splitting a buffer across qTD buffer pointers.
const PAGE_SIZE: u32 = 4096;
/// Maximum number of bytes a single qTD can describe (5 x 4 KiB pages,
/// first page possibly partial).
pub const QTD_MAX_BYTES: usize = 5 * 4096;

/// A single Queue Element Transfer Descriptor. 32-byte aligned per EHCI §3.5.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(32))]
pub struct QueueTransferDescriptor {
    pub next_qtd: u32,
    pub alt_qtd: u32,
    pub token: u32,
    pub buffer_ptrs: [u32; 5],
    pub ext_buffer_ptrs: [u32; 5],
    /// Driver-private: true from allocation until the ISR retires this qTD.
    pub used: bool,
}

impl QueueTransferDescriptor {
    pub const fn empty() -> Self {
        QueueTransferDescriptor {
            next_qtd: QTD_TERMINATE,
            alt_qtd: QTD_TERMINATE,
            token: 0,
            buffer_ptrs: [0; 5],
            ext_buffer_ptrs: [0; 5],
            used: false,
        }
    }

    /// Initialize as a fresh qTD: active, `cerr`=3, PID/toggle/bytes set,
    /// buffer pointers laid out across consecutive 4 KiB pages starting at
    /// `buffer`.
    pub fn init(&mut self, pid: u32, buffer: u32, len: usize, toggle: bool, ioc: bool) {
        debug_assert!(len <= QTD_MAX_BYTES);
        self.next_qtd = QTD_TERMINATE;
        self.alt_qtd = QTD_TERMINATE;

        let mut token = qtd_token::STATUS_ACTIVE | pid | (3 << qtd_token::CERR_SHIFT);
        token |= (len as u32) << qtd_token::BYTES_SHIFT;
        if toggle {
            token |= qtd_token::TOGGLE;
        }
        if ioc {
            token |= qtd_token::IOC;
        }
        self.token = token;

        self.buffer_ptrs = [0; 5];
        self.ext_buffer_ptrs = [0; 5];
        if len > 0 {
            self.buffer_ptrs[0] = buffer;
            for i in 1..5 {
                let prev_page = self.buffer_ptrs[i - 1] & !(PAGE_SIZE - 1);
                self.buffer_ptrs[i] = prev_page + PAGE_SIZE;
            }
        }
        self.used = true;
    }

    pub fn setup(buffer: u32) -> Self {
        let mut qtd = Self::empty();
        qtd.init(qtd_token::PID_SETUP, buffer, 8, false, false);
        qtd
    }

    pub fn data(pid: u32, buffer: u32, len: usize, toggle: bool, ioc: bool) -> Self {
        let mut qtd = Self::empty();
        qtd.init(pid, buffer, len, toggle, ioc);
        qtd
    }

    pub fn status(pid: u32) -> Self {
        let mut qtd = Self::empty();
        qtd.init(pid, 0, 0, true, true);
        qtd
    }

    pub fn is_active(&self) -> bool {
        self.token & qtd_token::STATUS_ACTIVE != 0
    }

    pub fn is_halted(&self) -> bool {
        self.token & qtd_token::STATUS_HALTED != 0
    }

    pub fn has_error(&self) -> bool {
        self.token & qtd_token::ERROR_MASK != 0
    }

    pub fn is_complete(&self) -> bool {
        !self.is_active()
    }

    pub fn bytes_remaining(&self) -> u32 {
        (self.token & qtd_token::BYTES_MASK) >> qtd_token::BYTES_SHIFT
    }
}

/// A single Queue Head. 32-byte aligned per EHCI §3.6.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(32))]
pub struct QueueHead {
    pub horizontal_link: u32,
    pub endpoint_chars: u32,
    pub endpoint_caps: u32,
    pub current_qtd: u32,
    pub overlay: QueueTransferDescriptor,
    /// Driver-private: true while linked into a schedule.
    pub used: bool,
    /// Driver-private: set when unlink has been requested but not yet
    /// confirmed by async-advance / one periodic frame (invariant 4).
    pub is_removing: bool,
    pub pid_non_control: u32,
    pub class_code: u8,
    /// Driver-private: index (within the owning device slot's qTD pool) of
    /// the first not-yet-retired qTD queued on this QHD, in enqueue order
    /// (`p_qtd_list_head`, §3 Data Model). `None` when idle.
    pub p_qtd_list_head: Option<u8>,
    /// Driver-private: index of the last qTD appended to this QHD's chain
    /// (`p_qtd_list_tail`, §3 Data Model). `None` when idle.
    pub p_qtd_list_tail: Option<u8>,
}

impl QueueHead {
    pub const fn empty() -> Self {
        QueueHead {
            horizontal_link: qh_link::TERMINATE,
            endpoint_chars: 0,
            endpoint_caps: 0,
            current_qtd: 0,
            overlay: QueueTransferDescriptor::empty(),
            used: false,
            is_removing: false,
            pid_non_control: qtd_token::PID_OUT,
            class_code: 0,
            p_qtd_list_head: None,
            p_qtd_list_tail: None,
        }
    }

    /// Initialize as the asynchronous list's permanent head-of-list QHD
    /// (shared with address 0, invariant 5/1).
    pub fn init_async_head(&mut self) {
        *self = Self::empty();
        self.endpoint_chars = qh_ep_chars::HEAD | qh_ep_chars::DTC;
        self.overlay.token = qtd_token::STATUS_HALTED;
        self.used = true;
    }

    /// Initialize a device QHD per SPEC_FULL §4.D. `device_address == 0`
    /// selects the address-0 slot (no separate QHD is allocated for it; the
    /// async head is reused by the caller instead) and is handled by
    /// [`Self::init_address_zero`] without wiping the QHD.
    #[allow(clippy::too_many_arguments)]
    pub fn init_device(
        &mut self,
        device_address: u8,
        endpoint_number: u8,
        max_packet_size: u16,
        is_high_speed: bool,
        is_low_speed: bool,
        is_control: bool,
        is_interrupt: bool,
        hub_address: u8,
        hub_port: u8,
    ) {
        if device_address == 0 {
            self.init_address_zero(max_packet_size, is_high_speed, is_low_speed, hub_address, hub_port);
            return;
        }
        *self = Self::empty();
        self.used = true;

        let speed_bits = if is_high_speed {
            qh_ep_chars::EPS_HIGH
        } else if is_low_speed {
            qh_ep_chars::EPS_LOW
        } else {
            qh_ep_chars::EPS_FULL
        };

        let mut chars = (device_address as u32) & qh_ep_chars::DEVADDR_MASK;
        chars |= ((endpoint_number as u32) << qh_ep_chars::ENDPT_SHIFT) & qh_ep_chars::ENDPT_MASK;
        chars |= speed_bits;
        chars |= ((max_packet_size as u32) << qh_ep_chars::MAXPKT_SHIFT) & qh_ep_chars::MAXPKT_MASK;
        chars |= (3 << qh_ep_chars::RL_SHIFT) & qh_ep_chars::RL_MASK;

        if is_control {
            chars |= qh_ep_chars::DTC;
            if !is_high_speed {
                chars |= qh_ep_chars::CTRL;
            }
        }
        self.endpoint_chars = chars;

        let mut caps = 0u32;
        if is_interrupt {
            let smask: u32 = if is_high_speed { 0xFF } else { 0x01 };
            caps |= smask << qh_ep_caps::SMASK_SHIFT;
            if !is_high_speed {
                caps |= 0b0011100 << qh_ep_caps::CMASK_SHIFT;
            }
        }
        if !is_high_speed {
            caps |= (hub_address as u32) << qh_ep_caps::HUBADDR_SHIFT;
            caps |= (hub_port as u32) << qh_ep_caps::PORTNUM_SHIFT;
        }
        caps |= 1 << qh_ep_caps::MULT_SHIFT;
        self.endpoint_caps = caps;

        self.overlay = QueueTransferDescriptor::empty();
        self.overlay.token = 0;
        self.pid_non_control = qtd_token::PID_OUT;
    }

    /// Refresh the async head's endpoint characteristics for an address-0
    /// control pipe without disturbing the fields that make it the async
    /// list's permanent head: `horizontal_link` (its circular self-link),
    /// `head_list_flag`, the permanently-halted overlay, and `p_qtd_list_*`.
    /// tinyusb's `qhd_init` (ehci.c) deliberately skips its `memclr_` for
    /// this same case and always forces `head_list_flag` on for address 0;
    /// wiping those fields here would break invariant 1 and testable
    /// property 2 every time a new device is enumerated.
    fn init_address_zero(
        &mut self,
        max_packet_size: u16,
        is_high_speed: bool,
        is_low_speed: bool,
        hub_address: u8,
        hub_port: u8,
    ) {
        self.used = true;

        let speed_bits = if is_high_speed {
            qh_ep_chars::EPS_HIGH
        } else if is_low_speed {
            qh_ep_chars::EPS_LOW
        } else {
            qh_ep_chars::EPS_FULL
        };

        let mut chars = qh_ep_chars::HEAD | qh_ep_chars::DTC;
        chars |= speed_bits;
        chars |= ((max_packet_size as u32) << qh_ep_chars::MAXPKT_SHIFT) & qh_ep_chars::MAXPKT_MASK;
        chars |= (3 << qh_ep_chars::RL_SHIFT) & qh_ep_chars::RL_MASK;
        if !is_high_speed {
            chars |= qh_ep_chars::CTRL;
        }
        self.endpoint_chars = chars;

        let mut caps = 1 << qh_ep_caps::MULT_SHIFT;
        if !is_high_speed {
            caps |= (hub_address as u32) << qh_ep_caps::HUBADDR_SHIFT;
            caps |= (hub_port as u32) << qh_ep_caps::PORTNUM_SHIFT;
        }
        self.endpoint_caps = caps;
        self.pid_non_control = qtd_token::PID_OUT;
    }

    pub fn is_head_of_list(&self) -> bool {
        self.endpoint_chars & qh_ep_chars::HEAD != 0
    }

    pub fn device_address(&self) -> u8 {
        (self.endpoint_chars & qh_ep_chars::DEVADDR_MASK) as u8
    }

    /// Whether this QHD's endpoint speed is high-speed (EHCI §3.6, `EPS` field).
    pub fn is_high_speed(&self) -> bool {
        (self.endpoint_chars >> qh_ep_chars::EPS_SHIFT) & 0b11 == qh_ep_chars::EPS_HIGH >> qh_ep_chars::EPS_SHIFT
    }

    /// Whether this QHD schedules on the periodic (interrupt) list, judged
    /// by a non-zero interrupt schedule mask (§4.D QHD initialization sets
    /// `smask` only for interrupt endpoints).
    pub fn is_interrupt(&self) -> bool {
        self.endpoint_caps & (0xFF << qh_ep_caps::SMASK_SHIFT) != 0
    }
}

/// Translate a logical transfer direction into the qTD PID field value.
pub fn pid_for_direction(direction: Direction) -> u32 {
    match direction {
        Direction::In => qtd_token::PID_IN,
        Direction::Out => qtd_token::PID_OUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qtd_init_sets_active_cerr_and_length() {
        let mut qtd = QueueTransferDescriptor::empty();
        qtd.init(qtd_token::PID_IN, 0x1000, 64, true, true);

        assert!(qtd.is_active());
        assert!(!qtd.is_halted());
        assert_eq!(qtd.token & qtd_token::TOGGLE, qtd_token::TOGGLE);
        assert_eq!(qtd.token & qtd_token::IOC, qtd_token::IOC);
        assert_eq!((qtd.token & qtd_token::BYTES_MASK) >> qtd_token::BYTES_SHIFT, 64);
        assert_eq!(qtd.buffer_ptrs[0], 0x1000);
        assert!(qtd.used);
    }

    #[test]
    fn qtd_zero_length_leaves_buffer_pointers_clear() {
        let mut qtd = QueueTransferDescriptor::empty();
        qtd.init(qtd_token::PID_OUT, 0x2000, 0, false, false);
        assert_eq!(qtd.buffer_ptrs, [0; 5]);
    }

    #[test]
    fn setup_qtd_is_eight_bytes_pid_setup_no_toggle() {
        let qtd = QueueTransferDescriptor::setup(0x3000);
        assert_eq!(qtd.token & 0x3 << 8, qtd_token::PID_SETUP);
        assert_eq!((qtd.token & qtd_token::BYTES_MASK) >> qtd_token::BYTES_SHIFT, 8);
        assert_eq!(qtd.token & qtd_token::TOGGLE, 0);
    }

    #[test]
    fn status_qtd_always_asserts_toggle_and_ioc() {
        let qtd = QueueTransferDescriptor::status(qtd_token::PID_IN);
        assert_eq!(qtd.token & qtd_token::TOGGLE, qtd_token::TOGGLE);
        assert_eq!(qtd.token & qtd_token::IOC, qtd_token::IOC);
        assert_eq!(qtd.buffer_ptrs[0], 0);
    }

    #[test]
    fn init_device_encodes_address_and_high_speed() {
        let mut qhd = QueueHead::empty();
        qhd.init_device(5, 2, 64, true, false, false, false, 0, 0);
        assert_eq!(qhd.device_address(), 5);
        assert!(qhd.is_high_speed());
        assert!(!qhd.is_interrupt());
        assert!(!qhd.is_head_of_list());
    }

    #[test]
    fn init_device_low_speed_is_not_high_speed() {
        let mut qhd = QueueHead::empty();
        qhd.init_device(1, 0, 8, false, true, true, false, 2, 3);
        assert!(!qhd.is_high_speed());
        // DTC is set for control endpoints regardless of speed.
        assert_ne!(qhd.endpoint_chars & qh_ep_chars::DTC, 0);
    }

    #[test]
    fn interrupt_endpoint_sets_smask_and_full_speed_cmask() {
        let mut qhd = QueueHead::empty();
        qhd.init_device(7, 1, 8, false, false, false, true, 4, 1);
        assert!(qhd.is_interrupt());
        let smask = qhd.endpoint_caps & 0xFF;
        assert_eq!(smask, 0x01);
        let cmask = (qhd.endpoint_caps >> qh_ep_caps::CMASK_SHIFT) & 0xFF;
        // EHCI complete-split mask for a non-high-speed interrupt endpoint
        // covers microframes 2 through 4 (bits 2..5 == 0b0011100).
        assert_eq!(cmask, 0b0011100);
    }

    #[test]
    fn high_speed_interrupt_sets_full_smask_and_no_cmask() {
        let mut qhd = QueueHead::empty();
        qhd.init_device(7, 1, 8, true, false, false, true, 0, 0);
        assert_eq!(qhd.endpoint_caps & 0xFF, 0xFF);
        assert_eq!((qhd.endpoint_caps >> qh_ep_caps::CMASK_SHIFT) & 0xFF, 0);
    }

    #[test]
    fn async_head_is_marked_head_of_list_and_halted() {
        let mut qhd = QueueHead::empty();
        qhd.init_async_head();
        assert!(qhd.is_head_of_list());
        assert!(qhd.overlay.is_halted());
        assert!(qhd.used);
    }

    #[test]
    fn pid_for_direction_matches_token_bits() {
        assert_eq!(pid_for_direction(Direction::In), qtd_token::PID_IN);
        assert_eq!(pid_for_direction(Direction::Out), qtd_token::PID_OUT);
    }
}
