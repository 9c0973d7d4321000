//! EHCI register definitions using `tock-registers`.
//!
//! # References
//! - EHCI Specification 1.0

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

// ============================================================================
// Capability Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// Capability Register Length and Interface Version (offset 0x00)
    pub CAPLENGTH_HCIVERSION [
        CAPLENGTH OFFSET(0) NUMBITS(8) [],
        HCIVERSION OFFSET(16) NUMBITS(16) []
    ],

    /// Structural Parameters (HCSPARAMS) - offset 0x04
    pub HCSPARAMS [
        N_PORTS OFFSET(0) NUMBITS(4) [],
        PPC OFFSET(4) NUMBITS(1) [],
        PRR OFFSET(7) NUMBITS(1) [],
        N_PCC OFFSET(8) NUMBITS(4) [],
        N_CC OFFSET(12) NUMBITS(4) [],
        P_INDICATOR OFFSET(16) NUMBITS(1) [],
        DEBUG_N OFFSET(20) NUMBITS(4) []
    ],

    /// Capability Parameters (HCCPARAMS) - offset 0x08
    pub HCCPARAMS [
        AC64 OFFSET(0) NUMBITS(1) [],
        PFLF OFFSET(1) NUMBITS(1) [],
        ASPC OFFSET(2) NUMBITS(1) [],
        IST OFFSET(4) NUMBITS(4) [],
        EECP OFFSET(8) NUMBITS(8) []
    ]
];

// ============================================================================
// Operational Register Bitfield Definitions
// ============================================================================

register_bitfields! [
    u32,
    /// USB Command (USBCMD) - op offset 0x00
    pub USBCMD [
        RS OFFSET(0) NUMBITS(1) [],
        HCRESET OFFSET(1) NUMBITS(1) [],
        FLS OFFSET(2) NUMBITS(2) [
            Size1024 = 0,
            Size512 = 1,
            Size256 = 2,
            Reserved = 3
        ],
        PSE OFFSET(4) NUMBITS(1) [],
        ASE OFFSET(5) NUMBITS(1) [],
        IAAD OFFSET(6) NUMBITS(1) [],
        LHCRESET OFFSET(7) NUMBITS(1) [],
        ASPMC OFFSET(8) NUMBITS(2) [],
        ASPME OFFSET(11) NUMBITS(1) [],
        ITC OFFSET(16) NUMBITS(8) [
            Micro1 = 0x01,
            Micro2 = 0x02,
            Micro4 = 0x04,
            Micro8 = 0x08,
            Micro16 = 0x10,
            Micro32 = 0x20,
            Micro64 = 0x40
        ]
    ],

    /// USB Status (USBSTS) - op offset 0x04
    pub USBSTS [
        USBINT OFFSET(0) NUMBITS(1) [],
        USBERRINT OFFSET(1) NUMBITS(1) [],
        PCD OFFSET(2) NUMBITS(1) [],
        FLR OFFSET(3) NUMBITS(1) [],
        HSE OFFSET(4) NUMBITS(1) [],
        IAA OFFSET(5) NUMBITS(1) [],
        HCHALTED OFFSET(12) NUMBITS(1) [],
        RECLAMATION OFFSET(13) NUMBITS(1) [],
        PSS OFFSET(14) NUMBITS(1) [],
        ASS OFFSET(15) NUMBITS(1) []
    ],

    /// USB Interrupt Enable (USBINTR) - op offset 0x08
    pub USBINTR [
        USBIE OFFSET(0) NUMBITS(1) [],
        USBEIE OFFSET(1) NUMBITS(1) [],
        PCIE OFFSET(2) NUMBITS(1) [],
        FLRE OFFSET(3) NUMBITS(1) [],
        HSEE OFFSET(4) NUMBITS(1) [],
        IAAE OFFSET(5) NUMBITS(1) []
    ],

    /// Configure Flag (CONFIGFLAG) - op offset 0x40
    pub CONFIGFLAG [
        CF OFFSET(0) NUMBITS(1) []
    ],

    /// Port Status and Control (PORTSC) - per port, starting at op offset 0x44
    pub PORTSC [
        CCS OFFSET(0) NUMBITS(1) [],
        CSC OFFSET(1) NUMBITS(1) [],
        PE OFFSET(2) NUMBITS(1) [],
        PEC OFFSET(3) NUMBITS(1) [],
        OCA OFFSET(4) NUMBITS(1) [],
        OCC OFFSET(5) NUMBITS(1) [],
        FPR OFFSET(6) NUMBITS(1) [],
        SUSPEND OFFSET(7) NUMBITS(1) [],
        PR OFFSET(8) NUMBITS(1) [],
        LS OFFSET(10) NUMBITS(2) [
            SE0 = 0,
            KState = 1,
            JState = 2,
            Undefined = 3
        ],
        PP OFFSET(12) NUMBITS(1) [],
        PO OFFSET(13) NUMBITS(1) [],
        PIC OFFSET(14) NUMBITS(2) [
            Off = 0,
            Amber = 1,
            Green = 2,
            Undefined = 3
        ],
        PTC OFFSET(16) NUMBITS(4) [
            Disabled = 0,
            JState = 1,
            KState = 2,
            SE0Nak = 3,
            Packet = 4,
            ForceEnable = 5
        ],
        WKCNNT_E OFFSET(20) NUMBITS(1) [],
        WKDSCNNT_E OFFSET(21) NUMBITS(1) [],
        WKOC_E OFFSET(22) NUMBITS(1) []
    ],

    /// TT Control (TTCTRL) - NXP-variant op offset 0x5C, split-transaction hub routing
    pub TTCTRL [
        TTHUBADDR OFFSET(24) NUMBITS(7) []
    ]
];

// ============================================================================
// EHCI Capability Registers Memory Map
// ============================================================================

/// EHCI Capability Registers (read-only, minimum 0x10 bytes)
#[repr(C)]
pub struct EhciCapRegs {
    pub caplength_hciversion: ReadOnly<u32, CAPLENGTH_HCIVERSION::Register>,
    pub hcsparams: ReadOnly<u32, HCSPARAMS::Register>,
    pub hccparams: ReadOnly<u32, HCCPARAMS::Register>,
    pub hcsp_portroute: [u8; 8],
}

/// EHCI Operational Registers
#[repr(C)]
pub struct EhciOpRegs {
    pub usbcmd: ReadWrite<u32, USBCMD::Register>,
    pub usbsts: ReadWrite<u32, USBSTS::Register>,
    pub usbintr: ReadWrite<u32, USBINTR::Register>,
    pub frindex: ReadWrite<u32>,
    pub ctrldssegment: ReadWrite<u32>,
    pub periodiclistbase: ReadWrite<u32>,
    pub asynclistaddr: ReadWrite<u32>,
    _reserved: [u32; 8],
    pub ttctrl: ReadWrite<u32, TTCTRL::Register>,
    pub configflag: ReadWrite<u32, CONFIGFLAG::Register>,
}

/// EHCI Port Register (one per port)
#[repr(C)]
pub struct EhciPortRegs {
    pub portsc: ReadWrite<u32, PORTSC::Register>,
}

// ============================================================================
// Operational Register Offsets (relative to CAPLENGTH)
// ============================================================================

pub const OP_PORTSC_BASE: u64 = 0x44;

// ============================================================================
// EHCI Extended Capabilities
// ============================================================================

pub const USBLEGSUP_CAP_ID: u8 = 0x01;

/// USBLEGSUP register bits (BIOS/OS handoff).
pub mod usblegsup {
    pub const HC_BIOS_OWNED: u32 = 1 << 16;
    pub const HC_OS_OWNED: u32 = 1 << 24;
}

// ============================================================================
// Queue Head (QH) Constants
// ============================================================================

pub mod qh_link {
    pub const TERMINATE: u32 = 1;
    pub const TYPE_ITD: u32 = 0 << 1;
    pub const TYPE_QH: u32 = 1 << 1;
    pub const TYPE_SITD: u32 = 2 << 1;
    pub const TYPE_FSTN: u32 = 3 << 1;
    pub const TYPE_MASK: u32 = 3 << 1;
}

pub mod qh_ep_chars {
    pub const DEVADDR_MASK: u32 = 0x7F;
    pub const INACTIVE: u32 = 1 << 7;
    pub const ENDPT_SHIFT: u32 = 8;
    pub const ENDPT_MASK: u32 = 0xF << 8;
    pub const EPS_SHIFT: u32 = 12;
    pub const EPS_FULL: u32 = 0 << 12;
    pub const EPS_LOW: u32 = 1 << 12;
    pub const EPS_HIGH: u32 = 2 << 12;
    pub const DTC: u32 = 1 << 14;
    pub const HEAD: u32 = 1 << 15;
    pub const MAXPKT_SHIFT: u32 = 16;
    pub const MAXPKT_MASK: u32 = 0x7FF << 16;
    pub const CTRL: u32 = 1 << 27;
    pub const RL_SHIFT: u32 = 28;
    pub const RL_MASK: u32 = 0xF << 28;
}

pub mod qh_ep_caps {
    pub const SMASK_SHIFT: u32 = 0;
    pub const CMASK_SHIFT: u32 = 8;
    pub const HUBADDR_SHIFT: u32 = 16;
    pub const PORTNUM_SHIFT: u32 = 23;
    pub const MULT_SHIFT: u32 = 30;
}

// ============================================================================
// Queue Element Transfer Descriptor (qTD) Constants
// ============================================================================

pub mod qtd_token {
    /// Ping State (bit 0): for a high-speed bulk/control OUT qTD, set to
    /// force the controller to issue a PING token before the next OUT
    /// transaction (EHCI §4.11).
    pub const PING_STATE: u32 = 1 << 0;
    pub const STATUS_SPLIT: u32 = 1 << 1;
    pub const STATUS_MISSED_UFRAME: u32 = 1 << 2;
    pub const STATUS_XACT_ERR: u32 = 1 << 3;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_BUFFER_ERR: u32 = 1 << 5;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_MASK: u32 = 0xFF;

    pub const PID_OUT: u32 = 0 << 8;
    pub const PID_IN: u32 = 1 << 8;
    pub const PID_SETUP: u32 = 2 << 8;

    pub const CERR_SHIFT: u32 = 10;
    pub const CPAGE_SHIFT: u32 = 12;
    pub const IOC: u32 = 1 << 15;
    pub const BYTES_SHIFT: u32 = 16;
    pub const BYTES_MASK: u32 = 0x7FFF << 16;
    pub const TOGGLE: u32 = 1 << 31;

    pub const ERROR_MASK: u32 = STATUS_HALTED | STATUS_BUFFER_ERR | STATUS_BABBLE | STATUS_XACT_ERR;
}

/// qTD/QH terminate bit.
pub const QTD_TERMINATE: u32 = 1;

/// Raw USBSTS bit positions, for code that acknowledges the register
/// outside the typed `USBSTS::Register` view (e.g. the ISR's single
/// read-ack-dispatch pass, §4.E).
pub mod usbsts_bits {
    pub const USBINT: u32 = 1 << 0;
    pub const USBERRINT: u32 = 1 << 1;
    pub const PCD: u32 = 1 << 2;
    pub const IAA: u32 = 1 << 5;
}
