//! Error taxonomy for the EHCI driver and enumeration state machine.

/// Crate-level error type returned at the public driver API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// A caller passed an invalid device address, endpoint, or buffer length.
    InvalidParameter,
    /// The device's QHD or qTD pool has no free entries.
    PoolExhausted,
    /// A hardware handshake (controller reset/stop, async advance) did not
    /// complete within its budget.
    Timeout,
    /// A device did not respond to a control transfer before the
    /// enumeration step's timeout.
    DeviceNotResponding,
    /// The controller reported a transaction, buffer, or babble error on a qTD.
    XferError,
    /// The controller halted the QHD with a non-zero device address (STALL).
    Stall,
    /// The requested pipe type is not supported (isochronous).
    Unsupported,
    /// No EHCI controller was found on the PCI bus.
    PciDeviceNotFound,
    /// The static DMA arena could not satisfy an allocation.
    AllocationFailed,
}

impl From<crate::platform::dma::AllocationFailed> for UsbError {
    fn from(_: crate::platform::dma::AllocationFailed) -> Self {
        UsbError::AllocationFailed
    }
}

pub type UsbResult<T> = Result<T, UsbError>;
