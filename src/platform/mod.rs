//! Ambient platform support that the USB driver sits on top of.

pub mod dma;

/// Per-controller critical section around schedule list-link writes (§5
/// "Shared-resource policy"). A no-op on this single-core reference target,
/// since nothing here ever enables the EHCI IRQ vector (the ISR is driven
/// from the poll loop, never true interrupt context) — but a real interrupt
/// vector on a multi-core build would race `list_insert`/`list_remove_qhd`
/// against the ISR, so the guard is real rather than assumed away.
#[cfg(target_arch = "x86_64")]
pub fn critical_section<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn critical_section<R>(f: impl FnOnce() -> R) -> R {
    f()
}
