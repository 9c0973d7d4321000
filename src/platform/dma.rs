//! Physical/DMA memory allocation.
//!
//! The donor firmware backs its DMA buffers with `efi::allocate_pages`, a
//! UEFI boot-services call; that surface is out of scope for this crate
//! (§1 Non-goals). The QHD/qTD pools, periodic framelist, and transfer
//! buffers still need physically addressable, never-freed, suitably aligned
//! memory, so this provides a minimal bump allocator over a static arena.
//! This target runs with an identity page mapping, so a virtual address
//! doubles as the physical address the controller DMAs against.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Size of the static DMA arena backing all USB driver allocations.
const ARENA_SIZE: usize = 256 * 1024;

#[repr(align(4096))]
struct AlignedArena(UnsafeCell<[u8; ARENA_SIZE]>);

// SAFETY: access is serialized through `OFFSET`, guarded by `ARENA_LOCK`.
unsafe impl Sync for AlignedArena {}

static ARENA: AlignedArena = AlignedArena(UnsafeCell::new([0u8; ARENA_SIZE]));
static ARENA_LOCK: Mutex<()> = Mutex::new(());
static OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Error returned when the static DMA arena is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct AllocationFailed;

/// Allocate `size` bytes aligned to `align` (must be a power of two) from the
/// static DMA arena. The allocation is never freed; the arena is sized for
/// the lifetime allocations the driver needs (device slot pools, framelist).
pub fn alloc_aligned(size: usize, align: usize) -> Result<*mut u8, AllocationFailed> {
    debug_assert!(align.is_power_of_two());
    let _guard = ARENA_LOCK.lock();
    let base = ARENA.0.get() as usize;
    let current = base + OFFSET.load(Ordering::Relaxed);
    let aligned = (current + align - 1) & !(align - 1);
    let new_offset = aligned + size - base;
    if new_offset > ARENA_SIZE {
        return Err(AllocationFailed);
    }
    OFFSET.store(new_offset, Ordering::Relaxed);
    Ok(aligned as *mut u8)
}

/// Allocate a zeroed, `align`-aligned buffer of `size` bytes.
pub fn alloc_zeroed(size: usize, align: usize) -> Result<*mut u8, AllocationFailed> {
    let ptr = alloc_aligned(size, align)?;
    unsafe {
        core::ptr::write_bytes(ptr, 0, size);
    }
    Ok(ptr)
}
