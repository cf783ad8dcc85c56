use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{LoadError, Result};

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

enum MapState {
    Rw(MmapMut),
    Ro(Mmap),
    Rx(Mmap),
    /// Transient state while a protection change is in flight.
    Empty,
}

/// A page-aligned, `mlock`ed anonymous mapping.
///
/// Arenas start out read-write and are transitioned exactly once to their
/// final protection (RX for code, RO for data/GOT); BSS arenas stay RW.
/// The base address never changes across a protection transition.
pub struct PinnedArena {
    map: MapState,
    /// Offset of the aligned base inside the mapping (non-zero only when an
    /// alignment larger than the page size was requested).
    offset: usize,
    len: usize,
}

impl PinnedArena {
    /// Allocate `size` bytes (page granularity), zero-initialised and pinned.
    pub fn alloc(size: usize) -> Result<Self> {
        Self::alloc_aligned(size, page_size())
    }

    /// Allocate with a base alignment that may exceed the page size.
    pub fn alloc_aligned(size: usize, align: usize) -> Result<Self> {
        let arena = Self::alloc_unpinned(size, align)?;
        if let Err(e) = arena.lock() {
            log::error!("failed to pin memory: {e}");
            return Err(LoadError::Protection(e));
        }
        Ok(arena)
    }

    /// Aligned mapping without the mlock pin. Used for the large fiber-stack
    /// and scratch arenas, where pinning would exceed RLIMIT_MEMLOCK.
    pub fn alloc_unpinned(size: usize, align: usize) -> Result<Self> {
        assert!(align.is_power_of_two());
        let page = page_size();
        let len = size.max(1).next_multiple_of(page);
        let slack = align.saturating_sub(page);
        let map = MmapOptions::new()
            .len(len + slack)
            .map_anon()
            .map_err(|e| {
                log::error!("failed to map {} bytes of memory: {e}", len + slack);
                LoadError::Allocation
            })?;
        let offset = (align - (map.as_ptr() as usize % align)) % align;
        Ok(PinnedArena { map: MapState::Rw(map), offset, len })
    }

    fn lock(&self) -> std::io::Result<()> {
        match &self.map {
            MapState::Rw(m) => m.lock(),
            MapState::Ro(m) | MapState::Rx(m) => m.lock(),
            MapState::Empty => Ok(()),
        }
    }

    /// Usable (page-rounded) size of the arena.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        let base = match &self.map {
            MapState::Rw(m) => m.as_ptr(),
            MapState::Ro(m) | MapState::Rx(m) => m.as_ptr(),
            MapState::Empty => unreachable!("arena in transient state"),
        };
        // SAFETY: offset < mapping length by construction.
        unsafe { base.add(self.offset) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match &mut self.map {
            MapState::Rw(m) => {
                let off = self.offset;
                // SAFETY: offset < mapping length by construction.
                unsafe { m.as_mut_ptr().add(off) }
            }
            _ => panic!("arena is no longer writable"),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: [offset, offset + len) lies within the mapping.
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }

    /// Write into a still-RW arena, even through a shared reference.
    ///
    /// # Safety
    /// The caller must guarantee exclusive access to the written range; this
    /// exists for per-worker BSS resets where each CPU owns its instance.
    pub unsafe fn write_unsynchronized(&self, offset: usize, len: usize, value: u8) {
        assert!(matches!(self.map, MapState::Rw(_)));
        assert!(offset + len <= self.len);
        // SAFETY: range checked above, exclusivity guaranteed by the caller.
        unsafe { core::ptr::write_bytes(self.as_ptr().add(offset).cast_mut(), value, len) };
    }

    /// Transition RW -> RX. On Apple platforms the maximum protection is
    /// additionally sealed to RX.
    pub fn protect_exec(&mut self) -> Result<()> {
        match core::mem::replace(&mut self.map, MapState::Empty) {
            MapState::Rw(m) => {
                self.map = MapState::Rx(m.make_exec()?);
                #[cfg(target_os = "macos")]
                self.seal_max_protection_rx()?;
                Ok(())
            }
            other => {
                self.map = other;
                Err(LoadError::Relocation("arena is not in a writable state".into()))
            }
        }
    }

    /// Transition RW -> RO.
    pub fn protect_read_only(&mut self) -> Result<()> {
        match core::mem::replace(&mut self.map, MapState::Empty) {
            MapState::Rw(m) => {
                self.map = MapState::Ro(m.make_read_only()?);
                Ok(())
            }
            other => {
                self.map = other;
                Err(LoadError::Relocation("arena is not in a writable state".into()))
            }
        }
    }

    #[cfg(target_os = "macos")]
    fn seal_max_protection_rx(&self) -> Result<()> {
        unsafe extern "C" {
            fn mach_task_self() -> u32;
            fn vm_protect(task: u32, address: u64, size: u64, set_maximum: i32, protection: i32)
                -> i32;
        }
        const VM_PROT_READ: i32 = 0x01;
        const VM_PROT_EXECUTE: i32 = 0x04;
        // SAFETY: the range is a live mapping owned by this arena.
        let kr = unsafe {
            vm_protect(mach_task_self(), self.as_ptr() as u64, self.len as u64, 1,
                       VM_PROT_READ | VM_PROT_EXECUTE)
        };
        if kr != 0 {
            log::error!("failed to seal exec memory protection (mach): {kr}");
            return Err(LoadError::Allocation);
        }
        Ok(())
    }
}

// Raw pointers into the mapping are handed to worker threads; the arena
// itself is just an address range.
unsafe impl Send for PinnedArena {}
unsafe impl Sync for PinnedArena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_alloc_respects_alignment() {
        let arena = PinnedArena::alloc_aligned(16 * 1024, 16 * 1024).unwrap();
        assert_eq!(arena.as_ptr() as usize % (16 * 1024), 0);
        assert!(arena.len() >= 16 * 1024);
    }

    #[test]
    fn exec_transition_keeps_address() {
        let mut arena = PinnedArena::alloc(4096).unwrap();
        arena.as_mut_slice()[0] = 0xc3;
        let before = arena.as_ptr();
        arena.protect_exec().unwrap();
        assert_eq!(before, arena.as_ptr());
    }
}
