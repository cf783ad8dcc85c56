//! Architecture-specific relocation application.
//!
//! Both relocators share the same contract: resolve the symbol to an absolute
//! address, compute the value per the SysV ABI formula for the relocation
//! type, then either store the value at the relocation offset (data width) or
//! mask it into the bit-field shape of the existing instruction word.
//!
//! Dispatch is on the object's machine type; the parser has already checked
//! that it matches the machine this process runs on.

mod aarch64;
mod x86_64;

pub use aarch64::Aarch64RelocationType;
pub use x86_64::X86_64RelocationType;

use goblin::elf::header::{EM_AARCH64, EM_X86_64};

use crate::Result;
use crate::elf::RelocEntry;
use crate::instance::GotAccess;
use crate::mem::PinnedArena;

/// Whether a relocation type consumes a GOT entry. Used by the sizing
/// pre-pass so the GOT can be allocated in one piece.
pub fn allocates_got_entry(machine: u16, r_type: u32) -> bool {
    match machine {
        EM_X86_64 => x86_64::allocates_got_entry(r_type),
        EM_AARCH64 => aarch64::allocates_got_entry(r_type),
        _ => false,
    }
}

pub(crate) fn apply_relocations(machine: u16, relocs: &[RelocEntry], memory: &mut PinnedArena,
                                got: &mut GotAccess<'_>,
                                resolve: &mut dyn FnMut(&RelocEntry) -> Result<*const u8>)
    -> Result<()> {
    match machine {
        EM_X86_64 => x86_64::apply_relocations(relocs, memory, got, resolve),
        EM_AARCH64 => aarch64::apply_relocations(relocs, memory, got, resolve),
        other => {
            log::error!("relocations for machine type {other:#x} are not supported");
            Err(crate::LoadError::Relocation(format!("unsupported machine type: {other:#x}")))
        }
    }
}

/// Bounds-checked store of `bytes` at `offset` in the target arena.
fn store(memory: &mut PinnedArena, offset: u64, bytes: &[u8]) -> Result<()> {
    if offset + bytes.len() as u64 > memory.len() as u64 {
        log::error!("relocation offset is out-of-bounds: {offset}");
        return Err(crate::LoadError::Relocation(format!(
            "relocation offset out-of-bounds: {offset}"
        )));
    }
    memory.as_mut_slice()[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Bounds-checked OR of a 32-bit value into the instruction word at `offset`.
fn patch_or_32(memory: &mut PinnedArena, offset: u64, value: u32) -> Result<()> {
    if offset + 4 > memory.len() as u64 {
        log::error!("relocation offset is out-of-bounds: {offset}");
        return Err(crate::LoadError::Relocation(format!(
            "relocation offset out-of-bounds: {offset}"
        )));
    }
    let slice = &mut memory.as_mut_slice()[offset as usize..offset as usize + 4];
    let current = u32::from_le_bytes(slice.try_into().expect("4-byte slice"));
    slice.copy_from_slice(&(current | value).to_le_bytes());
    Ok(())
}
