use int_enum::IntEnum;

use crate::elf::RelocEntry;
use crate::instance::GotAccess;
use crate::mem::PinnedArena;
use crate::{LoadError, Result};

use super::store;

/// Relocation types specified by the SysV x86-64/AMD64 ABI.
///
/// Types 5-8, 16, 28, 30, 31 and 37 are dynamic-linker/PLT types that never
/// appear in the objects the device toolchain emits; 38 is 32-bit only and
/// 39/40 are deprecated by the ABI, so none of them are mapped here.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum X86_64RelocationType {
    R_X86_64_NONE = 0,
    R_X86_64_64 = 1,
    R_X86_64_PC32 = 2,
    R_X86_64_GOT32 = 3,
    R_X86_64_PLT32 = 4,
    R_X86_64_GOTPCREL = 9,
    R_X86_64_32 = 10,
    R_X86_64_32S = 11,
    R_X86_64_16 = 12,
    R_X86_64_PC16 = 13,
    R_X86_64_8 = 14,
    R_X86_64_PC8 = 15,
    R_X86_64_DTPOFF64 = 17,
    R_X86_64_TPOFF64 = 18,
    R_X86_64_DTPOFF32 = 21,
    R_X86_64_GOTTPOFF = 22,
    R_X86_64_TPOFF32 = 23,
    R_X86_64_PC64 = 24,
    R_X86_64_GOTOFF64 = 25,
    R_X86_64_GOTPC32 = 26,
    R_X86_64_GOT64 = 27,
    R_X86_64_GOTPC64 = 29,
    R_X86_64_SIZE32 = 32,
    R_X86_64_SIZE64 = 33,
    R_X86_64_GOTPCRELX = 41,
    R_X86_64_REX_GOTPCRELX = 42,
}

type X64RelTy = X86_64RelocationType;

pub(super) fn allocates_got_entry(r_type: u32) -> bool {
    X64RelTy::try_from(r_type) == Ok(X64RelTy::R_X86_64_GOT64)
}

pub(super) fn apply_relocations(relocs: &[RelocEntry], memory: &mut PinnedArena,
                                got: &mut GotAccess<'_>,
                                resolve: &mut dyn FnMut(&RelocEntry) -> Result<*const u8>)
    -> Result<()> {
    for reloc in relocs {
        let reloc_type = X64RelTy::try_from(reloc.r_type).map_err(|_| {
            log::error!("invalid relocation type: {}", reloc.r_type);
            LoadError::Relocation(format!("invalid relocation type: {}", reloc.r_type))
        })?;

        match reloc_type {
            // G (GOT offset) + A
            X64RelTy::R_X86_64_GOT64 => {
                if reloc.addend != 0 {
                    // Not seen from any known toolchain; refuse instead of
                    // guessing at the intended GOT-slot arithmetic.
                    log::error!("addend not handled yet for GOT64: {}", reloc.addend);
                    return Err(LoadError::UnsupportedAddend(reloc.addend));
                }
                let resolved = resolve(reloc)?;
                let got_idx = got.publish(resolved as u64)?;
                let value = (got_idx * 8) as i64 + reloc.addend;
                store(memory, reloc.offset, &value.to_le_bytes())?;
            }
            // GOT - P + A; the specified symbol is ignored
            X64RelTy::R_X86_64_GOTPC64 => {
                let place = memory.as_ptr() as i64 + reloc.offset as i64;
                let value = got.base_addr() as i64 + reloc.addend - place;
                store(memory, reloc.offset, &value.to_le_bytes())?;
            }
            // S - GOT + A
            X64RelTy::R_X86_64_GOTOFF64 => {
                let resolved = resolve(reloc)?;
                let value = resolved as i64 - got.base_addr() as i64 + reloc.addend;
                store(memory, reloc.offset, &value.to_le_bytes())?;
            }
            // S + A - P
            X64RelTy::R_X86_64_PC32 => {
                let resolved = resolve(reloc)?;
                let place = memory.as_ptr() as i64 + reloc.offset as i64;
                let value = (resolved as i64 + reloc.addend - place) as i32;
                store(memory, reloc.offset, &value.to_le_bytes())?;
            }
            other => {
                log::error!("unhandled relocation type: {other:?}");
                return Err(LoadError::Relocation(format!("unhandled relocation type: {other:?}")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn got64_is_the_only_got_allocating_type() {
        assert!(allocates_got_entry(27));
        for ty in [0u32, 1, 2, 9, 25, 29, 41, 42] {
            assert!(!allocates_got_entry(ty), "type {ty} must not allocate a GOT entry");
        }
    }

    #[test]
    fn unknown_types_do_not_convert() {
        assert!(X86_64RelocationType::try_from(38).is_err());
        assert!(X86_64RelocationType::try_from(39).is_err());
        assert!(X86_64RelocationType::try_from(40).is_err());
        assert_eq!(X86_64RelocationType::try_from(27), Ok(X86_64RelocationType::R_X86_64_GOT64));
    }
}
