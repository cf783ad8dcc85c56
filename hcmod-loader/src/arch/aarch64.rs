use int_enum::IntEnum;

use crate::elf::RelocEntry;
use crate::instance::GotAccess;
use crate::mem::PinnedArena;
use crate::{LoadError, Result};

use super::patch_or_32;

/// Relocation types specified by the SysV ARM64/AArch64 ABI.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[allow(non_camel_case_types)]
pub enum Aarch64RelocationType {
    R_AARCH64_NONE = 0,
    R_AARCH64_NONE_256 = 0x100,
    R_AARCH64_ABS64 = 0x101,
    R_AARCH64_ABS32 = 0x102,
    R_AARCH64_ABS16 = 0x103,
    R_AARCH64_PREL64 = 0x104,
    R_AARCH64_PREL32 = 0x105,
    R_AARCH64_PREL16 = 0x106,
    R_AARCH64_MOVW_UABS_G0 = 0x107,
    R_AARCH64_MOVW_UABS_G0_NC = 0x108,
    R_AARCH64_MOVW_UABS_G1 = 0x109,
    R_AARCH64_MOVW_UABS_G1_NC = 0x10A,
    R_AARCH64_MOVW_UABS_G2 = 0x10B,
    R_AARCH64_MOVW_UABS_G2_NC = 0x10C,
    R_AARCH64_MOVW_UABS_G3 = 0x10D,
    R_AARCH64_MOVW_SABS_G0 = 0x10E,
    R_AARCH64_MOVW_SABS_G1 = 0x10F,
    R_AARCH64_MOVW_SABS_G2 = 0x110,
    R_AARCH64_LD_PREL_LO19 = 0x111,
    R_AARCH64_ADR_PREL_LO21 = 0x112,
    R_AARCH64_ADR_PREL_PG_HI21 = 0x113,
    R_AARCH64_ADR_PREL_PG_HI21_NC = 0x114,
    R_AARCH64_ADD_ABS_LO12_NC = 0x115,
    R_AARCH64_LDST8_ABS_LO12_NC = 0x116,
    R_AARCH64_TSTBR14 = 0x117,
    R_AARCH64_CONDBR19 = 0x118,
    R_AARCH64_JUMP26 = 0x11A,
    R_AARCH64_CALL26 = 0x11B,
    R_AARCH64_LDST16_ABS_LO12_NC = 0x11C,
    R_AARCH64_LDST32_ABS_LO12_NC = 0x11D,
    R_AARCH64_LDST64_ABS_LO12_NC = 0x11E,
    R_AARCH64_MOVW_PREL_G0 = 0x11F,
    R_AARCH64_MOVW_PREL_G0_NC = 0x120,
    R_AARCH64_MOVW_PREL_G1 = 0x121,
    R_AARCH64_MOVW_PREL_G1_NC = 0x122,
    R_AARCH64_MOVW_PREL_G2 = 0x123,
    R_AARCH64_MOVW_PREL_G2_NC = 0x124,
    R_AARCH64_MOVW_PREL_G3 = 0x125,
    R_AARCH64_LDST128_ABS_LO12_NC = 0x12B,
    R_AARCH64_MOVW_GOTOFF_G0 = 0x12C,
    R_AARCH64_MOVW_GOTOFF_G0_NC = 0x12D,
    R_AARCH64_MOVW_GOTOFF_G1 = 0x12E,
    R_AARCH64_MOVW_GOTOFF_G1_NC = 0x12F,
    R_AARCH64_MOVW_GOTOFF_G2 = 0x130,
    R_AARCH64_MOVW_GOTOFF_G2_NC = 0x131,
    R_AARCH64_MOVW_GOTOFF_G3 = 0x132,
    R_AARCH64_GOTREL64 = 0x133,
    R_AARCH64_GOTREL32 = 0x134,
    R_AARCH64_GOT_LD_PREL19 = 0x135,
    R_AARCH64_LD64_GOTOFF_LO15 = 0x136,
    R_AARCH64_ADR_GOT_PAGE = 0x137,
    R_AARCH64_LD64_GOT_LO12_NC = 0x138,
    R_AARCH64_LD64_GOTPAGE_LO15 = 0x139,
}

type Arm64RelTy = Aarch64RelocationType;

pub(super) fn allocates_got_entry(r_type: u32) -> bool {
    matches!(
        Arm64RelTy::try_from(r_type),
        Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G0)
            | Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G0_NC)
            | Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G1)
            | Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G1_NC)
            | Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G2)
            | Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G2_NC)
            | Ok(Arm64RelTy::R_AARCH64_MOVW_GOTOFF_G3)
            | Ok(Arm64RelTy::R_AARCH64_GOT_LD_PREL19)
            | Ok(Arm64RelTy::R_AARCH64_LD64_GOTOFF_LO15)
            | Ok(Arm64RelTy::R_AARCH64_ADR_GOT_PAGE)
            | Ok(Arm64RelTy::R_AARCH64_LD64_GOT_LO12_NC)
            | Ok(Arm64RelTy::R_AARCH64_LD64_GOTPAGE_LO15)
    )
}

/// ADRP immediate fields for a page-delta `value`: immlo at bits [30:29],
/// immhi at bits [23:5].
fn adrp_imm_fields(value: i64) -> u32 {
    let value_32 = (value >> 12) as i32 as u32;
    ((value_32 & 3) << 29) | ((value_32 & 0x001F_FFFC) << 3)
}

/// LDR (immediate, unsigned offset, 64-bit) field for the low 12 bits of an
/// 8-byte aligned address: imm12 at bits [21:10], scaled by 8.
fn ld64_lo12_fields(address: u64) -> u32 {
    (((address >> 3) & 0x1FF) as u32) << 10
}

/// 16-bit MOVZ/MOVK immediate at bits [20:5].
fn movw_imm16_fields(slice: u64) -> u32 {
    ((slice & 0xFFFF) as u32) << 5
}

/// BL/B 26-bit word-offset immediate at bits [25:0].
fn call26_fields(byte_offset: i64) -> u32 {
    ((byte_offset >> 2) as u32) & 0x03FF_FFFF
}

const fn page(address: i64) -> i64 {
    address & !0xFFF
}

pub(super) fn apply_relocations(relocs: &[RelocEntry], memory: &mut PinnedArena,
                                got: &mut GotAccess<'_>,
                                resolve: &mut dyn FnMut(&RelocEntry) -> Result<*const u8>)
    -> Result<()> {
    for reloc in relocs {
        let reloc_type = Arm64RelTy::try_from(reloc.r_type).map_err(|_| {
            log::error!("invalid relocation type: {}", reloc.r_type);
            LoadError::Relocation(format!("invalid relocation type: {}", reloc.r_type))
        })?;

        match reloc_type {
            Arm64RelTy::R_AARCH64_NONE | Arm64RelTy::R_AARCH64_NONE_256 => {}

            // Page(G(GDAT(S + A))) - Page(P), into the ADRP immediate
            Arm64RelTy::R_AARCH64_ADR_GOT_PAGE => {
                let resolved = resolve(reloc)?;
                let got_idx = got.publish((resolved as i64 + reloc.addend) as u64)?;
                let place = memory.as_ptr() as i64 + reloc.offset as i64;
                let value = page(got.entry_addr(got_idx) as i64) - page(place);
                if !(-(1i64 << 32)..(1i64 << 32)).contains(&value) {
                    log::error!("out-of-bounds ADR_GOT_PAGE relocation: {value}");
                    return Err(LoadError::Relocation("out-of-bounds ADR_GOT_PAGE".into()));
                }
                patch_or_32(memory, reloc.offset, adrp_imm_fields(value))?;
            }

            // G(GDAT(S + A)), low 12 bits into the LDR immediate
            Arm64RelTy::R_AARCH64_LD64_GOT_LO12_NC => {
                let resolved = resolve(reloc)?;
                let got_idx = got.publish((resolved as i64 + reloc.addend) as u64)?;
                let entry_addr = got.entry_addr(got_idx);
                if entry_addr & 0x7 != 0 {
                    log::error!("relocation is not 8-byte aligned: {entry_addr:#x}");
                    return Err(LoadError::Relocation("misaligned LD64_GOT_LO12_NC".into()));
                }
                patch_or_32(memory, reloc.offset, ld64_lo12_fields(entry_addr))?;
            }

            // S + A, 16-bit slice into a MOVZ/MOVK immediate
            Arm64RelTy::R_AARCH64_MOVW_UABS_G0
            | Arm64RelTy::R_AARCH64_MOVW_UABS_G0_NC
            | Arm64RelTy::R_AARCH64_MOVW_UABS_G1
            | Arm64RelTy::R_AARCH64_MOVW_UABS_G1_NC
            | Arm64RelTy::R_AARCH64_MOVW_UABS_G2
            | Arm64RelTy::R_AARCH64_MOVW_UABS_G2_NC
            | Arm64RelTy::R_AARCH64_MOVW_UABS_G3 => {
                let resolved = resolve(reloc)?;
                let value = resolved as i64 + reloc.addend;
                let overflow = |group: &str| {
                    log::error!("out-of-bounds {group} relocation: {value}");
                    LoadError::Relocation(format!("out-of-bounds {group} relocation"))
                };
                let slice = match reloc_type {
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G0 => {
                        if !(0..=0xFFFF).contains(&value) {
                            return Err(overflow("G0"));
                        }
                        value as u64
                    }
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G0_NC => value as u64,
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G1 => {
                        if !(0..=0xFFFF_FFFF).contains(&value) {
                            return Err(overflow("G1"));
                        }
                        value as u64 >> 16
                    }
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G1_NC => value as u64 >> 16,
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G2 => {
                        if !(0..=0xFFFF_FFFF_FFFF).contains(&value) {
                            return Err(overflow("G2"));
                        }
                        value as u64 >> 32
                    }
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G2_NC => value as u64 >> 32,
                    Arm64RelTy::R_AARCH64_MOVW_UABS_G3 => value as u64 >> 48,
                    _ => unreachable!(),
                };
                patch_or_32(memory, reloc.offset, movw_imm16_fields(slice))?;
            }

            // S + A - P, into the BL immediate
            Arm64RelTy::R_AARCH64_CALL26 => {
                let resolved = resolve(reloc)?;
                let place = memory.as_ptr() as i64 + reloc.offset as i64;
                let offset_value = resolved as i64 + reloc.addend - place;
                if !(-(1i64 << 27)..(1i64 << 27)).contains(&offset_value) {
                    log::error!("out-of-bounds CALL26 relocation: {offset_value}");
                    return Err(LoadError::Relocation("out-of-bounds CALL26".into()));
                }
                patch_or_32(memory, reloc.offset, call26_fields(offset_value))?;
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
    fn got_allocating_set() {
        for ty in [0x12C, 0x12D, 0x12E, 0x12F, 0x130, 0x131, 0x132, 0x135, 0x136, 0x137, 0x138,
                   0x139] {
            assert!(allocates_got_entry(ty), "type {ty:#x} must allocate a GOT entry");
        }
        for ty in [0u32, 0x100, 0x101, 0x107, 0x11B] {
            assert!(!allocates_got_entry(ty), "type {ty:#x} must not allocate a GOT entry");
        }
    }

    #[test]
    fn adrp_fields_encode_page_delta() {
        // +1 page: immlo = 1 -> bit 29, immhi = 0.
        assert_eq!(adrp_imm_fields(0x1000), 1 << 29);
        // +4 pages: immlo = 0, immhi bit 0 -> instruction bit 5.
        assert_eq!(adrp_imm_fields(0x4000), 1 << 5);
        // -1 page: all 21 immediate bits set.
        assert_eq!(adrp_imm_fields(-0x1000), (3 << 29) | (0x7FFFF << 5));
    }

    #[test]
    fn ld64_lo12_scales_by_8() {
        assert_eq!(ld64_lo12_fields(0x1008), 1 << 10);
        assert_eq!(ld64_lo12_fields(0x1FF8), 0x1FF << 10);
        assert_eq!(ld64_lo12_fields(0x2000), 0);
    }

    #[test]
    fn movw_slice_lands_in_bits_20_to_5() {
        assert_eq!(movw_imm16_fields(0xBEEF), 0xBEEF << 5);
        assert_eq!(movw_imm16_fields(0x1_0000), 0);
    }

    #[test]
    fn call26_masks_to_26_bits() {
        assert_eq!(call26_fields(8), 2);
        assert_eq!(call26_fields(-4), 0x03FF_FFFF);
        assert_eq!(call26_fields(-8), 0x03FF_FFFE);
    }
}
