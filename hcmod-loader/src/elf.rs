use bitflags::bitflags;
use goblin::elf::Elf;
use goblin::elf::header::{
    EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS64, ELFDATA2LSB, EM_AARCH64, EM_X86_64, ET_REL,
};
use goblin::elf::section_header::{
    SHF_ALLOC, SHF_COMPRESSED, SHF_EXECINSTR, SHF_WRITE, SHT_GROUP, SHT_NOBITS, SHT_NULL,
    SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, SectionHeader,
};
use goblin::elf::sym::{STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_FUNC, STT_OBJECT, STT_SECTION, Sym};

use crate::{LoadError, Result};

const ELF64_HEADER_SIZE: u16 = 64;
const ELF64_SECTION_HEADER_SIZE: u16 = 64;
const ELF64_SYMBOL_SIZE: u64 = 24;
const ELF64_RELA_SIZE: u64 = 24;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionPerm: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl SectionPerm {
    pub fn from_elf_flags(sh_flags: u64) -> Self {
        let mut perms = SectionPerm::empty();
        if (sh_flags & SHF_ALLOC as u64) != 0 {
            perms |= SectionPerm::READ;
        }
        if (sh_flags & SHF_WRITE as u64) != 0 {
            perms |= SectionPerm::WRITE;
        }
        if (sh_flags & SHF_EXECINSTR as u64) != 0 {
            perms |= SectionPerm::EXECUTE;
        }
        perms
    }
}

impl core::fmt::Display for SectionPerm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.contains(SectionPerm::READ) {
            f.write_str("R")?;
        }
        if self.contains(SectionPerm::WRITE) {
            f.write_str("W")?;
        }
        if self.contains(SectionPerm::EXECUTE) {
            f.write_str("X")?;
        }
        Ok(())
    }
}

/// Closed classification of the sections a Host-Compute object may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Null,
    StringTable,
    Text,
    Rodata,
    /// `.comment` program data, carried but never mapped.
    Comment,
    Bss,
    Rela,
    Group,
    SymbolTable,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub index: usize,
    pub name: String,
    pub kind: SectionKind,
    pub header: SectionHeader,
}

impl Section {
    pub fn perms(&self) -> SectionPerm {
        SectionPerm::from_elf_flags(self.header.sh_flags)
    }

    pub fn is_alloc(&self) -> bool {
        (self.header.sh_flags & SHF_ALLOC as u64) != 0
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub sym: Sym,
}

impl Symbol {
    /// External symbols are resolved against the host process.
    pub fn is_external(&self) -> bool {
        self.sym.st_shndx == 0
            && (self.sym.st_bind() == STB_GLOBAL || self.sym.st_bind() == STB_WEAK)
    }

    /// Internal symbols that translate through the instance section map.
    pub fn is_section_relative(&self) -> bool {
        matches!(self.sym.st_type(), STT_SECTION | STT_FUNC | STT_OBJECT)
    }

    pub fn bind_str(&self) -> &'static str {
        match self.sym.st_bind() {
            STB_LOCAL => "local",
            STB_GLOBAL => "global",
            STB_WEAK => "weak",
            10 => "gnu-unique",
            _ => "<unknown-binding>",
        }
    }
}

/// One `.rela.*` entry with its symbol index already bounds-checked.
#[derive(Debug, Clone, Copy)]
pub struct RelocEntry {
    pub offset: u64,
    pub r_type: u32,
    pub addend: i64,
    pub symbol_index: usize,
}

/// Parsed and validated view over a relocatable Host-Compute ELF object.
///
/// Parsing is pure: no executable memory is allocated, and a failed parse
/// leaves nothing behind. Instances are materialised separately.
#[derive(Debug)]
pub struct ElfView<'a> {
    pub data: &'a [u8],
    pub machine: u16,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub exec_relocations: Vec<RelocEntry>,
    pub rodata_relocations: Vec<RelocEntry>,
    /// True when `.rela.rodata` entries exist and read-only data therefore
    /// needs a private copy per instance.
    pub relocate_rodata: bool,
    pub function_names: Vec<String>,
}

fn parse_err(msg: impl Into<String>) -> LoadError {
    let msg = msg.into();
    log::error!("{msg}");
    LoadError::Parse(msg)
}

impl<'a> ElfView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let elf = Elf::parse(data).map_err(|e| parse_err(format!("ELF parse error: {e}")))?;
        Self::validate(data, elf)
    }

    fn validate(data: &'a [u8], elf: Elf<'a>) -> Result<Self> {
        let header = &elf.header;
        if header.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(parse_err("only 64-bit ELF is supported"));
        }
        if header.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(parse_err("only little endian is supported"));
        }
        if header.e_ident[EI_VERSION] != 1 {
            return Err(parse_err("ELF ident version must be 1"));
        }
        if header.e_type != ET_REL {
            return Err(parse_err("ELF object type must be REL/relocatable"));
        }
        let (expected_machine, machine_err) = if cfg!(target_arch = "aarch64") {
            (EM_AARCH64, "ELF machine type is not AArch64")
        } else {
            (EM_X86_64, "ELF machine type is not AMD64")
        };
        if header.e_machine != expected_machine {
            return Err(parse_err(machine_err));
        }
        if header.e_version != 1 {
            return Err(parse_err("ELF version must be 1"));
        }
        if header.e_ehsize != ELF64_HEADER_SIZE {
            return Err(parse_err("invalid ELF header size"));
        }
        if header.e_shentsize != ELF64_SECTION_HEADER_SIZE {
            return Err(parse_err("invalid section header table entry size"));
        }

        // Program headers are ignored, but if present they must be in bounds
        // and disjoint from the section headers.
        let mut program_header_range: Option<(u64, u64)> = None;
        if header.e_phnum > 0 {
            if header.e_phoff < ELF64_HEADER_SIZE as u64 || header.e_phoff >= data.len() as u64 {
                return Err(parse_err("invalid program header offset"));
            }
            let ph_size = header.e_phnum as u64 * header.e_phentsize as u64;
            if header.e_phoff + ph_size > data.len() as u64 {
                return Err(parse_err("program headers are out-of-bounds"));
            }
            program_header_range = Some((header.e_phoff, header.e_phoff + ph_size));
        }

        if header.e_shnum == 0 {
            return Err(parse_err("section header count is 0"));
        }
        if header.e_shoff < ELF64_HEADER_SIZE as u64 || header.e_shoff >= data.len() as u64 {
            return Err(parse_err("invalid section header offset"));
        }
        let sh_size = header.e_shnum as u64 * header.e_shentsize as u64;
        if header.e_shoff + sh_size > data.len() as u64 {
            return Err(parse_err("section headers are out-of-bounds"));
        }
        if header.e_shstrndx >= header.e_shnum {
            return Err(parse_err("section names index is out-of-bounds"));
        }
        if let Some((ph_start, ph_end)) = program_header_range {
            let sh_start = header.e_shoff;
            let overlap = if sh_start == ph_start {
                true
            } else if sh_start < ph_start {
                sh_start + sh_size > ph_start
            } else {
                ph_end > sh_start
            };
            if overlap {
                return Err(parse_err("section and program header overlap"));
            }
        }

        let names_header = &elf.section_headers[header.e_shstrndx as usize];
        if names_header.sh_type != SHT_STRTAB {
            return Err(parse_err("invalid section name header"));
        }
        if names_header.sh_offset + names_header.sh_size > data.len() as u64 {
            return Err(parse_err("section names out-of-bounds"));
        }

        // Resolve all section names up front; classification follows below.
        let mut raw_sections = Vec::with_capacity(elf.section_headers.len());
        for (index, sh) in elf.section_headers.iter().enumerate() {
            let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) else {
                return Err(parse_err("didn't find section name terminator"));
            };
            raw_sections.push((index, name.to_string(), sh.clone()));
        }

        // Symbol table (strict entry checks on top of goblin's parse).
        let mut symbols = Vec::new();
        for (_, _, sh) in &raw_sections {
            if sh.sh_type != SHT_SYMTAB {
                continue;
            }
            if sh.sh_entsize != ELF64_SYMBOL_SIZE {
                return Err(parse_err("invalid symbol table entry size"));
            }
            if sh.sh_size % ELF64_SYMBOL_SIZE != 0 {
                return Err(parse_err("incomplete symbol table"));
            }
            if sh.sh_offset + sh.sh_size > data.len() as u64 {
                return Err(parse_err("symbol table is out-of-bounds"));
            }
            for sym in elf.syms.iter() {
                let Some(sym_name) = elf.strtab.get_at(sym.st_name) else {
                    return Err(parse_err("didn't find symbol name terminator"));
                };
                symbols.push(Symbol { name: sym_name.to_string(), sym });
            }
        }
        if symbols.is_empty() {
            return Err(parse_err("binary has no symbol table"));
        }

        // Relocation tables; only .rela.text and .rela.rodata are accepted.
        let mut exec_relocations = Vec::new();
        let mut rodata_relocations = Vec::new();
        let mut relocate_rodata = false;
        for (index, name, sh) in &raw_sections {
            if sh.sh_type == SHT_REL {
                return Err(parse_err("relocations without addend are not supported by the ABI"));
            }
            if sh.sh_type != SHT_RELA {
                continue;
            }
            if sh.sh_entsize != ELF64_RELA_SIZE {
                return Err(parse_err("invalid relocation addend entry size"));
            }
            if sh.sh_size % ELF64_RELA_SIZE != 0 {
                return Err(parse_err("incomplete relocation addend table"));
            }
            if sh.sh_offset + sh.sh_size > data.len() as u64 {
                return Err(parse_err("relocation addend table is out-of-bounds"));
            }

            let relocations = match name.as_str() {
                ".rela.text" => &mut exec_relocations,
                ".rela.rodata" => {
                    // read-only data needs to be relocated -> per-instance copies
                    relocate_rodata = true;
                    &mut rodata_relocations
                }
                other => {
                    return Err(parse_err(format!("relocations section {other} is not supported")));
                }
            };

            let Some((_, rela)) = elf.shdr_relocs.iter().find(|(idx, _)| idx == index) else {
                return Err(parse_err("relocation section was not parsed"));
            };
            for reloc in rela.iter() {
                if reloc.r_sym >= symbols.len() {
                    return Err(parse_err("relocation symbol index is out-of-bounds"));
                }
                let Some(addend) = reloc.r_addend else {
                    return Err(parse_err("relocation entry is missing its addend"));
                };
                relocations.push(RelocEntry {
                    offset: reloc.r_offset,
                    r_type: reloc.r_type,
                    addend,
                    symbol_index: reloc.r_sym,
                });
            }
        }

        // Enforce the closed section vocabulary.
        let mut sections = Vec::with_capacity(raw_sections.len());
        let mut text_count = 0usize;
        for (index, name, sh) in raw_sections {
            if (sh.sh_flags & SHF_COMPRESSED as u64) != 0 {
                return Err(parse_err("compressed sections are not supported"));
            }
            if (sh.sh_flags & SHF_WRITE as u64) != 0 && (sh.sh_flags & SHF_EXECINSTR as u64) != 0 {
                return Err(parse_err("a section may not be both writable and executable"));
            }

            let kind = match sh.sh_type {
                SHT_NULL => {
                    if sh.sh_size > 0 {
                        return Err(parse_err("'unused' section must have a size of 0"));
                    }
                    SectionKind::Null
                }
                SHT_STRTAB => {
                    if name != ".strtab" {
                        return Err(parse_err("invalid string table section name"));
                    }
                    if index != header.e_shstrndx as usize {
                        return Err(parse_err("invalid duplicate string table section"));
                    }
                    SectionKind::StringTable
                }
                SHT_PROGBITS => {
                    if name.starts_with(".comment") {
                        SectionKind::Comment
                    } else if name.starts_with(".rodata") {
                        if (sh.sh_flags & SHF_WRITE as u64) != 0 {
                            return Err(parse_err(format!(
                                "program data section must be non-writable: {name}"
                            )));
                        }
                        if (sh.sh_flags & SHF_EXECINSTR as u64) != 0 {
                            return Err(parse_err(
                                "read-only program data section must be non-executable",
                            ));
                        }
                        SectionKind::Rodata
                    } else if name.starts_with(".text") {
                        if (sh.sh_flags & SHF_WRITE as u64) != 0 {
                            return Err(parse_err(format!(
                                "program data section must be non-writable: {name}"
                            )));
                        }
                        if (sh.sh_flags & SHF_EXECINSTR as u64) == 0 {
                            return Err(parse_err("program data section must be executable"));
                        }
                        text_count += 1;
                        SectionKind::Text
                    } else {
                        return Err(parse_err(format!("invalid program data section name: {name}")));
                    }
                }
                SHT_RELA => {
                    if !name.starts_with(".rela") {
                        return Err(parse_err("invalid relocation entries section name"));
                    }
                    SectionKind::Rela
                }
                SHT_GROUP => {
                    if !name.starts_with(".group") {
                        return Err(parse_err("invalid group section name"));
                    }
                    if sh.sh_flags != 0 {
                        return Err(parse_err("invalid group section flags"));
                    }
                    SectionKind::Group
                }
                SHT_NOBITS => {
                    if !name.starts_with(".bss") {
                        return Err(parse_err("invalid BSS section name"));
                    }
                    if (sh.sh_flags & SHF_EXECINSTR as u64) != 0 {
                        return Err(parse_err("BSS section must be non-executable"));
                    }
                    SectionKind::Bss
                }
                SHT_SYMTAB => {
                    if !name.starts_with(".symtab") {
                        return Err(parse_err("invalid symbol table section name"));
                    }
                    if sh.sh_flags != 0 {
                        return Err(parse_err("invalid symbol table section flags"));
                    }
                    SectionKind::SymbolTable
                }
                other => {
                    return Err(parse_err(format!(
                        "invalid or unhandled section: {name} (type {other:#x})"
                    )));
                }
            };
            sections.push(Section { index, name, kind, header: sh });
        }
        if text_count > 1 {
            return Err(parse_err("must not have more than one exec section"));
        }

        // Exported kernel entry points: global code symbols in an exec section.
        let mut function_names = Vec::new();
        for sym in &symbols {
            if sym.name.is_empty()
                || sym.sym.st_bind() != STB_GLOBAL
                || sym.sym.st_type() != STT_FUNC
            {
                continue;
            }
            let Some(section) = sections.get(sym.sym.st_shndx) else {
                continue;
            };
            if (section.header.sh_flags & SHF_EXECINSTR as u64) == 0 {
                continue;
            }
            function_names.push(sym.name.clone());
        }

        Ok(ElfView {
            data,
            machine: header.e_machine,
            sections,
            symbols,
            exec_relocations,
            rodata_relocations,
            relocate_rodata,
            function_names,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testelf::{TestElf, TestSymbol, build};

    #[test]
    fn parses_minimal_object() {
        let data = build(&TestElf::default());
        let view = ElfView::parse(&data).unwrap();
        assert_eq!(view.function_names, vec!["kernel_main".to_string()]);
        assert!(!view.relocate_rodata);
        assert!(view.exec_relocations.is_empty());
        assert_eq!(view.sections[1].kind, SectionKind::Text);
        assert_eq!(view.sections[2].kind, SectionKind::StringTable);
        assert_eq!(view.sections[3].kind, SectionKind::SymbolTable);
    }

    #[test]
    fn rejects_write_exec_section() {
        let data = build(&TestElf {
            text_flags: (SHF_ALLOC | SHF_EXECINSTR | SHF_WRITE) as u64,
            ..TestElf::default()
        });
        let err = ElfView::parse(&data).unwrap_err();
        assert!(matches!(err, LoadError::Parse(msg) if msg.contains("writable and executable")));
    }

    #[test]
    fn rejects_unknown_program_data_section() {
        let data = build(&TestElf { text_name: ".mystery", ..TestElf::default() });
        let err = ElfView::parse(&data).unwrap_err();
        assert!(matches!(err, LoadError::Parse(msg) if msg.contains("invalid program data")));
    }

    #[test]
    fn rejects_addendless_relocation_section() {
        let data = build(&TestElf { emit_rel_section: true, ..TestElf::default() });
        let err = ElfView::parse(&data).unwrap_err();
        assert!(matches!(err, LoadError::Parse(msg) if msg.contains("without addend")));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut data = build(&TestElf::default());
        data[18] ^= 0xff;
        assert!(ElfView::parse(&data).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build(&TestElf::default());
        data[0] = b'X';
        assert!(ElfView::parse(&data).is_err());
    }

    #[test]
    fn function_names_skip_local_symbols() {
        let data = build(&TestElf {
            symbols: vec![
                TestSymbol { name: "kernel_main", info: (1 << 4) | 2, shndx: 1, value: 0 },
                TestSymbol { name: "local_helper", info: 2, shndx: 1, value: 4 },
            ],
            ..TestElf::default()
        });
        let view = ElfView::parse(&data).unwrap();
        assert_eq!(view.function_names, vec!["kernel_main".to_string()]);
    }

    #[test]
    fn text_relocations_keep_rodata_shared() {
        let data = build(&TestElf {
            relocations: vec![(0, 0, 1, 0)],
            ..TestElf::default()
        });
        let view = ElfView::parse(&data).unwrap();
        assert!(!view.relocate_rodata);
        assert_eq!(view.exec_relocations.len(), 1);
        assert_eq!(view.exec_relocations[0].symbol_index, 1);
    }
}
