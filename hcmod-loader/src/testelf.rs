//! Byte-level ELF64 REL object builder for tests.
//!
//! Emits the minimal section set the loader accepts: NULL, `.text`,
//! `.strtab` (section + symbol names), `.symtab` and optionally `.rela.text`
//! and `.bss`. The machine field always matches the host architecture so the
//! built objects pass the parser's machine check.

use goblin::elf::header::{EM_AARCH64, EM_X86_64};
use goblin::elf::section_header::{
    SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_NULL, SHT_PROGBITS, SHT_RELA, SHT_STRTAB,
    SHT_SYMTAB,
};

pub struct TestSymbol {
    pub name: &'static str,
    /// (bind << 4) | type
    pub info: u8,
    pub shndx: u16,
    pub value: u64,
}

pub struct TestElf {
    pub text: Vec<u8>,
    pub text_flags: u64,
    pub text_name: &'static str,
    pub bss_size: u64,
    /// Symbol index 0 is the implicit NULL symbol; these start at index 1.
    pub symbols: Vec<TestSymbol>,
    /// (offset, r_type, symbol index, addend)
    pub relocations: Vec<(u64, u32, u32, i64)>,
    /// Emit an (empty) addend-less SHT_REL section, which the loader rejects.
    pub emit_rel_section: bool,
}

impl Default for TestElf {
    fn default() -> Self {
        TestElf {
            // ret (x86-64) / padding; the tests never execute this
            text: vec![0xc3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90],
            text_flags: (SHF_ALLOC | SHF_EXECINSTR) as u64,
            text_name: ".text",
            bss_size: 0,
            symbols: vec![TestSymbol {
                name: "kernel_main",
                info: (1 << 4) | 2, // GLOBAL FUNC
                shndx: 1,
                value: 0,
            }],
            relocations: Vec::new(),
            emit_rel_section: false,
        }
    }
}

pub fn host_machine() -> u16 {
    if cfg!(target_arch = "aarch64") { EM_AARCH64 } else { EM_X86_64 }
}

struct Strtab {
    data: Vec<u8>,
}

impl Strtab {
    fn new() -> Self {
        Strtab { data: vec![0] }
    }

    fn add(&mut self, s: &str) -> u32 {
        let off = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        off
    }
}

fn shdr(out: &mut Vec<u8>, name: u32, sh_type: u32, flags: u64, offset: u64, size: u64, link: u32,
        info: u32, align: u64, entsize: u64) {
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&sh_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&link.to_le_bytes());
    out.extend_from_slice(&info.to_le_bytes());
    out.extend_from_slice(&align.to_le_bytes());
    out.extend_from_slice(&entsize.to_le_bytes());
}

pub fn build(cfg: &TestElf) -> Vec<u8> {
    let mut strtab = Strtab::new();
    let text_name = strtab.add(cfg.text_name);
    let strtab_name = strtab.add(".strtab");
    let symtab_name = strtab.add(".symtab");
    let rela_name = strtab.add(".rela.text");
    let bss_name = strtab.add(".bss");

    // Symbol table: NULL symbol + configured symbols.
    let mut symtab = vec![0u8; 24];
    for sym in &cfg.symbols {
        let name_off = strtab.add(sym.name);
        symtab.extend_from_slice(&name_off.to_le_bytes());
        symtab.push(sym.info);
        symtab.push(0); // st_other
        symtab.extend_from_slice(&sym.shndx.to_le_bytes());
        symtab.extend_from_slice(&sym.value.to_le_bytes());
        symtab.extend_from_slice(&0u64.to_le_bytes()); // st_size
    }

    let mut rela = Vec::new();
    for (offset, r_type, sym_idx, addend) in &cfg.relocations {
        rela.extend_from_slice(&offset.to_le_bytes());
        let r_info = ((*sym_idx as u64) << 32) | *r_type as u64;
        rela.extend_from_slice(&r_info.to_le_bytes());
        rela.extend_from_slice(&addend.to_le_bytes());
    }

    let has_rela = !rela.is_empty();
    let has_bss = cfg.bss_size > 0;
    let mut shnum = 4u16; // NULL, .text, .strtab, .symtab
    if has_rela {
        shnum += 1;
    }
    if has_bss {
        shnum += 1;
    }
    if cfg.emit_rel_section {
        shnum += 1;
    }

    // File layout: header, .text, .strtab, .symtab, .rela.text, shdrs.
    let text_off = 64u64;
    let strtab_off = text_off + cfg.text.len() as u64;
    let symtab_off = (strtab_off + strtab.data.len() as u64).next_multiple_of(8);
    let rela_off = symtab_off + symtab.len() as u64;
    let shoff = (rela_off + rela.len() as u64).next_multiple_of(8);

    let mut out = Vec::new();
    // e_ident
    out.extend_from_slice(b"\x7fELF");
    out.push(2); // 64-bit
    out.push(1); // little endian
    out.push(1); // ident version
    out.push(0); // os abi
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&1u16.to_le_bytes()); // e_type = REL
    out.extend_from_slice(&host_machine().to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // e_version
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    out.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&shoff.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&shnum.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // e_shstrndx -> .strtab
    assert_eq!(out.len(), 64);

    out.extend_from_slice(&cfg.text);
    out.extend_from_slice(&strtab.data);
    out.resize(symtab_off as usize, 0);
    out.extend_from_slice(&symtab);
    out.extend_from_slice(&rela);
    out.resize(shoff as usize, 0);

    // Section headers.
    shdr(&mut out, 0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0);
    shdr(&mut out, text_name, SHT_PROGBITS, cfg.text_flags, text_off, cfg.text.len() as u64, 0, 0,
         16, 0);
    shdr(&mut out, strtab_name, SHT_STRTAB, 0, strtab_off, strtab.data.len() as u64, 0, 0, 1, 0);
    shdr(&mut out, symtab_name, SHT_SYMTAB, 0, symtab_off, symtab.len() as u64, 2,
         1 + cfg.symbols.len() as u32, 8, 24);
    if has_rela {
        shdr(&mut out, rela_name, SHT_RELA, 0, rela_off, rela.len() as u64, 3, 1, 8, 24);
    }
    if has_bss {
        shdr(&mut out, bss_name, SHT_NOBITS, (SHF_ALLOC | SHF_WRITE) as u64, strtab_off,
             cfg.bss_size, 0, 0, 16, 0);
    }
    if cfg.emit_rel_section {
        shdr(&mut out, rela_name, goblin::elf::section_header::SHT_REL, 0, rela_off, 0, 3, 1, 8,
             16);
    }
    out
}
