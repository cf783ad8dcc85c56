use core::cell::UnsafeCell;
use core::ffi::c_void;
use std::collections::HashMap;

use hcapi::{KernelIds, UInt3};

use crate::arch;
use crate::elf::{ElfView, RelocEntry, Section, SectionKind, SectionPerm};
use crate::mem::PinnedArena;
use crate::resolve::{RuntimeSymbols, dlsym_default};
use crate::{LoadError, Result};

/// The canonical exported name of the work-group barrier entry point; all
/// barrier spellings used by device code alias to it.
const DEVICE_BARRIER_SYMBOL: &str = "hc_device_barrier";

/// Global offset table of one instance.
///
/// Entry 0 always holds the address of the table itself; the remaining
/// entries are bump-allocated in relocation-application order. The entry
/// count is fixed by a pre-pass over the relocation streams, so the pinned
/// allocation never has to grow.
struct Got {
    arena: PinnedArena,
    entry_count: u64,
    index: u64,
}

impl Got {
    fn init(entry_count: u64) -> Result<Got> {
        let entry_count = 1 + entry_count;
        let arena = PinnedArena::alloc(entry_count as usize * 8)?;
        let mut got = Got { arena, entry_count, index: 1 };
        got.set(0, got.base_addr());
        Ok(got)
    }

    fn base_addr(&self) -> u64 {
        self.arena.as_ptr() as u64
    }

    fn entry_addr(&self, idx: u64) -> u64 {
        debug_assert!(idx < self.entry_count);
        self.base_addr() + idx * 8
    }

    fn allocate(&mut self, count: u64) -> Result<u64> {
        if self.index + count > self.entry_count {
            log::error!(
                "allocation of {count} GOT entries would create more GOT entries than previously defined"
            );
            return Err(LoadError::Relocation("GOT entry over-allocation".into()));
        }
        let start = self.index;
        self.index += count;
        Ok(start)
    }

    fn set(&mut self, idx: u64, value: u64) {
        debug_assert!(idx < self.entry_count);
        // SAFETY: idx is in bounds and the arena is still RW during setup.
        unsafe { *(self.arena.as_mut_ptr() as *mut u64).add(idx as usize) = value };
    }

    fn protect_read_only(&mut self) -> Result<()> {
        self.arena.protect_read_only()
    }
}

/// GOT access exposed to the per-architecture relocators.
pub(crate) struct GotAccess<'a>(&'a mut Got);

impl GotAccess<'_> {
    pub(crate) fn base_addr(&self) -> u64 {
        self.0.base_addr()
    }

    /// Allocate one entry, publish `value` into it and return its index.
    pub(crate) fn publish(&mut self, value: u64) -> Result<u64> {
        let idx = self.0.allocate(1)?;
        self.0.set(idx, value);
        Ok(idx)
    }

    pub(crate) fn entry_addr(&self, idx: u64) -> u64 {
        self.0.entry_addr(idx)
    }
}

/// One per-CPU materialisation of a loaded binary: private code, BSS and GOT
/// arenas plus the id block the device code addresses through relocations.
pub struct Instance {
    exec_memory: PinnedArena,
    /// Private read-only data; only present when `.rodata` has relocations.
    ro_memory: Option<PinnedArena>,
    rw_memory: Option<PinnedArena>,
    got: Got,
    /// section index -> mapped base address
    section_map: HashMap<usize, *const u8>,
    functions: HashMap<String, *const c_void>,
    /// Boxed so the addresses handed out during relocation stay stable.
    ids: Box<UnsafeCell<KernelIds>>,
}

// One instance is owned by exactly one worker thread during a dispatch; the
// raw pointers never leave the process.
unsafe impl Send for Instance {}
unsafe impl Sync for Instance {}

impl Instance {
    /// Entry pointer of an exported kernel function.
    pub fn function(&self, name: &str) -> Option<*const c_void> {
        self.functions.get(name).copied()
    }

    pub fn ids_ptr(&self) -> *mut KernelIds {
        self.ids.get()
    }

    /// BSS base and size; device kernels use this as their local memory.
    pub fn rw_memory(&self) -> Option<(*const u8, usize)> {
        self.rw_memory.as_ref().map(|m| (m.as_ptr(), m.len()))
    }

    /// Base and size of the relocated code pages (RX).
    pub fn exec_range(&self) -> (*const u8, usize) {
        (self.exec_memory.as_ptr(), self.exec_memory.len())
    }

    /// Base address of the GOT (RO after setup).
    pub fn got_base(&self) -> *const u8 {
        self.got.arena.as_ptr()
    }

    /// Mapped base address of a section, if it was allocated.
    pub fn section_address(&self, section_index: usize) -> Option<*const u8> {
        self.section_map.get(&section_index).copied()
    }

    /// Private read-only data base, present only when `.rodata` is relocated
    /// per instance.
    pub fn ro_range(&self) -> Option<(*const u8, usize)> {
        self.ro_memory.as_ref().map(|m| (m.as_ptr(), m.len()))
    }

    /// Prepare this instance for a new dispatch: zero the BSS and set the
    /// constant id fields.
    ///
    /// Takes `&self` because instances are handed to worker threads by shared
    /// reference; the dispatcher guarantees one worker per instance.
    pub fn reset(&self, global_work_size: UInt3, local_work_size: UInt3, group_size: UInt3,
                 work_dim: u32) {
        if let Some(rw) = &self.rw_memory {
            // SAFETY: this worker exclusively owns the instance for the dispatch.
            unsafe { rw.write_unsynchronized(0, rw.len(), 0) };
        }
        // SAFETY: same exclusivity argument as above.
        unsafe { (*self.ids.get()).reset(global_work_size, local_work_size, group_size, work_dim) };
    }
}

/// A loaded Host-Compute ELF binary with one instance per logical CPU.
pub struct HostProgram {
    /// The raw object, kept alive for debugging/dumps.
    #[allow(dead_code)]
    data: Box<[u8]>,
    /// Read-only data shared by all instances; only present when `.rodata`
    /// needs no relocation.
    #[allow(dead_code)]
    global_ro: Option<PinnedArena>,
    instances: Vec<Instance>,
    function_names: Vec<String>,
}

impl core::fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostProgram")
            .field("instances", &self.instances.len())
            .field("function_names", &self.function_names)
            .finish()
    }
}

impl HostProgram {
    pub fn load(data: Vec<u8>, resolver: &dyn RuntimeSymbols) -> Result<HostProgram> {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::load_with_cpu_count(data, resolver, cpu_count)
    }

    pub fn load_file(path: &std::path::Path, resolver: &dyn RuntimeSymbols) -> Result<HostProgram> {
        let data = std::fs::read(path).map_err(|e| {
            log::error!("failed to read binary {}: {e}", path.display());
            LoadError::Parse(format!("failed to read {}", path.display()))
        })?;
        Self::load(data, resolver)
    }

    pub fn load_with_cpu_count(data: Vec<u8>, resolver: &dyn RuntimeSymbols, cpu_count: u32)
        -> Result<HostProgram> {
        if cpu_count == 0 {
            return Err(LoadError::BadInstance(0));
        }
        let data = data.into_boxed_slice();
        let view = ElfView::parse(&data)?;
        let function_names = view.function_names.clone();

        // Read-only data without relocations is mapped once and shared.
        let mut global_ro = None;
        let mut global_ro_map = HashMap::new();
        if !view.relocate_rodata {
            global_ro = map_sections(&view.sections, view.data, SectionPerm::empty(),
                                     SectionPerm::WRITE | SectionPerm::EXECUTE, ".rodata",
                                     &mut global_ro_map)?;
            if let Some(ro) = &mut global_ro {
                ro.protect_read_only()?;
            }
        }

        let mut instances = Vec::with_capacity(cpu_count as usize);
        for cpu_idx in 0..cpu_count {
            let instance = instantiate(&view, &global_ro_map, resolver).map_err(|e| {
                log::error!("ELF binary instantiation for instance index {cpu_idx} failed: {e}");
                e
            })?;
            instances.push(instance);
        }

        Ok(HostProgram { data, global_ro, instances, function_names })
    }

    /// Exported kernel entry point names.
    pub fn function_names(&self) -> &[String] {
        &self.function_names
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn instance(&self, instance_idx: u32) -> Option<&Instance> {
        self.instances.get(instance_idx as usize)
    }
}

/// Concatenate all ALLOC sections matching the permission filter into one
/// pinned arena, respecting section alignment. The primary section is always
/// placed first since relocations may target it.
fn map_sections(sections: &[Section], binary: &[u8], required: SectionPerm,
                prohibited: SectionPerm, primary_section_name: &str,
                section_map: &mut HashMap<usize, *const u8>) -> Result<Option<PinnedArena>> {
    let mut alloc_sections: Vec<(&Section, usize)> = Vec::new();
    for section in sections {
        if !section.is_alloc() {
            continue;
        }
        let perms = section.perms();
        let has_required = required.is_empty() || perms.intersects(required);
        if !has_required || perms.intersects(prohibited) {
            continue;
        }
        if section.name == primary_section_name {
            alloc_sections.insert(0, (section, 0));
        } else {
            alloc_sections.push((section, 0));
        }
    }
    if alloc_sections.is_empty() {
        return Ok(None);
    }

    let mut total_size = 0usize;
    for (section, offset) in &mut alloc_sections {
        let align = (section.header.sh_addralign as usize).max(1);
        total_size = total_size.next_multiple_of(align);
        *offset = total_size;
        total_size += section.header.sh_size as usize;
    }

    let mut arena = PinnedArena::alloc(total_size)?;
    for (section, offset) in &alloc_sections {
        // BSS has no file contents and stays zero-initialised.
        if section.kind != SectionKind::Bss {
            let file_start = section.header.sh_offset as usize;
            let file_end = file_start + section.header.sh_size as usize;
            if file_end > binary.len() {
                return Err(LoadError::Parse(format!(
                    "section {} contents are out-of-bounds", section.name
                )));
            }
            arena.as_mut_slice()[*offset..*offset + (file_end - file_start)]
                .copy_from_slice(&binary[file_start..file_end]);
        }
        section_map.insert(section.index, unsafe { arena.as_ptr().add(*offset) });
    }
    Ok(Some(arena))
}

fn instantiate(view: &ElfView<'_>, global_ro_map: &HashMap<usize, *const u8>,
               resolver: &dyn RuntimeSymbols) -> Result<Instance> {
    let mut section_map = HashMap::new();

    // Read-only memory: private copy when it must be relocated, otherwise the
    // pre-existing global mapping.
    let mut ro_memory = None;
    if view.relocate_rodata {
        ro_memory = map_sections(&view.sections, view.data, SectionPerm::empty(),
                                 SectionPerm::WRITE | SectionPerm::EXECUTE, ".rodata",
                                 &mut section_map)?;
        if ro_memory.is_none() {
            return Err(LoadError::Parse("`.rela.rodata` exists but no read-only data does".into()));
        }
    } else {
        section_map.extend(global_ro_map.iter().map(|(k, v)| (*k, *v)));
    }

    // BSS / read-write memory.
    let rw_memory = map_sections(&view.sections, view.data, SectionPerm::WRITE,
                                 SectionPerm::EXECUTE, ".bss", &mut section_map)?;

    // There must be exactly one executable section; map it RW for now, the
    // RX transition happens after relocation.
    let exec_sections: Vec<&Section> = view
        .sections
        .iter()
        .filter(|s| {
            s.is_alloc() && s.perms().contains(SectionPerm::EXECUTE)
                && !s.perms().contains(SectionPerm::WRITE)
        })
        .collect();
    if exec_sections.len() != 1 {
        log::error!("must have exactly one exec section");
        return Err(LoadError::Parse("must have exactly one exec section".into()));
    }
    let exec_section = exec_sections[0];
    let file_start = exec_section.header.sh_offset as usize;
    let file_end = file_start + exec_section.header.sh_size as usize;
    if file_end > view.data.len() {
        return Err(LoadError::Parse("exec section contents are out-of-bounds".into()));
    }
    let mut exec_memory = PinnedArena::alloc(exec_section.header.sh_size as usize)?;
    exec_memory.as_mut_slice()[..file_end - file_start]
        .copy_from_slice(&view.data[file_start..file_end]);
    section_map.insert(exec_section.index, exec_memory.as_ptr());

    // Exported function pointers into the exec arena.
    let mut functions = HashMap::new();
    for sym in &view.symbols {
        if sym.name.is_empty()
            || sym.sym.st_bind() != goblin::elf::sym::STB_GLOBAL
            || sym.sym.st_type() != goblin::elf::sym::STT_FUNC
            || sym.sym.st_shndx != exec_section.index
        {
            continue;
        }
        let ptr = unsafe { exec_memory.as_ptr().add(sym.sym.st_value as usize) };
        functions.insert(sym.name.clone(), ptr as *const c_void);
    }

    // GOT sizing pre-pass over both relocation streams.
    let got_entry_count = view
        .exec_relocations
        .iter()
        .chain(view.rodata_relocations.iter())
        .filter(|r| arch::allocates_got_entry(view.machine, r.r_type))
        .count() as u64;
    let mut got = Got::init(got_entry_count)?;

    let ids: Box<UnsafeCell<KernelIds>> = Box::new(UnsafeCell::new(KernelIds::default()));
    let ids_ptr = ids.get();
    let got_base = got.base_addr();

    {
        let mut resolve = |reloc: &RelocEntry| -> Result<*const u8> {
            resolve_reloc_target(view, &section_map, ids_ptr, got_base, resolver, reloc)
        };
        arch::apply_relocations(view.machine, &view.exec_relocations, &mut exec_memory,
                                &mut GotAccess(&mut got), &mut resolve)?;
        if view.relocate_rodata {
            let ro = ro_memory.as_mut().expect("checked above");
            arch::apply_relocations(view.machine, &view.rodata_relocations, ro,
                                    &mut GotAccess(&mut got), &mut resolve)?;
        }
    }

    // Relocation is done; drop write access everywhere but the BSS.
    exec_memory.protect_exec()?;
    if let Some(ro) = &mut ro_memory {
        ro.protect_read_only()?;
    }
    got.protect_read_only()?;

    Ok(Instance { exec_memory, ro_memory, rw_memory, got, section_map, functions, ids })
}

/// Resolve the target address of one relocation: external symbols through the
/// built-in id table, the runtime resolver and finally `dlsym`; internal
/// symbols through the instance's section map.
fn resolve_reloc_target(view: &ElfView<'_>, section_map: &HashMap<usize, *const u8>,
                        ids: *mut KernelIds, got_base: u64, resolver: &dyn RuntimeSymbols,
                        reloc: &RelocEntry) -> Result<*const u8> {
    if reloc.symbol_index == 0 {
        log::error!("section relocation not implemented yet");
        return Err(LoadError::Relocation("section relocation not implemented yet".into()));
    }
    let sym = &view.symbols[reloc.symbol_index];

    if sym.is_external() {
        // SAFETY: `ids` points into the instance being built and outlives it.
        let ids_ref = unsafe { &mut *ids };
        let ptr: Option<*const c_void> = match sym.name.as_str() {
            "hc_global_idx" => Some((&raw const ids_ref.global_idx).cast()),
            "hc_global_work_size" => Some((&raw const ids_ref.global_work_size).cast()),
            "hc_local_idx" => Some((&raw const ids_ref.local_idx).cast()),
            "hc_local_work_size" => Some((&raw const ids_ref.local_work_size).cast()),
            "hc_group_idx" => Some((&raw const ids_ref.group_idx).cast()),
            "hc_group_size" => Some((&raw const ids_ref.group_size).cast()),
            "hc_work_dim" => Some((&raw const ids_ref.work_dim).cast()),
            "barrier" | "global_barrier" | "local_barrier" | "image_barrier"
            | DEVICE_BARRIER_SYMBOL => resolver
                .resolve(DEVICE_BARRIER_SYMBOL)
                .or_else(|| dlsym_default(DEVICE_BARRIER_SYMBOL)),
            "_GLOBAL_OFFSET_TABLE_" => Some(got_base as *const c_void),
            name => resolver.resolve(name).or_else(|| dlsym_default(name)),
        };
        return match ptr {
            Some(p) => Ok(p as *const u8),
            None => {
                log::error!("external symbol {} could not be resolved",
                            rustc_demangle::demangle(&sym.name));
                Err(LoadError::Relocation(format!("unresolved external symbol {}", sym.name)))
            }
        };
    }

    if sym.is_section_relative() {
        let shndx = sym.sym.st_shndx;
        if shndx >= view.sections.len() {
            log::error!("section index is out-of-bounds: {shndx}");
            return Err(LoadError::Relocation(format!("section index out-of-bounds: {shndx}")));
        }
        return match section_map.get(&shndx) {
            Some(base) => Ok(*base),
            None => {
                log::error!("failed to find section: {shndx}");
                Err(LoadError::Relocation(format!("unmapped section: {shndx}")))
            }
        };
    }

    log::error!("non-external symbol for relocation: {} (type: {})", sym.name, sym.sym.st_type());
    Err(LoadError::Relocation(format!("unsupported symbol for relocation: {}", sym.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testelf::{TestElf, TestSymbol, build};

    #[test]
    fn loads_instances_and_function_pointers() {
        let data = build(&TestElf { bss_size: 64, ..TestElf::default() });
        let program = HostProgram::load_with_cpu_count(data, &(), 2).unwrap();
        assert_eq!(program.instance_count(), 2);
        assert_eq!(program.function_names(), &["kernel_main".to_string()]);

        let instance = program.instance(0).unwrap();
        let func = instance.function("kernel_main").unwrap();
        assert!(!func.is_null());
        assert_eq!(func as usize, instance.exec_range().0 as usize);
        assert!(program.instance(2).is_none());

        // instances are independent materialisations
        let other = program.instance(1).unwrap();
        assert_ne!(instance.exec_range().0, other.exec_range().0);
    }

    #[test]
    fn reset_zeroes_bss_and_sets_ids() {
        let data = build(&TestElf { bss_size: 128, ..TestElf::default() });
        let program = HostProgram::load_with_cpu_count(data, &(), 1).unwrap();
        let instance = program.instance(0).unwrap();

        let (rw_ptr, rw_size) = instance.rw_memory().unwrap();
        assert!(rw_size >= 128);
        unsafe { *(rw_ptr as *mut u8) = 0xAB };

        instance.reset(UInt3::new(64, 1, 1), UInt3::new(16, 1, 1), UInt3::new(4, 1, 1), 1);
        assert_eq!(unsafe { *rw_ptr }, 0);
        let ids = unsafe { &*instance.ids_ptr() };
        assert_eq!(ids.global_work_size, UInt3::new(64, 1, 1));
        assert_eq!(ids.local_work_size, UInt3::new(16, 1, 1));
        assert_eq!(ids.group_size, UInt3::new(4, 1, 1));
        assert_eq!(ids.work_dim, 1);
        assert_eq!(ids.sub_group_size, hcapi::limits::SIMD_WIDTH);
    }

    #[test]
    fn unresolved_external_symbol_fails_the_load() {
        let mut cfg = TestElf::default();
        cfg.symbols.push(TestSymbol {
            name: "hc_no_such_symbol_anywhere",
            info: 1 << 4, // GLOBAL NOTYPE
            shndx: 0,
            value: 0,
        });
        // PC32 (x86-64) and MOVW_UABS_G0_NC (AArch64) against the unresolvable
        // symbol; only the type matching the host machine is reached.
        let r_type = if cfg!(target_arch = "aarch64") { 0x108 } else { 2 };
        cfg.relocations = vec![(0, r_type, 2, 0)];
        let data = build(&cfg);
        let err = HostProgram::load_with_cpu_count(data, &(), 1).unwrap_err();
        assert!(matches!(err, LoadError::Relocation(_)));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn applies_got64_and_gotpc64_relocations() {
        let mut cfg = TestElf {
            text: vec![0; 32],
            ..TestElf::default()
        };
        cfg.symbols.push(TestSymbol { name: "malloc", info: 1 << 4, shndx: 0, value: 0 });
        cfg.relocations = vec![
            (0, 27, 2, 0), // R_X86_64_GOT64 -> malloc
            (8, 29, 2, 0), // R_X86_64_GOTPC64
        ];
        let data = build(&cfg);
        let program = HostProgram::load_with_cpu_count(data, &(), 1).unwrap();
        let instance = program.instance(0).unwrap();
        let (exec, _) = instance.exec_range();
        let got = instance.got_base();

        // GOT64 wrote the GOT slot offset of entry 1 and published the
        // resolved address into that slot.
        let slot_offset = u64::from_le_bytes(
            unsafe { core::slice::from_raw_parts(exec, 8) }.try_into().unwrap(),
        );
        assert_eq!(slot_offset, 8);
        let malloc_addr = crate::resolve::dlsym_default("malloc").unwrap() as u64;
        let got_entry = unsafe { *(got as *const u64).add(1) };
        assert_eq!(got_entry, malloc_addr);

        // GOTPC64 is GOT base relative to the patched location.
        let gotpc = i64::from_le_bytes(
            unsafe { core::slice::from_raw_parts(exec.add(8), 8) }.try_into().unwrap(),
        );
        assert_eq!(gotpc, got as i64 - (exec as i64 + 8));

        // GOT entry 0 points at the GOT itself.
        assert_eq!(unsafe { *(got as *const u64) }, got as u64);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn applies_pc32_against_internal_symbol() {
        let mut cfg = TestElf {
            text: vec![0; 16],
            ..TestElf::default()
        };
        // kernel_main is symbol 1, FUNC in section 1 -> resolves to the
        // mapped .text base.
        cfg.relocations = vec![(4, 2, 1, 0)]; // R_X86_64_PC32
        let data = build(&cfg);
        let program = HostProgram::load_with_cpu_count(data, &(), 1).unwrap();
        let instance = program.instance(0).unwrap();
        let (exec, _) = instance.exec_range();
        let value = i32::from_le_bytes(
            unsafe { core::slice::from_raw_parts(exec.add(4), 4) }.try_into().unwrap(),
        );
        assert_eq!(value, -4);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn got64_rejects_nonzero_addend() {
        let mut cfg = TestElf { text: vec![0; 16], ..TestElf::default() };
        cfg.symbols.push(TestSymbol { name: "malloc", info: 1 << 4, shndx: 0, value: 0 });
        cfg.relocations = vec![(0, 27, 2, 16)];
        let data = build(&cfg);
        let err = HostProgram::load_with_cpu_count(data, &(), 1).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedAddend(16)));
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn applies_movw_uabs_relocation() {
        let mut cfg = TestElf {
            text: vec![0; 16],
            ..TestElf::default()
        };
        // MOVW_UABS_G0_NC against the .text base itself (symbol 1).
        cfg.relocations = vec![(0, 0x108, 1, 0)];
        let data = build(&cfg);
        let program = HostProgram::load_with_cpu_count(data, &(), 1).unwrap();
        let instance = program.instance(0).unwrap();
        let (exec, _) = instance.exec_range();
        let insn = u32::from_le_bytes(
            unsafe { core::slice::from_raw_parts(exec, 4) }.try_into().unwrap(),
        );
        assert_eq!(insn, ((exec as u64 & 0xFFFF) as u32) << 5);
    }
}
