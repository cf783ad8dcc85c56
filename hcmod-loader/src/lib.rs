//! ELF loader and relocator for Host-Compute kernel binaries.
//!
//! A Host-Compute program arrives as a relocatable ELF64 object produced by
//! the device toolchain. This crate validates the object, materialises one
//! execution instance per logical CPU (pinned exec/read-only/BSS arenas plus
//! a GOT), resolves external symbols against the host process and applies
//! x86-64 or AArch64 relocations in place.

pub mod arch;
mod elf;
mod instance;
mod mem;
mod resolve;
#[cfg(test)]
pub(crate) mod testelf;

pub use elf::{ElfView, RelocEntry, Section, SectionKind, SectionPerm, Symbol};
pub use instance::{HostProgram, Instance};
pub use mem::PinnedArena;
pub use resolve::RuntimeSymbols;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, LoadError>;

#[derive(Debug, Error)]
pub enum LoadError {
    /// Structural ELF error; the binary is rejected before any memory is mapped.
    #[error("invalid ELF binary: {0}")]
    Parse(String),
    /// Unresolved external symbol or bad relocation target.
    #[error("relocation failed: {0}")]
    Relocation(String),
    /// GOT64 with a non-zero addend; refused rather than guessed at.
    #[error("addend not handled yet for GOT64: {0}")]
    UnsupportedAddend(i64),
    /// `mlock` or page-protection change failed.
    #[error("memory protection failed: {0}")]
    Protection(#[from] std::io::Error),
    #[error("memory allocation failed")]
    Allocation,
    #[error("instance index {0} is out-of-bounds")]
    BadInstance(u32),
}
