//! Architecture dispatch.
//!
//! `vmsh`'s `cpu.rs` selects its register layout with `#[cfg(target_arch
//! = "...")] mod arch` because it always runs *on* the architecture it
//! inspects (it ptrace-attaches to a process on the same machine). This
//! analyser runs on whatever machine kdump happened to boot, inspecting
//! a CORE file captured on a (possibly different) crashed host, so the
//! choice has to be a runtime value derived from the ELF header's
//! `e_machine`, not a compile-time `cfg`. We keep the same idea -
//! "one module per ISA, matched exhaustively at the seams" - but express
//! it as a tagged enum over a common trait instead of conditional
//! compilation.

pub mod x86_64;

use crate::error::{AnalyserError, Result};
use crate::memory::MemoryMap;
use crate::symtab::SymbolTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86_64,
}

impl Architecture {
    pub fn from_e_machine(e_machine: u16) -> Result<Architecture> {
        match e_machine {
            x86_64::EM_X86_64 => Ok(Architecture::X86_64),
            other => Err(AnalyserError::UnsupportedArch(format!(
                "e_machine={}",
                other
            ))),
        }
    }

    pub fn backend(self) -> &'static dyn ArchBackend {
        match self {
            Architecture::X86_64 => &x86_64::X86_64Backend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Exec,
}

/// One canonical physical-cpu register snapshot, tagged by architecture.
/// Only one variant is realised today; the enum shape is what lets a
/// second ISA slot in later without touching `Host`/`Domain` call sites.
#[derive(Debug, Clone)]
pub enum RegisterState {
    X86_64(x86_64::PcpuRegisters),
}

impl RegisterState {
    pub fn rip(&self) -> u64 {
        match self {
            RegisterState::X86_64(r) => r.gp.rip,
        }
    }
}

/// A vCPU's saved guest register frame, either HVM or PV, per-architecture.
#[derive(Debug, Clone)]
pub enum VcpuFrame {
    X86_64(x86_64::VcpuRegisterFrame),
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub rip: u64,
    pub symbol: Option<(String, u64)>,
}

/// The capability set a supported ISA must provide. Implemented once
/// today (`x86_64::X86_64Backend`); additional ISAs add an impl plus an
/// `Architecture` variant, nothing else in the pipeline changes.
///
/// Deliberately missing `parse_elf`: the ELF64 header/program-header
/// layout is a property of the file format, not the captured `e_machine`,
/// so it is a free function in `elf::mod` instead of a per-backend seam
/// (see DESIGN.md).
pub trait ArchBackend: Sync {
    fn decode_pcpu_registers(&self, prstatus: &[u8], ext: &[u8]) -> Result<RegisterState>;

    fn walk_pagetable(
        &self,
        map: &MemoryMap,
        root: u64,
        virt: u64,
        access: AccessKind,
    ) -> Result<u64>;

    fn decode_vcpu_frame(
        &self,
        map: &MemoryMap,
        hv_root: u64,
        vcpu_struct_addr: u64,
        hv_version: (u32, u32),
    ) -> Result<VcpuFrame>;

    fn stack_unwind(
        &self,
        map: &MemoryMap,
        root: u64,
        frame: &VcpuFrame,
        hv_symtab: &SymbolTable,
        dom0_symtab: Option<&SymbolTable>,
        dom0_text: Option<std::ops::Range<u64>>,
    ) -> Vec<StackFrame>;
}
