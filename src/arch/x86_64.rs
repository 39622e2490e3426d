//! x86_64 realisation of the architecture backend: register layouts,
//! four-level page-table walker, vCPU frame decoding (HVM vs. PV) and a
//! frame-pointer stack unwinder.
//!
//! The general-purpose register layout below is lifted field-for-field
//! from `vmsh`'s `cpu.rs` `x86_64::Regs` (itself Linux's
//! `user_regs_struct`, which is also what `NT_PRSTATUS`'s `pr_reg` holds)
//! - the same struct shape, just renamed from a ptrace register snapshot
//! of a live process to a decoded CORE-note register snapshot of a dead
//! one.

use crate::arch::{AccessKind, ArchBackend, RegisterState, StackFrame, VcpuFrame};
use crate::error::{AnalyserError, PageFaultKind, Result};
use crate::memory::MemoryMap;
use crate::symtab::SymbolTable;
use std::convert::TryInto;
use bitflags::bitflags;
use log::debug;
use std::ops::Range;

pub const EM_X86_64: u16 = 62;

pub const PAGE_SIZE: u64 = 4096;
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
pub const HUGE_PAGE_SIZE: u64 = 1024 * 1024 * 1024;

const ENTRY_COUNT: u64 = 512;
const MAX_STACK_UNWIND_DEPTH: usize = 32;

bitflags! {
    pub struct PageTableFlags: u64 {
        const PRESENT         = 1;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH   = 1 << 3;
        const NO_CACHE        = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const HUGE_PAGE       = 1 << 7;
        const GLOBAL          = 1 << 8;
        const NO_EXECUTE      = 1 << 63;
    }
}

const RESERVED_MASK: u64 = 0x0007_FF00_0000_0000;

/// `pr_reg` from `NT_PRSTATUS` / `vmsh`'s `cpu::x86_64::Regs`: the full
/// general-purpose register file plus segment selectors, in the order
/// the kernel lays out `user_regs_struct`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

const GP_REGISTER_COUNT: usize = 27;
/// Offset of `pr_reg` inside Linux's `struct elf_prstatus` on x86_64.
const PR_REG_OFFSET: usize = 112;

impl GpRegisters {
    fn from_le_bytes(bytes: &[u64; GP_REGISTER_COUNT]) -> GpRegisters {
        GpRegisters {
            r15: bytes[0],
            r14: bytes[1],
            r13: bytes[2],
            r12: bytes[3],
            rbp: bytes[4],
            rbx: bytes[5],
            r11: bytes[6],
            r10: bytes[7],
            r9: bytes[8],
            r8: bytes[9],
            rax: bytes[10],
            rcx: bytes[11],
            rdx: bytes[12],
            rsi: bytes[13],
            rdi: bytes[14],
            orig_rax: bytes[15],
            rip: bytes[16],
            cs: bytes[17],
            rflags: bytes[18],
            rsp: bytes[19],
            ss: bytes[20],
            fs_base: bytes[21],
            gs_base: bytes[22],
            ds: bytes[23],
            es: bytes[24],
            fs: bytes[25],
            gs: bytes[26],
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub msr_gs_base: u64,
    pub msr_kernel_gs_base: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PcpuRegisters {
    pub gp: GpRegisters,
    pub cr: ControlRegisters,
}

fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64> {
    let slice: [u8; 8] = bytes
        .get(offset..offset + 8)
        .ok_or_else(|| AnalyserError::Truncated(format!("note payload too short at offset {}", offset)))?
        .try_into()
        .expect("slice taken with an explicit 8-byte range");
    Ok(u64::from_le_bytes(slice))
}

fn decode_gp_registers(prstatus: &[u8]) -> Result<GpRegisters> {
    if prstatus.len() < PR_REG_OFFSET + GP_REGISTER_COUNT * 8 {
        return Err(AnalyserError::Truncated(
            "NT_PRSTATUS payload shorter than pr_reg".to_string(),
        ));
    }
    let mut regs = [0u64; GP_REGISTER_COUNT];
    for (i, slot) in regs.iter_mut().enumerate() {
        *slot = read_u64_le(prstatus, PR_REG_OFFSET + i * 8)?;
    }
    Ok(GpRegisters::from_le_bytes(&regs))
}

fn decode_control_registers(ext: &[u8]) -> Result<ControlRegisters> {
    if ext.len() < 48 {
        return Err(AnalyserError::Truncated(
            "Xen extended-register note shorter than expected".to_string(),
        ));
    }
    Ok(ControlRegisters {
        cr0: read_u64_le(ext, 0)?,
        cr2: read_u64_le(ext, 8)?,
        cr3: read_u64_le(ext, 16)?,
        cr4: read_u64_le(ext, 24)?,
        msr_gs_base: read_u64_le(ext, 32)?,
        msr_kernel_gs_base: read_u64_le(ext, 40)?,
    })
}

/// Guest register save area for a single vCPU. Xen stores HVM guest
/// state in a VMCS-mirrored block and PV guest state in a `pt_regs`-shaped
/// area; both boil down to the same canonical GP register set once
/// decoded, but are read from different structure offsets.
#[derive(Debug, Clone, Copy)]
pub enum VcpuRegisterFrame {
    Hvm(GpRegisters),
    Pv(GpRegisters),
}

/// vCPU structure layout offsets, parameterised by hypervisor version so
/// minor structural drift between point releases can be accommodated
/// without a full rewrite of the decoder.
struct VcpuLayout {
    /// offset of the discriminator: non-zero means HVM.
    is_hvm_offset: u64,
    /// offset of the nested register save area (interpretation depends on
    /// `is_hvm_offset`'s value).
    regs_offset: u64,
}

const LAYOUT_4_4: VcpuLayout = VcpuLayout {
    is_hvm_offset: 0x20,
    regs_offset: 0x100,
};

const LAYOUT_4_11_PLUS: VcpuLayout = VcpuLayout {
    is_hvm_offset: 0x28,
    regs_offset: 0x108,
};

fn layout_for_version(version: (u32, u32)) -> &'static VcpuLayout {
    match version {
        (4, minor) if minor <= 4 => &LAYOUT_4_4,
        (major, _) if major < 4 => {
            let e = AnalyserError::StructLayoutMismatch(format!(
                "hypervisor version {}.{} predates known vcpu struct layouts",
                version.0, version.1
            ));
            debug!("{}, using newest known layout", e);
            &LAYOUT_4_11_PLUS
        }
        (4, minor) if minor <= 10 => &LAYOUT_4_4,
        _ => &LAYOUT_4_11_PLUS,
    }
}

fn get_index(virt: u64, level: u8) -> u64 {
    let shift = 12 + 9 * (3 - level as u64);
    (virt >> shift) & 0x1FF
}

fn entry_flags(entry: u64) -> PageTableFlags {
    PageTableFlags::from_bits_truncate(entry)
}

fn entry_addr(entry: u64) -> u64 {
    entry & 0x000f_ffff_ffff_f000
}

fn read_entry(map: &MemoryMap, table_phys: u64, index: u64) -> Result<u64> {
    let bytes = map.read_phys(table_phys + index * 8, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("read_phys(len=8) always returns exactly 8 bytes")))
}

fn check_present(entry: u64, va: u64) -> Result<()> {
    if !entry_flags(entry).contains(PageTableFlags::PRESENT) {
        return Err(AnalyserError::PageFault {
            kind: PageFaultKind::NonPresent,
            va,
        });
    }
    if entry & RESERVED_MASK != 0 {
        return Err(AnalyserError::PageFault {
            kind: PageFaultKind::Reserved,
            va,
        });
    }
    Ok(())
}

/// Four-level walk: PML4 -> PDPT -> PD -> PT, with huge/large-page
/// short-circuits at the PDPT (1 GiB) and PD (2 MiB) levels.
fn walk(map: &MemoryMap, root: u64, virt: u64) -> Result<u64> {
    let mut table_phys = root;
    for level in 0u8..4 {
        let index = get_index(virt, level);
        let entry = read_entry(map, table_phys, index)?;
        check_present(entry, virt)?;

        let flags = entry_flags(entry);
        let base = entry_addr(entry);

        if level == 1 && flags.contains(PageTableFlags::HUGE_PAGE) {
            return Ok(base + (virt & (HUGE_PAGE_SIZE - 1)));
        }
        if level == 2 && flags.contains(PageTableFlags::HUGE_PAGE) {
            return Ok(base + (virt & (LARGE_PAGE_SIZE - 1)));
        }
        if level == 3 {
            return Ok(base + (virt & (PAGE_SIZE - 1)));
        }
        table_phys = base;
    }
    unreachable!("loop always returns by level 3")
}

pub struct X86_64Backend;

impl ArchBackend for X86_64Backend {
    fn decode_pcpu_registers(&self, prstatus: &[u8], ext: &[u8]) -> Result<RegisterState> {
        let gp = decode_gp_registers(prstatus)?;
        let cr = decode_control_registers(ext)?;
        Ok(RegisterState::X86_64(PcpuRegisters { gp, cr }))
    }

    fn walk_pagetable(
        &self,
        map: &MemoryMap,
        root: u64,
        virt: u64,
        _access: AccessKind,
    ) -> Result<u64> {
        walk(map, root, virt)
    }

    fn decode_vcpu_frame(
        &self,
        map: &MemoryMap,
        hv_root: u64,
        vcpu_struct_addr: u64,
        hv_version: (u32, u32),
    ) -> Result<VcpuFrame> {
        let layout = layout_for_version(hv_version);

        // The vCPU struct lives in hypervisor heap, always reached
        // through the hypervisor's own page tables, never the guest's.
        let disc_bytes = map.read_virt(hv_root, vcpu_struct_addr + layout.is_hvm_offset, 8)?;
        let is_hvm =
            u64::from_le_bytes(disc_bytes.try_into().expect("read_virt(len=8) always returns exactly 8 bytes")) != 0;

        let regs_bytes = map.read_virt(
            hv_root,
            vcpu_struct_addr + layout.regs_offset,
            PR_REG_OFFSET + GP_REGISTER_COUNT * 8,
        )?;
        let gp = decode_gp_registers(&regs_bytes)?;

        Ok(VcpuFrame::X86_64(if is_hvm {
            VcpuRegisterFrame::Hvm(gp)
        } else {
            VcpuRegisterFrame::Pv(gp)
        }))
    }

    fn stack_unwind(
        &self,
        map: &MemoryMap,
        root: u64,
        frame: &VcpuFrame,
        hv_symtab: &SymbolTable,
        dom0_symtab: Option<&SymbolTable>,
        dom0_text: Option<Range<u64>>,
    ) -> Vec<StackFrame> {
        let VcpuFrame::X86_64(frame) = frame;
        let gp = match frame {
            VcpuRegisterFrame::Hvm(gp) | VcpuRegisterFrame::Pv(gp) => *gp,
        };

        let mut frames = Vec::new();
        let mut rip = gp.rip;
        let mut rbp = gp.rbp;
        let mut last_rsp = gp.rsp;

        for _ in 0..MAX_STACK_UNWIND_DEPTH {
            let symbol = symbolise_in_context(rip, hv_symtab, dom0_symtab, &dom0_text);
            frames.push(StackFrame { rip, symbol });

            if rbp == 0 {
                break;
            }
            let saved = match map.read_virt(root, rbp, 16) {
                Ok(bytes) => bytes,
                Err(_) => break,
            };
            let saved_rbp = u64::from_le_bytes(saved[0..8].try_into().expect("read_virt(len=16) always returns exactly 16 bytes"));
            let saved_rip = u64::from_le_bytes(saved[8..16].try_into().expect("read_virt(len=16) always returns exactly 16 bytes"));

            // RSP must move monotonically up the stack; otherwise we are
            // looping on corrupt frame-pointer chains.
            if saved_rbp != 0 && saved_rbp <= last_rsp {
                break;
            }
            last_rsp = rbp;
            rbp = saved_rbp;
            rip = saved_rip;
            if rip == 0 {
                break;
            }
        }
        frames
    }
}

fn symbolise_in_context(
    rip: u64,
    hv_symtab: &SymbolTable,
    dom0_symtab: Option<&SymbolTable>,
    dom0_text: &Option<Range<u64>>,
) -> Option<(String, u64)> {
    if let (Some(range), Some(dom0)) = (dom0_text, dom0_symtab) {
        if range.contains(&rip) {
            if let Some((name, off)) = dom0.symbolise(rip) {
                return Some((name.to_string(), off));
            }
        }
    }
    hv_symtab
        .symbolise(rip)
        .map(|(name, off)| (name.to_string(), off))
}
