//! Hypervisor-level decoding: per-pcpu register state, console ring
//! buffer, and the domain list walk.
//!
//! Grounded in `vmsh`'s `kernel.rs`, which locates well-known kernel
//! symbols (`init_task`, the per-cpu offset table) and walks a linked
//! list of in-guest structures the same shape as `domain_list` here;
//! the difference is that `vmsh` walks *live* guest memory through a
//! `GuestMem` it keeps mapped, we walk a dead hypervisor's memory
//! through a `MemoryMap` backed by `pread` on the CORE file.

use crate::arch::{Architecture, RegisterState};
use crate::domain::Domain;
use crate::elf::notes::{AnchorNote, CoreNote};
use crate::elf::ParsedElf;
use crate::error::{AnalyserError, Result};
use crate::memory::MemoryMap;
use crate::symtab::SymbolTable;
use log::{debug, warn};
use std::convert::TryInto;
use std::io::Write;

/// Domain lists are singly linked; this bounds the walk against a
/// corrupt or cyclic list rather than looping forever.
const MAX_DOMAINS: usize = 32768;

#[derive(Debug, Clone)]
pub struct Pcpu {
    pub index: u32,
    pub register_state: RegisterState,
    pub current_vcpu_ptr: Option<u64>,
    /// Reserved for per-pcpu status bits; no CORE note in this format
    /// carries them yet, so this is always zero today.
    pub flags: u32,
}

pub struct Host {
    architecture: Architecture,
    anchor: AnchorNote,
    pcpus: Vec<Pcpu>,
    console_ring: Vec<u8>,
    domain_list_head: Option<u64>,
}

fn decode_pcpus(architecture: Architecture, notes: &[CoreNote]) -> Result<Vec<Pcpu>> {
    let prstatus_notes: Vec<&CoreNote> = notes.iter().filter(|n| n.is_prstatus()).collect();
    let ext_notes: Vec<&CoreNote> = notes.iter().filter(|n| n.is_crash_regs()).collect();

    let mut pcpus = Vec::with_capacity(prstatus_notes.len());
    for (index, prstatus) in prstatus_notes.iter().enumerate() {
        let ext_payload = ext_notes.get(index).map(|n| n.payload.as_slice()).unwrap_or(&[]);
        let register_state = architecture
            .backend()
            .decode_pcpu_registers(&prstatus.payload, ext_payload)?;
        pcpus.push(Pcpu {
            index: index as u32,
            register_state,
            current_vcpu_ptr: None,
            flags: 0,
        });
    }
    Ok(pcpus)
}

impl Host {
    /// Stashes PCPU notes, resolves the anchor note. Fatal if no anchor
    /// note is present: without it there is no page-table root and no
    /// version to decode anything else against.
    pub fn setup(architecture: Architecture, parsed: &ParsedElf) -> Result<Host> {
        let anchor_note = parsed
            .notes
            .iter()
            .find(|n| n.is_anchor())
            .ok_or_else(|| AnalyserError::InvalidFormat("no hypervisor anchor note in CORE file".to_string()))?;
        let anchor = AnchorNote::decode(&anchor_note.payload)?;

        let pcpus = decode_pcpus(architecture, &parsed.notes)?;
        if pcpus.len() != anchor.cpu_count as usize {
            warn!(
                "anchor note reports {} cpus but {} NT_PRSTATUS notes were found",
                anchor.cpu_count,
                pcpus.len()
            );
        }

        Ok(Host {
            architecture,
            anchor,
            pcpus,
            console_ring: Vec::new(),
            domain_list_head: None,
        })
    }

    pub fn anchor(&self) -> &AnchorNote {
        &self.anchor
    }

    pub fn pcpus(&self) -> &[Pcpu] {
        &self.pcpus
    }

    /// Reassembles the console ring buffer and resolves the domain list
    /// head and each pcpu's `current_vcpu_ptr` from the hypervisor
    /// symbol table. Individual lookups that fail are advisory: the
    /// corresponding field is simply left unset.
    pub fn decode_xen(&mut self, map: &MemoryMap, hv_symtab: &SymbolTable) -> Result<()> {
        let root = self.anchor.page_table_base;

        self.console_ring = match read_console_ring(map, root, self.anchor.console_ring_va, self.anchor.console_ring_size, hv_symtab) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to reassemble console ring buffer: {}", e);
                Vec::new()
            }
        };

        match hv_symtab.lookup_name("domain_list") {
            Some(addr) => match map.read_virt(root, addr, 8) {
                Ok(bytes) => {
                    self.domain_list_head = Some(u64::from_le_bytes(
                        bytes.try_into().expect("read_virt(len=8) always returns exactly 8 bytes"),
                    ));
                }
                Err(e) => warn!("could not read domain_list head: {}", e),
            },
            None => {
                let e = AnalyserError::MissingSymbol("domain_list".to_string());
                warn!("{}", e);
            }
        }

        if let Some(per_cpu_offset) = hv_symtab.lookup_name("per_cpu__curr_vcpu") {
            for pcpu in &mut self.pcpus {
                let slot_addr = per_cpu_offset + pcpu.index as u64 * 8;
                match map.read_virt(root, slot_addr, 8) {
                    Ok(bytes) => {
                        let ptr = u64::from_le_bytes(
                            bytes.try_into().expect("read_virt(len=8) always returns exactly 8 bytes"),
                        );
                        pcpu.current_vcpu_ptr = if ptr != 0 { Some(ptr) } else { None };
                    }
                    Err(e) => debug!("pcpu {}: could not read current_vcpu_ptr: {}", pcpu.index, e),
                }
            }
        } else {
            debug!("{}", AnalyserError::MissingSymbol("per_cpu__curr_vcpu".to_string()));
        }

        Ok(())
    }

    /// Writes hypervisor-level information to `sink`: version, per-pcpu
    /// summary with symbolised RIP, and the reassembled console ring.
    pub fn print_xen(&self, sink: &mut impl Write, hv_symtab: &SymbolTable) -> Result<()> {
        writeln!(sink, "Xen version: {}", self.anchor.version_string())?;
        writeln!(sink, "idle vcpu: {:#x}", self.anchor.idle_vcpu)?;
        writeln!(sink, "cpus online: {}", self.pcpus.len())?;
        writeln!(sink)?;

        for pcpu in &self.pcpus {
            let rip = pcpu.register_state.rip();
            let symbol = hv_symtab
                .symbolise(rip)
                .map(|(name, off)| format!("{}+{:#x}", name, off))
                .unwrap_or_else(|| "<unknown>".to_string());
            writeln!(sink, "pcpu{}: rip={:#018x} ({})", pcpu.index, rip, symbol)?;
            match pcpu.current_vcpu_ptr {
                Some(ptr) => writeln!(sink, "  current_vcpu: {:#x}", ptr)?,
                None => writeln!(sink, "  current_vcpu: <idle>")?,
            }
        }

        writeln!(sink)?;
        writeln!(sink, "-- console ring --")?;
        sink.write_all(&self.console_ring)?;
        writeln!(sink)?;
        Ok(())
    }

    /// Walks the domain linked list and writes one report file per
    /// domain. A single domain's decode failing is entity-fatal: logged,
    /// a placeholder is written, and the walk continues. Returns the
    /// number of domains successfully iterated (including placeholders).
    pub fn print_domains(
        &self,
        map: &MemoryMap,
        hv_symtab: &SymbolTable,
        dom0_symtab: Option<&SymbolTable>,
        outdir: &std::path::Path,
    ) -> Result<usize> {
        let mut cursor = self.domain_list_head;
        let mut count = 0usize;
        let mut seen = std::collections::HashSet::new();

        while let Some(addr) = cursor {
            if addr == 0 {
                break;
            }
            if count >= MAX_DOMAINS {
                warn!("domain list exceeds {} entries, truncating walk", MAX_DOMAINS);
                break;
            }
            if !seen.insert(addr) {
                let e = AnalyserError::CycleDetected(count);
                warn!("domain list cycle detected at {:#x} after {}: {}", addr, count, e);
                break;
            }

            match Domain::decode(map, self.anchor.page_table_base, addr, self.architecture, self.anchor.version_pair()) {
                Ok(domain) => {
                    if let Err(e) = write_domain_report(&domain, map, hv_symtab, dom0_symtab, outdir) {
                        warn!("domain {:#x}: failed to write report: {}", addr, e);
                    }
                    cursor = domain.next_in_list;
                }
                Err(e) => {
                    warn!("domain at {:#x} failed to decode, skipping: {}", addr, e);
                    cursor = None;
                }
            }
            count += 1;
        }

        Ok(count)
    }
}

fn read_console_ring(
    map: &MemoryMap,
    root: u64,
    ring_va: u64,
    ring_size: u64,
    hv_symtab: &SymbolTable,
) -> Result<Vec<u8>> {
    if ring_va == 0 || ring_size == 0 {
        return Ok(Vec::new());
    }

    let (prod, cons) = match (
        hv_symtab.lookup_name("conring_prod"),
        hv_symtab.lookup_name("conring_cons"),
    ) {
        (Some(p), Some(c)) => {
            let p = u64::from_le_bytes(
                map.read_virt(root, p, 8)?.try_into().expect("read_virt(len=8) always returns exactly 8 bytes"),
            );
            let c = u64::from_le_bytes(
                map.read_virt(root, c, 8)?.try_into().expect("read_virt(len=8) always returns exactly 8 bytes"),
            );
            (p, c)
        }
        _ => {
            // No head/tail symbols: fall back to reading the whole ring
            // linearly, which is still useful even if not chronological.
            return map.read_virt(root, ring_va, ring_size as usize);
        }
    };

    let mask = ring_size - 1;
    let len = prod.wrapping_sub(cons).min(ring_size);
    let mut out = Vec::with_capacity(len as usize);
    let mut idx = cons;
    for _ in 0..len {
        let byte_addr = ring_va + (idx & mask);
        let byte = map.read_virt(root, byte_addr, 1)?;
        out.push(byte[0]);
        idx = idx.wrapping_add(1);
    }
    Ok(out)
}

fn write_domain_report(
    domain: &Domain,
    map: &MemoryMap,
    hv_symtab: &SymbolTable,
    dom0_symtab: Option<&SymbolTable>,
    outdir: &std::path::Path,
) -> Result<()> {
    let path = outdir.join(format!("domain-{}.log", domain.domain_id));
    let mut file = std::fs::File::create(&path).map_err(|e| AnalyserError::io_path(&path, e))?;
    domain.print(&mut file, map, hv_symtab, dom0_symtab)?;

    if domain.is_control_domain {
        let alias_path = outdir.join("dom0.log");
        let mut alias = std::fs::File::create(&alias_path).map_err(|e| AnalyserError::io_path(&alias_path, e))?;
        domain.print(&mut alias, map, hv_symtab, dom0_symtab)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::notes::{CORE_NOTE_NAME, NT_PRSTATUS, XEN_NOTE_NAME, XEN_NT_CRASH_REGS};
    use crate::memory::LoadSegment;
    use std::io::Write as _;

    fn synthetic_prstatus_payload(rip: u64) -> Vec<u8> {
        const PR_REG_OFFSET: usize = 112;
        const GP_REGISTER_COUNT: usize = 27;
        let mut buf = vec![0u8; PR_REG_OFFSET + GP_REGISTER_COUNT * 8];
        // rip is register index 16 within pr_reg
        buf[PR_REG_OFFSET + 16 * 8..PR_REG_OFFSET + 17 * 8].copy_from_slice(&rip.to_le_bytes());
        buf
    }

    fn synthetic_crash_regs_payload() -> Vec<u8> {
        vec![0u8; 48]
    }

    #[test]
    fn decode_pcpus_pairs_prstatus_with_matching_crash_regs_note() {
        let notes = vec![
            CoreNote {
                name: CORE_NOTE_NAME.to_string(),
                note_type: NT_PRSTATUS,
                payload: synthetic_prstatus_payload(0xffff82d080200037),
            },
            CoreNote {
                name: XEN_NOTE_NAME.to_string(),
                note_type: XEN_NT_CRASH_REGS,
                payload: synthetic_crash_regs_payload(),
            },
        ];
        let pcpus = decode_pcpus(Architecture::X86_64, &notes).unwrap();
        assert_eq!(pcpus.len(), 1);
        assert_eq!(pcpus[0].index, 0);
        assert_eq!(pcpus[0].register_state.rip(), 0xffff82d080200037);
        assert_eq!(pcpus[0].current_vcpu_ptr, None);
        assert_eq!(pcpus[0].flags, 0);
    }

    fn synthetic_anchor_note(console_ring_va: u64, console_ring_size: u64) -> CoreNote {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes()); // cpu_count
        payload.extend_from_slice(&4u32.to_le_bytes()); // major
        payload.extend_from_slice(&11u32.to_le_bytes()); // minor
        payload.extend_from_slice(&[0u8; 16]); // version_extra
        payload.extend_from_slice(&0u64.to_le_bytes()); // idle_vcpu
        payload.extend_from_slice(&0x1000u64.to_le_bytes()); // page_table_base
        payload.extend_from_slice(&console_ring_va.to_le_bytes());
        payload.extend_from_slice(&console_ring_size.to_le_bytes());
        CoreNote {
            name: crate::elf::notes::XEN_NOTE_NAME.to_string(),
            note_type: crate::elf::notes::XEN_NT_ANCHOR,
            payload,
        }
    }

    #[test]
    fn decode_xen_with_no_console_ring_and_no_symbols_is_a_no_op() {
        let anchor_note = synthetic_anchor_note(0, 0);
        let parsed = ParsedElf {
            segments: Vec::new(),
            notes: vec![anchor_note],
        };
        let host = Host::setup(Architecture::X86_64, &parsed).unwrap();
        assert_eq!(host.anchor().console_ring_size, 0);
        assert!(host.pcpus().is_empty());

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 0x1000]).unwrap();
        f.flush().unwrap();
        let segments = vec![LoadSegment {
            phys_start: 0,
            file_offset: 0,
            length: 0x1000,
            virt_start: None,
        }];
        let map = MemoryMap::setup(f.path(), segments, Architecture::X86_64).unwrap();

        let mut symtab_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(symtab_file, "0000000000000000 T only_symbol").unwrap();
        symtab_file.flush().unwrap();
        let symtab = SymbolTable::parse(symtab_file.path(), false).unwrap();

        let mut host = host;
        host.decode_xen(&map, &symtab).unwrap();
        assert!(host.console_ring.is_empty());
        assert_eq!(host.domain_list_head, None);
    }

    #[test]
    fn setup_fails_without_anchor_note() {
        let parsed = ParsedElf {
            segments: Vec::new(),
            notes: Vec::new(),
        };
        assert!(Host::setup(Architecture::X86_64, &parsed).is_err());
    }
}
