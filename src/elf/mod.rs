//! ELF64 CORE file parsing: identification, program headers, and notes.
//!
//! Unlike `vmsh`'s `elf.rs` (which re-exports the *host's* libc ELF
//! struct definitions via `#[cfg(target_pointer_width = ...)]`, because
//! `vmsh` only ever builds a CORE file describing its own process on its
//! own architecture), this parser never assumes the CORE file matches
//! the analysing host: the file describes a possibly-different crashed
//! machine. Every field is read by hand from little-endian byte slices
//! instead of transmuting a host struct over the bytes, so the parser's
//! behaviour does not depend on what it happens to be compiled for.

pub mod notes;

use crate::arch::Architecture;
use crate::error::{AnalyserError, Result};
use crate::memory::LoadSegment;
use notes::CoreNote;
use std::convert::TryInto;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const PT_NOTE: u32 = libc::PT_NOTE as u32;

#[derive(Debug, Clone)]
pub struct ParsedElf {
    pub segments: Vec<LoadSegment>,
    pub notes: Vec<CoreNote>,
}

struct RawEhdr {
    e_machine: u16,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

/// Callers slice `off..off+N` out of a buffer already length-checked
/// against the field layout, so the `try_into` here can never fail.
fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(b[off..off + 2].try_into().expect("2-byte slice"))
}
fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().expect("4-byte slice"))
}
fn read_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().expect("8-byte slice"))
}

fn parse_ehdr(bytes: &[u8]) -> Result<RawEhdr> {
    if bytes.len() < EHDR_SIZE {
        return Err(AnalyserError::Truncated(
            "ELF header truncated".to_string(),
        ));
    }
    if bytes[0..4] != ELFMAG {
        return Err(AnalyserError::InvalidFormat(
            "missing ELF magic".to_string(),
        ));
    }
    let ei_class = bytes[4];
    let ei_data = bytes[5];
    if ei_class != ELFCLASS64 {
        return Err(AnalyserError::UnsupportedArch(format!(
            "EI_CLASS={} (only 64-bit supported)",
            ei_class
        )));
    }
    if ei_data != ELFDATA2LSB {
        return Err(AnalyserError::UnsupportedArch(format!(
            "EI_DATA={} (only little-endian supported)",
            ei_data
        )));
    }

    let e_machine = read_u16(bytes, EI_NIDENT + 2);
    let e_phoff = read_u64(bytes, EI_NIDENT + 2 + 2 + 4 + 8);
    let e_phentsize = read_u16(bytes, EI_NIDENT + 2 + 2 + 4 + 8 + 8 + 8 + 4);
    let e_phnum = read_u16(bytes, EI_NIDENT + 2 + 2 + 4 + 8 + 8 + 8 + 4 + 2);

    Ok(RawEhdr {
        e_machine,
        e_phoff,
        e_phentsize,
        e_phnum,
    })
}

struct RawPhdr {
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
}

fn parse_phdr(bytes: &[u8]) -> Result<RawPhdr> {
    if bytes.len() < PHDR_SIZE {
        return Err(AnalyserError::Truncated(
            "program header truncated".to_string(),
        ));
    }
    Ok(RawPhdr {
        p_type: read_u32(bytes, 0),
        p_offset: read_u64(bytes, 8),
        p_vaddr: read_u64(bytes, 16),
        p_paddr: read_u64(bytes, 24),
        p_filesz: read_u64(bytes, 32),
    })
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn parse_notes(bytes: &[u8]) -> Result<Vec<CoreNote>> {
    let mut notes = Vec::new();
    let mut off = 0usize;
    while off + 12 <= bytes.len() {
        let namesz = read_u32(bytes, off) as usize;
        let descsz = read_u32(bytes, off + 4) as usize;
        let note_type = read_u32(bytes, off + 8);
        off += 12;

        let name_end = off
            .checked_add(namesz)
            .ok_or_else(|| AnalyserError::Truncated("note name overflow".to_string()))?;
        if name_end > bytes.len() {
            return Err(AnalyserError::Truncated("note name truncated".to_string()));
        }
        let name = String::from_utf8_lossy(&bytes[off..name_end.saturating_sub(1).max(off)])
            .trim_end_matches('\0')
            .to_string();
        off = align4(name_end);

        let desc_end = off
            .checked_add(descsz)
            .ok_or_else(|| AnalyserError::Truncated("note payload overflow".to_string()))?;
        if desc_end > bytes.len() {
            return Err(AnalyserError::Truncated(
                "note payload truncated".to_string(),
            ));
        }
        let payload = bytes[off..desc_end].to_vec();
        off = align4(desc_end);

        notes.push(CoreNote {
            name,
            note_type,
            payload,
        });
    }
    Ok(notes)
}

/// Reads the ELF identification, decides the architecture variant, and
/// parses all program headers and CORE notes. Truncated headers,
/// overflowing sizes and overlapping `PT_LOAD`s are fatal; individual
/// unparseable notes are recorded as advisory and skipped.
pub fn parse(path: &Path) -> Result<(Architecture, ParsedElf)> {
    let mut file =
        fs::File::open(path).map_err(|e| AnalyserError::io_path(&PathBuf::from(path), e))?;

    let mut header_buf = vec![0u8; EHDR_SIZE];
    file.read_exact(&mut header_buf)
        .map_err(|_| AnalyserError::Truncated("could not read ELF header".to_string()))?;
    let ehdr = parse_ehdr(&header_buf)?;
    let architecture = Architecture::from_e_machine(ehdr.e_machine)?;

    if ehdr.e_phentsize as usize != PHDR_SIZE {
        return Err(AnalyserError::InvalidFormat(format!(
            "unexpected e_phentsize={}",
            ehdr.e_phentsize
        )));
    }

    let ph_table_size = ehdr.e_phentsize as u64 * ehdr.e_phnum as u64;
    file.seek(SeekFrom::Start(ehdr.e_phoff))
        .map_err(AnalyserError::from)?;
    let mut ph_table_buf = vec![0u8; ph_table_size as usize];
    file.read_exact(&mut ph_table_buf)
        .map_err(|_| AnalyserError::Truncated("program header table truncated".to_string()))?;

    let mut segments = Vec::new();
    let mut note_ranges = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let start = i * PHDR_SIZE;
        let phdr = parse_phdr(&ph_table_buf[start..start + PHDR_SIZE])?;
        match phdr.p_type {
            t if t == libc::PT_LOAD as u32 => {
                segments.push(LoadSegment {
                    phys_start: phdr.p_paddr,
                    file_offset: phdr.p_offset,
                    length: phdr.p_filesz,
                    virt_start: if phdr.p_vaddr != 0 {
                        Some(phdr.p_vaddr)
                    } else {
                        None
                    },
                });
            }
            t if t == PT_NOTE => {
                note_ranges.push((phdr.p_offset, phdr.p_filesz));
            }
            _ => {}
        }
    }

    let mut notes = Vec::new();
    for (offset, size) in note_ranges {
        file.seek(SeekFrom::Start(offset))
            .map_err(AnalyserError::from)?;
        let mut buf = vec![0u8; size as usize];
        if file.read_exact(&mut buf).is_err() {
            log::warn!("PT_NOTE at offset {:#x} is truncated, skipping", offset);
            continue;
        }
        match parse_notes(&buf) {
            Ok(mut parsed) => notes.append(&mut parsed),
            Err(e) => log::warn!("unparseable PT_NOTE at offset {:#x}: {}", offset, e),
        }
    }

    Ok((architecture, ParsedElf { segments, notes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn build_minimal_core(phys_start: u64, length: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        // e_ident
        buf.extend_from_slice(&ELFMAG);
        buf.push(ELFCLASS64);
        buf.push(ELFDATA2LSB);
        buf.extend_from_slice(&[0u8; 10]);
        write_u16(&mut buf, 4); // e_type = ET_CORE
        write_u16(&mut buf, crate::arch::x86_64::EM_X86_64);
        write_u32(&mut buf, 1); // e_version
        write_u64(&mut buf, 0); // e_entry
        write_u64(&mut buf, EHDR_SIZE as u64); // e_phoff
        write_u64(&mut buf, 0); // e_shoff
        write_u32(&mut buf, 0); // e_flags
        write_u16(&mut buf, EHDR_SIZE as u16); // e_ehsize
        write_u16(&mut buf, PHDR_SIZE as u16); // e_phentsize
        write_u16(&mut buf, 1); // e_phnum
        write_u16(&mut buf, 0); // e_shentsize
        write_u16(&mut buf, 0); // e_shnum
        write_u16(&mut buf, 0); // e_shstrndx
        assert_eq!(buf.len(), EHDR_SIZE);

        // single PT_LOAD
        write_u32(&mut buf, libc::PT_LOAD as u32);
        write_u32(&mut buf, 0); // p_flags
        write_u64(&mut buf, 0x2000); // p_offset (right after header+phdr)
        write_u64(&mut buf, 0); // p_vaddr
        write_u64(&mut buf, phys_start); // p_paddr
        write_u64(&mut buf, length); // p_filesz
        write_u64(&mut buf, length); // p_memsz
        write_u64(&mut buf, 0x1000); // p_align
        assert_eq!(buf.len(), EHDR_SIZE + PHDR_SIZE);

        buf.resize(0x2000, 0);
        buf.extend(vec![0xAB; length as usize]);
        buf
    }

    #[test]
    fn parses_minimal_elf_with_one_pt_load() {
        let data = build_minimal_core(0x1000, 0x1000);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();

        let (arch, parsed) = parse(f.path()).unwrap();
        assert_eq!(arch, Architecture::X86_64);
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].phys_start, 0x1000);
        assert_eq!(parsed.segments[0].length, 0x1000);
        assert!(parsed.notes.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_minimal_core(0, 0x1000);
        data[0] = 0;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        assert!(parse(f.path()).is_err());
    }

    #[test]
    fn rejects_unsupported_machine() {
        let mut data = build_minimal_core(0, 0x1000);
        data[18] = 3; // e_machine low byte -> EM_386
        data[19] = 0;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        assert!(parse(f.path()).is_err());
    }
}
