//! Physical memory map over the CORE file's `PT_LOAD` segments, and the
//! architecture-dispatched virtual-to-physical translation built on top
//! of it.
//!
//! Grounded in `vmsh`'s `guest_mem::PhysHostMap`: both are a sorted list
//! of disjoint ranges with a binary-search lookup from an address to the
//! segment/offset that covers it. The difference is that `PhysHostMap`
//! maps physical addresses to an in-process host pointer offset (the VM
//! is live, mapped into this process), whereas `MemoryMap` maps physical
//! addresses to a byte offset inside a CORE file read with `pread` (the
//! hypervisor is dead, its memory is a file).

use crate::arch::{AccessKind, Architecture};
use crate::error::{AnalyserError, Result};
use nix::sys::uio::pread;
use std::cmp::Ordering;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment {
    pub phys_start: u64,
    pub file_offset: u64,
    pub length: u64,
    pub virt_start: Option<u64>,
}

impl LoadSegment {
    pub fn phys_end(&self) -> u64 {
        self.phys_start + self.length
    }

    pub fn contains(&self, phys: u64) -> bool {
        self.phys_start <= phys && phys < self.phys_end()
    }
}

pub struct MemoryMap {
    file: File,
    /// Sorted by `phys_start`; segments are disjoint (checked at
    /// construction), never assumed contiguous.
    segments: Vec<LoadSegment>,
    architecture: Architecture,
}

fn validate_disjoint(segments: &[LoadSegment]) -> Result<()> {
    for s in segments {
        if s.length == 0 {
            return Err(AnalyserError::InvalidFormat(format!(
                "zero-length PT_LOAD at phys {:#x}",
                s.phys_start
            )));
        }
    }
    for pair in segments.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.phys_end() > b.phys_start {
            return Err(AnalyserError::InvalidFormat(format!(
                "overlapping PT_LOAD segments: [{:#x}, {:#x}) and [{:#x}, {:#x})",
                a.phys_start,
                a.phys_end(),
                b.phys_start,
                b.phys_end()
            )));
        }
    }
    Ok(())
}

impl MemoryMap {
    pub fn setup(
        core_path: &Path,
        mut segments: Vec<LoadSegment>,
        architecture: Architecture,
    ) -> Result<MemoryMap> {
        if segments.is_empty() {
            return Err(AnalyserError::InvalidFormat(
                "CORE file has no PT_LOAD segments".to_string(),
            ));
        }
        segments.sort_by_key(|s| s.phys_start);
        validate_disjoint(&segments)?;

        let file =
            File::open(core_path).map_err(|e| AnalyserError::io_path(&PathBuf::from(core_path), e))?;

        Ok(MemoryMap {
            file,
            segments,
            architecture,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    fn find_segment(&self, phys: u64) -> Option<&LoadSegment> {
        let idx = self
            .segments
            .binary_search_by(|s| {
                if phys < s.phys_start {
                    Ordering::Greater
                } else if phys >= s.phys_end() {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .ok()?;
        Some(&self.segments[idx])
    }

    /// Reads `len` bytes starting at physical address `phys`. Spanning two
    /// segments is an error: segments are contiguous in physical space
    /// only by coincidence, never by guarantee.
    pub fn read_phys(&self, phys: u64, len: usize) -> Result<Vec<u8>> {
        let segment = self.find_segment(phys).ok_or(AnalyserError::PageFault {
            kind: crate::error::PageFaultKind::OutOfMap,
            va: phys,
        })?;

        let end = phys
            .checked_add(len as u64)
            .ok_or_else(|| AnalyserError::InvalidFormat("physical address overflow".to_string()))?;
        if end > segment.phys_end() {
            return Err(AnalyserError::PageFault {
                kind: crate::error::PageFaultKind::OutOfMap,
                va: phys,
            });
        }

        let file_offset = segment.file_offset + (phys - segment.phys_start);
        let mut buf = vec![0u8; len];
        let mut read_total = 0usize;
        while read_total < len {
            let n = pread(
                self.file.as_raw_fd(),
                &mut buf[read_total..],
                (file_offset + read_total as u64) as libc::off_t,
            )
            .map_err(AnalyserError::from)?;
            if n == 0 {
                return Err(AnalyserError::Truncated(format!(
                    "short read at physical {:#x}: wanted {} bytes, got {}",
                    phys, len, read_total
                )));
            }
            read_total += n;
        }
        Ok(buf)
    }

    pub fn virt_to_phys(&self, root: u64, virt: u64, access: AccessKind) -> Result<u64> {
        self.architecture
            .backend()
            .walk_pagetable(self, root, virt, access)
    }

    /// Composes `virt_to_phys` with `read_phys`, splitting the read at
    /// page boundaries. A fault on any page aborts the whole read.
    pub fn read_virt(&self, root: u64, virt: u64, len: usize) -> Result<Vec<u8>> {
        const PAGE_SIZE: u64 = 4096;
        let mut out = Vec::with_capacity(len);
        let mut addr = virt;
        let mut remaining = len;
        while remaining > 0 {
            let page_offset = (addr % PAGE_SIZE) as usize;
            let chunk = remaining.min(PAGE_SIZE as usize - page_offset);
            let phys = self.virt_to_phys(root, addr, AccessKind::Read)?;
            out.extend_from_slice(&self.read_phys(phys, chunk)?);
            addr += chunk as u64;
            remaining -= chunk;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn synthetic_core(contents: &[u8]) -> (tempfile::NamedTempFile, PathBuf) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        let path = f.path().to_path_buf();
        (f, path)
    }

    #[test]
    fn read_phys_returns_exact_bytes() {
        let data = (0u8..=255).collect::<Vec<u8>>();
        let (_f, path) = synthetic_core(&data);
        let segs = vec![LoadSegment {
            phys_start: 0x1000,
            file_offset: 0,
            length: 256,
            virt_start: None,
        }];
        let map = MemoryMap::setup(&path, segs, Architecture::X86_64).unwrap();
        let bytes = map.read_phys(0x1000, 16).unwrap();
        assert_eq!(bytes, data[0..16]);
        let bytes = map.read_phys(0x1010, 4).unwrap();
        assert_eq!(bytes, data[16..20]);
    }

    #[test]
    fn read_phys_out_of_map_fails() {
        let (_f, path) = synthetic_core(&[0u8; 0x1000]);
        let segs = vec![LoadSegment {
            phys_start: 0,
            file_offset: 0,
            length: 0x1000,
            virt_start: None,
        }];
        let map = MemoryMap::setup(&path, segs, Architecture::X86_64).unwrap();
        assert!(map.read_phys(0x1000, 1).is_err());
        assert!(matches!(
            map.read_phys(0x1000, 1),
            Err(AnalyserError::PageFault {
                kind: crate::error::PageFaultKind::OutOfMap,
                ..
            })
        ));
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let (_f, path) = synthetic_core(&[0u8; 0x2000]);
        let segs = vec![
            LoadSegment {
                phys_start: 0,
                file_offset: 0,
                length: 0x1001,
                virt_start: None,
            },
            LoadSegment {
                phys_start: 0x1000,
                file_offset: 0x1000,
                length: 0x1000,
                virt_start: None,
            },
        ];
        assert!(MemoryMap::setup(&path, segs, Architecture::X86_64).is_err());
    }

    #[test]
    fn no_segments_is_fatal() {
        let (_f, path) = synthetic_core(&[0u8; 0x10]);
        assert!(MemoryMap::setup(&path, vec![], Architecture::X86_64).is_err());
    }
}
