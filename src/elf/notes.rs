//! CORE note payloads.
//!
//! The two note classes the host walker cares about: per-pcpu register
//! snapshots (`NT_PRSTATUS` plus a paired hypervisor-specific extension
//! carrying control registers) and a single hypervisor anchor note that
//! gives the decoder everything it needs to start walking symbolically
//! (cpu count, page-table root, version).
//!
//! `original_source` for the real `xen-crashdump-analyser` wire format
//! was not available to ground the exact note name/type values against,
//! so the `XEN_NOTE_NAME`/`XEN_NT_*` constants below are this port's own
//! choice, recorded as an Open Question resolution in DESIGN.md.

use crate::error::{AnalyserError, Result};
use std::convert::TryInto;

pub const CORE_NOTE_NAME: &str = "CORE";
pub const NT_PRSTATUS: u32 = 1;

pub const XEN_NOTE_NAME: &str = "Xen";
pub const XEN_NT_ANCHOR: u32 = 1;
pub const XEN_NT_CRASH_REGS: u32 = 2;

#[derive(Debug, Clone)]
pub struct CoreNote {
    pub name: String,
    pub note_type: u32,
    pub payload: Vec<u8>,
}

impl CoreNote {
    pub fn is_prstatus(&self) -> bool {
        self.name == CORE_NOTE_NAME && self.note_type == NT_PRSTATUS
    }

    pub fn is_anchor(&self) -> bool {
        self.name == XEN_NOTE_NAME && self.note_type == XEN_NT_ANCHOR
    }

    pub fn is_crash_regs(&self) -> bool {
        self.name == XEN_NOTE_NAME && self.note_type == XEN_NT_CRASH_REGS
    }
}

/// The hypervisor-descriptor note: anchors all further symbolic decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorNote {
    pub cpu_count: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_extra: String,
    pub idle_vcpu: u64,
    pub page_table_base: u64,
    pub console_ring_va: u64,
    pub console_ring_size: u64,
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice: [u8; 4] = bytes
        .get(offset..offset + 4)
        .ok_or_else(|| AnalyserError::Truncated("anchor note too short".to_string()))?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(slice))
}

fn read_u64_le(bytes: &[u8], offset: usize) -> Result<u64> {
    let slice: [u8; 8] = bytes
        .get(offset..offset + 8)
        .ok_or_else(|| AnalyserError::Truncated("anchor note too short".to_string()))?
        .try_into()
        .unwrap();
    Ok(u64::from_le_bytes(slice))
}

const VERSION_EXTRA_LEN: usize = 16;
const ANCHOR_NOTE_LEN: usize = 4 + 4 + 4 + VERSION_EXTRA_LEN + 8 + 8 + 8 + 8;

impl AnchorNote {
    pub fn decode(payload: &[u8]) -> Result<AnchorNote> {
        if payload.len() < ANCHOR_NOTE_LEN {
            return Err(AnalyserError::Truncated(format!(
                "anchor note is {} bytes, expected at least {}",
                payload.len(),
                ANCHOR_NOTE_LEN
            )));
        }
        let cpu_count = read_u32_le(payload, 0)?;
        let version_major = read_u32_le(payload, 4)?;
        let version_minor = read_u32_le(payload, 8)?;
        let extra_bytes = &payload[12..12 + VERSION_EXTRA_LEN];
        let nul = extra_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VERSION_EXTRA_LEN);
        let version_extra = String::from_utf8_lossy(&extra_bytes[..nul]).into_owned();

        let mut off = 12 + VERSION_EXTRA_LEN;
        let idle_vcpu = read_u64_le(payload, off)?;
        off += 8;
        let page_table_base = read_u64_le(payload, off)?;
        off += 8;
        let console_ring_va = read_u64_le(payload, off)?;
        off += 8;
        let console_ring_size = read_u64_le(payload, off)?;

        Ok(AnchorNote {
            cpu_count,
            version_major,
            version_minor,
            version_extra,
            idle_vcpu,
            page_table_base,
            console_ring_va,
            console_ring_size,
        })
    }

    pub fn version_pair(&self) -> (u32, u32) {
        (self.version_major, self.version_minor)
    }

    pub fn version_string(&self) -> String {
        if self.version_extra.is_empty() {
            format!("{}.{}", self.version_major, self.version_minor)
        } else {
            format!(
                "{}.{}{}",
                self.version_major, self.version_minor, self.version_extra
            )
        }
    }
}
