//! Crate-wide error type.
//!
//! The entity boundaries in `host` and `domain` need to distinguish a
//! handful of failure kinds (a page fault vs. a cycle vs. a plain I/O
//! error) to decide whether to keep walking, so a single opaque string
//! error is not enough here the way it is for a CLI tool that always
//! exits on the first failure.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalyserError>;

/// Distinguishes why a page-table walk or a physical/virtual read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultKind {
    NonPresent,
    Reserved,
    OutOfMap,
}

impl std::fmt::Display for PageFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PageFaultKind::NonPresent => "non-present",
            PageFaultKind::Reserved => "reserved-bit violation",
            PageFaultKind::OutOfMap => "outside memory map",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum AnalyserError {
    #[error("{0}")]
    Io(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("missing symbol: {0}")]
    MissingSymbol(String),

    #[error("page fault ({kind}) at va={va:#x}")]
    PageFault { kind: PageFaultKind, va: u64 },

    #[error("struct layout mismatch: {0}")]
    StructLayoutMismatch(String),

    #[error("truncated: {0}")]
    Truncated(String),

    #[error("cycle detected after N={0} entries")]
    CycleDetected(usize),

    #[error("out of memory")]
    OutOfMemory,
}

impl AnalyserError {
    pub fn io_path(path: &PathBuf, err: std::io::Error) -> Self {
        AnalyserError::Io(format!("{}: {}", path.display(), err))
    }

    /// Which of the three tiers from the failure-semantics design this error
    /// belongs to when raised while decoding a single vCPU/domain/console
    /// segment. Callers above the entity boundary use this to decide
    /// whether to keep walking or abort the whole run.
    pub fn is_entity_recoverable(&self) -> bool {
        matches!(
            self,
            AnalyserError::PageFault { .. }
                | AnalyserError::StructLayoutMismatch(_)
                | AnalyserError::Truncated(_)
                | AnalyserError::CycleDetected(_)
                | AnalyserError::MissingSymbol(_)
        )
    }
}

impl From<std::io::Error> for AnalyserError {
    fn from(err: std::io::Error) -> Self {
        AnalyserError::Io(err.to_string())
    }
}

impl From<nix::Error> for AnalyserError {
    fn from(err: nix::Error) -> Self {
        AnalyserError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_recoverable_classification() {
        assert!(AnalyserError::CycleDetected(1).is_entity_recoverable());
        assert!(!AnalyserError::OutOfMemory.is_entity_recoverable());
        assert!(!AnalyserError::UnsupportedArch("ppc".into()).is_entity_recoverable());
    }
}
