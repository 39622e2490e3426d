#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod arch;
pub mod config;
pub mod domain;
pub mod elf;
pub mod error;
pub mod host;
pub mod memory;
pub mod symtab;

use config::Config;
use error::{AnalyserError, Result};
use host::Host;
use log::{error, info, warn};
use symtab::SymbolTable;

/// Process exit codes, assigned the same way a well-behaved Unix tool
/// would (`sysexits.h`): usage errors are distinct from I/O errors,
/// which are distinct from internal failures.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 64;
    pub const SOFTWARE: i32 = 70;
    pub const IO: i32 = 74;
}

/// The linear pipeline: parse symbols, parse the CORE file, build the
/// memory map, decode the hypervisor, then each domain in list order.
/// Entity-fatal failures (a single domain or vcpu) are logged and
/// skipped inside `Host`/`Domain`; everything that reaches this
/// function is run-fatal and returned to the caller.
pub fn run(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.outdir_path)
        .map_err(|e| AnalyserError::io_path(&config.outdir_path, e))?;

    info!("reading hypervisor symbol table from {}", config.xen_symtab_path.display());
    let hv_symtab = SymbolTable::parse(&config.xen_symtab_path, true)?;

    info!("reading control domain symbol table from {}", config.dom0_symtab_path.display());
    let dom0_symtab = match SymbolTable::parse(&config.dom0_symtab_path, false) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(
                "control domain symbol table unavailable, dom0 stack traces will be unsymbolised: {}",
                e
            );
            None
        }
    };

    info!("parsing CORE file {}", config.core_path.display());
    let (architecture, parsed) = elf::parse(&config.core_path)?;
    info!("CORE file architecture: {:?}", architecture);

    let memory_map = memory::MemoryMap::setup(&config.core_path, parsed.segments.clone(), architecture)?;

    let mut host = Host::setup(architecture, &parsed)?;
    host.decode_xen(&memory_map, &hv_symtab)?;

    let xen_log_path = config.outdir_path.join("xen.log");
    let mut xen_log =
        std::fs::File::create(&xen_log_path).map_err(|e| AnalyserError::io_path(&xen_log_path, e))?;
    host.print_xen(&mut xen_log, &hv_symtab)?;

    let domain_count = host.print_domains(&memory_map, &hv_symtab, dom0_symtab.as_ref(), &config.outdir_path)?;
    info!("wrote reports for {} domains", domain_count);

    Ok(())
}

/// Maps a top-level failure to the exit code contract in the external
/// interfaces. `Io`/`InvalidFormat`/`UnsupportedArch`/`Truncated` are all
/// failures to make sense of the inputs on disk (the CORE file, a
/// symbol table) and get `74`, matching the "bad input" scenarios in
/// the external interfaces (overlapping `PT_LOAD`s, a missing `_stext`).
/// The remaining variants are only ever supposed to be caught as
/// entity-recoverable at the host/domain boundary; one reaching this
/// function means that boundary didn't hold, which is an internal
/// error (`70`). Usage errors (`64`) are raised by the CLI layer before
/// `run` is ever called.
pub fn exit_code_for(err: &AnalyserError) -> i32 {
    match err {
        AnalyserError::Io(_)
        | AnalyserError::InvalidFormat(_)
        | AnalyserError::UnsupportedArch(_)
        | AnalyserError::Truncated(_) => exit_code::IO,
        AnalyserError::PageFault { .. }
        | AnalyserError::StructLayoutMismatch(_)
        | AnalyserError::CycleDetected(_)
        | AnalyserError::MissingSymbol(_)
        | AnalyserError::OutOfMemory => exit_code::SOFTWARE,
    }
}

pub fn log_fatal(err: &AnalyserError) {
    error!("{}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use error::PageFaultKind;

    #[test]
    fn invalid_format_and_truncated_exit_io() {
        assert_eq!(exit_code_for(&AnalyserError::InvalidFormat("bad magic".into())), exit_code::IO);
        assert_eq!(exit_code_for(&AnalyserError::Truncated("phdr".into())), exit_code::IO);
        assert_eq!(exit_code_for(&AnalyserError::UnsupportedArch("ia64".into())), exit_code::IO);
    }

    #[test]
    fn io_exits_io() {
        assert_eq!(exit_code_for(&AnalyserError::Io("read failed".into())), exit_code::IO);
    }

    #[test]
    fn entity_recoverable_kinds_reaching_top_level_exit_software() {
        assert_eq!(
            exit_code_for(&AnalyserError::PageFault { kind: PageFaultKind::NonPresent, va: 0 }),
            exit_code::SOFTWARE
        );
        assert_eq!(exit_code_for(&AnalyserError::CycleDetected(3)), exit_code::SOFTWARE);
        assert_eq!(exit_code_for(&AnalyserError::OutOfMemory), exit_code::SOFTWARE);
    }
}
