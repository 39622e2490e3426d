//! The configuration value passed from the (out-of-scope) CLI layer into
//! the core. Mirrors how `vmsh`'s `src/bin/vmsh.rs` builds an
//! `InspectOptions` and hands it to library functions instead of the
//! library reading `std::env` itself.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Warn,
    Info,
    Debug,
}

impl Verbosity {
    /// `--verbose` is repeatable and saturates at `Debug`; the original
    /// C++ increment expression (`verbosity - 3 ? verbosity + 1 : verbosity`)
    /// is buggy for values other than exactly 3 (it also increments for
    /// negative verbosities). We implement the evident intent: clamp.
    pub fn increment(self) -> Self {
        match self {
            Verbosity::Quiet => Verbosity::Warn,
            Verbosity::Warn => Verbosity::Info,
            Verbosity::Info | Verbosity::Debug => Verbosity::Debug,
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Quiet => log::LevelFilter::Error,
            Verbosity::Warn => log::LevelFilter::Warn,
            Verbosity::Info => log::LevelFilter::Info,
            Verbosity::Debug => log::LevelFilter::Debug,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Info
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub core_path: PathBuf,
    pub outdir_path: PathBuf,
    pub xen_symtab_path: PathBuf,
    pub dom0_symtab_path: PathBuf,
    pub verbosity: Verbosity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_saturates_at_debug() {
        let mut v = Verbosity::Quiet;
        for _ in 0..10 {
            v = v.increment();
        }
        assert_eq!(v, Verbosity::Debug);
    }
}
