//! CLI entry point. Parses arguments with `clap`'s builder API, the same
//! crate and style `vmsh`'s `src/bin/vmsh.rs` uses, installs `env_logger`
//! at the resolved verbosity, and hands a `Config` to the library.

use clap::{App, Arg};
use std::path::PathBuf;
use std::process::exit;
use xen_crashdump_analyser::config::{Config, Verbosity};
use xen_crashdump_analyser::{exit_code, exit_code_for, log_fatal, run};

fn parse_args() -> Result<Config, i32> {
    let matches = App::new("xen-crashdump-analyser")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Decodes a hypervisor CORE dump into human-readable reports")
        .arg(
            Arg::with_name("core")
                .short("c")
                .long("core")
                .value_name("PATH")
                .help("path to the ELF CORE file")
                .default_value("/proc/vmcore")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("outdir")
                .short("o")
                .long("outdir")
                .value_name("PATH")
                .help("output directory for reports")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("xen-symtab")
                .short("x")
                .long("xen-symtab")
                .value_name("PATH")
                .help("hypervisor nm-style symbol table")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dom0-symtab")
                .short("d")
                .long("dom0-symtab")
                .value_name("PATH")
                .help("control domain nm-style symbol table")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .conflicts_with("verbose")
                .help("suppress all but error output"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("increase verbosity (repeatable)"),
        )
        .get_matches_safe()
        .map_err(|e| {
            eprintln!("{}", e);
            exit_code::USAGE
        })?;

    let mut verbosity = Verbosity::default();
    if matches.is_present("quiet") {
        verbosity = Verbosity::Quiet;
    } else {
        for _ in 0..matches.occurrences_of("verbose") {
            verbosity = verbosity.increment();
        }
    }

    Ok(Config {
        core_path: PathBuf::from(matches.value_of("core").unwrap()),
        outdir_path: PathBuf::from(matches.value_of("outdir").unwrap()),
        xen_symtab_path: PathBuf::from(matches.value_of("xen-symtab").unwrap()),
        dom0_symtab_path: PathBuf::from(matches.value_of("dom0-symtab").unwrap()),
        verbosity,
    })
}

/// The log sink lives outside the core (§6 of the design doc): the
/// binary owns both the directory creation and the log file, writing
/// `xen-crashdump-analyser.log` into the same output directory the
/// core's reports land in.
fn init_logger(config: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(&config.outdir_path)?;
    let log_path = config.outdir_path.join("xen-crashdump-analyser.log");
    let log_file = std::fs::File::create(log_path)?;
    env_logger::Builder::new()
        .filter_level(config.verbosity.to_level_filter())
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();
    Ok(())
}

fn main() {
    let config = match parse_args() {
        Ok(config) => config,
        Err(code) => exit(code),
    };

    if let Err(e) = init_logger(&config) {
        eprintln!("failed to open log file in {}: {}", config.outdir_path.display(), e);
        exit(exit_code::IO);
    }

    match run(&config) {
        Ok(()) => exit(exit_code::OK),
        Err(err) => {
            log_fatal(&err);
            exit(exit_code_for(&err));
        }
    }
}
