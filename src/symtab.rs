//! `nm`-style symbol table: `<hex address> <type char> <name>` per line.
//!
//! Grounded in `vmsh`'s `kernel.rs::get_kernel_symbols`, which builds an
//! equivalent name→address map while reconstructing `ksymtab` from raw
//! guest memory; here the table comes straight from a text file instead
//! of being reverse-engineered out of a binary section.

use crate::error::{AnalyserError, Result};
use log::debug;
use std::fs;
use std::path::Path;

/// Distance beyond which `symbolise` refuses to attribute an address to
/// the nearest preceding symbol, to avoid misleading call-site attribution
/// deep inside an unrelated function or inside a data gap.
const SYMBOLISE_GAP_LIMIT: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub type_code: char,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Sorted by address; the primary access path for `symbolise`.
    by_address: Vec<Symbol>,
    by_name: std::collections::HashMap<String, u64>,
}

fn parse_line(line: &str) -> Option<Symbol> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    let addr_str = parts.next()?;
    let rest = parts.next()?.trim_start();
    let mut rest_parts = rest.splitn(2, char::is_whitespace);
    let type_str = rest_parts.next()?;
    let name = rest_parts.next()?.trim();

    let address = u64::from_str_radix(addr_str, 16).ok()?;
    let type_code = type_str.chars().next()?;
    if name.is_empty() {
        return None;
    }
    Some(Symbol {
        name: name.to_string(),
        address,
        type_code,
    })
}

impl SymbolTable {
    /// Well-known symbol used to check that a full hypervisor symtab (as
    /// opposed to a stripped one) was supplied.
    pub const TEXT_SECTION_MARKER: &'static str = "_stext";

    pub fn parse(path: &Path, require_text_section: bool) -> Result<SymbolTable> {
        let contents = fs::read_to_string(path).map_err(|e| AnalyserError::io_path(&path.to_path_buf(), e))?;

        let mut symbols = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            match parse_line(line) {
                Some(sym) => symbols.push(sym),
                None if line.trim().is_empty() || line.trim_start().starts_with('#') => {}
                None => debug!("{}:{}: malformed symbol line, skipping", path.display(), lineno + 1),
            }
        }

        if symbols.is_empty() {
            return Err(AnalyserError::InvalidFormat(format!(
                "{}: no symbols parsed",
                path.display()
            )));
        }

        symbols.sort_by_key(|s| s.address);

        let by_name = symbols
            .iter()
            .map(|s| (s.name.clone(), s.address))
            .collect();

        let table = SymbolTable {
            by_address: symbols,
            by_name,
        };

        if require_text_section && table.lookup_name(Self::TEXT_SECTION_MARKER).is_none() {
            return Err(AnalyserError::InvalidFormat(format!(
                "{}: missing {} symbol, this does not look like a full symbol table",
                path.display(),
                Self::TEXT_SECTION_MARKER
            )));
        }

        Ok(table)
    }

    pub fn lookup_name(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Greatest symbol with `address <= addr`, paired with the offset, or
    /// `None` if no such symbol exists or the gap exceeds the sanity limit.
    pub fn symbolise(&self, addr: u64) -> Option<(&str, u64)> {
        let idx = match self.by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let sym = &self.by_address[idx];
        let offset = addr - sym.address;
        if offset > SYMBOLISE_GAP_LIMIT {
            return None;
        }
        Some((sym.name.as_str(), offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_symtab(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn parses_basic_lines_and_skips_blanks_and_comments() {
        let f = write_symtab(&[
            "",
            "# a comment",
            "ffff82d080200000 T __start_xen",
            "ffff82d080200100 T __start_xen_end",
        ]);
        let table = SymbolTable::parse(f.path(), false).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup_name("__start_xen"),
            Some(0xffff82d080200000)
        );
    }

    #[test]
    fn empty_result_is_fatal() {
        let f = write_symtab(&["", "# nothing here"]);
        assert!(SymbolTable::parse(f.path(), false).is_err());
    }

    #[test]
    fn require_text_section_rejects_stripped_table() {
        let f = write_symtab(&["ffff82d080200000 T __start_xen"]);
        assert!(SymbolTable::parse(f.path(), true).is_err());

        let f = write_symtab(&[
            "ffff82d080200000 T _stext",
            "ffff82d080200000 T __start_xen",
        ]);
        assert!(SymbolTable::parse(f.path(), true).is_ok());
    }

    #[test]
    fn symbolise_returns_nearest_preceding_symbol_and_offset() {
        let f = write_symtab(&[
            "ffff82d080200000 T __start_xen",
            "ffff82d080201000 T next_fn",
        ]);
        let table = SymbolTable::parse(f.path(), false).unwrap();
        assert_eq!(
            table.symbolise(0xffff82d080200000),
            Some(("__start_xen", 0))
        );
        assert_eq!(
            table.symbolise(0xffff82d080200037),
            Some(("__start_xen", 0x37))
        );
        assert_eq!(table.symbolise(0xffff82d080200fff), Some(("__start_xen", 0xfff)));
    }

    #[test]
    fn symbolise_is_idempotent() {
        let f = write_symtab(&["ffff82d080200000 T __start_xen"]);
        let table = SymbolTable::parse(f.path(), false).unwrap();
        let a = table.symbolise(0xffff82d080200037);
        let b = table.symbolise(0xffff82d080200037);
        assert_eq!(a, b);
    }

    #[test]
    fn symbolise_refuses_large_gaps() {
        let f = write_symtab(&["0000000000000000 T only_symbol"]);
        let table = SymbolTable::parse(f.path(), false).unwrap();
        assert_eq!(table.symbolise(2 * 1024 * 1024), None);
    }
}
