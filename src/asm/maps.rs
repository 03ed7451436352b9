//! Maps-section assembler
//!
//! One map per line: `name: type, ks, vs, maxent[, flags]`. Each map
//! occupies a fixed packed record; symbol offsets are assigned in insertion
//! order at `resolve_symbols`.

use crate::asm::insn::check_s32;
use crate::error::{Error, Result};
use crate::lexer::{self, parse_immediate, Equates};

/// Map flag letters, in bit order: `P` = NO_PREALLOC, `L` = NO_COMMON_LRU
const MAP_FLAGS: &str = "PL";

/// Pinning value for the global namespace (iproute2 PIN_GLOBAL_NS)
const PIN_GLOBAL_NS: u32 = 2;

/// Assembler for the maps section
#[derive(Debug)]
pub struct MapsAssembler {
    no_pin: bool,
    maps: Vec<(String, Vec<u8>)>,
    symbols: Vec<(String, u64)>,
    section: Vec<u8>,
}

impl MapsAssembler {
    /// Create an empty maps section. With `no_pin`, the shorter 20-byte
    /// record is emitted instead of the 28-byte pinned form.
    pub fn new(no_pin: bool) -> MapsAssembler {
        MapsAssembler {
            no_pin,
            maps: Vec::new(),
            symbols: Vec::new(),
            section: Vec::new(),
        }
    }

    /// The section bytes; valid after `resolve_symbols`
    pub fn binary(&self) -> Vec<u8> {
        self.section.clone()
    }

    /// Map names with their byte offsets; valid after `resolve_symbols`
    pub fn symbols(&self) -> Vec<(String, u64)> {
        self.symbols.clone()
    }

    /// Ingest one trimmed map definition line
    pub fn feed_line(&mut self, line: &str, equates: &Equates) -> Result<()> {
        let (name, args) = match line.split_once(": ") {
            Some((n, a)) => (n, a),
            None => (line, ""),
        };
        if self.maps.iter().any(|(n, _)| n == name) {
            return Err(Error::DuplicateMap(name.to_string()));
        }
        let mut args = lexer::split_args(args);
        if args.len() == 4 {
            args.push(String::new());
        }
        if args.len() != 5 {
            return Err(Error::BadMapDefn(format!("{:?}", args)));
        }
        let map_type = parse_immediate(&args[0], equates)?;
        let key_size = parse_immediate(&args[1], equates)?;
        let value_size = parse_immediate(&args[2], equates)?;
        let max_entries = parse_immediate(&args[3], equates)?;
        let mut flags: i128 = 0;
        for c in args[4].chars() {
            let bit = MAP_FLAGS.find(c).ok_or(Error::BadMapFlag(c))?;
            flags |= 1 << bit;
        }
        let mut record = Vec::with_capacity(28);
        for field in [map_type, key_size, value_size, max_entries, flags] {
            record.extend_from_slice(&check_s32(field)?.to_le_bytes());
        }
        if !self.no_pin {
            // struct bpf_elf_map trailer: id (unused) and pinning
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&PIN_GLOBAL_NS.to_le_bytes());
        }
        self.maps.push((name.to_string(), record));
        Ok(())
    }

    /// Assign symbol offsets and lay out the section
    pub fn resolve_symbols(&mut self) {
        self.section.clear();
        self.symbols.clear();
        for (name, record) in &self.maps {
            self.symbols.push((name.clone(), self.section.len() as u64));
            self.section.extend_from_slice(record);
        }
    }
}
