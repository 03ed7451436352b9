//! The assembler front end
//!
//! Lines are fed one at a time; a current-section cursor dispatches each to
//! its section assembler. Directives switch sections, define equates and
//! include files. `resolve_symbols` finalizes every section.

pub mod btf;
pub mod data;
pub mod insn;
pub mod maps;
pub mod prog;

pub use btf::{BtfAssembler, BtfType, Member};
pub use data::DataAssembler;
pub use insn::Insn;
pub use maps::MapsAssembler;
pub use prog::{ImmRef, ProgAssembler};

use crate::error::{Error, Result};
use crate::lexer::{self, parse_immediate, Equates};
use tracing::debug;

/// Section flag letters, in bit order: W (writable), A (alloc), X (exec)
fn section_flags(letters: &str) -> u64 {
    let mut flags = 0;
    for c in letters.chars() {
        flags |= match c {
            'W' => 1,
            'A' => 2,
            'X' => 4,
            _ => 0,
        };
    }
    flags
}

/// The pending section kind set by `.text` or `.data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecKind {
    Text,
    Data,
}

/// One section under assembly
#[derive(Debug)]
pub enum SectionAsm {
    /// Instruction section
    Prog(ProgAssembler),
    /// Raw data section
    Data(DataAssembler),
    /// Map descriptor section
    Maps(MapsAssembler),
    /// BTF type section
    Btf(BtfAssembler),
}

impl SectionAsm {
    /// The kind name, for redefinition errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            SectionAsm::Prog(_) => "prog",
            SectionAsm::Data(_) => "data",
            SectionAsm::Maps(_) => "maps",
            SectionAsm::Btf(_) => "btf",
        }
    }

    fn feed_line(&mut self, line: &str, equates: &Equates) -> Result<()> {
        match self {
            SectionAsm::Prog(p) => p.feed_line(line, equates),
            SectionAsm::Data(d) => d.feed_line(line),
            SectionAsm::Maps(m) => m.feed_line(line, equates),
            SectionAsm::Btf(b) => b.feed_line(line, equates),
        }
    }

    fn resolve_symbols(&mut self) -> Result<()> {
        match self {
            SectionAsm::Prog(p) => p.resolve_symbols(),
            SectionAsm::Data(_) => Ok(()),
            SectionAsm::Maps(m) => {
                m.resolve_symbols();
                Ok(())
            }
            SectionAsm::Btf(b) => b.resolve_symbols(),
        }
    }

    /// The section bytes; valid after `resolve_symbols`
    pub fn binary(&self) -> Vec<u8> {
        match self {
            SectionAsm::Prog(p) => p.binary(),
            SectionAsm::Data(d) => d.binary(),
            SectionAsm::Maps(m) => m.binary(),
            SectionAsm::Btf(b) => b.binary(),
        }
    }

    /// ELF section flags for this kind
    pub fn elf_flags(&self) -> u64 {
        match self {
            SectionAsm::Prog(_) => section_flags("AX"),
            _ => section_flags("WA"),
        }
    }

    /// Defined symbols with byte offsets, in definition order
    pub fn symbols(&self) -> Vec<(String, u64)> {
        match self {
            SectionAsm::Prog(p) => p.symbols(),
            SectionAsm::Data(d) => d.symbols(),
            SectionAsm::Maps(m) => m.symbols(),
            SectionAsm::Btf(_) => Vec::new(),
        }
    }

    /// Remaining external relocations, by instruction index
    pub fn relocs(&self) -> Vec<(usize, String)> {
        match self {
            SectionAsm::Prog(p) => p.relocs(),
            _ => Vec::new(),
        }
    }
}

/// The top-level assembler
#[derive(Debug)]
pub struct Assembler {
    equates: Equates,
    sections: Vec<(String, SectionAsm)>,
    current: Option<usize>,
    pending: Option<SecKind>,
    cont: String,
    no_pin: bool,
}

impl Assembler {
    /// Create an assembler. With `no_pin`, maps are emitted in the shorter
    /// unpinned record form.
    pub fn new(no_pin: bool) -> Assembler {
        Assembler {
            equates: Equates::new(),
            sections: Vec::new(),
            current: None,
            pending: None,
            cont: String::new(),
            no_pin,
        }
    }

    /// The sections in definition order
    pub fn sections(&self) -> &[(String, SectionAsm)] {
        &self.sections
    }

    /// The equate table
    pub fn equates(&self) -> &Equates {
        &self.equates
    }

    /// Feed one physical source line
    pub fn feed_line(&mut self, raw: &str) -> Result<()> {
        let mut line = std::mem::take(&mut self.cont);
        line.push_str(raw.trim_end_matches('\n'));
        // A trailing backslash joins the next physical line, even inside a
        // comment.
        if let Some(stripped) = line.strip_suffix('\\') {
            self.cont = stripped.to_string();
            return Ok(());
        }
        let line = match line.split_once(';') {
            Some((before, _)) => before,
            None => line.as_str(),
        };
        let line = line.trim();
        if let Some(rest) = line.strip_prefix('.') {
            return self.directive(rest);
        }
        if line.is_empty() {
            return Ok(());
        }
        let idx = self
            .current
            .ok_or_else(|| Error::NotInSection(line.to_string()))?;
        let Assembler {
            sections, equates, ..
        } = self;
        sections[idx].1.feed_line(line, equates)
    }

    fn directive(&mut self, text: &str) -> Result<()> {
        let (name, rest) = lexer::split_op_args(text);
        let args = lexer::split_args(rest);
        match name {
            "text" => {
                self.pending = Some(SecKind::Text);
                self.current = None;
                Ok(())
            }
            "data" => {
                self.pending = Some(SecKind::Data);
                self.current = None;
                Ok(())
            }
            "section" => self.do_section(&args),
            "include" => self.do_include(&args),
            "equ" => self.do_equ(&args),
            _ => Err(Error::NoSuchDirective(name.to_string())),
        }
    }

    fn do_section(&mut self, args: &[String]) -> Result<()> {
        if args.len() != 1 {
            return Err(Error::arity(".section", "1 arg", args));
        }
        let name = &args[0];
        // Reserved names select their assembler regardless of the pending
        // .text/.data mode.
        let new = match name.as_str() {
            "maps" => SectionAsm::Maps(MapsAssembler::new(self.no_pin)),
            ".BTF" => SectionAsm::Btf(BtfAssembler::new()),
            _ => match self.pending {
                Some(SecKind::Text) => SectionAsm::Prog(ProgAssembler::new()),
                Some(SecKind::Data) => SectionAsm::Data(DataAssembler::new()),
                None => return Err(Error::NoSectionKind),
            },
        };
        if let Some(idx) = self.sections.iter().position(|(n, _)| n == name) {
            let old = &self.sections[idx].1;
            if std::mem::discriminant(old) != std::mem::discriminant(&new) {
                return Err(Error::SectionRedefined {
                    name: name.clone(),
                    new: new.kind_name(),
                    old: old.kind_name(),
                });
            }
            // resume the existing section, discarding the fresh assembler
            self.current = Some(idx);
            return Ok(());
        }
        let asm = new;
        debug!(section = %name, kind = asm.kind_name(), "opening section");
        self.sections.push((name.clone(), asm));
        self.current = Some(self.sections.len() - 1);
        Ok(())
    }

    fn do_include(&mut self, args: &[String]) -> Result<()> {
        if args.len() != 1 {
            return Err(Error::arity(".include", "1 arg", args));
        }
        let path = &args[0];
        let text = std::fs::read_to_string(path).map_err(|e| Error::IncludeFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        for line in text.lines() {
            self.feed_line(line)?;
        }
        Ok(())
    }

    fn do_equ(&mut self, args: &[String]) -> Result<()> {
        if args.len() != 2 {
            return Err(Error::arity(".equ", "2 args", args));
        }
        let name = &args[0];
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::BadEquName(name.clone()));
        }
        let value = parse_immediate(&args[1], &self.equates)?;
        self.equates.insert(name.clone(), value);
        Ok(())
    }

    /// Finalize every section: resolve labels, patch pseudo-calls, lay out
    /// maps and serialize BTF.
    pub fn resolve_symbols(&mut self) -> Result<()> {
        for (name, sec) in &mut self.sections {
            debug!(section = %name, "resolving symbols");
            sec.resolve_symbols()?;
        }
        Ok(())
    }
}
