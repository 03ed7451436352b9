//! Typed ELF object model
//!
//! Restricted to 64-bit little-endian relocatable objects for the eBPF
//! machine. Section bodies are typed by `sh_type`: raw bytes, NUL-separated
//! strings, 24-byte symbol records or 16-byte relocation records. The
//! reader materializes symbol names and relocation back-references; the
//! writer lays sections out 8-byte aligned with the header table either
//! before or after the bodies.

pub mod object;

use crate::error::{Error, Result};

/// ELF machine number for eBPF
pub const EM_BPF: u16 = 0xf7;
/// Relocatable object file type
pub const ET_REL: u16 = 1;
/// Size of the ELF header
pub const EHDR_LEN: usize = 64;
/// Size of one section header
pub const SHDR_LEN: usize = 64;
/// Size of one symbol record
pub const SYM_LEN: usize = 0x18;
/// Size of one relocation record
pub const REL_LEN: usize = 0x10;

/// Section header types
pub mod sh_type {
    /// Unused slot
    pub const NULL: u32 = 0;
    /// Program bytes
    pub const PROGBITS: u32 = 1;
    /// Symbol table
    pub const SYMTAB: u32 = 2;
    /// String table
    pub const STRTAB: u32 = 3;
    /// Relocations without addends
    pub const REL: u32 = 9;
}

/// The only relocation type produced or consumed: R_BPF_64_64, applied to
/// the low 32 bits of the wide immediate at `r_offset`.
pub const R_BPF_64_64: u32 = 1;

fn get(buf: &[u8], range: std::ops::Range<usize>) -> Result<&[u8]> {
    buf.get(range).ok_or(Error::TruncatedElf)
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(get(buf, off..off + 2)?.try_into().unwrap()))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(get(buf, off..off + 4)?.try_into().unwrap()))
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(get(buf, off..off + 8)?.try_into().unwrap()))
}

/// Pad to the next 8-byte boundary with NULs
fn align8(bytes: &mut Vec<u8>) {
    while bytes.len() % 8 != 0 {
        bytes.push(0);
    }
}

/// The fields of the fixed 64-byte ELF header that this toolchain uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfHeader {
    /// Object type; always `ET_REL`
    pub e_type: u16,
    /// Machine number; always `EM_BPF`
    pub machine: u16,
    /// ELF version
    pub version: u32,
    /// Entry point; unused, zero
    pub entry: u64,
    /// Program header offset; unused, zero
    pub phoff: u64,
    /// Section header table offset
    pub shoff: u64,
    /// Processor flags
    pub flags: u32,
    /// Section header count
    pub shnum: u16,
    /// Index of the section name string table
    pub shstrndx: u16,
}

impl ElfHeader {
    /// Serialize the 64-byte header
    pub fn write(&self) -> [u8; EHDR_LEN] {
        let mut out = [0u8; EHDR_LEN];
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&self.machine.to_le_bytes());
        out[20..24].copy_from_slice(&self.version.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&self.phoff.to_le_bytes());
        out[40..48].copy_from_slice(&self.shoff.to_le_bytes());
        out[48..52].copy_from_slice(&self.flags.to_le_bytes());
        out[52..54].copy_from_slice(&(EHDR_LEN as u16).to_le_bytes());
        // no program headers
        out[54..56].copy_from_slice(&0u16.to_le_bytes());
        out[56..58].copy_from_slice(&0u16.to_le_bytes());
        out[58..60].copy_from_slice(&(SHDR_LEN as u16).to_le_bytes());
        out[60..62].copy_from_slice(&self.shnum.to_le_bytes());
        out[62..64].copy_from_slice(&self.shstrndx.to_le_bytes());
        out
    }

    /// Parse a header, rejecting anything but 64-bit little-endian input
    pub fn read(buf: &[u8]) -> Result<ElfHeader> {
        if buf.len() < EHDR_LEN {
            return Err(Error::TruncatedElf);
        }
        if buf[4] != 2 {
            return Err(Error::Elf64Only);
        }
        if buf[5] != 1 {
            return Err(Error::ElfLittleEndianOnly);
        }
        Ok(ElfHeader {
            e_type: read_u16(buf, 16)?,
            machine: read_u16(buf, 18)?,
            version: read_u32(buf, 20)?,
            entry: read_u64(buf, 24)?,
            phoff: read_u64(buf, 32)?,
            shoff: read_u64(buf, 40)?,
            flags: read_u32(buf, 48)?,
            shnum: read_u16(buf, 60)?,
            shstrndx: read_u16(buf, 62)?,
        })
    }
}

/// One section header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionHeader {
    /// Name offset into the section name string table
    pub sh_name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags (W/A/X bits)
    pub sh_flags: u64,
    /// Load address; unused, zero
    pub sh_addr: u64,
    /// File offset of the body
    pub sh_offset: u64,
    /// Body length in bytes
    pub sh_size: u64,
    /// Type-specific linked section index
    pub sh_link: u32,
    /// Type-specific info (reloc target, or local symbol count)
    pub sh_info: u32,
    /// Alignment
    pub sh_addralign: u64,
    /// Fixed record size, for symtab and rel sections
    pub sh_entsize: u64,
}

impl SectionHeader {
    fn write(&self) -> [u8; SHDR_LEN] {
        let mut out = [0u8; SHDR_LEN];
        out[0..4].copy_from_slice(&self.sh_name.to_le_bytes());
        out[4..8].copy_from_slice(&self.sh_type.to_le_bytes());
        out[8..16].copy_from_slice(&self.sh_flags.to_le_bytes());
        out[16..24].copy_from_slice(&self.sh_addr.to_le_bytes());
        out[24..32].copy_from_slice(&self.sh_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.sh_size.to_le_bytes());
        out[40..44].copy_from_slice(&self.sh_link.to_le_bytes());
        out[44..48].copy_from_slice(&self.sh_info.to_le_bytes());
        out[48..56].copy_from_slice(&self.sh_addralign.to_le_bytes());
        out[56..64].copy_from_slice(&self.sh_entsize.to_le_bytes());
        out
    }

    fn read(buf: &[u8]) -> Result<SectionHeader> {
        if buf.len() < SHDR_LEN {
            return Err(Error::TruncatedElf);
        }
        Ok(SectionHeader {
            sh_name: read_u32(buf, 0)?,
            sh_type: read_u32(buf, 4)?,
            sh_flags: read_u64(buf, 8)?,
            sh_addr: read_u64(buf, 16)?,
            sh_offset: read_u64(buf, 24)?,
            sh_size: read_u64(buf, 32)?,
            sh_link: read_u32(buf, 40)?,
            sh_info: read_u32(buf, 44)?,
            sh_addralign: read_u64(buf, 48)?,
            sh_entsize: read_u64(buf, 56)?,
        })
    }
}

/// One symbol record, with its name materialized on read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Symbol {
    /// Name offset into the linked string table
    pub st_name: u32,
    /// Binding and type: 0 local untyped, 16 global untyped
    pub st_info: u8,
    /// Visibility; always zero
    pub st_other: u8,
    /// Defining section index, or 0 for undefined
    pub st_shndx: u16,
    /// Byte offset within the defining section
    pub st_value: u64,
    /// Object size; zero for labels
    pub st_size: u64,
    /// Materialized name
    pub name: String,
}

impl Symbol {
    fn write(&self) -> [u8; SYM_LEN] {
        let mut out = [0u8; SYM_LEN];
        out[0..4].copy_from_slice(&self.st_name.to_le_bytes());
        out[4] = self.st_info;
        out[5] = self.st_other;
        out[6..8].copy_from_slice(&self.st_shndx.to_le_bytes());
        out[8..16].copy_from_slice(&self.st_value.to_le_bytes());
        out[16..24].copy_from_slice(&self.st_size.to_le_bytes());
        out
    }

    fn read(buf: &[u8]) -> Result<Symbol> {
        if buf.len() < SYM_LEN {
            return Err(Error::TruncatedElf);
        }
        Ok(Symbol {
            st_name: read_u32(buf, 0)?,
            st_info: buf[4],
            st_other: buf[5],
            st_shndx: read_u16(buf, 6)?,
            st_value: read_u64(buf, 8)?,
            st_size: read_u64(buf, 16)?,
            name: String::new(),
        })
    }
}

/// One relocation record, with its symbol materialized on read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reloc {
    /// Byte offset the relocation applies to
    pub r_offset: u64,
    /// Relocation type; low dword of r_info
    pub r_type: u32,
    /// Symbol index; high dword of r_info
    pub r_sym: u32,
    /// Materialized copy of the referenced symbol
    pub sym: Symbol,
}

impl Reloc {
    fn write(&self) -> [u8; REL_LEN] {
        let mut out = [0u8; REL_LEN];
        out[0..8].copy_from_slice(&self.r_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.r_type.to_le_bytes());
        out[12..16].copy_from_slice(&self.r_sym.to_le_bytes());
        out
    }

    fn read(buf: &[u8]) -> Result<Reloc> {
        if buf.len() < REL_LEN {
            return Err(Error::TruncatedElf);
        }
        Ok(Reloc {
            r_offset: read_u64(buf, 0)?,
            r_type: read_u32(buf, 8)?,
            r_sym: read_u32(buf, 12)?,
            sym: Symbol::default(),
        })
    }
}

/// An ordered NUL-separated string table; the empty string is always first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringTable {
    strings: Vec<String>,
}

impl StringTable {
    /// Create a table holding only the empty string
    pub fn new() -> StringTable {
        StringTable {
            strings: vec![String::new()],
        }
    }

    /// The strings in table order
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Append a string unless already present
    pub fn add(&mut self, s: &str) {
        if !self.strings.iter().any(|t| t == s) {
            self.strings.push(s.to_string());
        }
    }

    /// Byte offset of a string in the serialized table
    pub fn offset(&self, s: &str) -> Result<u32> {
        let mut off = 0u32;
        for t in &self.strings {
            if t == s {
                return Ok(off);
            }
            off += t.len() as u32 + 1;
        }
        Err(Error::internal(format!("string {:?} not in table", s)))
    }

    /// The NUL-terminated string starting at a byte offset
    pub fn at_offset(&self, off: u32) -> String {
        let bytes = self.raw();
        let start = off as usize;
        if start >= bytes.len() {
            return String::new();
        }
        let end = bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[start..end]).into_owned()
    }

    fn raw(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for s in &self.strings {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        out
    }

    fn read(buf: &[u8]) -> StringTable {
        let mut strings: Vec<String> = buf
            .split(|&b| b == 0)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        // the trailing NUL yields one empty tail entry
        strings.pop();
        StringTable { strings }
    }
}

/// A typed section body
#[derive(Debug, Clone, PartialEq)]
pub enum SectionBody {
    /// Raw bytes (progbits and null sections)
    Raw(Vec<u8>),
    /// A string table
    Strings(StringTable),
    /// A symbol table
    Symbols(Vec<Symbol>),
    /// A relocation table
    Relocs(Vec<Reloc>),
}

impl SectionBody {
    /// Body length before alignment padding
    pub fn raw_len(&self) -> usize {
        match self {
            SectionBody::Raw(b) => b.len(),
            SectionBody::Strings(t) => t.strings.iter().map(|s| s.len() + 1).sum(),
            SectionBody::Symbols(syms) => syms.len() * SYM_LEN,
            SectionBody::Relocs(rels) => rels.len() * REL_LEN,
        }
    }

    /// Serialize, padded to an 8-byte multiple
    pub fn write(&self) -> Vec<u8> {
        let mut out = match self {
            SectionBody::Raw(b) => b.clone(),
            SectionBody::Strings(t) => t.raw(),
            SectionBody::Symbols(syms) => {
                let mut v = Vec::with_capacity(syms.len() * SYM_LEN);
                for s in syms {
                    v.extend_from_slice(&s.write());
                }
                v
            }
            SectionBody::Relocs(rels) => {
                let mut v = Vec::with_capacity(rels.len() * REL_LEN);
                for r in rels {
                    v.extend_from_slice(&r.write());
                }
                v
            }
        };
        align8(&mut out);
        out
    }
}

/// One section: name, header and typed body
#[derive(Debug, Clone)]
pub struct Section {
    /// Materialized section name
    pub name: String,
    /// The section header
    pub shdr: SectionHeader,
    /// The typed body
    pub body: SectionBody,
}

/// A whole object file
#[derive(Debug, Clone)]
pub struct ElfFile {
    /// The file header
    pub header: ElfHeader,
    /// Sections in table order
    pub sections: Vec<Section>,
}

impl ElfFile {
    /// Parse an object, materializing section names, symbol names and
    /// relocation symbol references.
    pub fn read(buf: &[u8]) -> Result<ElfFile> {
        let header = ElfHeader::read(buf)?;
        let mut sections = Vec::with_capacity(header.shnum as usize);
        for i in 0..header.shnum as usize {
            let off = header.shoff as usize + i * SHDR_LEN;
            let shdr = SectionHeader::read(get(buf, off..off + SHDR_LEN)?)?;
            let body_bytes = get(
                buf,
                shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize,
            )?;
            let body = match shdr.sh_type {
                sh_type::SYMTAB => {
                    let mut syms = Vec::new();
                    for chunk in body_bytes.chunks(SYM_LEN) {
                        syms.push(Symbol::read(chunk)?);
                    }
                    SectionBody::Symbols(syms)
                }
                sh_type::STRTAB => SectionBody::Strings(StringTable::read(body_bytes)),
                sh_type::REL => {
                    let mut rels = Vec::new();
                    for chunk in body_bytes.chunks(REL_LEN) {
                        rels.push(Reloc::read(chunk)?);
                    }
                    SectionBody::Relocs(rels)
                }
                _ => SectionBody::Raw(body_bytes.to_vec()),
            };
            sections.push(Section {
                name: String::new(),
                shdr,
                body,
            });
        }
        let mut file = ElfFile { header, sections };
        file.calc_section_names()?;
        file.calc_symbol_names()?;
        file.calc_reloc_symbols()?;
        Ok(file)
    }

    fn section_at(&self, index: usize) -> Result<&Section> {
        self.sections
            .get(index)
            .ok_or_else(|| Error::internal(format!("section index {} out of range", index)))
    }

    fn calc_section_names(&mut self) -> Result<()> {
        let shstr = match &self.section_at(self.header.shstrndx as usize)?.body {
            SectionBody::Strings(t) => t.clone(),
            _ => return Err(Error::ShstrtabNotStrtab),
        };
        for sec in &mut self.sections {
            sec.name = shstr.at_offset(sec.shdr.sh_name);
        }
        Ok(())
    }

    fn calc_symbol_names(&mut self) -> Result<()> {
        for i in 0..self.sections.len() {
            if !matches!(self.sections[i].body, SectionBody::Symbols(_)) {
                continue;
            }
            let link = self.sections[i].shdr.sh_link as usize;
            let strtab = match &self.section_at(link)?.body {
                SectionBody::Strings(t) => t.clone(),
                _ => return Err(Error::ShstrtabNotStrtab),
            };
            if let SectionBody::Symbols(syms) = &mut self.sections[i].body {
                for sym in syms {
                    sym.name = strtab.at_offset(sym.st_name);
                }
            }
        }
        Ok(())
    }

    fn calc_reloc_symbols(&mut self) -> Result<()> {
        for i in 0..self.sections.len() {
            if !matches!(self.sections[i].body, SectionBody::Relocs(_)) {
                continue;
            }
            let link = self.sections[i].shdr.sh_link as usize;
            let syms = match &self.section_at(link)?.body {
                SectionBody::Symbols(s) => s.clone(),
                _ => {
                    return Err(Error::internal(
                        "reloc section does not link a symtab".to_string(),
                    ))
                }
            };
            if let SectionBody::Relocs(rels) = &mut self.sections[i].body {
                for r in rels {
                    r.sym = syms
                        .get(r.r_sym as usize)
                        .cloned()
                        .ok_or(Error::TruncatedElf)?;
                }
            }
        }
        Ok(())
    }

    /// Place section bodies after the header table: `shoff` = 64, bodies
    /// from `64 + 64·shnum`, each 8-byte aligned. Used by the linker.
    pub fn layout_shtbl_first(&mut self) {
        self.header.shoff = EHDR_LEN as u64;
        self.header.shnum = self.sections.len() as u16;
        let mut off = (EHDR_LEN + SHDR_LEN * self.sections.len()) as u64;
        for sec in &mut self.sections {
            sec.shdr.sh_size = sec.body.raw_len() as u64;
            sec.shdr.sh_offset = off;
            off += sec.body.write().len() as u64;
        }
    }

    /// Place section bodies right after the ELF header with the header
    /// table at the end. Used by the assembler.
    pub fn layout_sections_first(&mut self) {
        self.header.shnum = self.sections.len() as u16;
        let mut off = EHDR_LEN as u64;
        for sec in &mut self.sections {
            sec.shdr.sh_size = sec.body.raw_len() as u64;
            sec.shdr.sh_offset = off;
            off += sec.body.write().len() as u64;
        }
        self.header.shoff = off;
    }

    /// Serialize the whole object. Offsets must have been laid out first.
    pub fn write(&self) -> Vec<u8> {
        let shtbl_end = self.header.shoff as usize + SHDR_LEN * self.sections.len();
        let body_end = self
            .sections
            .iter()
            .map(|s| s.shdr.sh_offset as usize + s.body.write().len())
            .max()
            .unwrap_or(0);
        let total = shtbl_end.max(body_end).max(EHDR_LEN);
        let mut out = vec![0u8; total];
        out[..EHDR_LEN].copy_from_slice(&self.header.write());
        for (i, sec) in self.sections.iter().enumerate() {
            let off = self.header.shoff as usize + i * SHDR_LEN;
            out[off..off + SHDR_LEN].copy_from_slice(&sec.shdr.write());
            let body = sec.body.write();
            let boff = sec.shdr.sh_offset as usize;
            out[boff..boff + body.len()].copy_from_slice(&body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table_offsets() {
        let mut t = StringTable::new();
        t.add(".strtab");
        t.add("f");
        t.add(".strtab"); // duplicate ignored
        assert_eq!(t.offset("").unwrap(), 0);
        assert_eq!(t.offset(".strtab").unwrap(), 1);
        assert_eq!(t.offset("f").unwrap(), 9);
        assert_eq!(t.at_offset(1), ".strtab");
        assert_eq!(t.at_offset(9), "f");
    }

    #[test]
    fn string_table_round_trip() {
        let mut t = StringTable::new();
        t.add("alpha");
        t.add("beta");
        let back = StringTable::read(&t.raw());
        assert_eq!(back, t);
    }

    #[test]
    fn header_round_trip() {
        let hdr = ElfHeader {
            e_type: ET_REL,
            machine: EM_BPF,
            version: 1,
            shoff: 64,
            shnum: 3,
            shstrndx: 1,
            ..Default::default()
        };
        let bytes = hdr.write();
        assert_eq!(ElfHeader::read(&bytes).unwrap(), hdr);
    }

    #[test]
    fn rejects_wrong_class_and_endianness() {
        let hdr = ElfHeader::default().write();
        let mut wrong_class = hdr;
        wrong_class[4] = 1;
        assert!(matches!(
            ElfHeader::read(&wrong_class),
            Err(Error::Elf64Only)
        ));
        let mut wrong_endian = hdr;
        wrong_endian[5] = 2;
        assert!(matches!(
            ElfHeader::read(&wrong_endian),
            Err(Error::ElfLittleEndianOnly)
        ));
    }
}
