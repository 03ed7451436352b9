//! The linker
//!
//! Reads several relocatable eBPF objects, concatenates same-named progbits
//! sections, merges their symbols, applies pseudo-call relocations and
//! writes a single output object. Unresolved relocations are fatal unless
//! `allow_undef` is set, in which case they are deferred to the output with
//! an undefined symbol each.

use crate::elf::{
    sh_type, ElfFile, ElfHeader, Reloc, Section, SectionBody, SectionHeader, StringTable, Symbol,
    EHDR_LEN, EM_BPF, ET_REL, REL_LEN, SYM_LEN,
};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Opcode byte of a call instruction (JMP | CALL)
const CALL_OPCODE: u8 = 0x85;
/// Regs byte of a pseudo-call (src register nibble 1)
const PSEUDO_CALL_REGS: u8 = 0x10;

/// Linker options
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    /// Tolerate unresolved relocations, deferring them to the output
    pub allow_undef: bool,
}

/// A relocation bound to its definition
struct Applied {
    reloc: Reloc,
    applying_off: u64,
    sym: Symbol,
    def_off: u64,
}

/// Link the given object files into one output object
pub fn link(opts: &LinkOptions, inputs: &[Vec<u8>]) -> Result<Vec<u8>> {
    let files = inputs
        .iter()
        .map(|b| ElfFile::read(b))
        .collect::<Result<Vec<_>>>()?;
    for f in &files {
        if f.header.machine != EM_BPF {
            return Err(Error::BadMachineType);
        }
    }

    // Output string table: the union of every input strtab, the empty
    // string first, plus our own section names.
    let mut names = BTreeSet::new();
    for f in &files {
        for s in &f.sections {
            if let SectionBody::Strings(t) = &s.body {
                for string in t.strings() {
                    if !string.is_empty() {
                        names.insert(string.clone());
                    }
                }
            }
        }
    }
    let mut strings = StringTable::new();
    for n in &names {
        strings.add(n);
    }
    strings.add(".strtab");
    strings.add(".symtab");

    // Assign every input progbits section an offset in the per-name
    // concatenated output buffer, in input order.
    let mut prog_order: Vec<String> = Vec::new();
    let mut prog_len: HashMap<String, u64> = HashMap::new();
    let mut prog_flags: HashMap<String, u64> = HashMap::new();
    let mut place: HashMap<(usize, usize), u64> = HashMap::new();
    for (fi, f) in files.iter().enumerate() {
        for (si, s) in f.sections.iter().enumerate() {
            if s.shdr.sh_type != sh_type::PROGBITS {
                continue;
            }
            if !prog_len.contains_key(&s.name) {
                prog_order.push(s.name.clone());
            }
            let off = *prog_len.get(&s.name).unwrap_or(&0);
            place.insert((fi, si), off);
            prog_len.insert(s.name.clone(), off + s.body.write().len() as u64);
            if let Some(&flags) = prog_flags.get(&s.name) {
                if flags != s.shdr.sh_flags {
                    return Err(Error::MixedProgbitsFlags(s.name.clone()));
                }
            } else {
                prog_flags.insert(s.name.clone(), s.shdr.sh_flags);
            }
            debug!(section = %s.name, input = fi, offset = off, "placed progbits");
        }
    }

    // Defined symbols, keyed by the name of the section defining them.
    type SymMap = BTreeMap<String, (Symbol, u64)>;
    let mut isym: BTreeMap<String, SymMap> = BTreeMap::new();
    for (fi, f) in files.iter().enumerate() {
        for s in &f.sections {
            let syms = match &s.body {
                SectionBody::Symbols(syms) => syms,
                _ => continue,
            };
            for sym in syms {
                if sym.st_shndx == 0 {
                    continue;
                }
                let def_sec = f
                    .sections
                    .get(sym.st_shndx as usize)
                    .ok_or(Error::TruncatedElf)?;
                let off = match place.get(&(fi, sym.st_shndx as usize)) {
                    Some(&off) => off,
                    None => {
                        warn!(symbol = %sym.name, section = %def_sec.name,
                              "symbol defined outside any progbits section, dropped");
                        continue;
                    }
                };
                isym.entry(def_sec.name.clone())
                    .or_default()
                    .insert(sym.name.clone(), (sym.clone(), off));
            }
        }
    }

    // Relocations, grouped by the progbits section they apply to.
    let mut irel: BTreeMap<String, Vec<(Reloc, u64)>> = BTreeMap::new();
    let mut relnames: BTreeMap<String, String> = BTreeMap::new();
    for (fi, f) in files.iter().enumerate() {
        for s in &f.sections {
            let rels = match &s.body {
                SectionBody::Relocs(rels) => rels,
                _ => continue,
            };
            let target_idx = s.shdr.sh_info as usize;
            let target = f.sections.get(target_idx).ok_or(Error::TruncatedElf)?;
            let applying_off = *place
                .get(&(fi, target_idx))
                .ok_or_else(|| Error::internal("relocation applies to a non-progbits section".to_string()))?;
            relnames
                .entry(target.name.clone())
                .or_insert_with(|| s.name.clone());
            for r in rels {
                irel.entry(target.name.clone())
                    .or_default()
                    .push((r.clone(), applying_off));
            }
        }
    }

    // Bind each relocation to a same-section definition, or defer it.
    let mut arel: BTreeMap<String, Vec<Applied>> = BTreeMap::new();
    let mut orel: BTreeMap<String, Vec<(Reloc, u64)>> = BTreeMap::new();
    for (pn, list) in &irel {
        let defined = isym.get(pn);
        for (reloc, applying_off) in list {
            match defined.and_then(|m| m.get(&reloc.sym.name)) {
                Some((sym, def_off)) => arel.entry(pn.clone()).or_default().push(Applied {
                    reloc: reloc.clone(),
                    applying_off: *applying_off,
                    sym: sym.clone(),
                    def_off: *def_off,
                }),
                None => {
                    if !opts.allow_undef {
                        return Err(Error::UnresolvedReloc {
                            sym: reloc.sym.name.clone(),
                            section: pn.clone(),
                        });
                    }
                    orel.entry(pn.clone())
                        .or_default()
                        .push((reloc.clone(), *applying_off));
                }
            }
        }
    }

    // Output section indices: progbits from 3, rel sections after.
    let pi: HashMap<&str, u16> = prog_order
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), 3 + i as u16))
        .collect();

    // Output symbol table: every surviving definition, relocated, then one
    // undefined entry per deferred relocation.
    let mut osym: Vec<Symbol> = Vec::new();
    for (pn, st) in &isym {
        let shndx = match pi.get(pn.as_str()) {
            Some(&i) => i,
            None => continue,
        };
        for (sn, (sym, off)) in st {
            osym.push(Symbol {
                st_name: strings.offset(sn)?,
                st_info: sym.st_info,
                st_other: sym.st_other,
                st_shndx: shndx,
                st_value: sym.st_value + off,
                st_size: sym.st_size,
                name: sn.clone(),
            });
        }
    }
    for list in orel.values() {
        for (reloc, _) in list {
            osym.push(Symbol {
                st_name: strings.offset(&reloc.sym.name)?,
                st_info: reloc.sym.st_info,
                st_other: reloc.sym.st_other,
                st_shndx: 0, // UND
                st_value: 0,
                st_size: reloc.sym.st_size,
                name: reloc.sym.name.clone(),
            });
        }
    }

    // Concatenate progbits bytes into the output buffers.
    let mut buffers: HashMap<String, Vec<u8>> = prog_len
        .iter()
        .map(|(n, &len)| (n.clone(), vec![0u8; len as usize]))
        .collect();
    for ((fi, si), &off) in &place {
        let s = &files[*fi].sections[*si];
        let bytes = s.body.write();
        let buf = buffers
            .get_mut(&s.name)
            .ok_or_else(|| Error::internal("missing output buffer".to_string()))?;
        buf[off as usize..off as usize + bytes.len()].copy_from_slice(&bytes);
    }

    // Apply relocations. This is the part where we actually "link".
    for (pn, entries) in &arel {
        let buf = buffers
            .get_mut(pn)
            .ok_or_else(|| Error::internal("missing output buffer".to_string()))?;
        for a in entries {
            let off = (a.reloc.r_offset + a.applying_off) as usize;
            if off + 8 > buf.len() {
                return Err(Error::TruncatedElf);
            }
            if buf[off] != CALL_OPCODE {
                // JMP|CALL is the only relocation site we know how to patch
                return Err(Error::RelocNonCall);
            }
            if buf[off + 1] != PSEUDO_CALL_REGS {
                return Err(Error::RelocNonPseudoCall);
            }
            let dest = a.sym.st_value + a.def_off;
            let imm = ((dest as i64 - off as i64) / 8 - 1) as i32;
            buf[off + 4..off + 8].copy_from_slice(&imm.to_le_bytes());
            debug!(section = %pn, offset = off, symbol = %a.sym.name, imm, "patched pseudo-call");
        }
    }

    // Assemble the output file: null, .strtab, .symtab, progbits, rel.
    let mut sections = Vec::with_capacity(3 + prog_order.len() + orel.len());
    sections.push(Section {
        name: String::new(),
        shdr: SectionHeader::default(),
        body: SectionBody::Raw(Vec::new()),
    });
    sections.push(Section {
        name: ".strtab".to_string(),
        shdr: SectionHeader {
            sh_name: strings.offset(".strtab")?,
            sh_type: sh_type::STRTAB,
            sh_addralign: 8,
            ..Default::default()
        },
        body: SectionBody::Strings(strings.clone()),
    });
    sections.push(Section {
        name: ".symtab".to_string(),
        shdr: SectionHeader {
            sh_name: strings.offset(".symtab")?,
            sh_type: sh_type::SYMTAB,
            sh_flags: 3,
            sh_link: 1,
            sh_addralign: 8,
            sh_entsize: SYM_LEN as u64,
            ..Default::default()
        },
        body: SectionBody::Symbols(osym.clone()),
    });
    for name in &prog_order {
        sections.push(Section {
            name: name.clone(),
            shdr: SectionHeader {
                sh_name: strings.offset(name)?,
                sh_type: sh_type::PROGBITS,
                sh_flags: prog_flags[name],
                sh_addralign: 8,
                ..Default::default()
            },
            body: SectionBody::Raw(buffers.remove(name).unwrap_or_default()),
        });
    }
    for (pn, list) in &orel {
        let mut relocs = Vec::with_capacity(list.len());
        for (reloc, applying_off) in list {
            let r_sym = osym
                .iter()
                .position(|s| s.name == reloc.sym.name)
                .ok_or_else(|| Error::internal("deferred symbol missing from symtab".to_string()))?;
            relocs.push(Reloc {
                r_offset: reloc.r_offset + applying_off,
                r_type: reloc.r_type,
                r_sym: r_sym as u32,
                sym: Symbol::default(),
            });
        }
        let rel_name = relnames
            .get(pn)
            .cloned()
            .unwrap_or_else(|| format!(".rel{}", pn));
        sections.push(Section {
            name: rel_name.clone(),
            shdr: SectionHeader {
                sh_name: strings.offset(&rel_name)?,
                sh_type: sh_type::REL,
                sh_link: 2,
                sh_info: pi[pn.as_str()] as u32,
                sh_addralign: 8,
                sh_entsize: REL_LEN as u64,
                ..Default::default()
            },
            body: SectionBody::Relocs(relocs),
        });
    }

    let mut out = ElfFile {
        header: ElfHeader {
            e_type: ET_REL,
            machine: EM_BPF,
            version: 1,
            shoff: EHDR_LEN as u64,
            shstrndx: 1,
            ..Default::default()
        },
        sections,
    };
    out.layout_shtbl_first();
    Ok(out.write())
}
