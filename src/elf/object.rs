//! Assembler-side object generation
//!
//! Packs the resolved sections of an [`Assembler`] into a relocatable
//! object with the fixed layout: null, `.strtab` (doubling as the section
//! name table), `.symtab`, one progbits per source section, then one rel
//! section per progbits that still carries external references.

use crate::asm::{Assembler, SectionAsm};
use crate::elf::{
    sh_type, ElfFile, ElfHeader, Reloc, Section, SectionBody, SectionHeader, StringTable, Symbol,
    EM_BPF, ET_REL, REL_LEN, R_BPF_64_64, SYM_LEN,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

/// Local untyped symbol
const STB_LOCAL: u8 = 0;
/// Global untyped symbol
const STB_GLOBAL: u8 = 16;

/// Generate the output object for a fully resolved assembler
pub fn generate_object(asm: &Assembler) -> Result<ElfFile> {
    let sections = asm.sections();

    // Progbits indices start at 3; rel sections follow all progbits.
    let mut prog_idx: HashMap<&str, u16> = HashMap::new();
    for (i, (name, _)) in sections.iter().enumerate() {
        prog_idx.entry(name.as_str()).or_insert(3 + i as u16);
    }
    let rel_secs: Vec<&str> = sections
        .iter()
        .filter(|(_, sec)| !sec.relocs().is_empty())
        .map(|(name, _)| name.as_str())
        .collect();

    // String table: section names first, then every symbol.
    let mut strings = StringTable::new();
    strings.add(".strtab");
    strings.add(".symtab");
    for (name, _) in sections {
        strings.add(name);
    }
    for name in &rel_secs {
        strings.add(&format!(".rel{}", name));
    }
    for (_, sec) in sections {
        for (sym, _) in sec.symbols() {
            strings.add(&sym);
        }
    }

    // Symbol table: the null symbol, program labels as locals, then
    // data/maps symbols as globals.
    let mut symbols = vec![Symbol::default()];
    let mut sym_index: HashMap<String, u32> = HashMap::new();
    let mut add_symbol = |symbols: &mut Vec<Symbol>,
                          sym_index: &mut HashMap<String, u32>,
                          name: &str,
                          info: u8,
                          shndx: u16,
                          value: u64|
     -> Result<()> {
        sym_index.insert(name.to_string(), symbols.len() as u32);
        symbols.push(Symbol {
            st_name: strings.offset(name)?,
            st_info: info,
            st_other: 0,
            st_shndx: shndx,
            st_value: value,
            st_size: 0,
            name: name.to_string(),
        });
        Ok(())
    };
    for (name, sec) in sections {
        if !matches!(sec, SectionAsm::Prog(_)) {
            continue;
        }
        let shndx = prog_idx[name.as_str()];
        for (sym, value) in sec.symbols() {
            add_symbol(&mut symbols, &mut sym_index, &sym, STB_LOCAL, shndx, value)?;
        }
    }
    let locals = symbols.len() as u32;
    for (name, sec) in sections {
        if matches!(sec, SectionAsm::Prog(_)) {
            continue;
        }
        let shndx = prog_idx[name.as_str()];
        for (sym, value) in sec.symbols() {
            add_symbol(&mut symbols, &mut sym_index, &sym, STB_GLOBAL, shndx, value)?;
        }
    }

    // Relocation bodies: one record per surviving external reference.
    let mut rel_bodies: HashMap<&str, Vec<Reloc>> = HashMap::new();
    for (name, sec) in sections {
        let refs = sec.relocs();
        if refs.is_empty() {
            continue;
        }
        let mut relocs = Vec::with_capacity(refs.len());
        for (index, sym) in refs {
            let r_sym = *sym_index
                .get(&sym)
                .ok_or_else(|| Error::UndefinedSymbol(sym.clone()))?;
            relocs.push(Reloc {
                r_offset: (index as u64) * 8,
                r_type: R_BPF_64_64,
                r_sym,
                sym: Symbol::default(),
            });
        }
        debug!(section = %name, count = relocs.len(), "emitting relocations");
        rel_bodies.insert(name.as_str(), relocs);
    }

    let symtab_idx = 2u32;
    let mut out = Vec::with_capacity(3 + sections.len() + rel_secs.len());
    out.push(Section {
        name: String::new(),
        shdr: SectionHeader {
            sh_addralign: 8,
            ..Default::default()
        },
        body: SectionBody::Raw(Vec::new()),
    });
    out.push(Section {
        name: ".strtab".to_string(),
        shdr: SectionHeader {
            sh_name: strings.offset(".strtab")?,
            sh_type: sh_type::STRTAB,
            sh_addralign: 8,
            ..Default::default()
        },
        body: SectionBody::Strings(strings.clone()),
    });
    out.push(Section {
        name: ".symtab".to_string(),
        shdr: SectionHeader {
            sh_name: strings.offset(".symtab")?,
            sh_type: sh_type::SYMTAB,
            sh_link: 1,
            sh_info: locals,
            sh_addralign: 8,
            sh_entsize: SYM_LEN as u64,
            ..Default::default()
        },
        body: SectionBody::Symbols(symbols),
    });
    for (name, sec) in sections {
        out.push(Section {
            name: name.clone(),
            shdr: SectionHeader {
                sh_name: strings.offset(name)?,
                sh_type: sh_type::PROGBITS,
                sh_flags: sec.elf_flags(),
                sh_addralign: 8,
                ..Default::default()
            },
            body: SectionBody::Raw(sec.binary()),
        });
    }
    for name in &rel_secs {
        let rel_name = format!(".rel{}", name);
        out.push(Section {
            name: rel_name.clone(),
            shdr: SectionHeader {
                sh_name: strings.offset(&rel_name)?,
                sh_type: sh_type::REL,
                sh_link: symtab_idx,
                sh_info: prog_idx[*name] as u32,
                sh_addralign: 8,
                sh_entsize: REL_LEN as u64,
                ..Default::default()
            },
            body: SectionBody::Relocs(rel_bodies.remove(*name).unwrap_or_default()),
        });
    }

    let mut file = ElfFile {
        header: ElfHeader {
            e_type: ET_REL,
            machine: EM_BPF,
            version: 1,
            shstrndx: 1,
            ..Default::default()
        },
        sections: out,
    };
    file.layout_sections_first();
    Ok(file)
}
