//! # ebas - an eBPF assembler, linker and BTF merger
//!
//! A toolchain for the eBPF target: an assembler translating a
//! line-oriented, Intel-syntax mnemonic language into relocatable 64-bit
//! little-endian ELF objects (machine type 0xF7), a linker combining such
//! objects into a final relocated object, and a BTF section merger that
//! unifies the type graphs of several objects into one minimal equivalent
//! type graph.
//!
//! ## Assembling
//!
//! ```
//! use ebas::{generate_object, Assembler};
//!
//! # fn main() -> ebas::Result<()> {
//! let source = "\
//! .text
//! .section prog
//!     ld r0, 0
//!     exit
//! ";
//! let mut asm = Assembler::new(false);
//! for line in source.lines() {
//!     asm.feed_line(line)?;
//! }
//! asm.resolve_symbols()?;
//! let object = generate_object(&asm)?;
//! let bytes = object.write();
//! assert_eq!(&bytes[0..4], b"\x7fELF");
//! # Ok(())
//! # }
//! ```
//!
//! ## Linking
//!
//! ```no_run
//! use ebas::linker::{link, LinkOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let inputs: Vec<Vec<u8>> = vec![
//!     std::fs::read("one.o")?,
//!     std::fs::read("two.o")?,
//! ];
//! let out = link(&LinkOptions::default(), &inputs)?;
//! std::fs::write("a.out", out)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! source lines → Assembler → sections → resolve_symbols → ElfFile
//! objects      → linker     → concatenated progbits + patched calls
//! type vectors → BtfMerger  → minimal annotated graph → type vector
//! ```
//!
//! The merger treats BTF as an annotated directed graph: nodes carry a
//! kind-dependent annotation stripped of references, edges carry the
//! references, and absorbing a graph finds the minimal supergraph that
//! embeds it, cycles included.

/// Version of the toolchain
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod asm;
pub mod elf;
pub mod error;
pub mod lexer;
pub mod linker;
pub mod merge;

pub use asm::{Assembler, BtfAssembler, BtfType, DataAssembler, Insn, MapsAssembler,
    ProgAssembler, SectionAsm};
pub use elf::object::generate_object;
pub use elf::{ElfFile, ElfHeader, Reloc, Section, SectionBody, StringTable, Symbol};
pub use error::{Error, Result};
pub use lexer::{Direct, Equates, JumpTarget, Operand, Size};
pub use merge::{Adg, BtfMerger};
