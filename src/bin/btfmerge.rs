//! BTF merge driver: parse each argument as a `.BTF`-section source file,
//! merge the type graphs and print the unified type vector.

use anyhow::Context;
use clap::Parser;
use ebas::{BtfAssembler, BtfMerger, Equates};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "btfmerge", version, about = "BTF type graph merger")]
struct Args {
    /// BTF source files, merged in order
    #[arg(required = true)]
    sources: Vec<PathBuf>,
}

/// Feed a BTF source file through the same line conventions the assembler
/// uses: continuations, `;` comments and blank lines.
fn parse_btf_source(text: &str) -> ebas::Result<BtfAssembler> {
    let equates = Equates::new();
    let mut asm = BtfAssembler::new();
    let mut cont = String::new();
    for raw in text.lines() {
        let mut line = std::mem::take(&mut cont);
        line.push_str(raw);
        if let Some(stripped) = line.strip_suffix('\\') {
            cont = stripped.to_string();
            continue;
        }
        let line = match line.split_once(';') {
            Some((before, _)) => before,
            None => line.as_str(),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        asm.feed_line(line, &equates)?;
    }
    Ok(asm)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut merger = BtfMerger::new();
    for src in &args.sources {
        let text = std::fs::read_to_string(src)
            .with_context(|| format!("reading {}", src.display()))?;
        let asm = parse_btf_source(&text)
            .with_context(|| format!("parsing {}", src.display()))?;
        merger
            .merge(&asm.types())
            .with_context(|| format!("merging {}", src.display()))?;
    }
    for (i, (name, ty)) in merger.types()?.iter().enumerate() {
        match name {
            Some(n) => println!("{}: [{}] {:?}", i, n, ty),
            None => println!("{}: (anon) {:?}", i, ty),
        }
    }
    Ok(())
}
