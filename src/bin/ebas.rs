//! Assembler driver: assemble one or more source files into a relocatable
//! eBPF object.

use anyhow::Context;
use clap::Parser;
use ebas::{generate_object, Assembler};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ebas", version, about = "eBPF assembler")]
struct Args {
    /// Output object path
    #[arg(short = 'o', long = "output", default_value = "a.out")]
    output: PathBuf,

    /// Emit the shorter 20-byte map records instead of the pinned form
    #[arg(long = "no-pin-maps")]
    no_pin_maps: bool,

    /// Source files, assembled in order into one object
    #[arg(required = true)]
    sources: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut asm = Assembler::new(args.no_pin_maps);
    for src in &args.sources {
        let text = std::fs::read_to_string(src)
            .with_context(|| format!("reading {}", src.display()))?;
        for line in text.lines() {
            asm.feed_line(line)
                .with_context(|| format!("assembling {}", src.display()))?;
        }
    }
    asm.resolve_symbols()?;
    let object = generate_object(&asm)?;
    std::fs::write(&args.output, object.write())
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}
