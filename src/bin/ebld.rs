//! Linker driver: combine relocatable eBPF objects into one output object.

use anyhow::Context;
use clap::Parser;
use ebas::linker::{link, LinkOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ebld", version, about = "eBPF object linker")]
struct Args {
    /// Output object path
    #[arg(short = 'o', long = "output", default_value = "a.out")]
    output: PathBuf,

    /// Tolerate unresolved relocations, deferring them to the output
    #[arg(short = 'c', long = "allow-undef")]
    allow_undef: bool,

    /// Input object files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut inputs = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        inputs.push(
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        );
    }
    let opts = LinkOptions {
        allow_undef: args.allow_undef,
    };
    let out = link(&opts, &inputs)?;
    std::fs::write(&args.output, out)
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}
