#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use ctn_harness::fixture::{MkimageOptions, inspect, write_image};
use std::env;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("mkimage") => {
            let Some(path) = args.get(1) else {
                bail!("mkimage requires an output path");
            };
            let opts = MkimageOptions::parse(&args[2..])?;
            let report = write_image(Path::new(path), &opts)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("inspect") => {
            let Some(path) = args.get(1) else {
                bail!("inspect requires an image path");
            };
            let report = inspect(Path::new(path))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn print_usage() {
    println!("ctn-harness\n");
    println!("USAGE:");
    println!(
        "  ctn-harness mkimage <path> [--local] [--stack NAME] [--slots N] [--dirty-journal SLOT]..."
    );
    println!("                            [--inline-files N] [--inline-dirs N] [--no-inline-data]");
    println!("  ctn-harness inspect <path>");
}
