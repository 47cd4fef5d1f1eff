//! See https://github.com/matklad/cargo-xtask
//! This is kind of like "Justfile but in Rust".

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::CommandFactory;
use fn_error_context::context;

fn main() {
    if let Err(e) = try_main() {
        eprintln!("error: {e:?}");
        std::process::exit(1);
    }
}

const TASKS: &[(&str, fn() -> Result<()>)] = &[("manpages", manpages)];

fn try_main() -> Result<()> {
    let task = std::env::args().nth(1);
    match task.as_deref() {
        Some(name) => match TASKS.iter().find(|(n, _)| *n == name) {
            Some((_, f)) => f(),
            None => {
                print_help();
                anyhow::bail!("unknown task '{name}'")
            }
        },
        None => {
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    eprintln!("Tasks:");
    for (name, _) in TASKS {
        eprintln!("  - {name}");
    }
}

/// Render a man page for both binaries straight from their `clap::Command`,
/// so help text and the man page can never drift apart.
#[context("Generating man pages")]
fn manpages() -> Result<()> {
    let dir = Utf8Path::new("target/man");
    std::fs::create_dir_all(dir).with_context(|| format!("creating {dir}"))?;
    render_one(dir, petitboot_discover::Args::command())?;
    render_one(dir, petitboot_event::Args::command())?;
    Ok(())
}

fn render_one(dir: &Utf8Path, cmd: clap::Command) -> Result<()> {
    let name = cmd.get_name().to_string();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    let path = dir.join(format!("{name}.1"));
    std::fs::write(&path, buf).with_context(|| format!("writing {path}"))?;
    println!("Generated: {path}");
    Ok(())
}
