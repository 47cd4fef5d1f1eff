//! CLI argument definition for `petitboot-event`, split out of `main.rs` so
//! `xtask`'s man-page generation can build the same `clap::Command` without
//! linking the binary.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "petitboot-event", about = "udev RUN+= helper for petitboot-discover")]
pub struct Args {
    /// add|remove|fake. Normally supplied by udev as `ACTION`, but also
    /// accepted positionally for manual/test invocation.
    pub action: Option<String>,

    /// Path to the daemon's user-action socket.
    #[arg(long, default_value = "/var/tmp/petitboot-user-event")]
    pub socket: PathBuf,
}
