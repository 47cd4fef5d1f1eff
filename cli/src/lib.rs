//! CLI argument definitions for the `petitboot-discover` daemon, split out
//! of `main.rs` so `xtask`'s man-page generation can build the same
//! `clap::Command` without linking the whole binary.

use std::path::PathBuf;

use clap::Parser;

/// The PowerPC OPAL `device-tree` GUID petitboot has historically used for
/// its EFI-variable namespace; kept as the default so an EFI install picks
/// up variables a previous run already wrote.
pub const DEFAULT_EFI_GUID: &str = "1b17e946-bc3b-4d4f-ad94-a8e0f25b7bf8";

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum PlatformArg {
    Nvram,
    Efi,
    Test,
}

#[derive(Debug, Parser)]
#[command(name = "petitboot-discover", about = "Device discovery and boot-option resolution daemon")]
pub struct Args {
    /// Path to the IPC broadcast socket the UI connects to.
    #[arg(long, default_value = "/var/tmp/petitboot-dev")]
    pub ipc_socket: PathBuf,

    /// Path to the user-action socket fed by `petitboot-event`.
    #[arg(long, default_value = "/var/tmp/petitboot-user-event")]
    pub user_event_socket: PathBuf,

    /// Base directory under which each device gets its own mount-point
    /// subdirectory.
    #[arg(long, default_value = "/var/tmp/petitboot")]
    pub mount_base: PathBuf,

    /// Platform storage backend. Defaults to probing for EFI variables,
    /// falling back to NVRAM, then a no-op backend.
    #[arg(long, value_enum)]
    pub platform: Option<PlatformArg>,

    /// Increase logging verbosity (stacks).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease logging verbosity (stacks).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}
