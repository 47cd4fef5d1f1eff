//! Device discovery and boot-option resolution engine for a kexec-based
//! bootloader selector.
//!
//! This crate is the core engine, components A-K: a single-threaded
//! event loop (`waitset`) drives a udev-backed
//! discovery driver (`discover`) which mounts candidate devices, runs them
//! through a priority-ordered `parser` chain, and publishes the resulting
//! `model::BootOption`s to any connected UI over the `ipc` wire protocol.
//! `resource` and `registry` together implement lazy, re-resolvable
//! references to kernel/initrd/dtb files; `platform` abstracts the
//! NVRAM/EFI-variable backend used to persist the user's boot choice.

pub mod discover;
pub mod error;
pub mod event;
pub mod ipc;
pub mod model;
pub mod parser;
pub mod platform;
pub mod process;
pub mod registry;
pub mod resource;
pub mod url;
pub mod waitset;

pub use error::{Error, Result};
