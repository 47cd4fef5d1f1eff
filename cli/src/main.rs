#![forbid(unused_must_use)]
#![deny(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;

use petitboot_core::discover::{DiscoverDriver, UserCommandChannel};
use petitboot_core::ipc::IpcServer;
use petitboot_core::parser::ParserChain;
use petitboot_core::platform;
use petitboot_core::process::Supervisor;
use petitboot_core::registry::Registry;
use petitboot_core::waitset::Waitset;
use petitboot_discover::{Args, PlatformArg, DEFAULT_EFI_GUID};

fn main() {
    petitboot_utils::initialize_tracing();
    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let _ = (args.verbose, args.quiet); // filtering is driven by RUST_LOG; these stack on top of it elsewhere

    std::fs::create_dir_all(&args.mount_base)
        .with_context(|| format!("creating mount base {}", args.mount_base.display()))?;

    let backend = match args.platform {
        Some(PlatformArg::Nvram) => {
            Box::new(platform::NvramBackend::new()) as Box<dyn platform::PlatformBackend>
        }
        Some(PlatformArg::Efi) => Box::new(platform::EfiVarBackend::new(DEFAULT_EFI_GUID)),
        Some(PlatformArg::Test) => Box::new(platform::TestBackend::new()),
        None => platform::probe_default(DEFAULT_EFI_GUID),
    };
    tracing::debug!(backend = ?backend, "platform backend selected");
    match backend.get_sysinfo() {
        Ok(sysinfo) => tracing::info!(platform = %sysinfo.platform_name, "platform sysinfo"),
        Err(e) => tracing::warn!(error = %e, "failed to read platform sysinfo"),
    }

    let mut waitset = Waitset::new();
    let supervisor = Supervisor::install(&mut waitset).context("installing SIGCHLD handler")?;

    let registry = Rc::new(RefCell::new(Registry::new()));
    let ipc = Rc::new(
        IpcServer::bind(&args.ipc_socket, &mut waitset, registry.clone())
            .with_context(|| format!("binding IPC socket {}", args.ipc_socket.display()))?,
    );

    let driver = Rc::new(DiscoverDriver::new(
        registry.clone(),
        ParserChain::default_chain(),
        ipc.clone(),
        args.mount_base.clone(),
    ));
    driver.init(&mut waitset, &supervisor).context("initializing discovery driver")?;

    let event_driver = driver.clone();
    let _user_channel = UserCommandChannel::bind(&args.user_event_socket, &mut waitset, move |event| {
        event_driver.handle_user_event(event);
    })
    .with_context(|| format!("binding user-action socket {}", args.user_event_socket.display()))?;

    tracing::info!("petitboot-discover ready");

    install_signal_handlers().context("installing SIGINT/SIGTERM handler")?;
    waitset.run(|| STOP_REQUESTED.load(Ordering::Relaxed)).context("event loop")?;

    tracing::info!("shutting down");
    Ok(())
}

static STOP_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn request_stop(_: i32) {
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

/// Flip `STOP_REQUESTED`. Deliberately installed *without* `SA_RESTART`:
/// the waitset's `poll()` call blocks with an infinite timeout whenever no
/// timer is pending, and `poll()` is one of the restartable syscalls per
/// signal(7) since Linux 3.17 — with `SA_RESTART` set the kernel would
/// transparently restart it and the flag would never be noticed until some
/// unrelated fd became ready. Leaving it off makes the signal interrupt
/// `poll()` with `EINTR`, which [`Waitset::run_once`] treats as "nothing
/// ready" so `run`'s `should_stop` check runs immediately.
#[allow(unsafe_code)]
fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{self, SigHandler, Signal};

    unsafe {
        signal::sigaction(
            Signal::SIGINT,
            &signal::SigAction::new(SigHandler::Handler(request_stop), signal::SaFlags::empty(), signal::SigSet::empty()),
        )?;
        signal::sigaction(
            Signal::SIGTERM,
            &signal::SigAction::new(SigHandler::Handler(request_stop), signal::SaFlags::empty(), signal::SigSet::empty()),
        )?;
    }
    Ok(())
}
