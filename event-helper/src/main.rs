//! `petitboot-event`: the short-lived helper a udev `RUN+=` rule (or a
//! `fake`-mode test invocation) execs to hand one discovery event to the
//! running daemon over its user-action socket. Reads its input entirely
//! from the environment udev provides, per the env-var contract the
//! daemon's wire format already defines in `petitboot_core::event`.

use std::collections::BTreeMap;
use std::os::unix::net::UnixDatagram;

use anyhow::{bail, Context, Result};
use clap::Parser;

use petitboot_core::event::{Action, Event, Source};
use petitboot_event::Args;

const ENV_PARAMS: &[&str] = &[
    "ID_BUS",
    "ID_CDROM",
    "ID_FS_TYPE",
    "ID_FS_UUID",
    "ID_FS_LABEL",
    "DM_NAME",
    "DM_LV_NAME",
    "IFINDEX",
    "INTERFACE",
    "ID_NET_NAME_MAC",
];

fn main() {
    if let Err(e) = run() {
        eprintln!("petitboot-event: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let action = args
        .action
        .clone()
        .or_else(|| std::env::var("ACTION").ok())
        .context("missing environment: ACTION not set and no action given")?;

    let socket = UnixDatagram::unbound().context("creating datagram socket")?;

    if action.eq_ignore_ascii_case("fake") {
        for event in fake_events() {
            send(&socket, &args.socket, &event)?;
        }
        return Ok(());
    }

    let event = build_event(&action)?;
    send(&socket, &args.socket, &event)
}

/// Build the real event from `ACTION` plus whichever env vars udev set.
/// `DEVNAME` names a block device; `INTERFACE` a network one. One of the
/// two must be present.
fn build_event(action: &str) -> Result<Event> {
    let action = match action.to_ascii_lowercase().as_str() {
        "add" => Action::Add,
        "remove" => Action::Remove,
        other => bail!("invalid action '{other}'"),
    };

    let device = std::env::var("DEVNAME")
        .ok()
        .or_else(|| std::env::var("INTERFACE").ok())
        .context("missing environment: neither DEVNAME nor INTERFACE set")?;

    let mut event = Event::new(Source::User, action, device);
    for name in ENV_PARAMS {
        if let Ok(value) = std::env::var(name) {
            event.set(*name, value);
        }
    }
    Ok(event)
}

/// Demo devices for exercising the UI without real hardware. The original
/// helper's `fake` mode pushed a full device/option payload directly onto
/// the wire; our user-action channel only ever carries a trigger (action +
/// device + params), so `fake` instead emits synthetic `add` events the
/// discovery driver treats the same as a simulated udev add.
fn fake_events() -> Vec<Event> {
    let mut devices = Vec::new();
    for (id, label) in [("fakeBoot0", "Bloobuntu Linux"), ("fakeBoot1", "Pendora Gore 6")] {
        let mut event = Event::new(Source::User, Action::Add, id);
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        params.insert("ID_FS_LABEL".to_string(), label.to_string());
        for (k, v) in params {
            event.set(k, v);
        }
        devices.push(event);
    }
    devices
}

fn send(socket: &UnixDatagram, target: &std::path::Path, event: &Event) -> Result<()> {
    let bytes = event.encode_ad_message();
    socket
        .send_to(&bytes, target)
        .with_context(|| format!("sending to {}", target.display()))?;
    Ok(())
}
