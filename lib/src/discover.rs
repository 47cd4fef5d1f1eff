//! Discovery driver (spec §4.I): the udev-backed event loop that turns
//! `add`/`remove`/`change` device events into mounted, parsed, published
//! `Device`s, plus the CD-ROM tray state machine and the separate
//! user-action channel carrying commands (boot selection, resync) back
//! from the UI and from the `petitboot-event` helper.
//!
//! Grounded in `discover/udev.c` (enumeration, monitor, block-device
//! classification) and `discover/cdrom.c` (tray ioctls). The original's
//! single `pb_udev` struct owning both the libudev context and the
//! `device_handler` becomes [`DiscoverDriver`] here, holding an owned
//! `udev::Enumerator`/`udev::MonitorSocket` pair instead of raw
//! `libudev` pointers.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use rustix::event::PollFlags;

use crate::error::{Error, Result};
use crate::event::{Action as EventAction, Event, Source as EventSource};
use crate::ipc::{Frame, IpcServer};
use crate::model::{Classification, Device};
use crate::parser::{self, DiscoverContext, ParseResult, ParserChain, PxeEvent};
use crate::process::{Supervisor, Task};
use crate::registry::{DeviceHandle, Registry};
use crate::url::PbUrl;
use crate::waitset::Waitset;

pub mod cdrom;

use cdrom::TrayState;

/// Filesystem types discovery never attempts to mount, matching
/// `udev_handle_block_add`'s `ignored_types`.
const IGNORED_FS_TYPES: &[&str] = &["linux_raid_member", "swap"];

/// Device-mapper devices skipped unless they carry `DM_LV_NAME` (i.e. are
/// LVM logical volumes rather than e.g. multipath or crypt targets).
fn is_non_lvm_dm_device(dm_name: Option<&str>, dm_lv_name: Option<&str>) -> bool {
    dm_name.is_some() && dm_lv_name.is_none()
}

/// Outcome of classifying one `block` subsystem udev device, mirroring the
/// early-return ladder in `udev_handle_block_add`.
enum Classification1 {
    Skip,
    Ramdisk,
    LvmRescan,
    Accept(PendingDevice),
}

struct PendingDevice {
    id: String,
    uuid: Option<String>,
    label: Option<String>,
    devnode: String,
    classification: Classification,
    properties: std::collections::BTreeMap<String, String>,
    is_cdrom: bool,
}

fn classify_block_device(
    sysname: &str,
    devtype: Option<&str>,
    devpath: Option<&str>,
    devnode: Option<&str>,
    properties: &std::collections::BTreeMap<String, String>,
    lookup_by_uuid: impl Fn(&str) -> bool,
) -> Classification1 {
    let Some(devtype) = devtype else {
        return Classification1::Skip;
    };
    if devtype != "disk" && devtype != "partition" {
        tracing::debug!(device = sysname, devtype, "skip: not disk/partition");
        return Classification1::Skip;
    }

    if let Some(path) = devpath {
        if path.contains("virtual/block/loop") {
            tracing::debug!(device = sysname, "skip: loop device");
            return Classification1::Skip;
        }
        if path.contains("virtual/block/ram") {
            return Classification1::Ramdisk;
        }
    }

    let is_cdrom = devnode.is_some() && properties.contains_key("ID_CDROM");

    let dm_name = properties.get("DM_NAME").map(String::as_str);
    let dm_lv_name = properties.get("DM_LV_NAME").map(String::as_str);
    if is_non_lvm_dm_device(dm_name, dm_lv_name) {
        tracing::debug!(device = sysname, dm_name, "skip: non-LVM dm device");
        return Classification1::Skip;
    }

    let Some(fs_type) = properties.get("ID_FS_TYPE").map(String::as_str) else {
        tracing::debug!(device = sysname, "skip: no ID_FS_TYPE");
        return Classification1::Skip;
    };
    if IGNORED_FS_TYPES.iter().any(|ignored| fs_type.starts_with(ignored)) {
        tracing::debug!(device = sysname, fs_type, "skip: ignored filesystem");
        return Classification1::Skip;
    }
    if fs_type.starts_with("LVM2_member") {
        return Classification1::LvmRescan;
    }

    let uuid = properties.get("ID_FS_UUID").cloned();
    if let Some(uuid) = &uuid {
        if lookup_by_uuid(uuid) {
            tracing::debug!(device = sysname, uuid, "skip: duplicate UUID (multipath)");
            return Classification1::Skip;
        }
    }

    let label = properties.get("ID_FS_LABEL").cloned();
    let id = dm_name.unwrap_or(sysname).to_string();

    // Prefer a `/dev/mapper/<lv-name>` devlink over the opaque `/dev/dm-N`
    // node for logical volumes, matching `udev_handle_block_add`'s DEVLINKS
    // scan.
    let mut node = devnode.map(str::to_string).unwrap_or_default();
    if dm_name.is_some() {
        if let Some(devlinks) = properties.get("DEVLINKS") {
            if let Some(mapper_link) = devlinks.split(' ').find(|l| l.starts_with("/dev/mapper/")) {
                node = mapper_link.to_string();
            }
        }
    }

    let usb = properties.contains_key("ID_USB_DRIVER");
    let classification = if is_cdrom {
        Classification::Optical
    } else if usb {
        Classification::Usb
    } else {
        Classification::Disk
    };

    Classification1::Accept(PendingDevice {
        id,
        uuid,
        label,
        devnode: node,
        classification,
        properties: properties.clone(),
        is_cdrom,
    })
}

/// Extracts a MAC from udev's `ID_NET_NAME_MAC` (format `enx<hexmac>`,
/// e.g. `enx001122334455`), matching `udev_check_interface_ready`'s manual
/// byte-pair parse.
fn parse_net_name_mac(value: &str) -> Option<[u8; 6]> {
    let hex = value.strip_prefix("enx")?;
    if hex.len() < 12 {
        return None;
    }
    let mut mac = [0u8; 6];
    for i in 0..6 {
        mac[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(mac)
}

/// Everything the daemon needs to turn udev activity into published boot
/// options: the device registry, the priority-ordered parser chain, the
/// IPC broadcaster, the subprocess supervisor (for `vgscan`/`vgchange`/
/// `mount`/`umount`), and the base directory under which each device gets
/// its own mount-point subdirectory.
pub struct DiscoverDriver {
    registry: Rc<RefCell<Registry>>,
    parsers: ParserChain,
    ipc: Rc<IpcServer>,
    mount_base: PathBuf,
    tray_states: RefCell<std::collections::HashMap<String, TrayState>>,
}

impl std::fmt::Debug for DiscoverDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoverDriver")
            .field("mount_base", &self.mount_base)
            .field("devices", &self.registry.borrow().len())
            .finish()
    }
}

impl DiscoverDriver {
    pub fn new(
        registry: Rc<RefCell<Registry>>,
        parsers: ParserChain,
        ipc: Rc<IpcServer>,
        mount_base: PathBuf,
    ) -> Self {
        Self {
            registry,
            parsers,
            ipc,
            mount_base,
            tray_states: Default::default(),
        }
    }

    /// Enumerate already-present block/net devices (`udev_enumerate`,
    /// matched on `block`/`net` with `is_initialized`) and register the
    /// udev netlink monitor on `waitset` (`udev_setup_monitor` +
    /// `waiter_register_io`).
    #[allow(unsafe_code)]
    pub fn init(self: &Rc<Self>, waitset: &mut Waitset, _supervisor: &Supervisor) -> Result<()> {
        let mut enumerator =
            udev::Enumerator::new().map_err(|e| Error::Fatal(format!("udev enumerate: {e}")))?;
        enumerator
            .match_subsystem("block")
            .map_err(|e| Error::Fatal(format!("udev match block: {e}")))?;
        enumerator
            .match_is_initialized()
            .map_err(|e| Error::Fatal(format!("udev match initialized: {e}")))?;
        let devices: Vec<udev::Device> = enumerator
            .scan_devices()
            .map_err(|e| Error::Fatal(format!("udev scan: {e}")))?
            .collect();
        for device in devices {
            self.handle_device_action(&device, "add");
        }

        // 128MiB receive buffer matches systemd's own default, since we may
        // not drain the monitor promptly while a mount/parse is in flight.
        const MONITOR_BUFSIZE: usize = 128 * 1024 * 1024;
        let mut builder =
            udev::MonitorBuilder::new().map_err(|e| Error::Fatal(format!("udev monitor: {e}")))?;
        builder = builder
            .match_subsystem("block")
            .map_err(|e| Error::Fatal(format!("udev monitor filter: {e}")))?;
        builder = builder
            .match_subsystem("net")
            .map_err(|e| Error::Fatal(format!("udev monitor filter: {e}")))?;
        let socket = builder
            .listen()
            .map_err(|e| Error::Fatal(format!("udev monitor listen: {e}")))?;
        {
            use std::os::fd::AsRawFd;
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(socket.as_raw_fd()) };
            let _ = nix::sys::socket::setsockopt(&borrowed, nix::sys::socket::sockopt::RcvBuf, &MONITOR_BUFSIZE);
        }

        // The waitset only needs a descriptor to poll; the real
        // `udev::MonitorSocket` (not `Clone`) is moved into the callback
        // itself so it can be drained directly once readable.
        let poll_fd = {
            use std::os::fd::AsRawFd;
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(socket.as_raw_fd()) };
            borrowed.try_clone_to_owned().map_err(Error::Io)?
        };

        let driver = self.clone();
        waitset.register_io(poll_fd, PollFlags::IN, move |_revents| {
            loop {
                let event = match socket.iter().next() {
                    Some(event) => event,
                    None => break,
                };
                let action = match event.event_type() {
                    udev::EventType::Add => "add",
                    udev::EventType::Remove => "remove",
                    udev::EventType::Change => "change",
                    _ => continue,
                };
                driver.handle_device_action(&event.device(), action);
            }
            false
        });
        Ok(())
    }

    /// Handle one udev device action (`add`, `remove`, `change`),
    /// matching `udev_handle_dev_action`.
    fn handle_device_action(self: &Rc<Self>, dev: &udev::Device, action: &str) {
        let Some(sysname) = dev.sysname().to_str() else { return };
        let Some(subsystem) = dev.subsystem().and_then(|s| s.to_str()) else { return };

        if subsystem == "net" {
            self.handle_net_change(dev, sysname);
            return;
        }
        if subsystem != "block" {
            tracing::debug!(device = sysname, subsystem, "skip: unknown subsystem");
            return;
        }

        match action {
            "add" => self.handle_block_add(dev, sysname),
            "remove" => self.remove_device(sysname),
            "change" => self.handle_block_change(dev, sysname),
            _ => {}
        }
    }

    fn handle_net_change(&self, dev: &udev::Device, sysname: &str) {
        let ifindex = dev.property_value("IFINDEX").and_then(|v| v.to_str());
        let interface = dev.property_value("INTERFACE").and_then(|v| v.to_str());
        let mac_name = dev.property_value("ID_NET_NAME_MAC").and_then(|v| v.to_str());
        let (Some(_ifindex), Some(_interface), Some(mac_name)) = (ifindex, interface, mac_name) else {
            tracing::debug!(device = sysname, "net interface missing properties, not ready");
            return;
        };
        if parse_net_name_mac(mac_name).is_none() {
            tracing::debug!(device = sysname, mac_name, "unexpected MAC format");
        }
    }

    fn properties_of(dev: &udev::Device) -> std::collections::BTreeMap<String, String> {
        dev.properties()
            .filter_map(|p| Some((p.name().to_str()?.to_string(), p.value().to_str()?.to_string())))
            .collect()
    }

    fn handle_block_add(self: &Rc<Self>, dev: &udev::Device, sysname: &str) {
        if self.registry.borrow().lookup_by_id(sysname).is_some() {
            return;
        }
        let devtype = dev.devtype().and_then(|v| v.to_str());
        let devpath = dev.syspath().to_str();
        let devnode = dev.devnode().and_then(|p| p.to_str());
        let properties = Self::properties_of(dev);

        if devnode.is_some() && properties.contains_key("ID_CDROM") {
            cdrom::init(devnode.unwrap());
            if !cdrom::media_present(devnode.unwrap()) {
                tracing::info!(device = sysname, "skip: no media present");
                return;
            }
        }

        let registry = self.registry.clone();
        let classified = classify_block_device(
            sysname,
            devtype,
            devpath,
            devnode,
            &properties,
            move |uuid| registry.borrow().lookup_by_uuid(uuid).is_some(),
        );

        match classified {
            Classification1::Skip => {}
            Classification1::Ramdisk => {
                tracing::debug!(device = sysname, "ramdisk device, ignored");
            }
            Classification1::LvmRescan => {
                tracing::info!("LVM2 member seen, rescanning volume groups");
                let _ = Task::run_simple("vgscan -qq", "vgscan", ["-qq"]);
                let _ = Task::run_simple("vgchange -ay -qq", "vgchange", ["-ay", "-qq"]);
            }
            Classification1::Accept(pending) => self.add_and_discover(pending),
        }
    }

    fn handle_block_change(self: &Rc<Self>, dev: &udev::Device, sysname: &str) {
        let has_eject_request = dev.property_value("DISK_EJECT_REQUEST").is_some();
        let has_media_change = dev.property_value("DISK_MEDIA_CHANGE").is_some();
        let devnode = dev.devnode().and_then(|p| p.to_str());
        let is_cdrom = dev.property_value("ID_CDROM").is_some();

        if is_cdrom && (has_eject_request || has_media_change) {
            let was_mounted = self
                .registry
                .borrow()
                .lookup_by_id(sysname)
                .is_some_and(|d| d.borrow().mount_point.is_some());

            if has_eject_request {
                tracing::debug!(device = sysname, "eject request");
                self.tray_states.borrow_mut().insert(sysname.to_string(), TrayState::Open);
                if was_mounted {
                    self.remove_device(sysname);
                }
                if let Some(node) = devnode {
                    if was_mounted {
                        cdrom::eject(node);
                    }
                }
                return;
            }

            if has_media_change {
                let state = devnode.map(cdrom::drive_status).unwrap_or(TrayState::NoDisc);
                self.tray_states.borrow_mut().insert(sysname.to_string(), state);
                if state == TrayState::Closed {
                    self.handle_block_add(dev, sysname);
                } else {
                    self.remove_device(sysname);
                }
                return;
            }
        }

        if self.registry.borrow().lookup_by_id(sysname).is_none() {
            self.handle_block_add(dev, sysname);
        }
    }

    fn add_and_discover(self: &Rc<Self>, pending: PendingDevice) {
        let mut device = Device::new(pending.id.clone(), pending.classification);
        device.uuid = pending.uuid;
        device.label = pending.label;
        device.properties = pending.properties;
        device.icon = Some(default_icon_for(pending.classification));

        let handle: DeviceHandle = Rc::new(std::cell::RefCell::new(device));
        if self.registry.borrow_mut().add(handle.clone()) == crate::registry::RegistryEvent::DuplicateSkipped {
            return;
        }

        let device_id = pending.id.clone();
        self.ipc_broadcast_device(&handle);

        if pending.is_cdrom {
            self.tray_states.borrow_mut().insert(device_id.clone(), TrayState::initial());
        }

        if pending.devnode.is_empty() {
            return;
        }
        match self.mount_device(&device_id, &pending.devnode) {
            Ok(mount_point) => {
                handle.borrow_mut().mount_point = Some(mount_point);
                self.run_parse(&handle);
            }
            Err(e) => {
                tracing::warn!(device = %device_id, error = %e, "mount failed, discovery skipped");
            }
        }
    }

    fn mount_device(&self, device_id: &str, devnode: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.mount_base).map_err(Error::Io)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{device_id}-"))
            .tempdir_in(&self.mount_base)
            .map_err(Error::Io)?;
        let path = dir.keep();
        Task::run_simple("mount", "mount", ["-o", "ro", devnode, path.to_string_lossy().as_ref()])?;
        Ok(path)
    }

    fn unmount_device(&self, mount_point: &std::path::Path) {
        let _ = Task::run_simple("umount", "umount", [mount_point.to_string_lossy().as_ref()]);
        let _ = std::fs::remove_dir(mount_point);
    }

    fn run_parse(self: &Rc<Self>, handle: &DeviceHandle) {
        let ctx = DiscoverContext::new(handle.clone());
        let result = parser::run_default_chain(&self.parsers, ctx, &self.registry.borrow());
        match result {
            Ok((ParseResult::Found(n), published)) => {
                tracing::debug!(published, found = n, "parser produced options");
                self.ipc_broadcast_options(handle);
            }
            Ok((ParseResult::ApplicableButEmpty, _)) => {
                tracing::debug!("parser matched but produced no options");
            }
            Ok((ParseResult::NotApplicable, _)) => {
                tracing::debug!("no parser claimed this device");
            }
            Err(e) => {
                tracing::warn!(error = %e, "parse chain failed");
            }
        }
        let reresolved = self.registry.borrow().reresolve_all();
        for other in reresolved {
            self.ipc_broadcast_options(&other);
        }
    }

    fn remove_device(&self, device_id: &str) {
        let Some(handle) = self.registry.borrow().lookup_by_id(device_id) else { return };
        let mount_point = handle.borrow().mount_point.clone();
        if self.registry.borrow_mut().remove(device_id) == crate::registry::RegistryEvent::Removed {
            let device = handle.borrow();
            for (index, option) in device.options().iter().enumerate() {
                if !option.is_published() {
                    continue;
                }
                let option_id = format!("{device_id}/{index}");
                let _ = self.ipc.broadcast(&Frame::remove_option(&option_id));
            }
            drop(device);
            let _ = self.ipc.broadcast(&Frame::remove_device(device_id));
            self.registry.borrow().revert_targeting(device_id);
        }
        if let Some(mount_point) = mount_point {
            self.unmount_device(&mount_point);
        }
        self.tray_states.borrow_mut().remove(device_id);
    }

    fn ipc_broadcast_device(&self, handle: &DeviceHandle) {
        let frame = Frame::add_device(&handle.borrow());
        let _ = self.ipc.broadcast(&frame);
    }

    fn ipc_broadcast_options(&self, handle: &DeviceHandle) {
        let device = handle.borrow();
        for (index, option) in device.options().iter().enumerate() {
            if !option.is_publishable() || option.is_published() {
                continue;
            }
            let option_id = format!("{}/{index}", device.id);
            let _ = self.ipc.broadcast(&Frame::add_option(&option_id, option));
            option.mark_published();
        }
    }

    /// Handle one user-originated [`Event`] from the user-action channel:
    /// boot selection, a manual resync, a simulated add/remove (used by
    /// `petitboot-event --fake` and tests without real hardware), or a PXE
    /// network-boot event driven from a URL supplied in a user event rather
    /// than a mounted device.
    pub fn handle_user_event(self: &Rc<Self>, event: Event) {
        match event.action {
            EventAction::Boot => {
                tracing::info!(device = %event.device, "boot requested");
            }
            EventAction::Sync => {
                tracing::info!("resync requested");
            }
            EventAction::Add | EventAction::Remove => {
                tracing::debug!(action = event.action.as_str(), device = %event.device, "simulated udev event");
            }
            EventAction::Url => self.handle_pxe_event(&event),
            EventAction::Dhcp | EventAction::Plugin => {
                tracing::debug!(
                    action = event.action.as_str(),
                    "network configuration/plugin events are handled by an external collaborator"
                );
            }
        }
        let _ = event.source;
    }

    /// Resolve a PXE config per §4.H's precedence, publishing any resulting
    /// `BootOption`s under a synthetic per-interface `Device` (created on
    /// first use, reused on a later re-DHCP of the same interface).
    fn handle_pxe_event(self: &Rc<Self>, event: &Event) {
        let Some(base) = pxe_base_url(event) else {
            tracing::warn!(device = %event.device, "pxe event has no resolvable base URL, ignored");
            return;
        };
        let pxe_event = PxeEvent {
            pxeconffile: event.get("pxeconffile").map(str::to_string),
            bootfile_url: event.get("bootfile_url").map(str::to_string),
            pxepathprefix: event.get("pxepathprefix").map(str::to_string),
            mac: event.get("mac").map(str::to_string),
            ip: event.get("ip").map(str::to_string),
        };

        let device_id = format!("pxe-{}", event.device);
        let handle = match self.registry.borrow().lookup_by_id(&device_id) {
            Some(handle) => handle,
            None => {
                let mut device = Device::new(device_id.clone(), Classification::Network);
                device.name = Some(event.device.clone());
                device.icon = Some(default_icon_for(Classification::Network));
                let handle: DeviceHandle = Rc::new(std::cell::RefCell::new(device));
                self.registry.borrow_mut().add(handle.clone());
                self.ipc_broadcast_device(&handle);
                handle
            }
        };

        let ctx = DiscoverContext::for_pxe(handle.clone(), pxe_event, base);
        let result = parser::run_pxe(ctx, &self.registry.borrow());
        match result {
            Ok((ParseResult::Found(n), published)) => {
                tracing::debug!(device = %device_id, found = n, published, "pxe parser produced options");
                self.ipc_broadcast_options(&handle);
            }
            Ok((ParseResult::ApplicableButEmpty, _)) => {
                tracing::debug!(device = %device_id, "pxe event fetched no usable config");
            }
            Ok((ParseResult::NotApplicable, _)) => {
                tracing::debug!(device = %device_id, "pxe event missing network_event/source_url");
            }
            Err(e) => {
                tracing::warn!(device = %device_id, error = %e, "pxe parse failed");
            }
        }
        let reresolved = self.registry.borrow().reresolve_all();
        for other in reresolved {
            self.ipc_broadcast_options(&other);
        }
    }
}

/// The base URL `candidate_urls` joins relative candidates against: an
/// explicit `next_server` parameter (as a DHCP server would supply),
/// falling back to whichever of `pxeconffile`/`bootfile_url` parses as an
/// absolute URL.
fn pxe_base_url(event: &Event) -> Option<PbUrl> {
    if let Some(explicit) = event.get("next_server") {
        if let Ok(url) = PbUrl::parse(explicit) {
            return Some(url);
        }
    }
    for key in ["pxeconffile", "bootfile_url"] {
        if let Some(value) = event.get(key) {
            if let Ok(url) = PbUrl::parse(value) {
                return Some(url);
            }
        }
    }
    None
}

fn default_icon_for(classification: Classification) -> String {
    match classification {
        Classification::Disk => "hdd.png".to_string(),
        Classification::Usb => "usbpen.png".to_string(),
        Classification::Optical => "cdrom.png".to_string(),
        Classification::Network => "network.png".to_string(),
        Classification::Unknown => "unknown.png".to_string(),
    }
}

/// Binds the user-action channel: a `SOCK_DGRAM` Unix socket distinct from
/// the IPC broadcast socket, since each sender (the UI, or the
/// short-lived `petitboot-event` helper invoked from a udev `RUN+=` rule)
/// writes exactly one ad-header message and is done — no persistent
/// connection or read-side framing is needed, unlike [`crate::ipc`]'s
/// stream protocol.
pub struct UserCommandChannel {
    socket_path: PathBuf,
}

impl std::fmt::Debug for UserCommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCommandChannel").field("socket_path", &self.socket_path).finish()
    }
}

impl UserCommandChannel {
    #[allow(unsafe_code)]
    pub fn bind(
        path: impl AsRef<std::path::Path>,
        waitset: &mut Waitset,
        mut on_event: impl FnMut(Event) + 'static,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path).map_err(Error::Io)?;
        }
        let socket = std::os::unix::net::UnixDatagram::bind(&path)
            .map_err(|e| Error::Fatal(format!("bind {}: {e}", path.display())))?;
        socket.set_nonblocking(true).map_err(Error::Io)?;

        let fd: std::os::fd::OwnedFd = socket.into();
        waitset.register_io(fd, PollFlags::IN, move |_revents| {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(std::os::fd::AsRawFd::as_raw_fd(&fd)) };
            let mut buf = [0u8; 8192];
            loop {
                match nix::sys::socket::recv(
                    std::os::fd::AsRawFd::as_raw_fd(&borrowed),
                    &mut buf,
                    nix::sys::socket::MsgFlags::empty(),
                ) {
                    Ok(0) => break,
                    Ok(n) => match Event::parse_ad_message(EventSource::User, &buf[..n]) {
                        Ok(event) => on_event(event),
                        Err(e) => tracing::warn!(error = %e, "malformed user-action message, dropped"),
                    },
                    Err(nix::errno::Errno::EAGAIN) => break,
                    Err(_) => break,
                }
            }
            false
        });

        Ok(Self { socket_path: path })
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }
}

impl Drop for UserCommandChannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn skips_non_disk_devtype() {
        let props = BTreeMap::new();
        let result = classify_block_device("sda", Some("disk"), None, Some("/dev/sda"), &props, |_| false);
        assert!(matches!(result, Classification1::Accept(_)));
        let result = classify_block_device("sda", Some("other"), None, Some("/dev/sda"), &props, |_| false);
        assert!(matches!(result, Classification1::Skip));
    }

    #[test]
    fn skips_loop_devices() {
        let props = BTreeMap::new();
        let result = classify_block_device(
            "loop0",
            Some("disk"),
            Some("/devices/virtual/block/loop0"),
            Some("/dev/loop0"),
            &props,
            |_| false,
        );
        assert!(matches!(result, Classification1::Skip));
    }

    #[test]
    fn ramdisk_path_is_flagged_separately() {
        let props = BTreeMap::new();
        let result = classify_block_device(
            "ram0",
            Some("disk"),
            Some("/devices/virtual/block/ram0"),
            Some("/dev/ram0"),
            &props,
            |_| false,
        );
        assert!(matches!(result, Classification1::Ramdisk));
    }

    #[test]
    fn lvm_member_triggers_rescan_not_accept() {
        let mut props = BTreeMap::new();
        props.insert("ID_FS_TYPE".to_string(), "LVM2_member".to_string());
        let result = classify_block_device("sda1", Some("partition"), None, Some("/dev/sda1"), &props, |_| false);
        assert!(matches!(result, Classification1::LvmRescan));
    }

    #[test]
    fn duplicate_uuid_is_skipped_before_accept() {
        let mut props = BTreeMap::new();
        props.insert("ID_FS_TYPE".to_string(), "ext4".to_string());
        props.insert("ID_FS_UUID".to_string(), "abcd".to_string());
        let result =
            classify_block_device("sda1", Some("partition"), None, Some("/dev/sda1"), &props, |uuid| uuid == "abcd");
        assert!(matches!(result, Classification1::Skip));
    }

    #[test]
    fn non_lvm_dm_device_without_lv_name_is_skipped() {
        let mut props = BTreeMap::new();
        props.insert("DM_NAME".to_string(), "mpatha".to_string());
        props.insert("ID_FS_TYPE".to_string(), "ext4".to_string());
        let result = classify_block_device("dm-0", Some("disk"), None, Some("/dev/dm-0"), &props, |_| false);
        assert!(matches!(result, Classification1::Skip));
    }

    #[test]
    fn dm_device_with_lv_name_prefers_mapper_devlink() {
        let mut props = BTreeMap::new();
        props.insert("DM_NAME".to_string(), "vg0-lv0".to_string());
        props.insert("DM_LV_NAME".to_string(), "lv0".to_string());
        props.insert("ID_FS_TYPE".to_string(), "ext4".to_string());
        props.insert("DEVLINKS".to_string(), "/dev/dm-0 /dev/mapper/vg0-lv0".to_string());
        let result = classify_block_device("dm-0", Some("disk"), None, Some("/dev/dm-0"), &props, |_| false);
        match result {
            Classification1::Accept(pending) => {
                assert_eq!(pending.id, "vg0-lv0");
                assert_eq!(pending.devnode, "/dev/mapper/vg0-lv0");
            }
            _ => panic!("expected Accept"),
        }
    }

    #[test]
    fn ignored_fs_type_is_skipped() {
        let mut props = BTreeMap::new();
        props.insert("ID_FS_TYPE".to_string(), "swap".to_string());
        let result = classify_block_device("sda2", Some("partition"), None, Some("/dev/sda2"), &props, |_| false);
        assert!(matches!(result, Classification1::Skip));
    }

    #[test]
    fn pxe_base_url_prefers_next_server_then_pxeconffile() {
        let mut event = Event::new(crate::event::Source::User, EventAction::Url, "eth0");
        event.set("pxeconffile", "tftp://10.0.0.1/dir/conf.text");
        assert_eq!(pxe_base_url(&event).unwrap().to_string(), "tftp://10.0.0.1/dir/conf.text");

        event.set("next_server", "tftp://10.0.0.9/other/");
        assert_eq!(pxe_base_url(&event).unwrap().to_string(), "tftp://10.0.0.9/other/");
    }

    #[test]
    fn pxe_base_url_none_without_any_url_param() {
        let event = Event::new(crate::event::Source::User, EventAction::Url, "eth0");
        assert!(pxe_base_url(&event).is_none());
    }

    #[test]
    fn parses_id_net_name_mac_format() {
        let mac = parse_net_name_mac("enx001122334455").unwrap();
        assert_eq!(mac, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn rejects_malformed_net_name_mac() {
        assert!(parse_net_name_mac("not-a-mac").is_none());
    }
}
