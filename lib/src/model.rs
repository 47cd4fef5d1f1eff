//! Core entities: [`Device`] and [`BootOption`].
//!
//! Ownership follows ordinary Rust rules rather than the original's arena
//! allocator: a `Device` owns its `BootOption`s directly in a `Vec`, and
//! dropping the `Device` drops every option and the resources it holds.
//! Back-references from option to owning device use `Weak` so the cycle
//! never keeps a `Device` alive past its registry entry.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Disk,
    Usb,
    Optical,
    Network,
    Unknown,
}

/// A discovered device: a disk, partition, logical volume, or network
/// interface. Created on a udev `add` event, destroyed on `remove`.
#[derive(Debug)]
pub struct Device {
    pub id: String,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub classification: Classification,
    pub mount_point: Option<PathBuf>,
    pub properties: BTreeMap<String, String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    options: Vec<Rc<BootOption>>,
}

impl Device {
    pub fn new(id: impl Into<String>, classification: Classification) -> Self {
        Self {
            id: id.into(),
            uuid: None,
            label: None,
            classification,
            mount_point: None,
            properties: BTreeMap::new(),
            name: None,
            description: None,
            icon: None,
            options: Vec::new(),
        }
    }

    pub fn options(&self) -> &[Rc<BootOption>] {
        &self.options
    }

    /// Append an option and publish it (invariant 1: every BootOption
    /// belongs to exactly one Device).
    pub fn push_option(&mut self, option: Rc<BootOption>) {
        self.options.push(option);
    }

    /// True once the device has at least one option referencing `resource`
    /// that is still unresolved (used to decide whether an option may be
    /// published over IPC).
    pub fn has_unresolved_options(&self) -> bool {
        self.options.iter().any(|o| o.has_unresolved_resource())
    }

    pub fn set_info(&mut self, name: Option<String>, description: Option<String>, icon: Option<String>) {
        if let Some(name) = name {
            self.name = Some(name);
        }
        if let Some(description) = description {
            self.description = Some(description);
        }
        if let Some(icon) = icon {
            self.icon = Some(icon);
        }
    }
}

/// A single bootable entry discovered by a parser. Immutable once
/// constructed; resolution state lives in the [`Resource`]s it holds via
/// interior mutability (`RefCell`).
#[derive(Debug)]
pub struct BootOption {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub boot_image: Resource,
    pub initrd: Option<Resource>,
    pub dtb: Option<Resource>,
    pub args: Option<String>,
    pub is_default: bool,
    owner: Weak<std::cell::RefCell<Device>>,
    /// Set once this option has been broadcast over IPC, so a later
    /// re-resolution pass doesn't re-announce an option clients already
    /// have.
    published: Cell<bool>,
}

impl BootOption {
    pub fn new(name: impl Into<String>, boot_image: Resource) -> Self {
        Self {
            name: name.into(),
            description: None,
            icon: None,
            boot_image,
            initrd: None,
            dtb: None,
            args: None,
            is_default: false,
            owner: Weak::new(),
            published: Cell::new(false),
        }
    }

    /// True if `ipc_broadcast_options` has already sent this option.
    pub fn is_published(&self) -> bool {
        self.published.get()
    }

    /// Mark this option as broadcast; idempotent.
    pub fn mark_published(&self) {
        self.published.set(true);
    }

    pub fn set_owner(&mut self, owner: &Rc<std::cell::RefCell<Device>>) {
        self.owner = Rc::downgrade(owner);
    }

    pub fn owner(&self) -> Option<Rc<std::cell::RefCell<Device>>> {
        self.owner.upgrade()
    }

    /// True if `boot_image`, `initrd`, or `dtb` is still unresolved.
    pub fn has_unresolved_resource(&self) -> bool {
        !self.boot_image.is_resolved()
            || self.initrd.as_ref().is_some_and(|r| !r.is_resolved())
            || self.dtb.as_ref().is_some_and(|r| !r.is_resolved())
    }

    /// True once every resource this option references is resolved, i.e.
    /// it is eligible for publication over IPC.
    pub fn is_publishable(&self) -> bool {
        !self.has_unresolved_resource()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::PbUrl;

    #[test]
    fn option_publishable_only_when_all_resources_resolved() {
        let url = PbUrl::parse("http://host/vmlinuz").unwrap();
        let opt = BootOption::new("test", Resource::Url(url));
        assert!(opt.is_publishable());

        let opt2 = BootOption::new(
            "test2",
            Resource::unresolved_devspec(crate::resource::Selector::Uuid("abcd".into()), "/vmlinuz"),
        );
        assert!(!opt2.is_publishable());
    }

    #[test]
    fn device_tracks_unresolved_options() {
        let mut dev = Device::new("dev0", Classification::Disk);
        let opt = Rc::new(BootOption::new(
            "test",
            Resource::unresolved_devspec(crate::resource::Selector::AnyWithFile, "/vmlinuz"),
        ));
        dev.push_option(opt);
        assert!(dev.has_unresolved_options());
    }
}
