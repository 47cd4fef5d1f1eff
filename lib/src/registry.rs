//! Device registry: the set of discovered devices plus secondary indexes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::model::Device;

pub type DeviceHandle = Rc<RefCell<Device>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Added,
    DuplicateSkipped,
    Removed,
    RemoveNoSuchDevice,
}

/// Devices in insertion order, plus UUID/LABEL/MAC indexes. Mirrors the
/// original's "device list + lookup tables" split rather than a single
/// keyed map, since insertion order matters for `for_each`.
#[derive(Debug, Default)]
pub struct Registry {
    order: Vec<String>,
    by_id: HashMap<String, DeviceHandle>,
    by_uuid: HashMap<String, String>,
    by_label: HashMap<String, String>,
    by_mac: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a device. If another device already holds the same UUID
    /// (e.g. a multipath re-report), the new one is skipped entirely.
    pub fn add(&mut self, device: DeviceHandle) -> RegistryEvent {
        let (id, uuid, label) = {
            let d = device.borrow();
            (d.id.clone(), d.uuid.clone(), d.label.clone())
        };
        if let Some(uuid) = &uuid {
            if self.by_uuid.contains_key(uuid) {
                return RegistryEvent::DuplicateSkipped;
            }
        }
        if let Some(uuid) = uuid {
            self.by_uuid.insert(uuid, id.clone());
        }
        if let Some(label) = label {
            self.by_label.insert(label, id.clone());
        }
        if let Some(mac) = device.borrow().properties.get("ID_NET_NAME_MAC").cloned() {
            self.by_mac.insert(mac, id.clone());
        }
        self.order.push(id.clone());
        self.by_id.insert(id, device);
        RegistryEvent::Added
    }

    pub fn remove(&mut self, id: &str) -> RegistryEvent {
        let Some(device) = self.by_id.remove(id) else {
            return RegistryEvent::RemoveNoSuchDevice;
        };
        self.order.retain(|i| i != id);
        let d = device.borrow();
        if let Some(uuid) = &d.uuid {
            self.by_uuid.remove(uuid);
        }
        if let Some(label) = &d.label {
            self.by_label.remove(label);
        }
        if let Some(mac) = d.properties.get("ID_NET_NAME_MAC") {
            self.by_mac.remove(mac);
        }
        RegistryEvent::Removed
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<DeviceHandle> {
        self.by_id.get(id).cloned()
    }

    pub fn lookup_by_uuid(&self, uuid: &str) -> Option<DeviceHandle> {
        self.by_uuid.get(uuid).and_then(|id| self.lookup_by_id(id))
    }

    pub fn lookup_by_label(&self, label: &str) -> Option<DeviceHandle> {
        self.by_label.get(label).and_then(|id| self.lookup_by_id(id))
    }

    pub fn lookup_by_mac(&self, mac: &str) -> Option<DeviceHandle> {
        self.by_mac.get(mac).and_then(|id| self.lookup_by_id(id))
    }

    /// First mounted device whose mount point contains `path`, used by the
    /// `any-with-file` resource selector. Iteration order is insertion
    /// order, matching `for_each`.
    pub fn find_any_with_file(&self, path: &str) -> Option<DeviceHandle> {
        self.for_each().find(|d| {
            let d = d.borrow();
            d.mount_point
                .as_ref()
                .is_some_and(|mp| mp.join(path.trim_start_matches('/')).exists())
        })
    }

    pub fn for_each(&self) -> impl Iterator<Item = DeviceHandle> + '_ {
        self.order.iter().filter_map(|id| self.by_id.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Re-attempt resolution of every unresolved resource on every device's
    /// options; called after an `add`. Returns the devices that had at
    /// least one resource newly resolve, so the caller can re-broadcast
    /// options that just became publishable on them.
    pub fn reresolve_all(&self) -> Vec<DeviceHandle> {
        let mut affected = Vec::new();
        for device in self.for_each() {
            let mut changed = false;
            let d = device.borrow();
            for option in d.options() {
                let current = d.id.clone();
                if !option.boot_image.is_resolved() && option.boot_image.resolve(self, &current) {
                    changed = true;
                }
                if let Some(initrd) = &option.initrd {
                    if !initrd.is_resolved() && initrd.resolve(self, &current) {
                        changed = true;
                    }
                }
                if let Some(dtb) = &option.dtb {
                    if !dtb.is_resolved() && dtb.resolve(self, &current) {
                        changed = true;
                    }
                }
            }
            drop(d);
            if changed {
                affected.push(device);
            }
        }
        affected
    }

    /// Revert every resolved resource that targeted `removed_device_id`,
    /// across every remaining device's options.
    pub fn revert_targeting(&self, removed_device_id: &str) {
        for device in self.for_each() {
            let d = device.borrow();
            for option in d.options() {
                option.boot_image.revert_if_targeting(removed_device_id);
                if let Some(initrd) = &option.initrd {
                    initrd.revert_if_targeting(removed_device_id);
                }
                if let Some(dtb) = &option.dtb {
                    dtb.revert_if_targeting(removed_device_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classification;

    fn dev(id: &str, uuid: Option<&str>) -> DeviceHandle {
        let mut d = Device::new(id, Classification::Disk);
        d.uuid = uuid.map(str::to_string);
        Rc::new(RefCell::new(d))
    }

    #[test]
    fn duplicate_uuid_is_skipped() {
        let mut reg = Registry::new();
        assert_eq!(reg.add(dev("a", Some("u1"))), RegistryEvent::Added);
        assert_eq!(reg.add(dev("b", Some("u1"))), RegistryEvent::DuplicateSkipped);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn lookup_by_uuid_works_after_add() {
        let mut reg = Registry::new();
        reg.add(dev("a", Some("u1")));
        assert!(reg.lookup_by_uuid("u1").is_some());
        assert!(reg.lookup_by_uuid("u2").is_none());
    }

    #[test]
    fn remove_clears_all_indexes() {
        let mut reg = Registry::new();
        reg.add(dev("a", Some("u1")));
        assert_eq!(reg.remove("a"), RegistryEvent::Removed);
        assert!(reg.lookup_by_id("a").is_none());
        assert!(reg.lookup_by_uuid("u1").is_none());
        assert_eq!(reg.remove("a"), RegistryEvent::RemoveNoSuchDevice);
    }

    #[test]
    fn for_each_preserves_insertion_order() {
        let mut reg = Registry::new();
        reg.add(dev("a", None));
        reg.add(dev("b", None));
        reg.add(dev("c", None));
        let ids: Vec<String> = reg.for_each().map(|d| d.borrow().id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
