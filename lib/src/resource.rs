//! Lazy resource references and their resolution against the device
//! registry.

use std::cell::RefCell;
use std::path::PathBuf;

use crate::registry::{DeviceHandle, Registry};
use crate::url::PbUrl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Uuid(String),
    Label(String),
    Partname(String),
    CurrentRoot,
    AnyWithFile,
    /// A bare token of unknown kind (e.g. a grub2 `$root` value set by an
    /// untyped `search`): tried as a UUID, then a label, then a device id.
    UuidOrLabel(String),
}

#[derive(Debug, Clone)]
struct Resolved {
    local_path: Option<PathBuf>,
    url: Option<PbUrl>,
    /// The device this resolution targeted, so a later device removal can
    /// revert exactly the resolutions that depended on it.
    device_id: Option<String>,
}

/// A resource reference in one of three forms; resolution state is tracked
/// via interior mutability so a `BootOption` holding a `Resource` stays
/// immutable from the outside while `resolve()` mutates it in place.
#[derive(Debug)]
pub enum Resource {
    /// `(target device id | None for "current device", in-device path)`.
    Local {
        device_id: Option<String>,
        path: String,
        resolved: RefCell<Option<Resolved>>,
    },
    /// Already an absolute URL; resolved at construction time.
    Url(PbUrl),
    /// Needs a device lookup before it can be used: a grub2 `search`
    /// result or a `(UUID-or-label)/path` devpath naming a device that
    /// hasn't appeared (yet, or ever). Re-tried on every `reresolve_all`
    /// pass, same as an unresolved `Local`.
    UnresolvedDevspec {
        selector: Selector,
        path: String,
        resolved: RefCell<Option<Resolved>>,
    },
}

impl Resource {
    pub fn local(device_id: Option<String>, path: impl Into<String>) -> Self {
        Resource::Local {
            device_id,
            path: path.into(),
            resolved: RefCell::new(None),
        }
    }

    pub fn unresolved_devspec(selector: Selector, path: impl Into<String>) -> Self {
        Resource::UnresolvedDevspec {
            selector,
            path: path.into(),
            resolved: RefCell::new(None),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Resource::Url(_) => true,
            Resource::Local { resolved, .. } => resolved.borrow().is_some(),
            Resource::UnresolvedDevspec { resolved, .. } => resolved.borrow().is_some(),
        }
    }

    /// Concrete local path, if resolved and local.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match self {
            Resource::Local { resolved, .. } | Resource::UnresolvedDevspec { resolved, .. } => {
                resolved.borrow().as_ref().and_then(|r| r.local_path.clone())
            }
            Resource::Url(_) => None,
        }
    }

    /// Concrete URL, if resolved as remote or already a URL.
    pub fn resolved_url(&self) -> Option<PbUrl> {
        match self {
            Resource::Url(u) => Some(u.clone()),
            Resource::Local { resolved, .. } | Resource::UnresolvedDevspec { resolved, .. } => {
                resolved.borrow().as_ref().and_then(|r| r.url.clone())
            }
        }
    }

    /// Attempt resolution. Idempotent: calling this on an already-resolved
    /// `Local` or a `Url` is a cheap no-op returning `true`.
    pub fn resolve(&self, registry: &Registry, current_device_id: &str) -> bool {
        match self {
            Resource::Url(_) => true,
            Resource::Local { device_id, path, resolved } => {
                if resolved.borrow().is_some() {
                    return true;
                }
                let target_id = device_id.as_deref().unwrap_or(current_device_id);
                let Some(device) = registry.lookup_by_id(target_id) else {
                    return false;
                };
                let device = device.borrow();
                let Some(mount_point) = &device.mount_point else {
                    return false;
                };
                let local_path = join_in_device_path(mount_point, path);
                *resolved.borrow_mut() = Some(Resolved {
                    local_path: Some(local_path),
                    url: None,
                    device_id: Some(target_id.to_string()),
                });
                true
            }
            Resource::UnresolvedDevspec { selector, path, resolved } => {
                if resolved.borrow().is_some() {
                    return true;
                }
                let Some(device) = lookup_selector(selector, path, registry, current_device_id) else {
                    return false;
                };
                let device_ref = device.borrow();
                let Some(mount_point) = &device_ref.mount_point else {
                    return false;
                };
                let local_path = join_in_device_path(mount_point, path);
                let device_id = device_ref.id.clone();
                drop(device_ref);
                *resolved.borrow_mut() = Some(Resolved {
                    local_path: Some(local_path),
                    url: None,
                    device_id: Some(device_id),
                });
                true
            }
        }
    }

    /// Revert a resolved resource back to unresolved because its backing
    /// device was removed. No-op for `Url` (always resolved) and resources
    /// that never resolved in the first place.
    pub fn revert_if_targeting(&self, removed_device_id: &str) {
        match self {
            Resource::Local { device_id, resolved, .. } => {
                if device_id.as_deref() == Some(removed_device_id) {
                    *resolved.borrow_mut() = None;
                }
            }
            Resource::UnresolvedDevspec { resolved, .. } => {
                let targets_removed = resolved
                    .borrow()
                    .as_ref()
                    .and_then(|r| r.device_id.as_deref())
                    == Some(removed_device_id);
                if targets_removed {
                    *resolved.borrow_mut() = None;
                }
            }
            Resource::Url(_) => {}
        }
    }
}

pub(crate) fn lookup_selector(
    selector: &Selector,
    path: &str,
    registry: &Registry,
    current_device_id: &str,
) -> Option<DeviceHandle> {
    match selector {
        Selector::Uuid(uuid) => registry.lookup_by_uuid(uuid),
        Selector::Label(label) => registry.lookup_by_label(label),
        Selector::Partname(name) => registry.lookup_by_id(name),
        Selector::CurrentRoot => registry.lookup_by_id(current_device_id),
        Selector::AnyWithFile => registry.find_any_with_file(path),
        Selector::UuidOrLabel(token) => registry
            .lookup_by_uuid(token)
            .or_else(|| registry.lookup_by_label(token))
            .or_else(|| registry.lookup_by_id(token)),
    }
}

fn join_in_device_path(mount_point: &std::path::Path, in_device_path: &str) -> PathBuf {
    mount_point.join(in_device_path.trim_start_matches('/'))
}

/// Resolve a devspec against the registry eagerly, returning a fully
/// resolved `Resource::local` on success. Most callers should prefer
/// `Resource::unresolved_devspec` plus `reresolve_all`, which also covers
/// the device-not-present-yet case; this is for call sites that need an
/// immediate yes/no answer (e.g. validating a `search --set` target).
pub fn resolve_devspec(
    selector: &Selector,
    path: &str,
    registry: &Registry,
    current_device_id: &str,
) -> Option<Resource> {
    let device = lookup_selector(selector, path, registry, current_device_id)?;
    let device_id = device.borrow().id.clone();
    let resource = Resource::local(Some(device_id), path);
    if resource.resolve(registry, current_device_id) {
        Some(resource)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classification, Device};
    use std::rc::Rc;

    #[test]
    fn url_resource_always_resolved() {
        let url = PbUrl::parse("http://host/vmlinuz").unwrap();
        assert!(Resource::Url(url).is_resolved());
    }

    #[test]
    fn local_resource_resolves_against_mounted_device() {
        let mut registry = Registry::new();
        let mut dev = Device::new("dev0", Classification::Disk);
        dev.mount_point = Some(PathBuf::from("/mnt/dev0"));
        registry.add(Rc::new(RefCell::new(dev)));

        let resource = Resource::local(Some("dev0".to_string()), "/boot/vmlinuz");
        assert!(!resource.is_resolved());
        assert!(resource.resolve(&registry, "dev0"));
        assert!(resource.is_resolved());
        assert_eq!(
            resource.resolved_path().unwrap(),
            PathBuf::from("/mnt/dev0/boot/vmlinuz")
        );
    }

    #[test]
    fn unresolved_devspec_resolves_once_its_device_is_registered() {
        let mut registry = Registry::new();
        let resource = Resource::unresolved_devspec(Selector::Uuid("target-uuid".into()), "/vmlinuz");
        assert!(!resource.resolve(&registry, "dev0"));
        assert!(!resource.is_resolved());

        let mut dev = Device::new("dev1", Classification::Disk);
        dev.uuid = Some("target-uuid".into());
        dev.mount_point = Some(PathBuf::from("/mnt/dev1"));
        registry.add(Rc::new(RefCell::new(dev)));

        assert!(resource.resolve(&registry, "dev0"));
        assert_eq!(resource.resolved_path().unwrap(), PathBuf::from("/mnt/dev1/vmlinuz"));
    }

    #[test]
    fn unresolved_devspec_reverts_when_its_resolved_device_is_removed() {
        let mut registry = Registry::new();
        let mut dev = Device::new("dev1", Classification::Disk);
        dev.uuid = Some("target-uuid".into());
        dev.mount_point = Some(PathBuf::from("/mnt/dev1"));
        registry.add(Rc::new(RefCell::new(dev)));

        let resource = Resource::unresolved_devspec(Selector::Uuid("target-uuid".into()), "/vmlinuz");
        assert!(resource.resolve(&registry, "dev0"));

        resource.revert_if_targeting("dev1");
        assert!(!resource.is_resolved());
    }

    #[test]
    fn local_resource_reverts_when_its_device_is_removed() {
        let mut registry = Registry::new();
        let mut dev = Device::new("dev0", Classification::Disk);
        dev.mount_point = Some(PathBuf::from("/mnt/dev0"));
        registry.add(Rc::new(RefCell::new(dev)));

        let resource = Resource::local(Some("dev0".to_string()), "/vmlinuz");
        resource.resolve(&registry, "dev0");
        assert!(resource.is_resolved());

        resource.revert_if_targeting("dev0");
        assert!(!resource.is_resolved());
    }
}
