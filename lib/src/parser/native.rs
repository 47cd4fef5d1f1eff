//! Native `key value` config parser: `/petitboot.conf` or
//! `/boot/petitboot.conf`.

use crate::model::BootOption;
use crate::resource::Resource;

use super::{DiscoverContext, ParseResult};
use crate::error::Result;
use crate::registry::Registry;

const SEARCH_PATHS: &[&str] = &["/petitboot.conf", "/boot/petitboot.conf"];

struct PendingOption {
    name: Option<String>,
    description: Option<String>,
    image: Option<String>,
    icon: Option<String>,
    initrd: Option<String>,
    args: Option<String>,
    dtb: Option<String>,
    is_default: bool,
}

impl PendingOption {
    fn new() -> Self {
        Self {
            name: None,
            description: None,
            image: None,
            icon: None,
            initrd: None,
            args: None,
            dtb: None,
            is_default: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.name.is_none() && self.image.is_none()
    }

    fn into_boot_option(self, device_id: &str) -> Option<BootOption> {
        let image = self.image?;
        let mut opt = BootOption::new(
            self.name.unwrap_or_else(|| image.clone()),
            Resource::local(Some(device_id.to_string()), image),
        );
        opt.description = self.description;
        opt.icon = self.icon;
        opt.args = self.args;
        opt.initrd = self.initrd.map(|p| Resource::local(Some(device_id.to_string()), p));
        opt.dtb = self.dtb.map(|p| Resource::local(Some(device_id.to_string()), p));
        opt.is_default = self.is_default;
        Some(opt)
    }
}

pub fn parse(ctx: &mut DiscoverContext, registry: &Registry) -> Result<ParseResult> {
    let device_id = ctx.device.borrow().id.clone();
    let mut contents = None;
    for path in SEARCH_PATHS {
        if let Ok(bytes) = ctx.request_file(registry, path) {
            contents = Some(bytes);
            break;
        }
    }
    let Some(bytes) = contents else {
        return Ok(ParseResult::NotApplicable);
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut device_name = None;
    let mut device_description = None;
    let mut device_icon = None;
    let mut options = Vec::new();
    let mut current = PendingOption::new();
    let mut saw_any_section = false;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                options.push(std::mem::replace(&mut current, PendingOption::new()));
            }
            continue;
        }
        if let Some(label) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if !current.is_empty() {
                options.push(std::mem::replace(&mut current, PendingOption::new()));
            }
            saw_any_section = true;
            current.name = Some(label.to_string());
            continue;
        }
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let value = value.trim().to_string();
        if saw_any_section || !current.is_empty() {
            match key {
                "name" => current.name = Some(value),
                "description" => current.description = Some(value),
                "image" => current.image = Some(value),
                "icon" => current.icon = Some(value),
                "initrd" => current.initrd = Some(value),
                "args" => current.args = Some(value),
                "dtb" => current.dtb = Some(value),
                "default" => current.is_default = true,
                _ => {}
            }
        } else {
            match key {
                "name" => device_name = Some(value),
                "description" => device_description = Some(value),
                "icon" => device_icon = Some(value),
                _ => {}
            }
        }
    }
    if !current.is_empty() {
        options.push(current);
    }

    ctx.set_device_info(device_name, device_description, device_icon);

    let mut found = 0;
    let mut any_default = false;
    let mut boot_options: Vec<BootOption> = Vec::new();
    for pending in options {
        let is_default = pending.is_default;
        if let Some(mut opt) = pending.into_boot_option(&device_id) {
            if is_default {
                any_default = true;
            }
            opt.is_default = is_default;
            boot_options.push(opt);
            found += 1;
        }
    }
    if !any_default {
        if let Some(first) = boot_options.first_mut() {
            first.is_default = true;
        }
    }
    for opt in boot_options {
        ctx.add_boot_option(opt);
    }

    if found == 0 {
        Ok(ParseResult::ApplicableButEmpty)
    } else {
        Ok(ParseResult::Found(found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classification, Device};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn mounted_device(dir: &std::path::Path) -> crate::registry::DeviceHandle {
        let mut d = Device::new("dev0", Classification::Disk);
        d.mount_point = Some(dir.to_path_buf());
        Rc::new(RefCell::new(d))
    }

    #[test]
    fn parses_device_scope_and_two_options() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("petitboot.conf"),
            "name Test Disk\n\
             description a disk\n\
             \n\
             name Option A\n\
             image /vmlinuz-a\n\
             initrd /initrd-a\n\
             args root=/dev/sda1\n\
             \n\
             name Option B\n\
             image /vmlinuz-b\n\
             default\n",
        )
        .unwrap();

        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let (result, published) = super::super::run_default_chain(
            &{
                let mut c = super::super::ParserChain::new();
                c.register(super::super::Parser::new("native", 100, parse));
                c
            },
            DiscoverContext::new(device.clone()),
            &registry,
        )
        .unwrap();
        assert_eq!(result, ParseResult::Found(2));
        assert_eq!(published, 2);
        assert_eq!(device.borrow().name.as_deref(), Some("Test Disk"));
        let opts = device.borrow();
        let opts = opts.options();
        assert_eq!(opts.len(), 2);
        assert!(opts[1].is_default);
    }

    #[test]
    fn absent_file_is_not_applicable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let mut ctx = DiscoverContext::new(device);
        assert_eq!(parse(&mut ctx, &registry).unwrap(), ParseResult::NotApplicable);
    }
}
