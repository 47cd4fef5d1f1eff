//! kboot config parser: `/etc/kboot.conf`, `key="kernel-image args..."`.

use crate::model::BootOption;
use crate::resource::Resource;

use super::{DiscoverContext, ParseResult};
use crate::error::Result;
use crate::registry::Registry;

const CONFIG_PATH: &str = "/etc/kboot.conf";
const IGNORED_KEYS: &[&str] = &["message", "timeout", "default"];

pub fn parse(ctx: &mut DiscoverContext, registry: &Registry) -> Result<ParseResult> {
    let device_id = ctx.device.borrow().id.clone();
    let Ok(bytes) = ctx.request_file(registry, CONFIG_PATH) else {
        return Ok(ParseResult::NotApplicable);
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut found = 0;
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if IGNORED_KEYS.contains(&key) {
            continue;
        }
        let value = unquote(value.trim());
        if let Some(opt) = parse_entry(key, &value, &device_id) {
            ctx.add_boot_option(opt);
            found += 1;
        }
    }

    if found == 0 {
        Ok(ParseResult::ApplicableButEmpty)
    } else {
        Ok(ParseResult::Found(found))
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// `value` is the unquoted `kernel-image args...` string. The first
/// whitespace-delimited token is the kernel image; the rest is scanned
/// for `name=value` pairs, with `initrd=`/`root=` intercepted rather than
/// passed through verbatim and re-synthesized into a canonical order:
/// `root=<root> initrd=<initrd> <other args..>`, with a synthetic
/// `root=/dev/ram0` inserted if there's an `initrd` but no explicit `root`.
fn parse_entry(name: &str, value: &str, device_id: &str) -> Option<BootOption> {
    let mut tokens = value.split_whitespace();
    let image = tokens.next()?.to_string();

    let mut initrd = None;
    let mut root = None;
    let mut other_args: Vec<String> = Vec::new();
    // Per-option arg buffer: each call to `parse_entry` starts fresh, so
    // distinct kboot.conf entries never share leftover tokens.
    for token in tokens {
        if let Some(v) = token.strip_prefix("initrd=") {
            initrd = Some(v.to_string());
        } else if let Some(v) = token.strip_prefix("root=") {
            root = Some(v.to_string());
        } else {
            other_args.push(token.to_string());
        }
    }

    if initrd.is_some() && root.is_none() {
        root = Some("/dev/ram0".to_string());
    }

    let mut args_parts = Vec::new();
    if let Some(root) = &root {
        args_parts.push(format!("root={root}"));
    }
    if let Some(initrd) = &initrd {
        args_parts.push(format!("initrd={initrd}"));
    }
    args_parts.extend(other_args);
    let args = if args_parts.is_empty() {
        None
    } else {
        Some(args_parts.join(" "))
    };

    let mut opt = BootOption::new(name, Resource::local(Some(device_id.to_string()), image));
    opt.args = args;
    opt.initrd = initrd.map(|p| Resource::local(Some(device_id.to_string()), p));
    Some(opt)
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
    fn synthesizes_root_from_initrd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/kboot.conf"),
            "linux=\"/vmlinux initrd=/initrd arg1=value1 arg2\"\n",
        )
        .unwrap();

        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let mut ctx = DiscoverContext::new(device);
        let result = parse(&mut ctx, &registry).unwrap();
        assert_eq!(result, ParseResult::Found(1));
        let opt = parse_entry("linux", "/vmlinux initrd=/initrd arg1=value1 arg2", "dev0").unwrap();
        assert_eq!(opt.args.as_deref(), Some("root=/dev/ram0 initrd=/initrd arg1=value1 arg2"));
    }

    #[test]
    fn explicit_root_is_not_overridden() {
        let opt = parse_entry("linux", "/vmlinux initrd=/initrd root=/dev/sda1 quiet", "dev0").unwrap();
        assert_eq!(opt.args.as_deref(), Some("root=/dev/sda1 initrd=/initrd quiet"));
    }

    #[test]
    fn ignored_keys_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/kboot.conf"),
            "default=linux\ntimeout=5\nmessage=\"hi\"\n",
        )
        .unwrap();
        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let mut ctx = DiscoverContext::new(device);
        assert_eq!(parse(&mut ctx, &registry).unwrap(), ParseResult::ApplicableButEmpty);
    }
}
