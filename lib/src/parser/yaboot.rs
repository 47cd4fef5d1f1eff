//! yaboot config parser: `/etc/yaboot.conf` or `/yaboot.conf`.
//!
//! Global keys apply to every subsequent `image=` section; each `image=`
//! starts a fresh BootOption named after its `label=`.

use crate::model::BootOption;
use crate::resource::Resource;

use super::{DiscoverContext, ParseResult};
use crate::error::Result;
use crate::registry::Registry;

const SEARCH_PATHS: &[&str] = &["/etc/yaboot.conf", "/yaboot.conf"];

/// Strip the surrounding double quotes a yaboot config value may carry
/// and resolve the `\"`/`\\`/`\n` escapes the original tokenizer's
/// quoted-string branch recognizes. A value with no surrounding quotes
/// passes through unchanged.
fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[derive(Default, Clone)]
struct Globals {
    root: Option<String>,
    append: Option<String>,
    ramdisk: Option<String>,
    initrd_size: Option<String>,
    read_only: Option<bool>,
    novideo: bool,
    literal: Option<String>,
}

struct Section {
    image: String,
    label: Option<String>,
    initrd: Option<String>,
    append: Option<String>,
    literal: Option<String>,
    globals_snapshot: Globals,
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

    let mut globals = Globals::default();
    let mut sections: Vec<Section> = Vec::new();
    let mut default_label: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), Some(unquote(v.trim()))),
            None => (line, None),
        };
        match key {
            "image" => {
                if let Some(image) = value {
                    sections.push(Section {
                        image,
                        label: None,
                        initrd: None,
                        append: None,
                        literal: None,
                        globals_snapshot: globals.clone(),
                    });
                }
            }
            "label" => {
                if let Some(section) = sections.last_mut() {
                    section.label = value;
                }
            }
            "initrd" => {
                if let Some(section) = sections.last_mut() {
                    section.initrd = value;
                } // before any image=, "initrd" only matters as a global marker (handled via initrd-size)
            }
            "append" => {
                if let Some(section) = sections.last_mut() {
                    section.append = value;
                } else {
                    globals.append = value;
                }
            }
            "literal" => {
                if let Some(section) = sections.last_mut() {
                    section.literal = value;
                } else {
                    globals.literal = value;
                }
            }
            "root" => globals.root = value,
            "ramdisk" => globals.ramdisk = value,
            "initrd-size" => globals.initrd_size = value,
            "read-only" => globals.read_only = Some(true),
            "read-write" => globals.read_only = Some(false),
            "novideo" => globals.novideo = true,
            "default" => default_label = value,
            _ => {}
        }
    }

    let mut found = 0;
    let mut any_default = false;
    let mut boot_options: Vec<BootOption> = Vec::new();
    for section in sections {
        let name = section.label.clone().unwrap_or_else(|| section.image.clone());
        let is_default = default_label.as_deref().is_some_and(|d| d == name);
        let mut opt = BootOption::new(name, Resource::local(Some(device_id.clone()), section.image));
        opt.initrd = section
            .initrd
            .map(|p| Resource::local(Some(device_id.clone()), p));
        opt.args = Some(compose_cmdline(&section.globals_snapshot, section.append, section.literal));
        if is_default {
            any_default = true;
        }
        opt.is_default = is_default;
        boot_options.push(opt);
        found += 1;
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

/// Fixed composition order: `root=… ro/rw ramdisk=… ramdisk_size=…
/// video=ofonly append-text`. If `literal` is set (globally or per-image),
/// it replaces everything except a per-image override of itself.
fn compose_cmdline(globals: &Globals, append: Option<String>, literal: Option<String>) -> String {
    if let Some(literal) = literal.or_else(|| globals.literal.clone()) {
        return literal;
    }
    let mut parts = Vec::new();
    if let Some(root) = &globals.root {
        parts.push(format!("root={root}"));
    }
    match globals.read_only {
        Some(true) => parts.push("ro".to_string()),
        Some(false) => parts.push("rw".to_string()),
        None => {}
    }
    if let Some(ramdisk) = &globals.ramdisk {
        parts.push(format!("ramdisk={ramdisk}"));
    }
    if let Some(size) = &globals.initrd_size {
        parts.push(format!("ramdisk_size={size}"));
    }
    if globals.novideo {
        parts.push("video=ofonly".to_string());
    }
    if let Some(append) = append.or_else(|| globals.append.clone()) {
        parts.push(append);
    }
    parts.join(" ")
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
    fn composes_cmdline_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("yaboot.conf"),
            "root=/dev/sda2\n\
             read-only\n\
             ramdisk=4096\n\
             append=\"quiet splash\"\n\
             \n\
             image=/vmlinux\n\
             label=linux\n\
             initrd=/initrd\n",
        )
        .unwrap();

        let registry = Registry::new();
        let device = mounted_device(dir.path());
        let mut chain = super::super::ParserChain::new();
        chain.register(super::super::Parser::new("yaboot", 60, parse));
        let (result, published) =
            super::super::run_default_chain(&chain, DiscoverContext::new(device.clone()), &registry).unwrap();
        assert_eq!(result, ParseResult::Found(1));
        assert_eq!(published, 1);
        let d = device.borrow();
        let opt = &d.options()[0];
        assert_eq!(opt.name, "linux");
        assert_eq!(
            opt.args.as_deref(),
            Some("root=/dev/sda2 ro ramdisk=4096 quiet splash")
        );
    }

    #[test]
    fn unquote_resolves_escapes_and_passes_through_bare_values() {
        assert_eq!(unquote("\"quiet splash\""), "quiet splash");
        assert_eq!(unquote("\"say \\\"hi\\\"\""), "say \"hi\"");
        assert_eq!(unquote("/vmlinux"), "/vmlinux");
    }
}
