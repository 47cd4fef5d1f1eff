//! syslinux/pxelinux config parser: `DEFAULT`/`LABEL`/`KERNEL`/`APPEND`/
//! `INCLUDE`/`IPAPPEND` and friends. Shared by the on-device syslinux
//! parser and, via [`parse_text`], by the PXE parser's config discovery.

use crate::model::BootOption;
use crate::resource::Resource;

use super::{DiscoverContext, ParseResult};
use crate::error::Result;
use crate::registry::Registry;

const SEARCH_PATHS: &[&str] = &["/syslinux/syslinux.cfg", "/isolinux/isolinux.cfg", "/extlinux.conf"];
const MAX_INCLUDE_DEPTH: u32 = 10;

pub struct Label {
    pub name: String,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
    pub append: Option<String>,
}

pub struct ParsedConfig {
    pub default_label: Option<String>,
    pub global_append: Option<String>,
    pub ipappend: u32,
    pub labels: Vec<Label>,
}

/// Parse syslinux-syntax `text`. `include_fn` resolves an `INCLUDE`
/// target's contents relative to whatever search context the caller uses
/// (a mounted device for the on-device parser, a base URL for PXE).
pub fn parse_text(text: &str, include_fn: &impl Fn(&str) -> Option<String>) -> ParsedConfig {
    let mut config = ParsedConfig {
        default_label: None,
        global_append: None,
        ipappend: 0,
        labels: Vec::new(),
    };
    parse_into(text, include_fn, &mut config, 0);
    config
}

fn parse_into(text: &str, include_fn: &impl Fn(&str) -> Option<String>, config: &mut ParsedConfig, depth: u32) {
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((keyword, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let rest = rest.trim();
        match keyword.to_ascii_uppercase().as_str() {
            "DEFAULT" => config.default_label = Some(rest.to_string()),
            "APPEND" => {
                if let Some(label) = config.labels.last_mut() {
                    label.append = Some(rest.to_string());
                } else {
                    config.global_append = Some(rest.to_string());
                }
            }
            "LABEL" => config.labels.push(Label {
                name: rest.to_string(),
                kernel: None,
                initrd: None,
                append: None,
            }),
            "KERNEL" | "LINUX" => {
                if let Some(label) = config.labels.last_mut() {
                    label.kernel = Some(rest.to_string());
                }
            }
            "INITRD" => {
                if let Some(label) = config.labels.last_mut() {
                    label.initrd = Some(rest.to_string());
                }
            }
            "IPAPPEND" => {
                config.ipappend = rest.trim().parse().unwrap_or(0);
            }
            "INCLUDE" => {
                if depth >= MAX_INCLUDE_DEPTH {
                    tracing::debug!(file = rest, "INCLUDE depth exceeded, skipping");
                    continue;
                }
                if let Some(included) = include_fn(rest) {
                    parse_into(&included, include_fn, config, depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// Resolve each label's effective `APPEND`: its own, unless it is
/// literally `-` (meaning "no args"), in which case the global `APPEND`
/// is *not* inherited either — the label explicitly opts out.
fn effective_append(config: &ParsedConfig, label: &Label, mac: Option<&str>) -> Option<String> {
    let base = match &label.append {
        Some(a) if a == "-" => None,
        Some(a) => Some(a.clone()),
        None => config.global_append.clone(),
    };
    if config.ipappend == 2 {
        if let Some(mac) = mac {
            let extra = format!("BOOTIF=01-{}", mac.to_ascii_lowercase().replace(':', "-"));
            return Some(match base {
                Some(b) => format!("{b} {extra}"),
                None => extra,
            });
        }
    }
    base
}

pub fn parse(ctx: &mut DiscoverContext, registry: &Registry) -> Result<ParseResult> {
    let device_id = ctx.device.borrow().id.clone();
    let mut contents = None;
    let mut found_path = None;
    for path in SEARCH_PATHS {
        if let Ok(bytes) = ctx.request_file(registry, path) {
            contents = Some(bytes);
            found_path = Some(*path);
            break;
        }
    }
    let (Some(bytes), Some(found_path)) = (contents, found_path) else {
        return Ok(ParseResult::NotApplicable);
    };
    let base_dir = found_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let text = String::from_utf8_lossy(&bytes).to_string();

    let include_fn = |rel: &str| -> Option<String> {
        let full = format!("{base_dir}/{rel}");
        ctx.request_file(registry, &full)
            .ok()
            .map(|b| String::from_utf8_lossy(&b).to_string())
    };
    let config = parse_text(&text, &include_fn);
    let mac = ctx.device.borrow().properties.get("ID_NET_NAME_MAC").cloned();

    let mut found = 0;
    for label in &config.labels {
        let Some(kernel) = &label.kernel else { continue };
        let mut opt = BootOption::new(
            label.name.clone(),
            Resource::local(Some(device_id.clone()), format!("{base_dir}/{kernel}")),
        );
        opt.initrd = label
            .initrd
            .as_ref()
            .map(|p| Resource::local(Some(device_id.clone()), format!("{base_dir}/{p}")));
        opt.args = effective_append(&config, label, mac.as_deref());
        opt.is_default = config.default_label.as_deref() == Some(label.name.as_str());
        ctx.add_boot_option(opt);
        found += 1;
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

    #[test]
    fn global_append_inherited_unless_dashed() {
        let text = "APPEND quiet\nLABEL linux\nKERNEL vmlinuz\nLABEL other\nAPPEND -\nKERNEL vmlinuz2\n";
        let config = parse_text(text, &|_| None);
        assert_eq!(effective_append(&config, &config.labels[0], None).as_deref(), Some("quiet"));
        assert_eq!(effective_append(&config, &config.labels[1], None), None);
    }

    #[test]
    fn ipappend_2_adds_bootif() {
        let text = "IPAPPEND 2\nLABEL linux\nKERNEL vmlinuz\n";
        let config = parse_text(text, &|_| None);
        let args = effective_append(&config, &config.labels[0], Some("AA:BB:CC:DD:EE:FF")).unwrap();
        assert_eq!(args, "BOOTIF=01-aa-bb-cc-dd-ee-ff");
    }

    #[test]
    fn include_recurses_with_depth_cap() {
        let text = "INCLUDE other.cfg\n";
        let included = |_: &str| Some("LABEL from_include\nKERNEL vmlinuz\n".to_string());
        let config = parse_text(text, &included);
        assert_eq!(config.labels.len(), 1);
        assert_eq!(config.labels[0].name, "from_include");
    }
}
