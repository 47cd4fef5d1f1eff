//! PXE parser: driven by a user event carrying network boot parameters
//! rather than a mounted device. Config discovery precedence:
//! 1. explicit `pxeconffile`,
//! 2. `bootfile_url` when its content starts with `#!ipxe`,
//! 3. MAC/IP-derived filename enumeration under `pxepathprefix`.

use crate::model::BootOption;
use crate::process::Task;
use crate::resource::Resource;
use crate::url::PbUrl;

use super::syslinux::parse_text;
use super::{DiscoverContext, ParseResult, PxeEvent};
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Build the ordered list of candidate config URLs per the precedence
/// rule, cheapest-first. The caller fetches each in turn and stops at the
/// first that exists.
pub fn candidate_urls(event: &PxeEvent, base: &PbUrl) -> Vec<PbUrl> {
    let mut candidates = Vec::new();
    if let Some(explicit) = &event.pxeconffile {
        if let Ok(url) = PbUrl::parse(explicit) {
            candidates.push(url);
        } else if let Ok(url) = base.join(explicit) {
            candidates.push(url);
        }
    }
    if let Some(bootfile_url) = &event.bootfile_url {
        if let Ok(url) = PbUrl::parse(bootfile_url) {
            candidates.push(url);
        }
    }
    let prefix = event.pxepathprefix.clone().unwrap_or_default();
    if let Some(mac) = &event.mac {
        let hex = mac.to_ascii_lowercase().replace(':', "-");
        if let Ok(url) = base.join(&format!("{prefix}01-{hex}")) {
            candidates.push(url);
        }
    }
    if let Some(ip) = &event.ip {
        for filename in ip_hex_fallbacks(ip) {
            if let Ok(url) = base.join(&format!("{prefix}{filename}")) {
                candidates.push(url);
            }
        }
    }
    if let Ok(url) = base.join(&format!("{prefix}default")) {
        candidates.push(url);
    }
    candidates
}

/// pxelinux's classic progressively-shortened hex-IP filenames, most to
/// least specific, ending with `default` handled by the caller.
fn ip_hex_fallbacks(ip: &str) -> Vec<String> {
    let octets: Vec<u8> = ip.split('.').filter_map(|p| p.parse().ok()).collect();
    if octets.len() != 4 {
        return Vec::new();
    }
    let hex = format!("{:02X}{:02X}{:02X}{:02X}", octets[0], octets[1], octets[2], octets[3]);
    (1..=hex.len()).rev().step_by(1).map(|n| hex[..n].to_string()).collect()
}

pub fn parse(ctx: &mut DiscoverContext, registry: &Registry) -> Result<ParseResult> {
    let Some(event) = ctx.network_event.clone() else {
        return Ok(ParseResult::NotApplicable);
    };
    let Some(base) = ctx.source_url.clone() else {
        return Ok(ParseResult::NotApplicable);
    };

    let candidates = candidate_urls(&event, &base);
    let mut fetched = None;
    let mut fetched_url = None;
    for candidate in candidates {
        if let Some(body) = fetch(registry, &candidate) {
            fetched = Some(body);
            fetched_url = Some(candidate);
            break;
        }
    }
    let (Some(body), Some(config_url)) = (fetched, fetched_url) else {
        return Ok(ParseResult::ApplicableButEmpty);
    };

    if body.trim_start().starts_with("#!ipxe") {
        // ipxe scripting is out of scope beyond recognizing the shebang;
        // treat as applicable-but-empty rather than misparsing it as
        // syslinux syntax.
        return Ok(ParseResult::ApplicableButEmpty);
    }

    let config_dir = config_url.clone();
    let include_fn = |rel: &str| -> Option<String> {
        let url = config_dir.join(rel).ok()?;
        fetch(registry, &url)
    };
    let parsed = parse_text(&body, &include_fn);

    let mut found = 0;
    for label in &parsed.labels {
        let Some(kernel) = &label.kernel else { continue };
        let kernel_url = config_url.join(kernel).map_err(|e| Error::Format(e.to_string()))?;
        let mut opt = BootOption::new(label.name.clone(), Resource::Url(kernel_url));
        opt.initrd = match &label.initrd {
            Some(p) => Some(Resource::Url(
                config_url.join(p).map_err(|e| Error::Format(e.to_string()))?,
            )),
            None => None,
        };
        opt.args = label.append.clone().or_else(|| parsed.global_append.clone());
        opt.is_default = parsed.default_label.as_deref() == Some(label.name.as_str());
        ctx.add_boot_option(opt);
        found += 1;
    }

    if found == 0 {
        Ok(ParseResult::ApplicableButEmpty)
    } else {
        Ok(ParseResult::Found(found))
    }
}

fn fetch(registry: &Registry, url: &PbUrl) -> Option<String> {
    if url.is_local() {
        let device = registry.find_any_with_file(&url.path)?;
        let mount_point = device.borrow().mount_point.clone()?;
        let full = mount_point.join(url.path.trim_start_matches('/'));
        return std::fs::read_to_string(full).ok();
    }
    fetch_remote(url)
}

/// Fetch a `tftp`/`http`/`https` URL by shelling out to `curl`, the same
/// way `discover.rs` shells out to `mount`/`vgscan` rather than linking a
/// network client into the daemon.
fn fetch_remote(url: &PbUrl) -> Option<String> {
    let url_str = url.to_string();
    match Task::new(format!("fetch {url_str}"), "curl")
        .quiet()
        .args(["-fsS", "--connect-timeout", "5", url_str.as_str()])
        .read()
    {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::debug!(url = %url_str, error = %e, "pxe: remote fetch failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_prefers_explicit_pxeconffile() {
        let base = PbUrl::parse("tftp://10.0.0.1/pxelinux.cfg/default").unwrap();
        let event = PxeEvent {
            pxeconffile: Some("tftp://10.0.0.1/custom.cfg".to_string()),
            bootfile_url: Some("tftp://10.0.0.1/boot.ipxe".to_string()),
            pxepathprefix: None,
            mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ip: Some("192.168.1.10".to_string()),
        };
        let candidates = candidate_urls(&event, &base);
        assert_eq!(candidates[0].to_string(), "tftp://10.0.0.1/custom.cfg");
    }

    #[test]
    fn mac_derived_filename_present_before_ip_fallbacks() {
        let base = PbUrl::parse("tftp://10.0.0.1/pxelinux.cfg/").unwrap();
        let event = PxeEvent {
            pxeconffile: None,
            bootfile_url: None,
            pxepathprefix: None,
            mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ip: Some("192.168.1.10".to_string()),
        };
        let candidates = candidate_urls(&event, &base);
        assert!(candidates[0].path.ends_with("01-aa-bb-cc-dd-ee-ff"));
        assert!(candidates.last().unwrap().path.ends_with("default"));
    }
}
