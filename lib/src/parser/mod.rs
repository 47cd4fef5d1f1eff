//! Parser framework: priority-ordered registration, per-device parse
//! context, and the shared file-request API.
//!
//! Grounded in bootupd's `Component` trait (one trait object per
//! bootloader kind, invoked uniformly by the daemon loop) generalized
//! here to a tri-state result and a priority-ordered chain instead of
//! bootupd's "try every component" model.

pub mod grub2;
pub mod kboot;
pub mod native;
pub mod pxe;
pub mod syslinux;
pub mod yaboot;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::model::{BootOption, Device};
use crate::registry::{DeviceHandle, Registry};
use crate::resource::Selector;
use crate::url::PbUrl;

/// Outcome of a single parser invocation against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    NotApplicable,
    ApplicableButEmpty,
    Found(usize),
}

/// Per-device, per-parse scratch state. Dropped at the end of
/// `iterate_parsers`, taking every partial option it accumulated with it
/// unless they were transferred to the Device.
pub struct DiscoverContext {
    pub device: DeviceHandle,
    /// Set only for the PXE parser, driven by a user event rather than a
    /// mounted device.
    pub network_event: Option<PxeEvent>,
    /// Source URL when parsing a config fetched over the network (PXE),
    /// used to resolve relative paths inside that config.
    pub source_url: Option<PbUrl>,
    pending: Vec<Rc<BootOption>>,
    /// Set by `abandon()` when the owning Device is removed mid-parse; the
    /// parse runs to completion but its results are discarded.
    abandoned: RefCell<bool>,
}

#[derive(Debug, Clone)]
pub struct PxeEvent {
    pub pxeconffile: Option<String>,
    pub bootfile_url: Option<String>,
    pub pxepathprefix: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
}

impl DiscoverContext {
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device,
            network_event: None,
            source_url: None,
            pending: Vec::new(),
            abandoned: RefCell::new(false),
        }
    }

    pub fn for_pxe(device: DeviceHandle, event: PxeEvent, source_url: PbUrl) -> Self {
        Self {
            device,
            network_event: Some(event),
            source_url: Some(source_url),
            pending: Vec::new(),
            abandoned: RefCell::new(false),
        }
    }

    pub fn abandon(&self) {
        *self.abandoned.borrow_mut() = true;
    }

    pub fn is_abandoned(&self) -> bool {
        *self.abandoned.borrow()
    }

    /// Record a boot option found by the current parser; attached to the
    /// Device only once the parse completes without being abandoned.
    pub fn add_boot_option(&mut self, mut option: BootOption) {
        option.set_owner(&self.device);
        self.pending.push(Rc::new(option));
    }

    pub fn set_device_info(&self, name: Option<String>, description: Option<String>, icon: Option<String>) {
        self.device.borrow_mut().set_info(name, description, icon);
    }

    /// Resolve a path argument per §4.G: absolute paths are in-device;
    /// `device:path` selects another device by UUID, LABEL, or legacy name.
    pub fn request_file(&self, registry: &Registry, relpath: &str) -> Result<Vec<u8>> {
        let (target, in_device_path) = split_devspec(relpath);
        let device = match target {
            None => self.device.clone(),
            Some(selector_str) => {
                let current_device_id = self.device.borrow().id.clone();
                resolve_selector_to_device(registry, &current_device_id, selector_str)
                    .ok_or_else(|| Error::MissingResource(format!("no device for '{selector_str}'")))?
            }
        };
        let mount_point = device
            .borrow()
            .mount_point
            .clone()
            .ok_or_else(|| Error::MissingResource(format!("{relpath}: device not mounted")))?;
        let full = mount_point.join(in_device_path.trim_start_matches('/'));
        std::fs::read(&full).map_err(Error::Io)
    }

    /// Finalize: transfer every pending option onto the device, unless the
    /// context was abandoned, in which case they're simply dropped.
    fn publish(self) -> usize {
        if self.is_abandoned() {
            return 0;
        }
        let count = self.pending.len();
        let mut device = self.device.borrow_mut();
        for option in self.pending {
            device.push_option(option);
        }
        count
    }
}

fn split_devspec(relpath: &str) -> (Option<&str>, &str) {
    if let Some(idx) = relpath.find(':') {
        // Reject Windows-style drive letters / bare absolute paths that
        // happen to contain a colon later; a devspec colon always precedes
        // a path that starts with '/'.
        let (maybe_dev, rest) = relpath.split_at(idx);
        let rest = &rest[1..];
        if rest.starts_with('/') {
            return (Some(maybe_dev), rest);
        }
    }
    (None, relpath)
}

fn resolve_selector_to_device(
    registry: &Registry,
    current_device_id: &str,
    selector_str: &str,
) -> Option<DeviceHandle> {
    registry
        .lookup_by_uuid(selector_str)
        .or_else(|| registry.lookup_by_label(selector_str))
        .or_else(|| {
            let selector = devspec_selector(current_device_id, selector_str);
            crate::resource::lookup_selector(&selector, "", registry, current_device_id)
        })
}

/// (Name, priority, parse fn). Built once at startup and kept sorted by
/// descending priority.
pub struct Parser {
    pub name: &'static str,
    pub priority: i32,
    parse_fn: Box<dyn Fn(&mut DiscoverContext, &Registry) -> Result<ParseResult>>,
}

impl Parser {
    pub fn new(
        name: &'static str,
        priority: i32,
        parse_fn: impl Fn(&mut DiscoverContext, &Registry) -> Result<ParseResult> + 'static,
    ) -> Self {
        Self {
            name,
            priority,
            parse_fn: Box::new(parse_fn),
        }
    }
}

/// Registry of parsers sorted by descending priority, so discovery always
/// tries the highest-priority match first (invariant: for any device, a
/// lower-priority parser never runs once a higher one has matched).
pub struct ParserChain {
    parsers: Vec<Parser>,
}

impl ParserChain {
    pub fn new() -> Self {
        Self { parsers: Vec::new() }
    }

    pub fn register(&mut self, parser: Parser) {
        let pos = self
            .parsers
            .iter()
            .position(|p| p.priority < parser.priority)
            .unwrap_or(self.parsers.len());
        self.parsers.insert(pos, parser);
    }

    /// The chain shipped by default, in descending priority: native first
    /// (explicit config wins), then the distro-family parsers, syslinux
    /// last among on-device parsers. PXE is invoked separately, driven by
    /// a user event rather than a mounted device.
    pub fn default_chain() -> Self {
        let mut chain = Self::new();
        chain.register(Parser::new("native", 100, native::parse));
        chain.register(Parser::new("grub2", 80, grub2::parse));
        chain.register(Parser::new("yaboot", 60, yaboot::parse));
        chain.register(Parser::new("kboot", 50, kboot::parse));
        chain.register(Parser::new("syslinux", 40, syslinux::parse));
        chain
    }

    /// Run parsers in priority order against `ctx` until one reports
    /// anything but `NotApplicable`; publish its results onto the device.
    pub fn iterate_parsers(&self, ctx: &mut DiscoverContext, registry: &Registry) -> Result<ParseResult> {
        for parser in &self.parsers {
            match (parser.parse_fn)(ctx, registry) {
                Ok(ParseResult::NotApplicable) => continue,
                Ok(result) => {
                    tracing::debug!(parser = parser.name, ?result, "parser matched");
                    return Ok(result);
                }
                Err(e) => {
                    tracing::debug!(parser = parser.name, error = %e, "parser error, treated as not-applicable");
                    continue;
                }
            }
        }
        Ok(ParseResult::NotApplicable)
    }
}

impl Default for ParserChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the default chain against `ctx`, publishing any options found.
/// Returns the final `ParseResult` and the number of options published.
pub fn run_default_chain(
    chain: &ParserChain,
    mut ctx: DiscoverContext,
    registry: &Registry,
) -> Result<(ParseResult, usize)> {
    let result = chain.iterate_parsers(&mut ctx, registry)?;
    let published = ctx.publish();
    Ok((result, published))
}

/// Run the PXE parser against a context built with [`DiscoverContext::for_pxe`],
/// publishing any options found. Mirrors [`run_default_chain`] but for the
/// single PXE parser, which lives outside the on-device [`ParserChain`]
/// since it's driven by a user event rather than a mounted device (spec
/// §4.H).
pub fn run_pxe(mut ctx: DiscoverContext, registry: &Registry) -> Result<(ParseResult, usize)> {
    let result = pxe::parse(&mut ctx, registry)?;
    let published = ctx.publish();
    Ok((result, published))
}

/// Classify the final fallback of a `device:path` devspec (spec §4.G),
/// once the token has failed as both a UUID and a LABEL: a legacy device
/// name, remapped through [`DEVICE_NAME_REMAPS`] before the id lookup.
pub(crate) fn devspec_selector(current_device_id: &str, token: &str) -> Selector {
    Selector::Partname(remap_device_name(current_device_id, token))
}

/// A remap rule rewrites a legacy device-name token given the id of the
/// device the devspec is being resolved relative to. Returns `None` when
/// the rule doesn't apply.
type DeviceNameRemap = fn(current_device_id: &str, token: &str) -> Option<String>;

/// Built-in remaps, tried in order; the first applicable one wins. A table
/// rather than a single hardcoded comparison, so a future platform quirk
/// can be added as another entry.
const DEVICE_NAME_REMAPS: &[DeviceNameRemap] = &[ps3_sd_remap];

/// On a PS3, partitions enumerate as `ps3dN` rather than `sdN`; a devspec
/// written against the generic `sdN` convention needs rewriting before it
/// resolves. Mirrors `parse_device_path`'s `ps3d`/`sd` substitution, keyed
/// off the device we're resolving relative to rather than the real
/// hardware.
fn ps3_sd_remap(current_device_id: &str, token: &str) -> Option<String> {
    let suffix = token.strip_prefix("sd")?;
    current_device_id.starts_with("ps3d").then(|| format!("ps3d{suffix}"))
}

fn remap_device_name(current_device_id: &str, token: &str) -> String {
    DEVICE_NAME_REMAPS
        .iter()
        .find_map(|rule| rule(current_device_id, token))
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_sorted_by_descending_priority() {
        let chain = ParserChain::default_chain();
        let priorities: Vec<i32> = chain.parsers.iter().map(|p| p.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn higher_priority_not_applicable_falls_through() {
        let mut chain = ParserChain::new();
        chain.register(Parser::new("high", 100, |_, _| Ok(ParseResult::NotApplicable)));
        chain.register(Parser::new("low", 10, |_, _| Ok(ParseResult::Found(1))));

        let registry = Registry::new();
        let device = Rc::new(RefCell::new(Device::new("d0", crate::model::Classification::Disk)));
        let mut ctx = DiscoverContext::new(device);
        let result = chain.iterate_parsers(&mut ctx, &registry).unwrap();
        assert_eq!(result, ParseResult::Found(1));
    }

    #[test]
    fn first_applicable_terminates_chain() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let calls_a = calls.clone();
        let calls_b = calls.clone();
        let mut chain = ParserChain::new();
        chain.register(Parser::new("a", 100, move |_, _| {
            calls_a.borrow_mut().push("a");
            Ok(ParseResult::ApplicableButEmpty)
        }));
        chain.register(Parser::new("b", 10, move |_, _| {
            calls_b.borrow_mut().push("b");
            Ok(ParseResult::Found(1))
        }));

        let registry = Registry::new();
        let device = Rc::new(RefCell::new(Device::new("d0", crate::model::Classification::Disk)));
        let mut ctx = DiscoverContext::new(device);
        chain.iterate_parsers(&mut ctx, &registry).unwrap();
        assert_eq!(*calls.borrow(), vec!["a"]);
    }

    #[test]
    fn ps3_remap_rewrites_sd_prefix_when_current_device_is_ps3d() {
        assert_eq!(remap_device_name("ps3d0", "sda1"), "ps3da1");
        assert_eq!(remap_device_name("ps3da", "sdb"), "ps3db");
    }

    #[test]
    fn ps3_remap_leaves_token_unchanged_off_ps3_hardware() {
        assert_eq!(remap_device_name("sda", "sdb1"), "sdb1");
    }

    #[test]
    fn ps3_remap_leaves_non_sd_token_unchanged() {
        assert_eq!(remap_device_name("ps3d0", "vg0-lv0"), "vg0-lv0");
    }

    #[test]
    fn resolve_selector_to_device_falls_back_to_remapped_legacy_name() {
        let mut registry = Registry::new();
        registry.add(Rc::new(RefCell::new(Device::new("ps3da1", crate::model::Classification::Disk))));

        let found = resolve_selector_to_device(&registry, "ps3d0", "sda1").unwrap();
        assert_eq!(found.borrow().id, "ps3da1");
    }

    #[test]
    fn resolve_selector_to_device_prefers_uuid_and_label_before_legacy_name() {
        let mut registry = Registry::new();
        let mut dev = Device::new("sda1", crate::model::Classification::Disk);
        dev.uuid = Some("target-uuid".into());
        registry.add(Rc::new(RefCell::new(dev)));

        let found = resolve_selector_to_device(&registry, "d0", "target-uuid").unwrap();
        assert_eq!(found.borrow().id, "sda1");
    }
}
