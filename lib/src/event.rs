//! The `Event` entity shared by udev-originated and user-originated input
//! to the discovery driver (spec §3 "Event"), plus the wire format used on
//! the user-action channel: `petitboot-event` (the udev `RUN+=` helper,
//! spec §6) and the IPC server's inbound half both speak it.
//!
//! Grounded in the original's `discover/event.c`: a header `<action>@<device>`
//! followed by zero or more NUL-separated `name=value` parameters. We keep
//! the same header/param split but use a `BTreeMap` rather than a linear
//! array, since lookups (`get_param`) matter more than insertion order here.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Url,
    Dhcp,
    Boot,
    Sync,
    Plugin,
}

impl Action {
    fn parse(s: &str) -> Option<Action> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Some(Action::Add),
            "remove" => Some(Action::Remove),
            "url" => Some(Action::Url),
            "dhcp" => Some(Action::Dhcp),
            "boot" => Some(Action::Boot),
            "sync" => Some(Action::Sync),
            "plugin" => Some(Action::Plugin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Url => "url",
            Action::Dhcp => "dhcp",
            Action::Boot => "boot",
            Action::Sync => "sync",
            Action::Plugin => "plugin",
        }
    }
}

/// Where an `Event` originated: the kernel (via udev) or a user action
/// (the UI, relayed through the IPC server's reader half, or the
/// `petitboot-event` helper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Udev,
    User,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub source: Source,
    pub action: Action,
    pub device: String,
    pub params: BTreeMap<String, String>,
}

impl Event {
    pub fn new(source: Source, action: Action, device: impl Into<String>) -> Self {
        Self {
            source,
            action,
            device: device.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    /// Parse a `<action>@<device>\0name=value\0name=value\0...` buffer, the
    /// format written by `petitboot-event` and read back by the IPC
    /// server's reader context.
    pub fn parse_ad_message(source: Source, buf: &[u8]) -> Result<Event> {
        let header_end = buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(buf.len());
        let header = std::str::from_utf8(&buf[..header_end])
            .map_err(|e| Error::Protocol(format!("bad header: {e}")))?;
        let (action_str, device) = header
            .split_once('@')
            .ok_or_else(|| Error::Protocol(format!("bad header, no '@': {header}")))?;
        if device.is_empty() {
            return Err(Error::Protocol(format!("bad header, no device: {header}")));
        }
        let action = Action::parse(action_str)
            .ok_or_else(|| Error::Protocol(format!("unknown action: {action_str}")))?;

        let mut event = Event::new(source, action, device);
        let mut rest = if header_end < buf.len() { &buf[header_end + 1..] } else { &[][..] };
        while !rest.is_empty() {
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let chunk = &rest[..end];
            if !chunk.is_empty() {
                let s = String::from_utf8_lossy(chunk);
                match s.split_once('=') {
                    Some((k, v)) => event.set(k.to_string(), v.to_string()),
                    None => event.set(s.to_string(), ""),
                }
            }
            rest = if end < rest.len() { &rest[end + 1..] } else { &[][..] };
        }
        Ok(event)
    }

    /// Serialize to the same `<action>@<device>\0name=value\0...` wire
    /// format, used by `petitboot-event` to emit a message.
    pub fn encode_ad_message(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.action.as_str().as_bytes());
        buf.push(b'@');
        buf.extend_from_slice(self.device.as_bytes());
        buf.push(0);
        for (k, v) in &self.params {
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_add_with_params() {
        let mut event = Event::new(Source::User, Action::Add, "sda1");
        event.set("ID_FS_TYPE", "ext4");
        event.set("ID_FS_UUID", "abcd-1234");
        let encoded = event.encode_ad_message();
        let decoded = Event::parse_ad_message(Source::User, &encoded).unwrap();
        assert_eq!(decoded.device, "sda1");
        assert_eq!(decoded.action, Action::Add);
        assert_eq!(decoded.get("ID_FS_TYPE"), Some("ext4"));
        assert_eq!(decoded.get("id_fs_uuid"), Some("abcd-1234"));
    }

    #[test]
    fn rejects_missing_device() {
        let err = Event::parse_ad_message(Source::User, b"add@").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn rejects_unknown_action() {
        let err = Event::parse_ad_message(Source::User, b"frobnicate@sda1").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn no_params_is_valid() {
        let event = Event::parse_ad_message(Source::Udev, b"remove@sda1").unwrap();
        assert_eq!(event.device, "sda1");
        assert!(event.params.is_empty());
    }
}
