//! The length-prefixed IPC protocol (spec §4.J/§6): big-endian, 4-tag
//! framing carrying device/option add/remove events from the discovery
//! engine to any connected UI, over a `SOCK_STREAM` Unix domain socket at
//! `/var/tmp/petitboot-dev` by default.
//!
//! Per spec §4.J ("Clients connect, then continuously read; any framing
//! error closes the connection"), this direction is one-way: the server
//! broadcasts `Frame`s, clients only read them. User commands travelling
//! the other way (boot selection, resync) use the separate channel in
//! [`crate::discover`] built on [`crate::event::Event`]'s ad-header format,
//! matching the original's distinct `petitboot-event` / user-action path
//! rather than this wire protocol.
//!
//! Factored as §9's "Re-architecture hints" suggest: a single
//! pair of primitives read/write one big-endian `u32` length plus a byte
//! slice, with each `Frame` variant's marshalling built on top of that pair
//! rather than hand-duplicated per variant.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rustix::event::PollFlags;

use crate::error::{Error, Result};
use crate::model::{BootOption, Device};
use crate::waitset::Waitset;

pub const MAX_STRING_LEN: u32 = 4096;
pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/petitboot-dev";

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() as u32 > MAX_STRING_LEN {
        return Err(Error::Protocol(format!(
            "string of {} bytes exceeds max length {MAX_STRING_LEN}",
            bytes.len()
        )));
    }
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_STRING_LEN {
        return Err(Error::Protocol(format!(
            "frame string length {len} exceeds max {MAX_STRING_LEN}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| Error::Protocol(format!("non-UTF-8 string: {e}")))
}

/// A single wire message, in the order fields appear on the wire (spec §4.J
/// table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    AddDevice {
        id: String,
        name: String,
        description: String,
        icon_file: String,
    },
    AddOption {
        id: String,
        name: String,
        description: String,
        icon_file: String,
        boot_image: String,
        initrd: String,
        boot_args: String,
    },
    RemoveDevice {
        id: String,
    },
    RemoveOption {
        id: String,
    },
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::AddDevice { .. } => 0,
            Frame::AddOption { .. } => 1,
            Frame::RemoveDevice { .. } => 2,
            Frame::RemoveOption { .. } => 3,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.tag()];
        match self {
            Frame::AddDevice { id, name, description, icon_file } => {
                write_string(&mut buf, id)?;
                write_string(&mut buf, name)?;
                write_string(&mut buf, description)?;
                write_string(&mut buf, icon_file)?;
            }
            Frame::AddOption {
                id,
                name,
                description,
                icon_file,
                boot_image,
                initrd,
                boot_args,
            } => {
                write_string(&mut buf, id)?;
                write_string(&mut buf, name)?;
                write_string(&mut buf, description)?;
                write_string(&mut buf, icon_file)?;
                write_string(&mut buf, boot_image)?;
                write_string(&mut buf, initrd)?;
                write_string(&mut buf, boot_args)?;
            }
            Frame::RemoveDevice { id } | Frame::RemoveOption { id } => {
                write_string(&mut buf, id)?;
            }
        }
        Ok(buf)
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Frame> {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        Ok(match tag[0] {
            0 => Frame::AddDevice {
                id: read_string(r)?,
                name: read_string(r)?,
                description: read_string(r)?,
                icon_file: read_string(r)?,
            },
            1 => Frame::AddOption {
                id: read_string(r)?,
                name: read_string(r)?,
                description: read_string(r)?,
                icon_file: read_string(r)?,
                boot_image: read_string(r)?,
                initrd: read_string(r)?,
                boot_args: read_string(r)?,
            },
            2 => Frame::RemoveDevice { id: read_string(r)? },
            3 => Frame::RemoveOption { id: read_string(r)? },
            other => return Err(Error::Protocol(format!("unknown action tag {other}"))),
        })
    }

    pub fn add_device(device: &Device) -> Frame {
        Frame::AddDevice {
            id: device.id.clone(),
            name: device.name.clone().unwrap_or_default(),
            description: device.description.clone().unwrap_or_default(),
            icon_file: device.icon.clone().unwrap_or_default(),
        }
    }

    pub fn remove_device(device_id: &str) -> Frame {
        Frame::RemoveDevice { id: device_id.to_string() }
    }

    pub fn remove_option(option_id: &str) -> Frame {
        Frame::RemoveOption { id: option_id.to_string() }
    }

    /// Builds an `AddOption` frame. Callers only emit this once every
    /// resource the option references has resolved (spec §7's "retained
    /// but not published" rule for `MissingResource`).
    pub fn add_option(option_id: &str, option: &BootOption) -> Frame {
        let resource_str = |r: &crate::resource::Resource| -> String {
            r.resolved_path()
                .map(|p| p.to_string_lossy().into_owned())
                .or_else(|| r.resolved_url().map(|u| u.to_string()))
                .unwrap_or_default()
        };
        Frame::AddOption {
            id: option_id.to_string(),
            name: option.name.clone(),
            description: option.description.clone().unwrap_or_default(),
            icon_file: option.icon.clone().unwrap_or_default(),
            boot_image: resource_str(&option.boot_image),
            initrd: option.initrd.as_ref().map(&resource_str).unwrap_or_default(),
            boot_args: option.args.clone().unwrap_or_default(),
        }
    }
}

struct Client {
    fd: OwnedFd,
    out_queue: Vec<u8>,
    closed: bool,
}

/// Server side of the IPC protocol. Accepts UI connections on a listening
/// socket, replays the current device/option state to each new client
/// (oldest device first, each device's options immediately following its
/// `AddDevice`, per invariant 2), and thereafter broadcasts live
/// add/remove frames to every connected client. Purely outbound: per
/// spec §4.J clients only read this socket, so a disconnected or
/// misbehaving client is simply dropped the next time a write to it
/// fails, rather than tracked via a read side.
pub struct IpcServer {
    socket_path: PathBuf,
    clients: Rc<std::cell::RefCell<Vec<Client>>>,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer")
            .field("socket_path", &self.socket_path)
            .field("clients", &self.clients.borrow().len())
            .finish()
    }
}

impl IpcServer {
    /// Bind the listening socket and register its accept readiness onto
    /// `waitset`. Removes any stale socket file left behind by a previous,
    /// uncleanly-terminated instance. Every newly accepted client is
    /// immediately sent the full current device/option state from
    /// `registry` before joining the broadcast set.
    pub fn bind(
        path: impl AsRef<Path>,
        waitset: &mut Waitset,
        registry: Rc<std::cell::RefCell<crate::registry::Registry>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path).map_err(Error::Io)?;
        }
        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Fatal(format!("bind {}: {e}", path.display())))?;
        listener.set_nonblocking(true).map_err(Error::Io)?;

        let clients: Rc<std::cell::RefCell<Vec<Client>>> = Default::default();
        let accept_clients = clients.clone();
        let poll_fd: OwnedFd = listener
            .try_clone()
            .map_err(Error::Io)?
            .into();
        waitset.register_io(poll_fd, PollFlags::IN, move |_revents| {
            while let Ok((stream, _addr)) = listener.accept() {
                stream.set_nonblocking(true).ok();
                let mut client = Client {
                    fd: stream.into(),
                    out_queue: Vec::new(),
                    closed: false,
                };
                replay_state(&mut client, &registry.borrow());
                flush_client(&mut client);
                if !client.closed {
                    accept_clients.borrow_mut().push(client);
                }
            }
            false
        });

        Ok(Self { socket_path: path, clients })
    }

    /// Broadcast a frame to every currently connected client.
    pub fn broadcast(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        let mut clients = self.clients.borrow_mut();
        for client in clients.iter_mut() {
            client.out_queue.extend_from_slice(&bytes);
            flush_client(client);
        }
        clients.retain(|c| !c.closed);
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Send the full device/option state to a freshly connected client, in
/// registry order, each device's options immediately following it
/// (invariant 2). Only resources that are fully resolved are published
/// (spec §7's "retained but not published" rule).
fn replay_state(client: &mut Client, registry: &crate::registry::Registry) {
    for device in registry.for_each() {
        let d = device.borrow();
        let frame = Frame::add_device(&d);
        let Ok(bytes) = frame.encode() else { continue };
        client.out_queue.extend_from_slice(&bytes);
        for (opt_index, option) in d.options().iter().enumerate() {
            if !option.is_publishable() {
                continue;
            }
            let option_id = format!("{}/{opt_index}", d.id);
            let frame = Frame::add_option(&option_id, option);
            if let Ok(bytes) = frame.encode() {
                client.out_queue.extend_from_slice(&bytes);
            }
        }
    }
}

#[allow(unsafe_code)]
fn flush_client(client: &mut Client) {
    use std::os::fd::AsRawFd;
    while !client.out_queue.is_empty() {
        let raw = client.fd.as_raw_fd();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) };
        match nix::unistd::write(borrowed, &client.out_queue) {
            Ok(0) => {
                client.closed = true;
                break;
            }
            Ok(n) => {
                client.out_queue.drain(..n);
            }
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(_) => {
                client.closed = true;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_5_exact_wire_bytes() {
        let device_frame = Frame::AddDevice {
            id: "d1".into(),
            name: "D".into(),
            description: String::new(),
            icon_file: String::new(),
        };
        let option_frame = Frame::AddOption {
            id: "o1".into(),
            name: "O".into(),
            description: String::new(),
            icon_file: String::new(),
            boot_image: "/k".into(),
            initrd: String::new(),
            boot_args: String::new(),
        };

        let mut expected = vec![0x00];
        expected.extend_from_slice(&[0, 0, 0, 2]);
        expected.extend_from_slice(b"d1");
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(b"D");
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);

        expected.push(0x01);
        expected.extend_from_slice(&[0, 0, 0, 2]);
        expected.extend_from_slice(b"o1");
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(b"O");
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 2]);
        expected.extend_from_slice(b"/k");
        expected.extend_from_slice(&[0, 0, 0, 0]);
        expected.extend_from_slice(&[0, 0, 0, 0]);

        let mut actual = device_frame.encode().unwrap();
        actual.extend(option_frame.encode().unwrap());
        assert_eq!(actual, expected);
    }

    #[test]
    fn roundtrips_through_decode() {
        let frame = Frame::AddOption {
            id: "o1".into(),
            name: "Option".into(),
            description: "desc".into(),
            icon_file: "icon.png".into(),
            boot_image: "/vmlinuz".into(),
            initrd: "/initrd".into(),
            boot_args: "console=hvc0".into(),
        };
        let bytes = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Frame::decode(&mut cursor).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn string_over_max_length_is_rejected() {
        let huge = "a".repeat(MAX_STRING_LEN as usize + 1);
        let frame = Frame::RemoveDevice { id: huge };
        assert!(matches!(frame.encode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn empty_string_encodes_as_four_zero_bytes() {
        let frame = Frame::RemoveDevice { id: String::new() };
        assert_eq!(frame.encode().unwrap(), vec![2, 0, 0, 0, 0]);
    }

    #[test]
    fn replay_emits_device_before_its_publishable_options() {
        use crate::model::{BootOption, Classification};
        use crate::registry::Registry;
        use crate::resource::Resource;
        use crate::url::PbUrl;
        use std::cell::RefCell;

        let mut registry = Registry::new();
        let mut dev = Device::new("d1", Classification::Disk);
        let published = BootOption::new("Published", Resource::Url(PbUrl::parse("http://h/vmlinuz").unwrap()));
        let unpublished = BootOption::new(
            "Unpublished",
            Resource::unresolved_devspec(crate::resource::Selector::AnyWithFile, "/vmlinuz"),
        );
        dev.push_option(Rc::new(published));
        dev.push_option(Rc::new(unpublished));
        registry.add(Rc::new(RefCell::new(dev)));

        let mut client = Client {
            fd: std::os::unix::net::UnixStream::pair().unwrap().0.into(),
            out_queue: Vec::new(),
            closed: false,
        };
        replay_state(&mut client, &registry);

        let mut cursor = std::io::Cursor::new(client.out_queue);
        let first = Frame::decode(&mut cursor).unwrap();
        assert!(matches!(first, Frame::AddDevice { ref id, .. } if id == "d1"));
        let second = Frame::decode(&mut cursor).unwrap();
        assert!(matches!(second, Frame::AddOption { ref name, .. } if name == "Published"));
        // the unresolved option never gets a frame: cursor is now exhausted.
        assert!(Frame::decode(&mut cursor).is_err());
    }
}
