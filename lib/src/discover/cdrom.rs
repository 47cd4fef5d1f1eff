//! CD-ROM tray and media-change handling (spec §4.I, §9 "CDROM state
//! machine"), grounded in `discover/cdrom.c`'s three raw ioctls:
//! `CDROM_CLEAR_OPTIONS` (disable autoclose/lock at discovery time),
//! `CDROM_DRIVE_STATUS` (media-present probe), and `CDROM_LOCKDOOR` +
//! `CDROMEJECT` (eject). `libc::ioctl` stands in for the original's direct
//! `<linux/cdrom.h>` syscalls since no safe wrapper for this ioctl family
//! exists in `nix`/`rustix`.

use std::ffi::CString;

use libc::{c_int, c_ulong};

const CDROM_LOCKDOOR: c_ulong = 0x5329;
const CDROM_DRIVE_STATUS: c_ulong = 0x5326;
const CDROMEJECT: c_ulong = 0x5309;
const CDROM_CLEAR_OPTIONS: c_ulong = 0x5321;
const CDO_LOCK: c_int = 0x1;
const CDO_AUTO_CLOSE: c_int = 0x2;
/// `CDSL_CURRENT`: the magic slot index meaning "the currently loaded
/// disc", used by changer-capable drives and harmless on ordinary ones.
const CDSL_CURRENT: c_int = 0x7fff_fffe;
const CDS_NO_DISC: c_int = 1;
const CDS_TRAY_OPEN: c_int = 2;
const CDS_DRIVE_NOT_READY: c_int = 3;
const CDS_DISC_OK: c_int = 4;

/// Tray/media state of one optical [`crate::model::Device`], attached
/// per-device by the discovery driver (spec §9: "tray-lock, media-present,
/// eject-request and media-change map naturally to a four-state machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayState {
    /// Tray closed, media present, device mounted/published normally.
    Closed,
    /// Tray physically open (eject request acted on or detected).
    Open,
    /// Tray closed but no disc loaded.
    NoDisc,
    /// Drive reports not-ready (spinning up, or a bad disc).
    NotReady,
}

impl TrayState {
    /// Initial state for a freshly discovered optical device: present
    /// media that passed `media_present()` implies `Closed`.
    pub fn initial() -> Self {
        TrayState::Closed
    }
}

#[allow(unsafe_code)]
fn cdrom_open(devpath: &str) -> Option<c_int> {
    let path = CString::new(devpath).ok()?;
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
    if fd < 0 {
        tracing::debug!(devpath, "cdrom_open: can't open device");
        return None;
    }
    Some(fd)
}

#[allow(unsafe_code)]
fn cdrom_close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// Disable autoclose (so a later `mount()` never closes the tray) and the
/// door lock (so the lock status doesn't change across open/close),
/// matching `cdrom_init`.
#[allow(unsafe_code)]
pub fn init(devpath: &str) {
    let Some(fd) = cdrom_open(devpath) else { return };
    let rc = unsafe { libc::ioctl(fd, CDROM_CLEAR_OPTIONS, CDO_LOCK | CDO_AUTO_CLOSE) };
    if rc < 0 {
        tracing::debug!(devpath, "CLEAR CDO_LOCK|CDO_AUTO_CLOSE failed");
    }
    cdrom_close(fd);
}

/// True only when `CDROM_DRIVE_STATUS` reports `CDS_DISC_OK`, matching
/// `cdrom_media_present`.
pub fn media_present(devpath: &str) -> bool {
    drive_status(devpath) == TrayState::Closed
}

/// Full `CDROM_DRIVE_STATUS` read, mapped onto [`TrayState`] rather than
/// collapsed to a present/absent bool; used on a `DISK_MEDIA_CHANGE`
/// event, where "not ready" (drive spinning up, or a bad disc) is a
/// distinct outcome from "no disc loaded" and from "tray open".
#[allow(unsafe_code)]
pub fn drive_status(devpath: &str) -> TrayState {
    let Some(fd) = cdrom_open(devpath) else { return TrayState::NoDisc };
    let rc = unsafe { libc::ioctl(fd, CDROM_DRIVE_STATUS, CDSL_CURRENT) };
    cdrom_close(fd);
    match rc {
        CDS_DISC_OK => TrayState::Closed,
        CDS_TRAY_OPEN => TrayState::Open,
        CDS_DRIVE_NOT_READY => TrayState::NotReady,
        CDS_NO_DISC => TrayState::NoDisc,
        _ => TrayState::NoDisc,
    }
}

/// Unlock the door then eject, matching `cdrom_eject`.
#[allow(unsafe_code)]
pub fn eject(devpath: &str) {
    let Some(fd) = cdrom_open(devpath) else { return };
    if unsafe { libc::ioctl(fd, CDROM_LOCKDOOR, 0) } < 0 {
        tracing::debug!(devpath, "CDROM_LOCKDOOR(unlock) failed");
    }
    if unsafe { libc::ioctl(fd, CDROMEJECT, 0) } < 0 {
        tracing::debug!(devpath, "CDROMEJECT failed");
    }
    cdrom_close(fd);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_closed() {
        assert_eq!(TrayState::initial(), TrayState::Closed);
    }

    #[test]
    fn nonexistent_device_reports_no_media() {
        assert!(!media_present("/dev/nonexistent-petitboot-test-cdrom"));
    }

    #[test]
    fn unopenable_device_reports_no_disc_status() {
        assert_eq!(drive_status("/dev/nonexistent-petitboot-test-cdrom"), TrayState::NoDisc);
    }

    #[test]
    fn init_and_eject_on_missing_device_are_harmless() {
        init("/dev/nonexistent-petitboot-test-cdrom");
        eject("/dev/nonexistent-petitboot-test-cdrom");
    }
}
