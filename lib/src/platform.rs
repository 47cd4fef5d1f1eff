//! Platform interface (spec §4.K): persisting the user's boot-config
//! choices (autoboot, network config) against whatever storage backend
//! the running firmware provides, plus a read-only "system info" probe.
//!
//! Grounded in `lib/pb-config/pb-config.c` and its three backends
//! (`storage-powerpc-nvram.c`, `storage-test.c`, and the EFI-variable path
//! described in spec §4.K but absent from the original source — it only
//! ever ran on PowerPC OPAL/OpenFirmware hardware). The original's single
//! `load`/`save` pair on `struct config_storage` becomes the
//! [`PlatformBackend`] trait here; `Config` mirrors `struct config` with
//! the talloc-owned arrays replaced by `Vec`.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::process::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMethod {
    Dhcp,
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub hwaddr: [u8; 6],
    pub ignore: bool,
    pub method: ConfigMethod,
    pub address: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub autoboot_enabled: bool,
    pub autoboot_timeout_sec: u32,
    pub interfaces: Vec<InterfaceConfig>,
    pub dns_servers: Vec<String>,
}

/// System information a UI might display (firmware identity, not boot
/// configuration). Spec §4.K names "system identity, BMC MAC, firmware
/// versions" as the capability's scope; §6 further pins the BMC sensor
/// source to `/proc/device-tree`, so those two fields are always populated
/// the same way regardless of which storage backend is selected (see
/// [`system_identity`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SysInfo {
    pub platform_name: String,
    pub interfaces: Vec<InterfaceConfig>,
    /// From `dmidecode -s system-version` (or equivalent), if the tool is
    /// present and the call succeeds.
    pub firmware_version: Option<String>,
    /// IPMI sensor readings under `/proc/device-tree/bmc/sensors/sensor@*`,
    /// keyed by the sensor's directory name, value the big-endian u32
    /// `ipmi-sensor-type` payload.
    pub bmc_sensors: Vec<(String, u32)>,
}

/// Abstract boot-configuration storage. The core treats every backend as
/// an opaque source/sink (spec §4.K): "it is legal for the backend to be
/// a no-op" — see [`NullBackend`].
pub trait PlatformBackend: std::fmt::Debug {
    fn load_config(&self) -> Result<Config>;
    fn save_config(&self, config: &Config) -> Result<()>;
    fn get_sysinfo(&self) -> Result<SysInfo>;
}

/// The known `petitboot,*` NVRAM parameter names (`storage-powerpc-nvram.c`'s
/// `known_params`); any other line in `nvram --print-config`'s output is
/// ignored, matching `param_is_known`.
const KNOWN_PARAMS: &[&str] = &["auto-boot?", "petitboot,network"];

/// POWER/OPAL NVRAM backend: `nvram --print-config --partition=common` to
/// read, `nvram --update-config` to write, exactly as the original's
/// `storage-powerpc-nvram.c` shells out.
#[derive(Debug, Clone)]
pub struct NvramBackend {
    partition: String,
}

impl NvramBackend {
    pub fn new() -> Self {
        Self { partition: "common".to_string() }
    }
}

impl Default for NvramBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hwaddr(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(out)
}

/// Parse one whitespace-separated `hwaddr,method[,addr[,gateway]]` token
/// from `petitboot,network`, matching `parse_one_interface_config`.
fn parse_interface_token(tok: &str) -> Option<InterfaceConfig> {
    let mut fields = tok.split(',');
    let hwaddr = parse_hwaddr(fields.next()?)?;
    let method_field = fields.next().unwrap_or("");
    if method_field.is_empty() || method_field == "ignore" {
        return Some(InterfaceConfig {
            hwaddr,
            ignore: true,
            method: ConfigMethod::Dhcp,
            address: None,
            gateway: None,
        });
    }
    match method_field {
        "dhcp" => Some(InterfaceConfig {
            hwaddr,
            ignore: false,
            method: ConfigMethod::Dhcp,
            address: None,
            gateway: None,
        }),
        "static" => {
            let address = fields.next()?.to_string();
            let gateway = fields.next().map(str::to_string);
            Some(InterfaceConfig {
                hwaddr,
                ignore: false,
                method: ConfigMethod::Static,
                address: Some(address),
                gateway,
            })
        }
        _ => None,
    }
}

/// Parse the `nvram --print-config` text body: two header lines, then
/// `name=value` lines, matching `parse_nvram_params`.
fn parse_nvram_output(text: &str) -> Vec<(String, String)> {
    let mut lines = text.lines();
    // discard the "<partition> partition" header and its "----" underline.
    let _ = lines.next();
    let _ = lines.next();
    let mut params = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once('=') else { continue };
        if name.is_empty() {
            continue;
        }
        if KNOWN_PARAMS.contains(&name) {
            params.push((name.to_string(), value.to_string()));
        }
    }
    params
}

fn populate_config(params: &[(String, String)]) -> Config {
    let mut config = Config {
        autoboot_enabled: true,
        autoboot_timeout_sec: 10,
        interfaces: Vec::new(),
        dns_servers: Vec::new(),
    };
    for (name, value) in params {
        match name.as_str() {
            "auto-boot?" => config.autoboot_enabled = value != "false",
            "petitboot,network" => {
                for tok in value.split(' ') {
                    if tok.is_empty() {
                        continue;
                    }
                    if let Some(rest) = tok.strip_prefix("dns,").or_else(|| tok.strip_prefix("DNS,")) {
                        config.dns_servers.extend(rest.split(',').filter(|s| !s.is_empty()).map(str::to_string));
                    } else if let Some(iface) = parse_interface_token(tok) {
                        config.interfaces.push(iface);
                    }
                }
            }
            _ => {}
        }
    }
    config
}

fn format_hwaddr(hw: &[u8; 6]) -> String {
    hw.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Serialize back to the `petitboot,network` value format, the inverse of
/// [`populate_config`].
fn format_network_value(config: &Config) -> String {
    let mut tokens: Vec<String> = config
        .interfaces
        .iter()
        .map(|iface| {
            if iface.ignore {
                format!("{},ignore", format_hwaddr(&iface.hwaddr))
            } else {
                match iface.method {
                    ConfigMethod::Dhcp => format!("{},dhcp", format_hwaddr(&iface.hwaddr)),
                    ConfigMethod::Static => {
                        let addr = iface.address.as_deref().unwrap_or("");
                        match &iface.gateway {
                            Some(gw) => format!("{},static,{addr},{gw}", format_hwaddr(&iface.hwaddr)),
                            None => format!("{},static,{addr}", format_hwaddr(&iface.hwaddr)),
                        }
                    }
                }
            }
        })
        .collect();
    if !config.dns_servers.is_empty() {
        tokens.push(format!("dns,{}", config.dns_servers.join(",")));
    }
    tokens.join(" ")
}

impl PlatformBackend for NvramBackend {
    fn load_config(&self) -> Result<Config> {
        let output = Task::new("nvram --print-config", "nvram")
            .args(["--print-config", "--partition", self.partition.as_str()])
            .read()?;
        Ok(populate_config(&parse_nvram_output(&output)))
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        let autoboot = if config.autoboot_enabled { "true" } else { "false" };
        let autoboot_arg = format!("auto-boot?={autoboot}");
        Task::run_simple(
            "nvram --update-config auto-boot?",
            "nvram",
            ["--update-config", autoboot_arg.as_str(), "--partition", self.partition.as_str()],
        )?;
        let network_arg = format!("petitboot,network={}", format_network_value(config));
        Task::run_simple(
            "nvram --update-config petitboot,network",
            "nvram",
            ["--update-config", network_arg.as_str(), "--partition", self.partition.as_str()],
        )
    }

    fn get_sysinfo(&self) -> Result<SysInfo> {
        let config = self.load_config()?;
        let (firmware_version, bmc_sensors) = system_identity();
        Ok(SysInfo {
            platform_name: "powerpc-nvram".to_string(),
            interfaces: config.interfaces,
            firmware_version,
            bmc_sensors,
        })
    }
}

/// EFI-variable backend: each config value is its own variable under
/// `/sys/firmware/efi/efivars/<name>-<guid>`, following the kernel's
/// efivarfs layout (a 4-byte little-endian attributes word followed by the
/// raw payload). Spec §4.K names this backend but the original C source
/// never implemented it (PowerPC-only); the wire shape here follows the
/// kernel's documented efivarfs ABI rather than any petitboot precedent.
#[derive(Debug, Clone)]
pub struct EfiVarBackend {
    efivars_dir: PathBuf,
    guid: String,
}

const EFI_VAR_ATTR_NON_VOLATILE: u32 = 0x1;
const EFI_VAR_ATTR_BOOTSERVICE_ACCESS: u32 = 0x2;
const EFI_VAR_ATTR_RUNTIME_ACCESS: u32 = 0x4;

impl EfiVarBackend {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            efivars_dir: PathBuf::from("/sys/firmware/efi/efivars"),
            guid: guid.into(),
        }
    }

    fn var_path(&self, name: &str) -> PathBuf {
        self.efivars_dir.join(format!("{name}-{}", self.guid))
    }

    fn read_var(&self, name: &str) -> Result<Option<String>> {
        let path = self.var_path(name);
        match std::fs::read(&path) {
            Ok(bytes) if bytes.len() >= 4 => {
                Ok(Some(String::from_utf8_lossy(&bytes[4..]).trim_end_matches('\0').to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_var(&self, name: &str, value: &str) -> Result<()> {
        let attrs = EFI_VAR_ATTR_NON_VOLATILE | EFI_VAR_ATTR_BOOTSERVICE_ACCESS | EFI_VAR_ATTR_RUNTIME_ACCESS;
        let mut payload = attrs.to_le_bytes().to_vec();
        payload.extend_from_slice(value.as_bytes());
        std::fs::write(self.var_path(name), payload).map_err(Error::Io)
    }
}

impl PlatformBackend for EfiVarBackend {
    fn load_config(&self) -> Result<Config> {
        let autoboot_enabled = self
            .read_var("PetitbootAutoBoot")?
            .map(|v| v != "false")
            .unwrap_or(true);
        let autoboot_timeout_sec = self
            .read_var("PetitbootAutoBootTimeout")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);
        Ok(Config {
            autoboot_enabled,
            autoboot_timeout_sec,
            interfaces: Vec::new(),
            dns_servers: Vec::new(),
        })
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        self.write_var("PetitbootAutoBoot", if config.autoboot_enabled { "true" } else { "false" })?;
        self.write_var("PetitbootAutoBootTimeout", &config.autoboot_timeout_sec.to_string())
    }

    fn get_sysinfo(&self) -> Result<SysInfo> {
        let (firmware_version, bmc_sensors) = system_identity();
        Ok(SysInfo {
            platform_name: "efi".to_string(),
            interfaces: Vec::new(),
            firmware_version,
            bmc_sensors,
        })
    }
}

/// No-op backend: "it is legal for the backend to be a no-op" (spec §4.K).
/// Also the backend for hosts with neither NVRAM nor EFI variables.
#[derive(Debug, Clone, Default)]
pub struct NullBackend;

impl PlatformBackend for NullBackend {
    fn load_config(&self) -> Result<Config> {
        Ok(Config::default())
    }
    fn save_config(&self, _config: &Config) -> Result<()> {
        Ok(())
    }
    fn get_sysinfo(&self) -> Result<SysInfo> {
        let (firmware_version, bmc_sensors) = system_identity();
        Ok(SysInfo { firmware_version, bmc_sensors, ..SysInfo::default() })
    }
}

/// In-memory test backend, matching `storage-test.c`: `load` returns
/// whatever `save` last stored, starting from a fixed seed configuration.
#[derive(Debug)]
pub struct TestBackend {
    state: std::cell::RefCell<Config>,
}

impl TestBackend {
    pub fn new() -> Self {
        let seed = Config {
            autoboot_enabled: true,
            autoboot_timeout_sec: 10,
            interfaces: vec![
                InterfaceConfig {
                    hwaddr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
                    ignore: false,
                    method: ConfigMethod::Dhcp,
                    address: None,
                    gateway: None,
                },
                InterfaceConfig {
                    hwaddr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x56],
                    ignore: false,
                    method: ConfigMethod::Static,
                    address: Some("192.168.0.2/24".to_string()),
                    gateway: Some("192.168.0.1".to_string()),
                },
            ],
            dns_servers: vec!["192.168.1.1".to_string(), "192.168.1.2".to_string()],
        };
        Self { state: std::cell::RefCell::new(seed) }
    }
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformBackend for TestBackend {
    fn load_config(&self) -> Result<Config> {
        Ok(self.state.borrow().clone())
    }
    fn save_config(&self, config: &Config) -> Result<()> {
        *self.state.borrow_mut() = config.clone();
        Ok(())
    }
    fn get_sysinfo(&self) -> Result<SysInfo> {
        let config = self.state.borrow();
        Ok(SysInfo {
            platform_name: "test".to_string(),
            interfaces: config.interfaces.clone(),
            firmware_version: None,
            bmc_sensors: Vec::new(),
        })
    }
}

/// Read every `/proc/device-tree/bmc/sensors/sensor@*/ipmi-sensor-type`
/// leaf under `device_tree_root`, matching spec §6's "Device-tree-derived
/// info is read from ... (big-endian u32 values)". Missing directory (most
/// hosts, and any non-BMC machine) yields an empty list rather than an
/// error: this is diagnostic information, never required for discovery.
fn read_bmc_sensors(device_tree_root: &std::path::Path) -> Vec<(String, u32)> {
    let sensors_dir = device_tree_root.join("bmc/sensors");
    let Ok(entries) = std::fs::read_dir(&sensors_dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("sensor@") {
            continue;
        }
        let leaf = entry.path().join("ipmi-sensor-type");
        let Ok(bytes) = std::fs::read(&leaf) else { continue };
        if bytes.len() < 4 {
            continue;
        }
        let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        out.push((name, value));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Firmware version via `dmidecode -s system-version`, one of the binary
/// collaborators spec §1 calls out as external. Absent on most dev hosts
/// and every container, so failure is silent (`None`), not an error.
fn read_firmware_version() -> Option<String> {
    Task::new("dmidecode -s system-version", "dmidecode")
        .quiet()
        .args(["-s", "system-version"])
        .read()
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// The platform-agnostic half of `get_sysinfo`: firmware version and BMC
/// sensor readings, shared across every [`PlatformBackend`] since neither
/// comes from the NVRAM/EFI config storage itself.
pub fn system_identity() -> (Option<String>, Vec<(String, u32)>) {
    (read_firmware_version(), read_bmc_sensors(std::path::Path::new("/proc/device-tree")))
}

/// Probe for a usable backend the way `petitboot-discover`'s `--platform`
/// flag's default does: prefer EFI variables if the efivarfs mount is
/// present, else fall back to NVRAM.
pub fn probe_default(efi_guid: &str) -> Box<dyn PlatformBackend> {
    if std::path::Path::new("/sys/firmware/efi/efivars").is_dir() {
        Box::new(EfiVarBackend::new(efi_guid))
    } else if std::path::Path::new("/proc/device-tree/rtas/nvram").exists() || which_nvram() {
        Box::new(NvramBackend::new())
    } else {
        Box::new(NullBackend)
    }
}

fn which_nvram() -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join("nvram").is_file())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvram_print_config_output() {
        let text = "common partition\n------------------\nauto-boot?=true\npetitboot,network=00:11:22:33:44:55,dhcp dns,8.8.8.8,8.8.4.4\nunrelated-param=xyz\n";
        let params = parse_nvram_output(text);
        let config = populate_config(&params);
        assert!(config.autoboot_enabled);
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].hwaddr, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(config.interfaces[0].method, ConfigMethod::Dhcp);
        assert_eq!(config.dns_servers, vec!["8.8.8.8", "8.8.4.4"]);
    }

    #[test]
    fn autoboot_false_disables_autoboot() {
        let text = "common partition\n------------------\nauto-boot?=false\n";
        let config = populate_config(&parse_nvram_output(text));
        assert!(!config.autoboot_enabled);
    }

    #[test]
    fn static_interface_round_trips_through_format_and_parse() {
        let config = Config {
            autoboot_enabled: true,
            autoboot_timeout_sec: 10,
            interfaces: vec![InterfaceConfig {
                hwaddr: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
                ignore: false,
                method: ConfigMethod::Static,
                address: Some("10.0.0.5/24".to_string()),
                gateway: Some("10.0.0.1".to_string()),
            }],
            dns_servers: vec![],
        };
        let value = format_network_value(&config);
        let parsed = parse_interface_token(value.split(' ').next().unwrap()).unwrap();
        assert_eq!(parsed.hwaddr, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(parsed.address.as_deref(), Some("10.0.0.5/24"));
        assert_eq!(parsed.gateway.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_backend_load_returns_last_saved() {
        let backend = TestBackend::new();
        let mut config = backend.load_config().unwrap();
        config.autoboot_enabled = false;
        backend.save_config(&config).unwrap();
        assert!(!backend.load_config().unwrap().autoboot_enabled);
    }

    #[test]
    fn null_backend_is_a_harmless_no_op() {
        let backend = NullBackend;
        assert!(backend.load_config().unwrap().interfaces.is_empty());
        backend.save_config(&Config::default()).unwrap();
    }

    #[test]
    fn missing_device_tree_yields_no_sensors() {
        assert!(read_bmc_sensors(std::path::Path::new("/nonexistent-petitboot-test-dt")).is_empty());
    }

    #[test]
    fn reads_big_endian_ipmi_sensor_type_leaves() {
        let root = tempfile::tempdir().unwrap();
        let sensor_dir = root.path().join("bmc/sensors/sensor@1");
        std::fs::create_dir_all(&sensor_dir).unwrap();
        std::fs::write(sensor_dir.join("ipmi-sensor-type"), 0x0000_0004u32.to_be_bytes()).unwrap();
        // A non-`sensor@*` sibling must be ignored.
        std::fs::create_dir_all(root.path().join("bmc/sensors/other")).unwrap();

        let sensors = read_bmc_sensors(root.path());
        assert_eq!(sensors, vec![("sensor@1".to_string(), 4)]);
    }
}
