// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Driver name that requires a `remote_device` reference.
pub const REMOTE_PCI_DRIVER: &str = "remote-pci-dev";

/// Well-known name of the remote device executable.
pub const DEFAULT_REMOTE_EXECUTABLE: &str = "labwired-remote";

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000_000;
pub const DEFAULT_HEARTBEAT_MAX_MISSED: u32 = 3;
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;

/// Number of base address registers a PCI function can expose.
pub const PCI_NUM_BARS: u8 = 6;

/// Largest region a 32-bit bar register can decode.
pub const MAX_BAR_SIZE: u64 = 1 << 31;

fn default_schema_version() -> String {
    "1.0".to_string()
}

fn default_driver() -> String {
    REMOTE_PCI_DRIVER.to_string()
}

fn default_reply_timeout_ms() -> Option<u64> {
    Some(DEFAULT_REPLY_TIMEOUT_MS)
}

fn default_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_max_missed() -> u32 {
    DEFAULT_HEARTBEAT_MAX_MISSED
}

fn default_executable() -> String {
    DEFAULT_REMOTE_EXECUTABLE.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive unanswered pings after which a device is evicted.
    #[serde(default = "default_max_missed")]
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_missed: DEFAULT_HEARTBEAT_MAX_MISSED,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Directory holding the remote executable. Defaults to the directory
    /// of the running host binary.
    #[serde(default)]
    pub exec_dir: Option<PathBuf>,
    #[serde(default = "default_executable")]
    pub executable: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            exec_dir: None,
            executable: DEFAULT_REMOTE_EXECUTABLE.to_string(),
        }
    }
}

impl RemoteConfig {
    /// Resolves the directory the remote executable is looked up in.
    pub fn resolved_exec_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.exec_dir {
            return Ok(dir.clone());
        }
        let exe = std::env::current_exe().context("Failed to resolve host executable path")?;
        exe.parent()
            .map(Path::to_path_buf)
            .context("Host executable has no parent directory")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarKind {
    #[serde(alias = "mmio")]
    Memory,
    #[serde(alias = "pio")]
    Io,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BarConfig {
    pub index: u8,
    pub kind: BarKind,
    pub size: String, // e.g. "4KB"
    #[serde(default)]
    pub base: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub remote_device: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub managed: bool,
    /// Pid of an externally owned remote process (managed mode).
    #[serde(default)]
    pub pid: Option<String>,
    /// Socket of an externally owned remote process (managed mode).
    #[serde(default)]
    pub socket: Option<PathBuf>,
    #[serde(default)]
    pub interrupt_pin: u8,
    #[serde(default)]
    pub bars: Vec<BarConfig>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxyManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// Upper bound on waiting for a remote reply. `null` waits forever.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: Option<u64>,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for ProxyManifest {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            reply_timeout_ms: default_reply_timeout_ms(),
            heartbeat: HeartbeatConfig::default(),
            remote: RemoteConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl ProxyManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open proxy manifest at {:?}", path.as_ref()))?;
        let manifest: Self =
            serde_yaml::from_reader(f).context("Failed to parse Proxy Manifest YAML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let manifest: Self =
            serde_yaml::from_str(contents).context("Failed to parse Proxy Manifest YAML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.heartbeat.interval_ms == 0 {
            anyhow::bail!("'heartbeat.interval_ms' must be greater than zero");
        }

        if self.reply_timeout_ms == Some(0) {
            anyhow::bail!("'reply_timeout_ms' must be greater than zero, or null to wait forever");
        }

        if self.remote.executable.trim().is_empty() {
            anyhow::bail!("'remote.executable' cannot be empty");
        }

        let mut ids = HashSet::new();
        for dev in &self.devices {
            dev.validate()?;
            if !ids.insert(dev.id.as_str()) {
                anyhow::bail!("Duplicate device id '{}'", dev.id);
            }
        }

        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Device id cannot be empty");
        }

        if self.driver == REMOTE_PCI_DRIVER
            && self.remote_device.as_deref().map_or(true, |r| r.is_empty())
        {
            anyhow::bail!(
                "Device '{}': driver '{}' requires a 'remote_device' id",
                self.id,
                REMOTE_PCI_DRIVER
            );
        }

        if self.managed {
            if self.pid.is_none() {
                anyhow::bail!("Device '{}': managed devices require 'pid'", self.id);
            }
            if self.socket.is_none() {
                anyhow::bail!("Device '{}': managed devices require 'socket'", self.id);
            }
            if !self.command.trim().is_empty() {
                tracing::warn!(
                    "Device '{}': command is ignored for managed devices",
                    self.id
                );
            }
        }

        if self.interrupt_pin > 4 {
            anyhow::bail!(
                "Device '{}': interrupt_pin {} out of range (0-4)",
                self.id,
                self.interrupt_pin
            );
        }

        let mut seen = HashSet::new();
        for bar in &self.bars {
            if bar.index >= PCI_NUM_BARS {
                anyhow::bail!("Device '{}': bar index {} out of range", self.id, bar.index);
            }
            if !seen.insert(bar.index) {
                anyhow::bail!("Device '{}': bar {} declared twice", self.id, bar.index);
            }
            bar.region_size()
                .with_context(|| format!("Device '{}': bar {}", self.id, bar.index))?;
        }

        Ok(())
    }
}

impl BarConfig {
    /// Parses the size and checks that the region and its base fit a 32-bit
    /// bar register. The base must be aligned to the decoded region.
    pub fn region_size(&self) -> Result<u64> {
        let size = parse_size(&self.size).context("invalid size")?;
        if size == 0 {
            anyhow::bail!("zero size");
        }
        if size > MAX_BAR_SIZE {
            anyhow::bail!("size {:#x} exceeds {:#x}", size, MAX_BAR_SIZE);
        }
        if let Some(base) = self.base {
            if base > u32::MAX as u64 {
                anyhow::bail!("base {:#x} is above 4 GiB", base);
            }
            let min = if self.kind == BarKind::Memory { 16 } else { 4 };
            let align = size.max(min).next_power_of_two();
            if base % align != 0 {
                anyhow::bail!("base {:#x} is not aligned to {:#x}", base, align);
            }
        }
        Ok(size)
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u64(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).with_context(|| format!("Invalid hex number '{}'", s))
    } else {
        trimmed
            .parse::<u64>()
            .with_context(|| format!("Invalid number '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_manifest_defaults() {
        let m = ProxyManifest::from_yaml_str("devices: []").unwrap();
        assert_eq!(m.schema_version, "1.0");
        assert_eq!(m.reply_timeout_ms, Some(DEFAULT_REPLY_TIMEOUT_MS));
        assert_eq!(m.heartbeat.interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert_eq!(m.remote.executable, DEFAULT_REMOTE_EXECUTABLE);
    }

    #[test]
    fn test_remote_pci_requires_remote_device() {
        let yaml = r#"
devices:
  - id: lsi0
    driver: remote-pci-dev
"#;
        let err = ProxyManifest::from_yaml_str(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("remote_device"));
    }

    #[test]
    fn test_other_driver_does_not_require_remote_device() {
        let yaml = r#"
devices:
  - id: custom0
    driver: custom-dev
"#;
        assert!(ProxyManifest::from_yaml_str(yaml).is_ok());
    }

    #[test]
    fn test_managed_requires_pid_and_socket() {
        let yaml = r#"
devices:
  - id: lsi0
    remote_device: rdev0
    managed: true
    pid: "4242"
"#;
        let err = ProxyManifest::from_yaml_str(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("socket"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
devices:
  - id: a
    remote_device: r
  - id: a
    remote_device: r
"#;
        assert!(ProxyManifest::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_bar_validation() {
        let yaml = r#"
devices:
  - id: a
    remote_device: r
    bars:
      - { index: 6, kind: memory, size: "4KB" }
"#;
        assert!(ProxyManifest::from_yaml_str(yaml).is_err());

        let yaml = r#"
devices:
  - id: a
    remote_device: r
    bars:
      - { index: 0, kind: mmio, size: "4KB", base: 0x1000 }
      - { index: 1, kind: io, size: "256B" }
"#;
        let m = ProxyManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(m.devices[0].bars[0].kind, BarKind::Memory);
        assert_eq!(m.devices[0].bars[1].kind, BarKind::Io);
        assert!(parse_size(&m.devices[0].bars[0].size).unwrap() >= 4000);
    }

    #[test]
    fn test_options_keep_json_types() {
        let yaml = r#"
devices:
  - id: a
    remote_device: r
    options:
      drive: disk0
      queues: 4
"#;
        let m = ProxyManifest::from_yaml_str(yaml).unwrap();
        let options = &m.devices[0].options;
        assert_eq!(options["drive"], serde_json::json!("disk0"));
        assert_eq!(options["queues"], serde_json::json!(4));
    }

    #[test]
    fn test_bar_base_must_fit_register() {
        let bar = |base: u64, size: &str| BarConfig {
            index: 0,
            kind: BarKind::Memory,
            size: size.to_string(),
            base: Some(base),
        };
        assert_eq!(bar(0x1000, "4KiB").region_size().unwrap(), 4096);
        assert_eq!(bar(0x8000_0000, "2GiB").region_size().unwrap(), 1 << 31);

        let err = bar(0x1_0000_1000, "4KiB").region_size().unwrap_err();
        assert!(err.to_string().contains("above 4 GiB"));
        assert!(bar(0x1004, "4KiB").region_size().is_err());
        assert!(bar(0, "4GiB").region_size().is_err());
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0x10").unwrap(), 16);
        assert_eq!(parse_u64("42").unwrap(), 42);
        assert!(parse_u64("zz").is_err());
    }
}
