// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use labwired_proxy_config::{parse_size, BarKind, ProxyManifest, REMOTE_PCI_DRIVER};

const FULL_MANIFEST: &str = r#"
schema_version: "1.0"
reply_timeout_ms: 2500
heartbeat:
  interval_ms: 1000000
  max_missed: 5
remote:
  exec_dir: /opt/labwired/bin
  executable: labwired-remote
devices:
  - id: lsi0
    driver: remote-pci-dev
    remote_device: rdev0
    command: "--reg 0x10=0x12345678"
    interrupt_pin: 1
    bars:
      - { index: 0, kind: memory, size: "4KiB", base: 0x1000 }
      - { index: 2, kind: io, size: "256B" }
    options:
      drive: disk0
  - id: ext0
    remote_device: rext0
    managed: true
    pid: "4242"
    socket: /run/labwired/ext0.sock
"#;

#[test]
fn test_full_manifest_parses() {
    let m = ProxyManifest::from_yaml_str(FULL_MANIFEST).unwrap();
    assert_eq!(m.reply_timeout_ms, Some(2500));
    assert_eq!(m.heartbeat.max_missed, 5);
    assert_eq!(
        m.remote.resolved_exec_dir().unwrap().to_str(),
        Some("/opt/labwired/bin")
    );

    let lsi = m.device("lsi0").unwrap();
    assert_eq!(lsi.driver, REMOTE_PCI_DRIVER);
    assert_eq!(lsi.bars.len(), 2);
    assert_eq!(lsi.bars[1].kind, BarKind::Io);
    assert_eq!(lsi.bars[1].base, None);
    assert_eq!(parse_size(&lsi.bars[0].size).unwrap(), 4096);

    let ext = m.device("ext0").unwrap();
    assert!(ext.managed);
    assert_eq!(ext.pid.as_deref(), Some("4242"));
    assert_eq!(ext.driver, REMOTE_PCI_DRIVER);
    assert!(m.device("missing").is_none());
}

#[test]
fn test_null_reply_timeout_waits_forever() {
    let m = ProxyManifest::from_yaml_str("reply_timeout_ms: null\ndevices: []").unwrap();
    assert_eq!(m.reply_timeout_ms, None);
}

#[test]
fn test_unknown_fields_rejected() {
    let yaml = r#"
devices:
  - id: a
    remote_device: r
    colour: blue
"#;
    assert!(ProxyManifest::from_yaml_str(yaml).is_err());
}

#[test]
fn test_unsupported_schema_version() {
    let err = ProxyManifest::from_yaml_str("schema_version: \"2.0\"").unwrap_err();
    assert!(format!("{:#}", err).contains("schema_version"));
}

#[test]
fn test_zero_interval_rejected() {
    let yaml = "heartbeat:\n  interval_ms: 0\n";
    assert!(ProxyManifest::from_yaml_str(yaml).is_err());
}

#[test]
fn test_zero_reply_timeout_rejected() {
    let err = ProxyManifest::from_yaml_str("reply_timeout_ms: 0\ndevices: []").unwrap_err();
    assert!(format!("{:#}", err).contains("reply_timeout_ms"));
}

#[test]
fn test_bar_base_above_4g_rejected() {
    let yaml = r#"
devices:
  - id: a
    remote_device: r
    bars:
      - { index: 0, kind: memory, size: "4KiB", base: 0x100001000 }
"#;
    let err = ProxyManifest::from_yaml_str(yaml).unwrap_err();
    assert!(format!("{:#}", err).contains("above 4 GiB"));
}

#[test]
fn test_interrupt_pin_range() {
    let yaml = r#"
devices:
  - id: a
    remote_device: r
    interrupt_pin: 5
"#;
    let err = ProxyManifest::from_yaml_str(yaml).unwrap_err();
    assert!(format!("{:#}", err).contains("interrupt_pin"));
}

#[test]
fn test_zero_sized_bar_rejected() {
    let yaml = r#"
devices:
  - id: a
    remote_device: r
    bars:
      - { index: 0, kind: memory, size: "0B" }
"#;
    assert!(ProxyManifest::from_yaml_str(yaml).is_err());
}

#[test]
fn test_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy.yaml");
    std::fs::write(&path, FULL_MANIFEST).unwrap();
    let m = ProxyManifest::from_file(&path).unwrap();
    assert_eq!(m.devices.len(), 2);

    let err = ProxyManifest::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to open proxy manifest"));
}
