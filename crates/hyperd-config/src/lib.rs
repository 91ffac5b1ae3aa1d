// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the hyperd daemon.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Directory holding per-VM runtime state, the key-value store and
    /// directory-backed container storage.
    #[serde(default = "Config::default_root")]
    pub root: PathBuf,

    pub kernel: PathBuf,
    pub initrd: PathBuf,

    #[serde(default)]
    pub bios: Option<PathBuf>,
    #[serde(default)]
    pub cbfs: Option<PathBuf>,

    #[serde(default)]
    pub hypervisor: Hypervisor,

    #[serde(default)]
    pub qmp: Qmp,

    #[serde(default)]
    pub vm: VmDefaults,

    #[serde(default)]
    pub network: Network,
}

impl Config {
    /// Constructs a new configuration object.
    ///
    /// Typically, the configuration is parsed from a config
    /// file via [`parse`], but this method allows an alternative
    /// mechanism for initialization.
    pub fn new<P: Into<PathBuf>>(root: P, kernel: P, initrd: P) -> Config {
        Config {
            root: root.into(),
            kernel: kernel.into(),
            initrd: initrd.into(),
            bios: None,
            cbfs: None,
            hypervisor: Hypervisor::default(),
            qmp: Qmp::default(),
            vm: VmDefaults::default(),
            network: Network::default(),
        }
    }

    fn default_root() -> PathBuf {
        PathBuf::from("/var/run/hyper")
    }

    pub fn vm_root(&self) -> PathBuf {
        self.root.join("vm")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    pub fn storage_root(&self) -> PathBuf {
        self.root.join("storage")
    }
}

#[derive(Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Hypervisor {
    /// Path to the hypervisor binary; looked up on `PATH` when unset.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Launch VMs in lazy mode, deferring device attachment to the
    /// hypervisor command line.
    #[serde(default)]
    pub lazy: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Qmp {
    #[serde(default = "Qmp::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "Qmp::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Attempts made at a single session step before the session fails.
    #[serde(default = "Qmp::default_max_step_attempts")]
    pub max_step_attempts: u32,
}

impl Qmp {
    fn default_connect_timeout_ms() -> u64 {
        5_000
    }
    fn default_handshake_timeout_ms() -> u64 {
        10_000
    }
    fn default_max_step_attempts() -> u32 {
        3
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for Qmp {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            max_step_attempts: Self::default_max_step_attempts(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct VmDefaults {
    #[serde(default = "VmDefaults::default_cpu")]
    pub cpu: u32,

    /// Memory in MiB.
    #[serde(default = "VmDefaults::default_memory")]
    pub memory: u32,

    #[serde(default = "VmDefaults::default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    #[serde(default = "VmDefaults::default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl VmDefaults {
    fn default_cpu() -> u32 {
        1
    }
    fn default_memory() -> u32 {
        128
    }
    fn default_start_timeout_secs() -> u64 {
        60
    }
    fn default_shutdown_timeout_secs() -> u64 {
        10
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cpu: Self::default_cpu(),
            memory: Self::default_memory(),
            start_timeout_secs: Self::default_start_timeout_secs(),
            shutdown_timeout_secs: Self::default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Network {
    #[serde(default = "Network::default_bridge")]
    pub bridge: String,

    /// IPv4 subnet in CIDR notation that guest addresses come from.
    #[serde(default = "Network::default_subnet")]
    pub subnet: String,
}

impl Network {
    fn default_bridge() -> String {
        "hyper0".to_string()
    }
    fn default_subnet() -> String {
        "192.168.123.0/24".to_string()
    }
}

impl Default for Network {
    fn default() -> Self {
        Self { bridge: Self::default_bridge(), subnet: Self::default_subnet() }
    }
}

/// Errors which may be returned when parsing the daemon configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    if cfg.qmp.max_step_attempts == 0 {
        return Err(ParseError::Invalid(
            "qmp.max_step_attempts",
            "must be at least 1".to_string(),
        ));
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let dummy_config =
            Config::new("/var/run/hyper", "/boot/kernel", "/boot/initrd.img");
        let serialized = toml::ser::to_string(&dummy_config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(dummy_config, deserialized);
    }

    #[test]
    fn minimal_file_takes_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
kernel = "/var/lib/hyper/kernel"
initrd = "/var/lib/hyper/hyper-initrd.img"

[qmp]
max_step_attempts = 5
"#
        )
        .unwrap();

        let cfg = parse(file.path()).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/var/run/hyper"));
        assert_eq!(cfg.qmp.max_step_attempts, 5);
        assert_eq!(cfg.qmp.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.vm.cpu, 1);
        assert_eq!(cfg.vm.memory, 128);
        assert_eq!(cfg.vm.start_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.network.bridge, "hyper0");
        assert!(!cfg.hypervisor.lazy);
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "kernel = \"/k\"\ninitrd = \"/i\"\n[qmp]\nmax_step_attempts = 0"
        )
        .unwrap();
        assert!(matches!(parse(file.path()), Err(ParseError::Invalid(..))));
    }
}
