//! Load config from file and environment.
//!
//! File: `~/.config/iot-testbed/config.toml` or `/etc/iot-testbed/config.toml`
//! (or an explicit `--config`). Env overrides: IOT_INBOUND_PORT,
//! IOT_OUTBOUND_PORT, IOT_INTERVAL_SECS, IOT_BIND_ADDR, IOT_LOG_DIR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::device::{DeviceConfig, Role};

/// Per-role section, e.g. `[sensor]` or `[meter]`. Unset fields keep the role default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleSection {
    pub inbound_port: Option<u16>,
    pub outbound_port: Option<u16>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the inbound listener binds (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory for the meter's per-sensor CSV files (default: working directory).
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub sensor: RoleSection,
    #[serde(default)]
    pub meter: RoleSection,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_owned()
}
fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_dir: default_log_dir(),
            sensor: RoleSection::default(),
            meter: RoleSection::default(),
        }
    }
}

/// Values that win over the file: first the environment, then the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub inbound_port: Option<u16>,
    pub outbound_port: Option<u16>,
    pub interval_secs: Option<u64>,
    pub bind_addr: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl Overrides {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; a set but unparsable value is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            inbound_port: parse_var(&lookup, "IOT_INBOUND_PORT")?,
            outbound_port: parse_var(&lookup, "IOT_OUTBOUND_PORT")?,
            interval_secs: parse_var(&lookup, "IOT_INTERVAL_SECS")?,
            bind_addr: lookup("IOT_BIND_ADDR"),
            log_dir: lookup("IOT_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|s| s.trim().parse::<T>().with_context(|| format!("invalid {key}: {s:?}")))
        .transpose()
}

impl Config {
    fn section_mut(&mut self, role: Role) -> &mut RoleSection {
        match role {
            Role::Sensor => &mut self.sensor,
            Role::Meter => &mut self.meter,
        }
    }

    /// Fold overrides into the section for `role`.
    pub fn apply(&mut self, role: Role, overrides: &Overrides) {
        if let Some(addr) = &overrides.bind_addr {
            self.bind_addr = addr.clone();
        }
        if let Some(dir) = &overrides.log_dir {
            self.log_dir = dir.clone();
        }
        let section = self.section_mut(role);
        if overrides.inbound_port.is_some() {
            section.inbound_port = overrides.inbound_port;
        }
        if overrides.outbound_port.is_some() {
            section.outbound_port = overrides.outbound_port;
        }
        if overrides.interval_secs.is_some() {
            section.interval_secs = overrides.interval_secs;
        }
    }

    /// Device settings for `role`, falling back to the role defaults.
    pub fn device(&self, role: Role, name: &str, peers: Vec<String>) -> DeviceConfig {
        let section = match role {
            Role::Sensor => &self.sensor,
            Role::Meter => &self.meter,
        };
        let mut device = DeviceConfig::new(name, role);
        device.bind_addr = self.bind_addr.clone();
        if let Some(p) = section.inbound_port {
            device.inbound_port = p;
        }
        if let Some(p) = section.outbound_port {
            device.outbound_port = p;
        }
        if let Some(secs) = section.interval_secs {
            device.interval = Duration::from_secs(secs.max(1));
        }
        device.peers = peers;
        device
    }
}

/// Load config: defaults, then the explicit file or the first default path that exists.
/// A missing explicit file or a malformed file is an error.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = explicit {
        return load_file(path);
    }
    for path in config_paths() {
        if path.exists() {
            return load_file(&path);
        }
    }
    Ok(Config::default())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/iot-testbed/config.toml"));
    }
    out.push(PathBuf::from("/etc/iot-testbed/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}
