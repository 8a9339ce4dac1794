// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use cmdq::{AdapterParams, DeviceParams, LockStrategy};

/// Configuration for an adapter and the devices attached through it.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub adapter: AdapterConfig,

    #[serde(default, rename = "device")]
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct AdapterConfig {
    pub name: String,

    #[serde(default)]
    pub unit: u32,

    /// Per-device ceiling for devices without tagged queueing
    #[serde(default = "default_device_openings")]
    pub max_device_openings: u32,

    /// Per-device ceiling for devices with tagged queueing
    #[serde(default = "default_tagged_openings")]
    pub max_tagged_openings: u32,

    /// Adapter-wide ceiling on dispatched commands
    pub send_openings: u32,

    #[serde(default)]
    pub locking: LockingConfig,
}
impl AdapterConfig {
    pub fn params(&self) -> AdapterParams {
        AdapterParams {
            name: self.name.clone(),
            unit: self.unit,
            max_device_openings: self.max_device_openings,
            max_tagged_openings: self.max_tagged_openings,
            locking: self.locking.into(),
        }
    }
}

fn default_device_openings() -> u32 {
    1
}
fn default_tagged_openings() -> u32 {
    16
}

#[derive(Copy, Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockingConfig {
    #[default]
    Perimeter,
    #[serde(rename = "self")]
    SelfSynchronized,
}
impl From<LockingConfig> for LockStrategy {
    fn from(value: LockingConfig) -> Self {
        match value {
            LockingConfig::Perimeter => LockStrategy::Perimeter,
            LockingConfig::SelfSynchronized => LockStrategy::SelfSynchronized,
        }
    }
}

#[derive(Copy, Clone, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub tagged: bool,

    /// Fixed depth, overriding the one derived from the adapter ceilings
    pub openings: Option<u32>,
}
impl From<&DeviceConfig> for DeviceParams {
    fn from(value: &DeviceConfig) -> Self {
        DeviceParams { tagged: value.tagged, openings: value.openings }
    }
}

impl Config {
    /// Check for values which would leave the adapter unable to dispatch.
    pub fn validate(&self) -> Result<(), ParseError> {
        let adapter = &self.adapter;
        if adapter.name.is_empty() {
            return Err(ParseError::Invalid("adapter name is empty".into()));
        }
        for (key, val) in [
            ("max_device_openings", adapter.max_device_openings),
            ("max_tagged_openings", adapter.max_tagged_openings),
            ("send_openings", adapter.send_openings),
        ] {
            if val == 0 {
                return Err(ParseError::Invalid(format!(
                    "adapter {key} must be non-zero"
                )));
            }
        }
        for (name, dev) in self.devices.iter() {
            if dev.openings == Some(0) {
                return Err(ParseError::Invalid(format!(
                    "device {name} openings must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

/// Errors which may be returned when parsing the adapter configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
