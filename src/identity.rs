//! Device identity strings shared by the device and the verifying broker
//!
//! The client id a device presents and the topic it publishes to are derived
//! from the same four identifiers on both sides, so they must be built the
//! same way byte for byte.

use crate::error::{IotCoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Username presented alongside the credential. The broker ignores its value
/// beyond checking it matches.
pub const DEVICE_USERNAME: &str = "unused";

/// Fully qualified device path used as the MQTT client id:
/// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityPath {
    path: String,
    device_id: String,
}

impl IdentityPath {
    /// Builds the path from its four components
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a component is empty or contains `/`, since
    /// either would make the path ambiguous.
    pub fn new(project: &str, region: &str, registry: &str, device: &str) -> Result<Self> {
        for (name, value) in [
            ("project", project),
            ("region", region),
            ("registry", registry),
            ("device", device),
        ] {
            validate_component(name, value)?;
        }

        Ok(Self {
            path: format!(
                "projects/{project}/locations/{region}/registries/{registry}/devices/{device}"
            ),
            device_id: device.to_string(),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Topic of the given kind for this device
    #[must_use]
    pub fn topic(&self, kind: TopicKind) -> String {
        kind.topic_for(&self.device_id)
    }
}

impl fmt::Display for IdentityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

fn validate_component(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(IotCoreError::Configuration(format!("{name} id is empty")));
    }
    if value.contains('/') {
        return Err(IotCoreError::Configuration(format!(
            "{name} id '{value}' must not contain '/'"
        )));
    }
    Ok(())
}

/// The two per-device topics: `/devices/{device}/events` and `/devices/{device}/state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    #[default]
    Events,
    State,
}

impl TopicKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::State => "state",
        }
    }

    #[must_use]
    pub fn topic_for(self, device_id: &str) -> String {
        format!("/devices/{device_id}/{}", self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = IotCoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "events" => Ok(Self::Events),
            "state" => Ok(Self::State),
            other => Err(IotCoreError::Configuration(format!(
                "unknown topic kind '{other}', expected 'events' or 'state'"
            ))),
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
