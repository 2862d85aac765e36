use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_INTERFACE: &str = "nic0";

/// A fully resolved remote endpoint: one port on one VM network interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub project_id: String,
    pub zone: String,
    pub instance: String,
    pub port: u16,
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

impl Target {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            instance: instance.into(),
            port,
            interface: default_interface(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project_id.trim().is_empty() {
            anyhow::bail!("target: project_id is required");
        }
        if self.zone.trim().is_empty() {
            anyhow::bail!("target: zone is required");
        }
        if self.instance.trim().is_empty() {
            anyhow::bail!("target: instance is required");
        }
        if self.port == 0 {
            anyhow::bail!("target: port must be non-zero");
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/zones/{}/instances/{}:{}",
            self.project_id, self.zone, self.instance, self.port
        )
    }
}
