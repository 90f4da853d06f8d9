//! Configuration file support for afisyncd
//!
//! Loads and validates the daemon configuration from YAML.
//! Default location: /etc/afisyncd/afisyncd.yaml

use crate::error::{AfisyncError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/afisyncd/afisyncd.yaml";

/// One forwarding-plane port and the host tap device backing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    /// Physical interface name
    pub name: String,

    /// Sandbox port index
    pub port: u16,

    /// Host tap device name
    pub tap: String,
}

/// Complete afisyncd configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AfisyncConfig {
    /// Netlink socket receive buffer in bytes
    #[serde(default = "default_netlink_buffer_size")]
    pub netlink_buffer_size: usize,

    /// Take routes from the FPM feed instead of netlink
    #[serde(default)]
    pub use_fpm_interface: bool,

    #[serde(default = "default_fpm_listen_address")]
    pub fpm_listen_address: SocketAddr,

    /// Forwarding-plane control channel
    #[serde(default = "default_afi_server_address")]
    pub afi_server_address: SocketAddr,

    /// Where punted packets arrive from the forwarding plane
    #[serde(default = "default_afi_hostpath_address")]
    pub afi_hostpath_address: SocketAddr,

    #[serde(default = "default_sandbox_name")]
    pub sandbox_name: String,

    /// Number of sandbox ports, not counting the punt port
    #[serde(default = "default_num_ports")]
    pub num_ports: u16,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

fn default_netlink_buffer_size() -> usize {
    32 * 1024 * 1024
}

fn default_fpm_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], crate::fpm::FPM_DEFAULT_PORT))
}

fn default_afi_server_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 50051))
}

fn default_afi_hostpath_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 50052))
}

fn default_sandbox_name() -> String {
    "green".to_string()
}

fn default_num_ports() -> u16 {
    8
}

impl Default for AfisyncConfig {
    fn default() -> Self {
        Self {
            netlink_buffer_size: default_netlink_buffer_size(),
            use_fpm_interface: false,
            fpm_listen_address: default_fpm_listen_address(),
            afi_server_address: default_afi_server_address(),
            afi_hostpath_address: default_afi_hostpath_address(),
            sandbox_name: default_sandbox_name(),
            num_ports: default_num_ports(),
            interfaces: Vec::new(),
        }
    }
}

impl AfisyncConfig {
    /// Loads and validates a configuration file. A missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AfisyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_ports == 0 {
            return Err(AfisyncError::Config("num-ports must be > 0".to_string()));
        }
        // The sandbox gets one more port for the punt path
        if self.num_ports == u16::MAX {
            return Err(AfisyncError::Config(format!(
                "num-ports must be < {}",
                u16::MAX
            )));
        }
        if self.sandbox_name.is_empty() {
            return Err(AfisyncError::Config(
                "sandbox-name must not be empty".to_string(),
            ));
        }
        if self.netlink_buffer_size == 0 {
            return Err(AfisyncError::Config(
                "netlink-buffer-size must be > 0".to_string(),
            ));
        }

        let mut ports = HashSet::new();
        let mut taps = HashSet::new();
        for iface in &self.interfaces {
            if iface.name.is_empty() || iface.tap.is_empty() {
                return Err(AfisyncError::Config(format!(
                    "interface on port {} needs a name and a tap",
                    iface.port
                )));
            }
            if iface.port >= self.num_ports {
                return Err(AfisyncError::Config(format!(
                    "{}: port {} out of range (num-ports {})",
                    iface.name, iface.port, self.num_ports
                )));
            }
            if !ports.insert(iface.port) {
                return Err(AfisyncError::Config(format!(
                    "port {} configured twice",
                    iface.port
                )));
            }
            if !taps.insert(iface.tap.as_str()) {
                return Err(AfisyncError::Config(format!(
                    "tap {} configured twice",
                    iface.tap
                )));
            }
        }
        Ok(())
    }
}
