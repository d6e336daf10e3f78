use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::kernel::PacketType;
use crate::utils::hca::{default_hca_devices, parse_hca_list, HcaListError};
use crate::utils::HCA_DEVICES_ENV;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    pub root_addr: Option<SocketAddr>,
    #[serde(default = "BootstrapConfig::default_listen_addr")]
    pub listen_addr: IpAddr,
}

impl BootstrapConfig {
    fn default_listen_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            root_addr: None,
            listen_addr: Self::default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    // overrides what the bootstrap reports
    pub nranks_per_node: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FabricConfig {
    /// Device of each fabric transport, `Ib0` first.
    pub hca_devices: Vec<String>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            hca_devices: default_hca_devices(),
        }
    }
}

impl FabricConfig {
    /// Device names with the `MCCS_HCA_DEVICES` override applied.
    pub fn resolved_hca_devices(&self) -> Result<Vec<String>, HcaListError> {
        match std::env::var(HCA_DEVICES_ENV) {
            Ok(list) if !list.trim().is_empty() => Ok(parse_hca_list(&list)?
                .into_iter()
                .map(|spec| spec.name)
                .collect()),
            _ => Ok(self.hca_devices.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub default_packet_type: PacketType,
    pub max_cached_contexts: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn full_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[bootstrap]
root_addr = "10.0.0.1:5000"
listen_addr = "10.0.0.2"

[topology]
nranks_per_node = 4

[fabric]
hca_devices = ["mlx5_2", "mlx5_3"]

[executor]
default_packet_type = "LL8"
max_cached_contexts = 16
"#
        )
        .unwrap();
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(
            config.bootstrap.root_addr,
            Some("10.0.0.1:5000".parse().unwrap())
        );
        assert_eq!(config.topology.nranks_per_node, Some(4));
        assert_eq!(config.fabric.hca_devices, vec!["mlx5_2", "mlx5_3"]);
        assert_eq!(config.executor.default_packet_type, PacketType::LL8);
        assert_eq!(config.executor.max_cached_contexts, Some(16));
    }

    #[test]
    fn sections_default_when_absent() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bootstrap.root_addr, None);
        assert_eq!(config.fabric.hca_devices.len(), 8);
        assert_eq!(config.executor.default_packet_type, PacketType::LL16);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("[executor]\ncache = 3\n").is_err());
    }
}
