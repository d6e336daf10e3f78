use thiserror::Error;

use crate::transport::NUM_IB_TRANSPORTS;

pub const DEFAULT_HCA_DEVICES: [&str; NUM_IB_TRANSPORTS] = [
    "mlx5_0", "mlx5_1", "mlx5_2", "mlx5_3", "mlx5_4", "mlx5_5", "mlx5_6", "mlx5_7",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HcaListError {
    #[error("Failed to parse device list: {0}")]
    Parse(String),
    #[error("At most {} fabric devices are supported, got {0}", NUM_IB_TRANSPORTS)]
    TooManyDevices(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcaDeviceSpec {
    pub name: String,
    pub port: Option<u8>,
}

/// Parses a comma separated device list such as `mlx5_0:1,mlx5_1`.
/// The n-th entry backs transport `Ib<n>`.
pub fn parse_hca_list(list: &str) -> Result<Vec<HcaDeviceSpec>, HcaListError> {
    if !list.is_ascii() {
        return Err(HcaListError::Parse(list.to_string()));
    }
    let mut specs = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let spec = match entry.split_once(':') {
            Some((name, port)) => {
                if name.is_empty() {
                    return Err(HcaListError::Parse(list.to_string()));
                }
                let port = port
                    .parse::<u8>()
                    .map_err(|_| HcaListError::Parse(list.to_string()))?;
                HcaDeviceSpec {
                    name: name.to_string(),
                    port: Some(port),
                }
            }
            None => HcaDeviceSpec {
                name: entry.to_string(),
                port: None,
            },
        };
        specs.push(spec);
    }
    if specs.len() > NUM_IB_TRANSPORTS {
        return Err(HcaListError::TooManyDevices(specs.len()));
    }
    Ok(specs)
}

pub fn default_hca_devices() -> Vec<String> {
    DEFAULT_HCA_DEVICES.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_ports() {
        let specs = parse_hca_list("mlx5_0:1, mlx5_3,").unwrap();
        assert_eq!(
            specs,
            vec![
                HcaDeviceSpec {
                    name: "mlx5_0".to_string(),
                    port: Some(1)
                },
                HcaDeviceSpec {
                    name: "mlx5_3".to_string(),
                    port: None
                },
            ]
        );
    }

    #[test]
    fn reject_malformed() {
        assert!(parse_hca_list(":1").is_err());
        assert!(parse_hca_list("mlx5_0:x").is_err());
        let too_many = (0..9).map(|i| format!("d{}", i)).collect::<Vec<_>>().join(",");
        assert_eq!(
            parse_hca_list(&too_many),
            Err(HcaListError::TooManyDevices(9))
        );
    }
}
