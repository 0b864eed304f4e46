// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Enclave Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing one
// enclave's service network:
// - Enclave identity and whether network partitioning is enabled
// - Subnet and Docker network the services are attached to
// - Sidecar image and container engine settings
// - Initial default partition connection
// - Logging settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::domain::partition_topology::PartitionConnection;
use crate::domain::sidecar::DEFAULT_SIDECAR_INTERFACE;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "EnclaveConfig";
pub const CONFIG_PATH_ENV: &str = "AEGIS_ENCLAVE_CONFIG_PATH";
pub const PARTITIONING_ENV: &str = "AEGIS_PARTITIONING_ENABLED";
pub const LOG_LEVEL_ENV: &str = "AEGIS_LOG_LEVEL";

/// Smallest subnet that still leaves room for a gateway and some services.
const MAX_PREFIX_LENGTH: u8 = 29;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EnclaveConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: EnclaveConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnclaveConfigSpec {
    #[serde(default)]
    pub enclave: EnclaveSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    /// Connection applied to every partition pair without an override
    #[serde(default)]
    pub default_connection: PartitionConnection,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveSettings {
    pub id: String,

    #[serde(default)]
    pub partitioning_enabled: bool,
}

impl Default for EnclaveSettings {
    fn default() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("enclave-{}", &uuid[..12]),
            partitioning_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// IPv4 CIDR the enclave hands out service addresses from
    #[serde(default = "default_subnet")]
    pub subnet: String,

    #[serde(default = "default_network_name")]
    pub docker_network: String,

    /// Interface shaped by networking sidecars
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            docker_network: default_network_name(),
            interface: default_interface(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Unix socket or URL; local defaults are used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,

    #[serde(default = "default_sidecar_image")]
    pub sidecar_image: String,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: i64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket: None,
            sidecar_image: default_sidecar_image(),
            stop_timeout_seconds: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_subnet() -> String {
    "172.23.0.0/16".to_string()
}

fn default_network_name() -> String {
    "aegis-enclave".to_string()
}

fn default_interface() -> String {
    DEFAULT_SIDECAR_INTERFACE.to_string()
}

fn default_sidecar_image() -> String {
    "nicolaka/netshoot:latest".to_string()
}

fn default_stop_timeout() -> i64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

impl Default for EnclaveConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-enclave".to_string(),
                labels: None,
            },
            spec: EnclaveConfigSpec::default(),
        }
    }
}

/// IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    pub network: Ipv4Addr,
    pub prefix_length: u8,
}

impl Ipv4Subnet {
    pub fn parse(cidr: &str) -> anyhow::Result<Self> {
        let (address, prefix) = cidr
            .split_once('/')
            .with_context(|| format!("Subnet '{}' is not in CIDR notation", cidr))?;
        let address: Ipv4Addr = address
            .parse()
            .with_context(|| format!("Invalid subnet address in '{}'", cidr))?;
        let prefix_length: u8 = prefix
            .parse()
            .with_context(|| format!("Invalid prefix length in '{}'", cidr))?;
        if prefix_length > 32 {
            anyhow::bail!("Prefix length {} in '{}' exceeds 32", prefix_length, cidr);
        }
        let mask = Self::mask(prefix_length);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(address) & mask),
            prefix_length,
        })
    }

    fn mask(prefix_length: u8) -> u32 {
        if prefix_length == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_length))
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask(self.prefix_length))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix_length) == u32::from(self.network)
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_length)
    }
}

impl EnclaveConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read enclave config at {:?}", path))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse enclave config at {:?}", path))
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_ENCLAVE_CONFIG_PATH environment variable
    /// 2. ./enclave-config.yaml (working directory)
    /// 3. ~/.aegis/enclave-config.yaml (user home)
    /// 4. /etc/aegis/enclave-config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./enclave-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("enclave-config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/aegis/enclave-config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default.
    /// An explicit path that cannot be loaded is an error.
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            tracing::info!("Loading enclave configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading enclave configuration from discovered path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else {
            tracing::warn!(
                "No enclave configuration file found in standard locations. Using defaults."
            );
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup(PARTITIONING_ENV) {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: {}=true", PARTITIONING_ENV);
                    self.spec.enclave.partitioning_enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: {}=false", PARTITIONING_ENV);
                    self.spec.enclave.partitioning_enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for {}: '{}'. Expected true/false. Ignoring.",
                        PARTITIONING_ENV,
                        val
                    );
                }
            }
        }

        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            tracing::info!("Environment override: {}={}", LOG_LEVEL_ENV, level);
            self.spec.logging.level = level;
        }
    }

    pub fn subnet(&self) -> anyhow::Result<Ipv4Subnet> {
        Ipv4Subnet::parse(&self.spec.network.subnet)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.spec.enclave.id.trim().is_empty() {
            anyhow::bail!("spec.enclave.id cannot be empty");
        }

        let subnet = self.subnet()?;
        if subnet.prefix_length > MAX_PREFIX_LENGTH {
            anyhow::bail!(
                "Subnet {} is too small to host services; prefix length must be at most {}",
                subnet,
                MAX_PREFIX_LENGTH
            );
        }

        if self.spec.network.interface.trim().is_empty() {
            anyhow::bail!("spec.network.interface cannot be empty");
        }

        self.spec
            .default_connection
            .validate()
            .context("Invalid spec.default_connection")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_manifest_is_valid() {
        let manifest = EnclaveConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(manifest.spec.enclave.id.starts_with("enclave-"));
        assert!(!manifest.spec.enclave.partitioning_enabled);
        assert_eq!(manifest.spec.network.interface, "eth0");
        assert!(manifest.spec.default_connection.is_open());
        manifest.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
apiVersion: 100monkeys.ai/v1
kind: EnclaveConfig
metadata:
  name: test-enclave
spec:
  enclave:
    id: enclave-test
    partitioning_enabled: true
  network:
    subnet: 10.10.0.0/24
  default_connection:
    packet_loss_percentage: 100
  logging:
    level: debug
    format: json
"#;
        let manifest = EnclaveConfigManifest::from_yaml_str(yaml).unwrap();
        manifest.validate().unwrap();
        assert!(manifest.spec.enclave.partitioning_enabled);
        assert!(manifest.spec.default_connection.is_blocked());
        assert_eq!(manifest.spec.logging.format, LogFormat::Json);
        assert_eq!(manifest.spec.docker.sidecar_image, "nicolaka/netshoot:latest");
        assert_eq!(manifest.subnet().unwrap().broadcast(), Ipv4Addr::new(10, 10, 0, 255));
    }

    #[test]
    fn test_validation() {
        let mut manifest = EnclaveConfigManifest::default();
        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = EnclaveConfigManifest::default();
        manifest.spec.network.subnet = "10.0.0.0/30".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = EnclaveConfigManifest::default();
        manifest.spec.network.subnet = "not-a-subnet".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = EnclaveConfigManifest::default();
        manifest.spec.default_connection.packet_loss_percentage = -1.0;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_subnet_parse_normalizes_host_bits() {
        let subnet = Ipv4Subnet::parse("192.168.7.9/16").unwrap();
        assert_eq!(subnet.network, Ipv4Addr::new(192, 168, 0, 0));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 200, 1)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 169, 0, 1)));
        assert!(Ipv4Subnet::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut manifest = EnclaveConfigManifest::default();
        manifest.apply_overrides_from(|key| match key {
            PARTITIONING_ENV => Some("yes".to_string()),
            LOG_LEVEL_ENV => Some("trace".to_string()),
            _ => None,
        });
        assert!(manifest.spec.enclave.partitioning_enabled);
        assert_eq!(manifest.spec.logging.level, "trace");

        manifest.apply_overrides_from(|key| (key == PARTITIONING_ENV).then(|| "maybe".to_string()));
        assert!(manifest.spec.enclave.partitioning_enabled);
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let manifest = EnclaveConfigManifest::default();
        write!(file, "{}", serde_yaml::to_string(&manifest).unwrap()).unwrap();

        let loaded = EnclaveConfigManifest::from_yaml_file(file.path()).unwrap();
        assert_eq!(loaded.spec.enclave.id, manifest.spec.enclave.id);

        let missing = EnclaveConfigManifest::from_yaml_file("/nonexistent/enclave-config.yaml");
        assert!(missing.is_err());
    }
}
