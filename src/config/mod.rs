//! Configuration loading for the 5GMS Application Function.
//!
//! A YAML file merged with `RT5GMS_`-prefixed environment overrides,
//! falling back to a generated default file on first run.

use anyhow::Result;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HttpProtocol {
    Http1,
    Http2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tls: bool,
    pub protocol: HttpProtocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationServerConfig {
    pub canonical_hostname: String,
    pub url_path_prefix_format: String,
    pub m3_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAssistanceConfig {
    pub delivery_boost_seconds: u64,
}

impl Default for NetworkAssistanceConfig {
    fn default() -> Self {
        Self {
            delivery_boost_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BsfConfig {
    pub endpoint: String,
    pub cache_ttl_seconds: u64,
    pub negative_cache_ttl_seconds: u64,
}

impl Default for BsfConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://bsf.example.com".to_string(),
            cache_ttl_seconds: 3600,
            negative_cache_ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcfConfig {
    pub endpoint: String,
}

impl Default for PcfConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://pcf.example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_name: String,
    pub api_release: String,
    pub endpoints: Vec<EndpointConfig>,
    pub application_servers: Vec<ApplicationServerConfig>,
    pub certificate_manager: PathBuf,
    pub certificate_store_dir: PathBuf,
    pub data_collection_dir: PathBuf,
    pub sai_cache_control_max_age: u64,
    pub network_assistance: NetworkAssistanceConfig,
    pub bsf: BsfConfig,
    pub pcf: PcfConfig,
    pub nrf_endpoint: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Timeout applied to every outbound request (M3/PCF/BSF/certmgr).
    pub outbound_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "5GMSdAF".to_string(),
            api_release: "v2".to_string(),
            endpoints: vec![
                EndpointConfig {
                    name: "m1".to_string(),
                    address: "0.0.0.0".to_string(),
                    port: 7777,
                    tls: false,
                    protocol: HttpProtocol::Http2,
                },
                EndpointConfig {
                    name: "m5".to_string(),
                    address: "0.0.0.0".to_string(),
                    port: 7778,
                    tls: false,
                    protocol: HttpProtocol::Http1,
                },
            ],
            application_servers: Vec::new(),
            certificate_manager: PathBuf::from("/usr/bin/certmgr"),
            certificate_store_dir: PathBuf::from("./data/certificates"),
            data_collection_dir: PathBuf::from("./data/reports"),
            sai_cache_control_max_age: 30,
            network_assistance: NetworkAssistanceConfig::default(),
            bsf: BsfConfig::default(),
            pcf: PcfConfig::default(),
            nrf_endpoint: "http://nrf.example.com".to_string(),
            logging: LoggingConfig::default(),
            outbound_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load configuration from `path`, merging `RT5GMS_`-prefixed
    /// environment variables on top, writing out a default file if none
    /// exists yet.
    pub fn load(path: &str) -> Result<Self> {
        let config = if std::path::Path::new(path).exists() {
            Figment::new()
                .merge(Yaml::file(path))
                .merge(Env::prefixed("RT5GMS_").split("__"))
                .extract()?
        } else {
            let default_config = Self::default();
            let contents = serde_yaml::to_string(&default_config)?;
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, contents)?;
            std::fs::create_dir_all(&default_config.certificate_store_dir)?;
            std::fs::create_dir_all(&default_config.data_collection_dir)?;
            default_config
        };
        config.validate()?;
        Ok(config)
    }

    /// Two AS entries sharing a `canonical_hostname` is a configuration
    /// error: the store keys AS-state nodes by that hostname, so duplicates
    /// would silently collapse onto one node.
    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for as_config in &self.application_servers {
            if !seen.insert(as_config.canonical_hostname.as_str()) {
                anyhow::bail!(
                    "duplicate application server canonical_hostname: {}",
                    as_config.canonical_hostname
                );
            }
        }
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed.server_name, config.server_name);
        assert_eq!(reparsed.endpoints.len(), 2);
    }

    #[test]
    fn default_m1_endpoint_is_http2_m5_is_http1() {
        let config = Config::default();
        assert_eq!(config.endpoint("m1").unwrap().protocol, HttpProtocol::Http2);
        assert_eq!(config.endpoint("m5").unwrap().protocol, HttpProtocol::Http1);
    }

    #[test]
    fn duplicate_canonical_hostnames_are_rejected() {
        let mut config = Config::default();
        config.application_servers.push(ApplicationServerConfig {
            canonical_hostname: "as1.example.com".to_string(),
            url_path_prefix_format: "/{ps}/".to_string(),
            m3_port: 8080,
        });
        config.application_servers.push(ApplicationServerConfig {
            canonical_hostname: "as1.example.com".to_string(),
            url_path_prefix_format: "/{ps}/".to_string(),
            m3_port: 8443,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn distinct_canonical_hostnames_are_accepted() {
        let mut config = Config::default();
        config.application_servers.push(ApplicationServerConfig {
            canonical_hostname: "as1.example.com".to_string(),
            url_path_prefix_format: "/{ps}/".to_string(),
            m3_port: 8080,
        });
        config.application_servers.push(ApplicationServerConfig {
            canonical_hostname: "as2.example.com".to_string(),
            url_path_prefix_format: "/{ps}/".to_string(),
            m3_port: 8080,
        });
        assert!(config.validate().is_ok());
    }
}
