use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid environment override for '{key}': {detail}")]
    EnvOverride { key: String, detail: String },
}

fn default_flow_idle_timeout() -> u64 {
    5
}
fn default_arp_src_mac() -> String {
    "02:00:00:00:00:ff".to_string()
}
fn default_true() -> bool {
    true
}

/// Root configuration document, matching the JSON shape in `SPEC_FULL.md` §6.
///
/// Loading layers two sources, in the same order as
/// `original_source/util/Config.py::loadConfig`: the JSON file provides
/// defaults, and an environment variable named after the field (see
/// [`Config::load`]) overrides it if set. Only scalar top-level fields
/// participate in the override (string/bool/integer); `scheduler` and
/// `switches` are structured and come from the file alone — the original's
/// generic "coerce from the default value's Python type" trick has no
/// equivalent for nested structures, so we simply don't extend it there.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootConfig {
    #[serde(default = "default_arp_src_mac")]
    pub arp_src_mac: String,

    #[serde(default = "default_flow_idle_timeout")]
    pub flow_idle_timeout: u64,

    #[serde(default)]
    pub cluster_glob: String,

    #[serde(default)]
    pub services_glob: String,

    #[serde(default)]
    pub services_dir: String,

    #[serde(default = "default_true")]
    pub use_unique_prefix: bool,

    #[serde(default = "default_true")]
    pub use_unique_mask: bool,

    #[serde(default)]
    pub log_performance: bool,

    #[serde(default)]
    pub scheduler: SchedulerSpec,

    #[serde(default)]
    pub switches: HashMap<String, SwitchSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    #[serde(default = "default_scheduler_class")]
    pub class: String,
    #[serde(default = "default_scheduler_log_name")]
    pub log_name: String,
}

fn default_scheduler_class() -> String {
    "proximity".to_string()
}
fn default_scheduler_log_name() -> String {
    "ProxScheduler".to_string()
}

impl Default for SchedulerSpec {
    fn default() -> Self {
        Self {
            class: default_scheduler_class(),
            log_name: default_scheduler_log_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchSpec {
    pub gateway: String,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    pub ip: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub service_cidr: Vec<String>,
    #[serde(default)]
    pub scheduler: Option<String>,
}

fn default_target() -> String {
    "pod".to_string()
}

/// Loads and layers [`RootConfig`] from a JSON file plus environment
/// variable overrides, matching `original_source/util/Config.py`.
pub struct Config;

impl Config {
    pub fn load(path: &Path) -> Result<RootConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg: RootConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Self::apply_env_overrides(&mut cfg)?;
        Ok(cfg)
    }

    fn apply_env_overrides(cfg: &mut RootConfig) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("ARP_SRC_MAC") {
            cfg.arp_src_mac = v;
        }
        if let Some(v) = Self::env_u64("FLOW_IDLE_TIMEOUT")? {
            cfg.flow_idle_timeout = v;
        }
        if let Ok(v) = std::env::var("CLUSTER_GLOB") {
            cfg.cluster_glob = v;
        }
        if let Ok(v) = std::env::var("SERVICES_GLOB") {
            cfg.services_glob = v;
        }
        if let Ok(v) = std::env::var("SERVICES_DIR") {
            cfg.services_dir = v;
        }
        if let Some(v) = Self::env_bool("USE_UNIQUE_PREFIX")? {
            cfg.use_unique_prefix = v;
        }
        if let Some(v) = Self::env_bool("USE_UNIQUE_MASK")? {
            cfg.use_unique_mask = v;
        }
        if let Some(v) = Self::env_bool("LOG_PERFORMANCE")? {
            cfg.log_performance = v;
        }
        Ok(())
    }

    fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
        match std::env::var(key) {
            Ok(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                other => Err(ConfigError::EnvOverride {
                    key: key.to_string(),
                    detail: format!("'{other}' is not a recognized boolean"),
                }),
            },
            Err(_) => Ok(None),
        }
    }

    fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
        match std::env::var(key) {
            Ok(raw) => raw
                .parse::<u64>()
                .map(Some)
                .map_err(|e| ConfigError::EnvOverride {
                    key: key.to_string(),
                    detail: e.to_string(),
                }),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_defaults_for_missing_fields() {
        let mut file = tempfile_with_json(r#"{"switches": {}}"#);
        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.flow_idle_timeout, 5);
        assert_eq!(cfg.arp_src_mac, "02:00:00:00:00:ff");
        assert!(cfg.use_unique_prefix);
        file.flush().ok();
    }

    #[test]
    fn parses_switch_topology() {
        let json = r#"{
            "switches": {
                "1": { "gateway": "10.0.0.1", "edges": [
                    {"ip": "10.0.0.2", "target": "cluster", "serviceCidr": ["10.0.1.0/24"]}
                ]}
            }
        }"#;
        let file = tempfile_with_json(json);
        let cfg = Config::load(file.path()).expect("load");
        let switch = cfg.switches.get("1").expect("switch 1");
        assert_eq!(switch.gateway, "10.0.0.1");
        assert_eq!(switch.edges[0].target, "cluster");
        assert_eq!(switch.edges[0].service_cidr, vec!["10.0.1.0/24".to_string()]);
    }

    #[test]
    fn camel_case_keys_map_to_snake_case_fields() {
        let json = r#"{
            "arpSrcMac": "02:00:00:00:00:01",
            "flowIdleTimeout": 7,
            "clusterGlob": "/tmp/*.json",
            "servicesGlob": "/tmp/*.yml",
            "servicesDir": "/tmp/svc",
            "useUniquePrefix": false,
            "useUniqueMask": false,
            "logPerformance": true,
            "scheduler": {"class": "pkg.Class", "logName": "Named"},
            "switches": {}
        }"#;
        let file = tempfile_with_json(json);
        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.arp_src_mac, "02:00:00:00:00:01");
        assert_eq!(cfg.flow_idle_timeout, 7);
        assert_eq!(cfg.cluster_glob, "/tmp/*.json");
        assert_eq!(cfg.services_glob, "/tmp/*.yml");
        assert_eq!(cfg.services_dir, "/tmp/svc");
        assert!(!cfg.use_unique_prefix);
        assert!(!cfg.use_unique_mask);
        assert!(cfg.log_performance);
        assert_eq!(cfg.scheduler.class, "pkg.Class");
        assert_eq!(cfg.scheduler.log_name, "Named");
    }

    fn tempfile_with_json(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }
}
