/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

use serde::Deserialize;
use std::sync::OnceLock;

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Runtime configuration for the control plane.
///
/// Every field has a working default; operators override through the
/// settings file or environment variables of the same (upper-cased) name.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Formation this control plane belongs to and manages.
    pub formation: String,
    /// Comma-separated service registry nodes.
    pub service_registry: String,
    /// REST API listen port.
    pub port: u16,
    /// Seconds before a booting instance is given up on.
    pub slow_boot_threshold: u64,
    /// Seconds before a stopping instance is force-killed.
    pub slow_term_threshold: u64,
    /// Seconds between sweeps of terminated instances.
    pub remove_terminated_interval: u64,
    /// Worker poll period in seconds.
    pub check_interval: u64,
    /// etcd endpoint, `host:port`.
    pub database: String,
    /// Optional redis URL for the observed-state mirror.
    pub state_cache: Option<String>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            formation: String::from("scheduler"),
            service_registry: String::new(),
            port: 8000,
            slow_boot_threshold: 60,
            slow_term_threshold: 20,
            remove_terminated_interval: 30,
            check_interval: 10,
            database: String::from("127.0.0.1:2379"),
            state_cache: None,
            log_level: String::from("info"),
        }
    }
}

impl Settings {
    /// Registry nodes as a list, dropping empty entries.
    pub fn registry_nodes(&self) -> Vec<String> {
        self.service_registry
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

fn parse_settings() -> Settings {
    let built = config::Config::builder()
        .add_source(config::File::with_name("/etc/scheduler/settings").required(false))
        .add_source(config::Environment::default().try_parsing(true))
        .build();

    match built {
        Ok(conf) => conf.try_deserialize::<Settings>().unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

pub fn get_config() -> &'static Settings {
    SETTINGS.get_or_init(parse_settings)
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::*;

    // Test default values when no settings file is provided
    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.formation, "scheduler");
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.slow_boot_threshold, 60);
        assert_eq!(settings.slow_term_threshold, 20);
        assert_eq!(settings.remove_terminated_interval, 30);
        assert_eq!(settings.check_interval, 10);
        assert_eq!(settings.database, "127.0.0.1:2379");
        assert!(settings.state_cache.is_none());
    }

    #[test]
    fn test_registry_nodes_split() {
        let settings = Settings {
            service_registry: String::from("reg1:3222, reg2:3222"),
            ..Settings::default()
        };
        assert_eq!(settings.registry_nodes(), vec!["reg1:3222", "reg2:3222"]);
    }

    #[test]
    fn test_registry_nodes_empty() {
        let settings = Settings::default();
        assert!(settings.registry_nodes().is_empty());
    }

    // Test static behavior of `get_config`
    #[test]
    fn test_get_config_static_behavior() {
        let config1 = get_config();
        let config2 = get_config();
        assert!(std::ptr::eq(config1, config2));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "formation: assembly\nport: 9100\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.formation, "assembly");
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.check_interval, 10);
        assert_eq!(settings.database, "127.0.0.1:2379");
    }
}
