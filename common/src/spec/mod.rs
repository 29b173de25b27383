/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Data model for formations, releases and their scheduled instances.

mod formation;
mod instance;
mod release;

pub use formation::Formation;
pub use instance::{Instance, InstanceState, Placement};
pub use release::{PortSpec, Release, ServiceTemplate};

/// Persisted key layout. The shapes are load-bearing: external tools
/// read the same keys.
pub mod keys {
    use const_format::concatcp;

    pub const FORMATION_PREFIX: &str = "formation";
    pub const RELEASE_PREFIX: &str = "release";
    pub const INSTANCE_PREFIX: &str = "instances";
    pub const LEADER_KEY: &str = "leader";

    /// Watch/scan prefix for instance records, trailing slash included.
    pub const INSTANCE_SCAN_PREFIX: &str = concatcp!(INSTANCE_PREFIX, "/");

    pub fn formation(name: &str) -> String {
        format!("{}/{}", FORMATION_PREFIX, name)
    }

    pub fn release(formation: &str, name: &str) -> String {
        format!("{}/{}/{}", RELEASE_PREFIX, formation, name)
    }

    pub fn instance(formation: &str, name: &str) -> String {
        format!("{}/{}/{}", INSTANCE_PREFIX, formation, name)
    }

    /// Split an `instances/<formation>/<name>` key into its parts.
    pub fn split_instance(key: &str) -> Option<(String, String)> {
        let mut parts = key.splitn(3, '/');
        if parts.next()? != INSTANCE_PREFIX {
            return None;
        }
        let formation = parts.next()?.to_owned();
        let name = parts.next()?.to_owned();
        Some((formation, name))
    }
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::formation("assembly"), "formation/assembly");
        assert_eq!(keys::release("assembly", "2"), "release/assembly/2");
        assert_eq!(
            keys::instance("assembly", "web.1f2e3d4c"),
            "instances/assembly/web.1f2e3d4c"
        );
        assert_eq!(keys::INSTANCE_SCAN_PREFIX, "instances/");
    }

    #[test]
    fn test_split_instance_roundtrip() {
        let key = keys::instance("assembly", "web.1f2e3d4c");
        let (formation, name) = keys::split_instance(&key).unwrap();
        assert_eq!(formation, "assembly");
        assert_eq!(name, "web.1f2e3d4c");
    }

    #[test]
    fn test_split_instance_rejects_foreign_prefix() {
        assert!(keys::split_instance("release/assembly/2").is_none());
        assert!(keys::split_instance("instances/only-formation").is_none());
    }
}
