//! Immutable, atomically swappable view of the configuration.
//!
//! Readers load the current snapshot without locking; reload compiles a
//! complete new snapshot and swaps the root pointer, so in-flight calls see
//! either the old or the new configuration, never a mixture.

use crate::config::{
    ExtensionConfig, FeatureCodeConfig, InboundNumberConfig, OutboundRouteConfig, PbxConfig,
    RingGroupConfig, TrunkConfig,
};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the per-call hot path needs to resolve, pre-indexed
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: PbxConfig,

    extensions_by_number: HashMap<String, usize>,
    trunks_by_id: HashMap<String, usize>,
    inbound_by_number: HashMap<String, usize>,
    groups_by_number: HashMap<String, usize>,
    feature_by_code: HashMap<String, usize>,

    /// Route indices sorted by ascending priority
    routes_by_priority: Vec<usize>,
}

impl ConfigSnapshot {
    pub fn compile(config: PbxConfig) -> Self {
        let extensions_by_number = config
            .extensions
            .iter()
            .enumerate()
            .map(|(idx, ext)| (ext.number.clone(), idx))
            .collect();

        let trunks_by_id = config
            .trunks
            .iter()
            .enumerate()
            .map(|(idx, trunk)| (trunk.id.clone(), idx))
            .collect();

        let inbound_by_number = config
            .inbound_numbers
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.number.clone(), idx))
            .collect();

        let groups_by_number = config
            .ring_groups
            .iter()
            .enumerate()
            .map(|(idx, group)| (group.number.clone(), idx))
            .collect();

        let feature_by_code = config
            .feature_codes
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.code.clone(), idx))
            .collect();

        let mut routes_by_priority: Vec<usize> = (0..config.outbound_routes.len()).collect();
        routes_by_priority.sort_by_key(|&idx| config.outbound_routes[idx].priority);

        Self {
            config,
            extensions_by_number,
            trunks_by_id,
            inbound_by_number,
            groups_by_number,
            feature_by_code,
            routes_by_priority,
        }
    }

    pub fn extension(&self, number: &str) -> Option<&ExtensionConfig> {
        self.extensions_by_number
            .get(number)
            .map(|&idx| &self.config.extensions[idx])
    }

    pub fn trunk(&self, id: &str) -> Option<&TrunkConfig> {
        self.trunks_by_id
            .get(id)
            .map(|&idx| &self.config.trunks[idx])
    }

    pub fn trunks(&self) -> impl Iterator<Item = &TrunkConfig> {
        self.config.trunks.iter()
    }

    pub fn inbound_number(&self, number: &str) -> Option<&InboundNumberConfig> {
        self.inbound_by_number
            .get(number)
            .map(|&idx| &self.config.inbound_numbers[idx])
    }

    pub fn ring_group(&self, number: &str) -> Option<&RingGroupConfig> {
        self.groups_by_number
            .get(number)
            .map(|&idx| &self.config.ring_groups[idx])
    }

    pub fn feature_code(&self, code: &str) -> Option<&FeatureCodeConfig> {
        self.feature_by_code
            .get(code)
            .map(|&idx| &self.config.feature_codes[idx])
    }

    /// Outbound routes in priority order
    pub fn routes(&self) -> impl Iterator<Item = &OutboundRouteConfig> {
        self.routes_by_priority
            .iter()
            .map(|&idx| &self.config.outbound_routes[idx])
    }

    /// Find the trunk a source address belongs to (ip type trunks)
    pub fn trunk_for_source(&self, source_ip: &str) -> Option<&TrunkConfig> {
        self.config.trunks.iter().find(|trunk| {
            trunk.host == source_ip
                || trunk.remote_hosts.iter().any(|host| host == source_ip)
        })
    }
}

/// Lock-free store of the active snapshot
pub struct SnapshotStore {
    current: ArcSwap<ConfigSnapshot>,
}

impl SnapshotStore {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Cheap read of the active snapshot
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Swap in a newly compiled snapshot
    pub fn store(&self, snapshot: ConfigSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> ConfigSnapshot {
        let config: PbxConfig = toml::from_str(
            r#"
            [sip]
            domain = "pbx.example.org"

            [[extension]]
            number = "100"
            password = "pw"

            [[inbound_number]]
            number = "+15551234567"
            target = "100"

            [[outbound_route]]
            pattern = "011."
            trunk = "b"
            priority = 20

            [[outbound_route]]
            pattern = "9."
            trunk = "a"
            priority = 10
            "#,
        )
        .unwrap();

        ConfigSnapshot::compile(config)
    }

    #[test]
    fn lookups() {
        let snapshot = sample();

        assert!(snapshot.extension("100").is_some());
        assert!(snapshot.extension("101").is_none());
        assert_eq!(snapshot.inbound_number("+15551234567").unwrap().target, "100");
    }

    #[test]
    fn routes_ordered_by_priority() {
        let snapshot = sample();

        let priorities: Vec<u32> = snapshot.routes().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![10, 20]);
    }

    #[test]
    fn swap_is_visible_to_new_loads() {
        let store = SnapshotStore::new(sample());

        assert!(store.load().extension("200").is_none());

        let config: PbxConfig = toml::from_str(
            r#"
            [sip]
            domain = "pbx.example.org"

            [[extension]]
            number = "200"
            password = "pw"
            "#,
        )
        .unwrap();

        store.store(ConfigSnapshot::compile(config));

        assert!(store.load().extension("200").is_some());
    }
}
