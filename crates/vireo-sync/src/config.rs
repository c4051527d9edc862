//! Protocol core configuration.

use serde::{Deserialize, Serialize};

/// Consensus timing parameters the core consults for stall math.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Expected inter-block time, seconds.
    pub target_spacing: i64,
    /// Spacing after the service upgrade activates.
    pub upgraded_target_spacing: i64,
    /// Activation time of the service upgrade (unix seconds of the tip's
    /// median time past).
    pub upgrade_time: i64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            target_spacing: 180,
            upgraded_target_spacing: 150,
            upgrade_time: 1_560_000_000,
        }
    }
}

impl ConsensusParams {
    /// Spacing in effect for a tip with the given median time past.
    pub fn target_spacing_at(&self, median_time_past: i64) -> i64 {
        if median_time_past > self.upgrade_time {
            self.upgraded_target_spacing
        } else {
            self.target_spacing
        }
    }
}

/// Behavior knobs recognized by the protocol core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Misbehavior threshold at which a peer is marked for banning.
    #[serde(default = "default_banscore")]
    pub banscore: u32,
    /// Orphan pool size cap.
    #[serde(default = "default_max_orphan_tx")]
    pub max_orphan_tx: usize,
    /// Let whitelisted peers relay even in blocks-only mode.
    #[serde(default = "default_true")]
    pub whitelist_relay: bool,
    /// Relay transactions from whitelisted peers even when not accepted.
    #[serde(default)]
    pub whitelist_force_relay: bool,
    /// Disconnect old-version peers that send filter messages to a
    /// non-bloom node.
    #[serde(default)]
    pub enforce_node_bloom: bool,
    /// Ignore transaction inventory entirely.
    #[serde(default)]
    pub blocks_only: bool,
    /// Randomly drop one in N received messages; 0 disables. Testing only.
    #[serde(default)]
    pub drop_messages_test: u32,
    /// Whether we accept inbound connections (gates self-advertisement).
    #[serde(default = "default_true")]
    pub listen: bool,
    /// Subversion string advertised in our version message.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub consensus: ConsensusParams,
}

fn default_banscore() -> u32 {
    crate::DEFAULT_BANSCORE
}

fn default_max_orphan_tx() -> usize {
    crate::DEFAULT_MAX_ORPHAN_TRANSACTIONS
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    "/vireo:0.4.1/".to_owned()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            banscore: default_banscore(),
            max_orphan_tx: default_max_orphan_tx(),
            whitelist_relay: true,
            whitelist_force_relay: false,
            enforce_node_bloom: false,
            blocks_only: false,
            drop_messages_test: 0,
            listen: true,
            user_agent: default_user_agent(),
            consensus: ConsensusParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacing_switches_at_upgrade() {
        let params = ConsensusParams::default();
        assert_eq!(
            params.target_spacing_at(params.upgrade_time - 1),
            params.target_spacing
        );
        assert_eq!(
            params.target_spacing_at(params.upgrade_time + 1),
            params.upgraded_target_spacing
        );
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.banscore, 100);
        assert!(config.whitelist_relay);
        assert!(!config.blocks_only);
    }
}
