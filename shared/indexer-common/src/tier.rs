//! Subscription tiers and the quotas they carry.
//!
//! The plan table ships with the binary and mirrors the on-chain
//! subscription contract's values. Deployments verify against the deployed
//! contract through the subscription resolver seam; this table is the
//! fallback of record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel for "index from deployment" (Enterprise only).
pub const FROM_DEPLOYMENT: i64 = -1;

/// A subscription plan and the indexing quotas attached to it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTier {
    pub name: &'static str,
    pub tier_number: u8,
    /// Days of history a session may cover; `FROM_DEPLOYMENT` means the
    /// whole contract lifetime.
    pub historical_days: i64,
    pub continuous_sync: bool,
    pub max_contracts: u32,
    pub api_quota: u64,
}

pub const FREE: SubscriptionTier = SubscriptionTier {
    name: "free",
    tier_number: 0,
    historical_days: 30,
    continuous_sync: false,
    max_contracts: 5,
    api_quota: 10_000,
};

pub const STARTER: SubscriptionTier = SubscriptionTier {
    name: "starter",
    tier_number: 1,
    historical_days: 90,
    continuous_sync: true,
    max_contracts: 10,
    api_quota: 100_000,
};

pub const PRO: SubscriptionTier = SubscriptionTier {
    name: "pro",
    tier_number: 2,
    historical_days: 365,
    continuous_sync: true,
    max_contracts: 25,
    api_quota: 1_000_000,
};

pub const ENTERPRISE: SubscriptionTier = SubscriptionTier {
    name: "enterprise",
    tier_number: 3,
    historical_days: 730,
    continuous_sync: true,
    max_contracts: 100,
    api_quota: 10_000_000,
};

pub const ALL_TIERS: [SubscriptionTier; 4] = [FREE, STARTER, PRO, ENTERPRISE];

impl SubscriptionTier {
    pub fn from_number(tier_number: u8) -> Option<SubscriptionTier> {
        ALL_TIERS.into_iter().find(|t| t.tier_number == tier_number)
    }

    pub fn from_name(name: &str) -> Option<SubscriptionTier> {
        let lower = name.to_lowercase();
        ALL_TIERS.into_iter().find(|t| t.name == lower)
    }

    /// Chunks a session may fetch in parallel.
    pub fn chunk_concurrency(&self) -> usize {
        if self.tier_number >= 3 {
            8
        } else {
            4
        }
    }

    /// Cap on concurrent RPC calls per chain for this tier's sessions.
    pub fn rpc_concurrency(&self) -> usize {
        match self.tier_number {
            0 | 1 => 16,
            2 => 32,
            _ => 64,
        }
    }

    /// Hard wall-clock limit before a session fails with a timeout.
    pub fn hard_deadline(&self) -> std::time::Duration {
        if self.tier_number >= 2 {
            std::time::Duration::from_secs(6 * 3600)
        } else {
            std::time::Duration::from_secs(3600)
        }
    }
}

/// Resolved subscription state for a wallet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierInfo {
    pub tier_number: u8,
    pub tier_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TierInfo {
    pub fn tier(&self) -> SubscriptionTier {
        SubscriptionTier::from_number(self.tier_number).unwrap_or(FREE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_table_matches_contract() {
        assert_eq!(FREE.historical_days, 30);
        assert_eq!(STARTER.historical_days, 90);
        assert_eq!(PRO.historical_days, 365);
        assert_eq!(ENTERPRISE.historical_days, 730);
        assert!(!FREE.continuous_sync);
        assert!(STARTER.continuous_sync);
    }

    #[test]
    fn test_tier_lookup() {
        assert_eq!(SubscriptionTier::from_number(2), Some(PRO));
        assert_eq!(SubscriptionTier::from_number(9), None);
        assert_eq!(SubscriptionTier::from_name("Enterprise"), Some(ENTERPRISE));
    }

    #[test]
    fn test_concurrency_by_tier() {
        assert_eq!(FREE.chunk_concurrency(), 4);
        assert_eq!(ENTERPRISE.chunk_concurrency(), 8);
        assert_eq!(FREE.rpc_concurrency(), 16);
        assert_eq!(PRO.rpc_concurrency(), 32);
        assert_eq!(ENTERPRISE.rpc_concurrency(), 64);
    }

    #[test]
    fn test_hard_deadlines() {
        assert_eq!(FREE.hard_deadline().as_secs(), 3600);
        assert_eq!(PRO.hard_deadline().as_secs(), 6 * 3600);
    }

    #[test]
    fn test_tier_info_fallback() {
        let info = TierInfo {
            tier_number: 42,
            tier_name: "unknown".into(),
            expires_at: None,
        };
        assert_eq!(info.tier(), FREE);
    }
}
