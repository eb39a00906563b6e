//! Deployment block discovery.
//!
//! Binary search over `get_code_at`: code present at block `b` means the
//! deployment is at or before `b`. Results are cached for the process
//! lifetime since a deployment block never changes.

use crate::error::{IndexerError, Result};
use crate::fetcher::ContractFetcher;
use crate::rpc::CallOptions;
use chain_common::ChainId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct DeploymentFinder {
    fetcher: Arc<dyn ContractFetcher>,
    cache: DashMap<(ChainId, String), u64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl DeploymentFinder {
    pub fn new(fetcher: Arc<dyn ContractFetcher>) -> Self {
        Self {
            fetcher,
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Find the first block at which `address` held code, searching
    /// `[0, head]`. `NotAContract` when the address has no code at `head`.
    pub async fn find_deployment_block(
        &self,
        chain: ChainId,
        address: &str,
        head: u64,
        opts: &CallOptions,
    ) -> Result<u64> {
        let key = (chain, address.to_lowercase());
        if let Some(cached) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if !self.has_code(chain, address, head, opts).await? {
            return Err(IndexerError::NotAContract {
                chain,
                address: address.to_string(),
            });
        }

        let mut lo = 0u64;
        let mut hi = head;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.has_code(chain, address, mid, opts).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
            debug!(
                "deployment search for {} on {} narrowed to [{}, {}]",
                address, chain, lo, hi
            );
        }

        info!("contract {} on {} deployed at block {}", address, chain, lo);
        self.cache.insert(key, lo);
        Ok(lo)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    async fn has_code(
        &self,
        chain: ChainId,
        address: &str,
        block: u64,
        opts: &CallOptions,
    ) -> Result<bool> {
        let code = self.fetcher.get_code_at(chain, address, block, opts).await?;
        Ok(!matches!(code.as_str(), "" | "0x" | "0x0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFetcher;

    #[tokio::test]
    async fn test_finds_deployment_block() {
        let fetcher = Arc::new(MockFetcher::new(1_000_000).with_deployment(4_321));
        let finder = DeploymentFinder::new(fetcher.clone());

        let block = finder
            .find_deployment_block(
                ChainId::Ethereum,
                "0xae",
                1_000_000,
                &CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(block, 4_321);

        // O(log head) calls: 1 head check + ~20 bisection probes.
        assert!(fetcher.code_calls() <= 22, "used {}", fetcher.code_calls());
    }

    #[tokio::test]
    async fn test_deployment_at_genesis() {
        let fetcher = Arc::new(MockFetcher::new(100).with_deployment(0));
        let finder = DeploymentFinder::new(fetcher);
        let block = finder
            .find_deployment_block(ChainId::Lisk, "0xae", 100, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(block, 0);
    }

    #[tokio::test]
    async fn test_not_a_contract() {
        let fetcher = Arc::new(MockFetcher::new(100));
        let finder = DeploymentFinder::new(fetcher);
        let err = finder
            .find_deployment_block(ChainId::Ethereum, "0xae", 100, &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::NotAContract { .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_search() {
        let fetcher = Arc::new(MockFetcher::new(1_000).with_deployment(500));
        let finder = DeploymentFinder::new(fetcher.clone());
        let opts = CallOptions::default();

        finder
            .find_deployment_block(ChainId::Ethereum, "0xAE", 1_000, &opts)
            .await
            .unwrap();
        let calls_after_first = fetcher.code_calls();

        // Same address with different casing hits the cache.
        finder
            .find_deployment_block(ChainId::Ethereum, "0xae", 1_000, &opts)
            .await
            .unwrap();
        assert_eq!(fetcher.code_calls(), calls_after_first);
        assert_eq!(finder.cache_stats().hits, 1);
        assert!(finder.cache_stats().hit_rate() > 0.0);
    }
}
