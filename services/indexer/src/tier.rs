//! Tier-driven block window calculation. Pure, no I/O.

use chain_common::ChainId;
use indexer_common::tier::{SubscriptionTier, FROM_DEPLOYMENT};
use indexer_common::BlockWindow;

/// Compute the block window a session covers.
///
/// The start is `head - historical_days * blocks_per_day`, clamped up to
/// the deployment block; Enterprise's `FROM_DEPLOYMENT` mode starts at the
/// deployment block outright.
pub fn calculate_window(
    chain: ChainId,
    head: u64,
    tier: &SubscriptionTier,
    deployment_block: u64,
) -> BlockWindow {
    let start = if tier.historical_days == FROM_DEPLOYMENT {
        deployment_block
    } else {
        let span = (tier.historical_days as u64).saturating_mul(chain.blocks_per_day());
        head.saturating_sub(span).max(deployment_block)
    };

    // A deployment past the head can only come from a stale head; collapse
    // to a single-block window at the head rather than inverting the range.
    let start = start.min(head);
    BlockWindow::new(start, head, deployment_block.min(start))
}
