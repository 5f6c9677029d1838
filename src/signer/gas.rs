//! Gas price resolution and auto-gas limits

use crate::error::RuntimeResult;
use crate::node::ChainNode;

use ethers::types::U256;
use tracing::debug;

/// Multiplier precision used for auto-gas arithmetic
const MULTIPLIER_SCALE: u64 = 1_000_000;

/// Fixed price if configured, else the node's median price.
///
/// Nodes reporting a price of zero get `floor` instead.
pub async fn resolve_gas_price(
    node: &dyn ChainNode,
    fixed: Option<U256>,
    floor: U256,
) -> RuntimeResult<U256> {
    if let Some(price) = fixed {
        return Ok(price);
    }

    let price = node.gas_price().await?;
    if price.is_zero() {
        debug!("Node returned gas price 0, using fallback {} wei", floor);
        return Ok(floor);
    }
    Ok(price)
}

/// Highest gas limit a transaction can request without risking the next
/// block's limit adjustment (1/1024 per block) pushing it out
pub fn block_gas_cap(block_gas_limit: U256) -> U256 {
    block_gas_limit * 255 / 256
}

/// `floor(min(estimate * multiplier, block_gas_limit * 255/256))`
pub fn auto_gas_limit(estimate: U256, multiplier: f64, block_gas_limit: U256) -> U256 {
    let scaled = (multiplier * MULTIPLIER_SCALE as f64).round().max(0.0) as u64;
    let wanted = estimate.saturating_mul(U256::from(scaled)) / MULTIPLIER_SCALE;
    wanted.min(block_gas_cap(block_gas_limit))
}
