//! Reward Shaping for Off-Policy Training
//!
//! Converts the change in position value over one environment step into a
//! log-return style reward per asset:
//!
//! ```text
//! r_i = ln(max(offset + (value_i' - value_i - cost_i) / prev_equity, floor))
//! ```
//!
//! where `cost_i = units_i * price_i + transaction_cost_i` is the margin spent
//! on the step's transaction. The floor keeps the log finite after a large
//! loss; such steps are logged rather than raised.

use tracing::warn;

use crate::config::RewardConfig;
use crate::env::BrokerResponse;

/// Proportional equity change attributable to each asset over one step.
///
/// # Arguments
/// * `prev_equity` - Account equity before the step
/// * `prev_values` - Position values before the step
/// * `curr_values` - Position values after the step
/// * `broker` - Broker response for the step's transaction
///
/// # Example
/// ```
/// use dqn_trader::env::BrokerResponse;
/// use dqn_trader::rl::reward::proportional_change;
///
/// // Position grew from 100 to 110 with no trade, equity 1000
/// let change = proportional_change(1000.0, &[100.0], &[110.0], &BrokerResponse::default());
/// assert!((change[0] - 0.01).abs() < 1e-12);
/// ```
pub fn proportional_change(
    prev_equity: f64,
    prev_values: &[f64],
    curr_values: &[f64],
    broker: &BrokerResponse,
) -> Vec<f64> {
    if prev_equity <= 0.0 {
        return vec![0.0; curr_values.len()];
    }
    curr_values
        .iter()
        .zip(prev_values)
        .enumerate()
        .map(|(i, (curr, prev))| {
            let units = broker.transaction_units.get(i).copied().unwrap_or(0.0);
            let price = broker.transaction_prices.get(i).copied().unwrap_or(0.0);
            let cost = broker.transaction_cost.get(i).copied().unwrap_or(0.0);
            (curr - prev - (units * price + cost)) / prev_equity
        })
        .collect()
}

/// Apply offset, floor and log to proportional changes.
///
/// Values below zero after the offset are logged as anomalies and floored.
pub fn shape_reward(change: &[f64], config: &RewardConfig) -> Vec<f32> {
    let mut shaped: Vec<f32> = change
        .iter()
        .map(|c| {
            let raw = c + config.offset;
            if raw < 0.0 {
                warn!(raw = raw, floor = config.floor, "[RL] Large negative reward, flooring");
            }
            raw.max(config.floor).ln() as f32
        })
        .collect();

    if config.reduce {
        shaped = vec![shaped.iter().sum()];
    }
    shaped
}

/// Full shaping pipeline used by the interaction loop.
pub fn compute_step_reward(
    prev_equity: f64,
    prev_values: &[f64],
    curr_values: &[f64],
    broker: &BrokerResponse,
    config: &RewardConfig,
) -> Vec<f32> {
    let change = proportional_change(prev_equity, prev_values, curr_values, broker);
    shape_reward(&change, config)
}
