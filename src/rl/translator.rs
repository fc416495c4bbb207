//! Discrete action -> transaction unit translation.
//!
//! Each asset gets an action index in `[0, action_atoms)`. The index is
//! centred on `action_atoms / 2` and scaled by a trade unit sized from the
//! available margin, so `action_atoms = 5` gives multipliers `-2..=2`.
//! The flat (midpoint) action closes any open position outright.

use serde::{Deserialize, Serialize};

use crate::env::Environment;
use crate::error::{Result, TraderError};

/// Portfolio fields the translator reads from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub available_margin: f64,
    pub prices: Vec<f64>,
    /// Signed units held per asset
    pub ledger: Vec<f64>,
}

impl PortfolioSnapshot {
    pub fn from_env<E: Environment + ?Sized>(env: &E) -> Self {
        Self {
            available_margin: env.available_margin(),
            prices: env.current_prices(),
            ledger: env.ledger(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionTranslator {
    n_assets: usize,
    action_atoms: usize,
    /// Proportion of available margin per trade unit
    unit_size: f64,
}

impl ActionTranslator {
    pub fn new(n_assets: usize, action_atoms: usize, unit_size: f64) -> Result<Self> {
        if action_atoms < 2 {
            return Err(TraderError::config(format!(
                "action_atoms must be at least 2, got {}",
                action_atoms
            )));
        }
        if n_assets == 0 {
            return Err(TraderError::config("translator needs at least one asset"));
        }
        Ok(Self {
            n_assets,
            action_atoms,
            unit_size,
        })
    }

    /// Index of the flat action
    pub fn midpoint(&self) -> usize {
        self.action_atoms / 2
    }

    pub fn action_atoms(&self) -> usize {
        self.action_atoms
    }

    /// Signed multiplier for an action index
    pub fn centered(&self, action: usize) -> f64 {
        action as f64 - self.midpoint() as f64
    }

    /// Convert one action per asset into signed transaction units.
    pub fn translate(&self, actions: &[usize], ctx: &PortfolioSnapshot) -> Result<Vec<f64>> {
        if actions.len() != self.n_assets {
            return Err(TraderError::config(format!(
                "got {} actions for {} assets",
                actions.len(),
                self.n_assets
            )));
        }
        if ctx.prices.len() != self.n_assets || ctx.ledger.len() != self.n_assets {
            return Err(TraderError::config(format!(
                "portfolio snapshot covers {} prices / {} holdings, expected {}",
                ctx.prices.len(),
                ctx.ledger.len(),
                self.n_assets
            )));
        }

        let mut transactions = Vec::with_capacity(self.n_assets);
        for (i, &action) in actions.iter().enumerate() {
            if action >= self.action_atoms {
                return Err(TraderError::config(format!(
                    "action {} for asset {} outside [0, {})",
                    action, i, self.action_atoms
                )));
            }
            let holding = ctx.ledger[i];
            if action == self.midpoint() {
                transactions.push(if holding != 0.0 { -holding } else { 0.0 });
                continue;
            }
            let price = ctx.prices[i];
            let units = if price > 0.0 {
                self.unit_size * ctx.available_margin / price
            } else {
                0.0
            };
            transactions.push(self.centered(action) * units);
        }
        Ok(transactions)
    }

    /// Zero any trade that would add to an existing position in the same
    /// direction.
    pub fn filter_doubling(transactions: &mut [f64], ledger: &[f64]) {
        for (tx, &held) in transactions.iter_mut().zip(ledger) {
            if held != 0.0 && held.signum() == tx.signum() && *tx != 0.0 {
                *tx = 0.0;
            }
        }
    }
}
