//! Collaborator interfaces: market environment and observation preprocessor.
//!
//! The simulator and feature pipeline live outside this crate. The agent only
//! needs the narrow surface below: reset/step with a transaction vector, the
//! broker response for reward shaping, portfolio accessors for the action
//! translator, and a preprocessor that turns raw observations into the
//! windowed view fed to the network.

use std::collections::VecDeque;

use ndarray::{concatenate, Array3, Axis};
use serde::{Deserialize, Serialize};

use tracing::warn;

use crate::config::InputShape;
use crate::error::{Result, TraderError};
use crate::rl::data::Observation;

/// Outcome of the broker's risk check for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskInfo {
    Green,
    MarginCall,
    InsufficientMargin,
    NotEnoughCash,
}

impl Default for RiskInfo {
    fn default() -> Self {
        Self::Green
    }
}

/// Broker fields reported for every environment step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerResponse {
    pub transaction_units: Vec<f64>,
    pub transaction_prices: Vec<f64>,
    pub transaction_cost: Vec<f64>,
    pub margin_call: bool,
    pub risk_info: Vec<RiskInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub broker: BrokerResponse,
    /// The underlying data source is exhausted; the caller must reset
    pub data_end: bool,
}

#[derive(Debug, Clone)]
pub struct EnvStep {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

/// Market environment driven by per-asset transaction units.
pub trait Environment {
    fn reset(&mut self) -> Result<Observation>;

    fn step(&mut self, transaction: &[f64]) -> Result<EnvStep>;

    fn n_assets(&self) -> usize;

    fn equity(&self) -> f64;

    fn cash(&self) -> f64;

    fn position_values(&self) -> Vec<f64>;

    /// Signed units currently held per asset
    fn ledger(&self) -> Vec<f64>;

    fn available_margin(&self) -> f64;

    fn current_prices(&self) -> Vec<f64>;
}

/// Feature pipeline between the environment and the network.
pub trait Preprocessor {
    fn reset_state(&mut self);

    /// Append an observation. Rows that do not match the configured
    /// `[features, n_assets]` layout are a `Shape` error.
    fn stream_state(&mut self, observation: &Observation) -> Result<()>;

    /// Step the environment with empty transactions until enough history is
    /// buffered to produce a full window. Running out of data first is an
    /// `InsufficientData` error.
    fn initialize_history(&mut self, env: &mut dyn Environment) -> Result<()>;

    fn current_data(&self) -> Observation;
}

// =============================================================================
// Rolling window preprocessor
// =============================================================================

/// Keeps the last `window` price rows and the latest portfolio.
///
/// Incoming observations may carry any number of time rows; they are appended
/// and the window is trimmed from the front. Until the window is full the
/// oldest available row is repeated.
#[derive(Debug, Clone)]
pub struct WindowPreprocessor {
    shape: InputShape,
    n_assets: usize,
    rows: VecDeque<Array3<f32>>,
    latest: Observation,
}

impl WindowPreprocessor {
    pub fn new(shape: InputShape, n_assets: usize) -> Self {
        Self {
            shape,
            n_assets,
            rows: VecDeque::with_capacity(shape.window),
            latest: Observation::zeros(shape, n_assets),
        }
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.shape.window
    }
}

impl Preprocessor for WindowPreprocessor {
    fn reset_state(&mut self) {
        self.rows.clear();
        self.latest = Observation::zeros(self.shape, self.n_assets);
    }

    fn stream_state(&mut self, observation: &Observation) -> Result<()> {
        let expected = [self.shape.features, self.n_assets];
        if observation.price.shape()[1..] != expected {
            return Err(TraderError::Shape(format!(
                "observation rows are {:?}, window expects {:?}",
                &observation.price.shape()[1..],
                expected
            )));
        }
        for row in observation.price.axis_iter(Axis(0)) {
            if self.rows.len() >= self.shape.window {
                self.rows.pop_front();
            }
            self.rows.push_back(row.to_owned().insert_axis(Axis(0)));
        }
        self.latest.portfolio = observation.portfolio.clone();
        self.latest.timestamp = observation.timestamp;
        Ok(())
    }

    fn initialize_history(&mut self, env: &mut dyn Environment) -> Result<()> {
        let empty = vec![0.0; env.n_assets()];
        while !self.is_full() {
            let step = env.step(&empty)?;
            if step.info.data_end || step.done {
                return Err(TraderError::InsufficientData {
                    requested: self.shape.window,
                    available: self.rows.len(),
                });
            }
            self.stream_state(&step.observation)?;
        }
        Ok(())
    }

    fn current_data(&self) -> Observation {
        let mut obs = self.latest.clone();
        if self.rows.is_empty() {
            return obs;
        }
        let missing = self.shape.window.saturating_sub(self.rows.len());
        let mut views = Vec::with_capacity(self.shape.window);
        for _ in 0..missing {
            views.push(self.rows[0].view());
        }
        views.extend(self.rows.iter().map(|r| r.view()));
        match concatenate(Axis(0), &views) {
            Ok(price) => obs.price = price,
            Err(e) => warn!(error = %e, "[RL] Window rows are inconsistent, returning empty prices"),
        }
        obs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    /// Source with `remaining` rows of data left.
    struct ShortFeed {
        remaining: usize,
        t: i64,
    }

    impl Environment for ShortFeed {
        fn reset(&mut self) -> Result<Observation> {
            Ok(raw(0.0, 0))
        }

        fn step(&mut self, _transaction: &[f64]) -> Result<EnvStep> {
            self.t += 1;
            let data_end = self.remaining == 0;
            self.remaining = self.remaining.saturating_sub(1);
            Ok(EnvStep {
                observation: raw(self.t as f32, self.t),
                reward: 0.0,
                done: false,
                info: StepInfo {
                    data_end,
                    ..Default::default()
                },
            })
        }

        fn n_assets(&self) -> usize {
            2
        }

        fn equity(&self) -> f64 {
            0.0
        }

        fn cash(&self) -> f64 {
            0.0
        }

        fn position_values(&self) -> Vec<f64> {
            vec![0.0; 2]
        }

        fn ledger(&self) -> Vec<f64> {
            vec![0.0; 2]
        }

        fn available_margin(&self) -> f64 {
            0.0
        }

        fn current_prices(&self) -> Vec<f64> {
            vec![1.0; 2]
        }
    }

    fn raw(value: f32, ts: i64) -> Observation {
        Observation::new(
            Array3::from_elem((1, 1, 2), value),
            Array1::from_elem(3, value),
            ts,
        )
    }

    #[test]
    fn test_window_trims_from_front() {
        let shape = InputShape {
            window: 3,
            features: 1,
        };
        let mut pre = WindowPreprocessor::new(shape, 2);
        for i in 0..5 {
            pre.stream_state(&raw(i as f32, i)).unwrap();
        }
        let out = pre.current_data();
        assert_eq!(out.price.shape(), &[3, 1, 2]);
        assert_eq!(out.price[[0, 0, 0]], 2.0);
        assert_eq!(out.price[[2, 0, 1]], 4.0);
        assert_eq!(out.timestamp, 4);
    }

    #[test]
    fn test_partial_window_pads_with_oldest() {
        let shape = InputShape {
            window: 4,
            features: 1,
        };
        let mut pre = WindowPreprocessor::new(shape, 2);
        pre.stream_state(&raw(7.0, 1)).unwrap();
        pre.stream_state(&raw(8.0, 2)).unwrap();
        assert!(!pre.is_full());
        let out = pre.current_data();
        assert_eq!(out.price.shape(), &[4, 1, 2]);
        assert_eq!(out.price[[0, 0, 0]], 7.0);
        assert_eq!(out.price[[1, 0, 0]], 7.0);
        assert_eq!(out.price[[3, 0, 0]], 8.0);
    }

    #[test]
    fn test_reset_clears_history() {
        let shape = InputShape {
            window: 2,
            features: 1,
        };
        let mut pre = WindowPreprocessor::new(shape, 2);
        pre.stream_state(&raw(1.0, 1)).unwrap();
        pre.reset_state();
        let out = pre.current_data();
        assert!(out.price.iter().all(|&x| x == 0.0));
        assert_eq!(out.timestamp, 0);
    }

    #[test]
    fn test_mismatched_row_is_shape_error() {
        let shape = InputShape {
            window: 2,
            features: 1,
        };
        let mut pre = WindowPreprocessor::new(shape, 2);
        pre.stream_state(&raw(1.0, 1)).unwrap();
        pre.stream_state(&raw(2.0, 2)).unwrap();

        let narrow = Observation::new(Array3::from_elem((1, 1, 3), 9.0), Array1::zeros(4), 3);
        assert!(matches!(pre.stream_state(&narrow), Err(TraderError::Shape(_))));

        // the window keeps the last valid rows
        let out = pre.current_data();
        assert_eq!(out.price.shape(), &[2, 1, 2]);
        assert_eq!(out.price[[1, 0, 0]], 2.0);
        assert_eq!(out.timestamp, 2);
    }

    #[test]
    fn test_short_history_is_insufficient_data() {
        let shape = InputShape {
            window: 5,
            features: 1,
        };
        let mut pre = WindowPreprocessor::new(shape, 2);
        let mut feed = ShortFeed { remaining: 2, t: 0 };
        pre.stream_state(&feed.reset().unwrap()).unwrap();
        match pre.initialize_history(&mut feed) {
            Err(TraderError::InsufficientData {
                requested,
                available,
            }) => {
                assert_eq!(requested, 5);
                assert_eq!(available, 3);
            }
            other => panic!("expected insufficient data, got {:?}", other),
        }
        assert_eq!(feed.t, 3);
    }

    #[test]
    fn test_initialize_history_fills_window() {
        let shape = InputShape {
            window: 3,
            features: 1,
        };
        let mut pre = WindowPreprocessor::new(shape, 2);
        let mut feed = ShortFeed { remaining: 10, t: 0 };
        pre.stream_state(&feed.reset().unwrap()).unwrap();
        pre.initialize_history(&mut feed).unwrap();
        assert!(pre.is_full());
        assert_eq!(feed.t, 2);
    }
}
