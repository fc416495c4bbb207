//! Training and Test Metrics
//!
//! Record types streamed out of the interaction loop and test episodes, plus
//! the reductions the trainer logs:
//! - [`TrainMetrics`]: one row per training step
//! - [`TrainSummary`]: mean/last reduction over a yielded batch
//! - [`TestMetrics`]: per-step table from a greedy test episode
//! - [`MetricsHistory`]: bounded rolling history of batch summaries

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of batch summaries retained for moving averages
const MAX_HISTORY_SIZE: usize = 100;

// =============================================================================
// Training step metrics
// =============================================================================

/// Metrics produced by one training step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub loss: f32,
    pub td_error: f32,
    pub qt_mean: f32,
    pub gt_mean: f32,
    /// Global gradient norm before clipping
    pub grad_norm: f32,
    pub eps: f64,
    /// Shaped reward accumulated since the last episode reset
    pub running_reward: f64,
    pub training_steps: u64,
    pub env_steps: u64,
    /// Auxiliary objective losses by name (`loss_ae`, `loss_curl`, ...)
    #[serde(default)]
    pub extra: BTreeMap<String, f32>,
}

/// Reduction of a metrics batch: means for losses, last value for counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    pub count: usize,
    pub loss: f32,
    pub td_error: f32,
    pub qt_mean: f32,
    pub gt_mean: f32,
    pub grad_norm: f32,
    pub eps: f64,
    pub running_reward: f64,
    pub training_steps: u64,
    pub env_steps: u64,
    pub extra: BTreeMap<String, f32>,
}

impl TrainSummary {
    /// `None` for an empty batch.
    pub fn from_batch(batch: &[TrainMetrics]) -> Option<Self> {
        let last = batch.last()?;
        let n = batch.len() as f32;
        let mean = |f: fn(&TrainMetrics) -> f32| batch.iter().map(f).sum::<f32>() / n;

        let mut extra: BTreeMap<String, (f32, usize)> = BTreeMap::new();
        for m in batch {
            for (k, v) in &m.extra {
                let entry = extra.entry(k.clone()).or_insert((0.0, 0));
                entry.0 += v;
                entry.1 += 1;
            }
        }

        Some(Self {
            count: batch.len(),
            loss: mean(|m| m.loss),
            td_error: mean(|m| m.td_error),
            qt_mean: mean(|m| m.qt_mean),
            gt_mean: mean(|m| m.gt_mean),
            grad_norm: mean(|m| m.grad_norm),
            eps: last.eps,
            running_reward: last.running_reward,
            training_steps: last.training_steps,
            env_steps: last.env_steps,
            extra: extra
                .into_iter()
                .map(|(k, (sum, count))| (k, sum / count as f32))
                .collect(),
        })
    }
}

// =============================================================================
// Rolling history
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MetricsHistory {
    summaries: VecDeque<TrainSummary>,
    total_batches: u64,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, summary: TrainSummary) {
        if self.summaries.len() >= MAX_HISTORY_SIZE {
            self.summaries.pop_front();
        }
        self.summaries.push_back(summary);
        self.total_batches += 1;
    }

    pub fn total_batches(&self) -> u64 {
        self.total_batches
    }

    pub fn latest(&self) -> Option<&TrainSummary> {
        self.summaries.back()
    }

    /// Moving average of batch losses
    pub fn avg_loss(&self) -> f32 {
        if self.summaries.is_empty() {
            return 0.0;
        }
        self.summaries.iter().map(|s| s.loss).sum::<f32>() / self.summaries.len() as f32
    }

    pub fn avg_td_error(&self) -> f32 {
        if self.summaries.is_empty() {
            return 0.0;
        }
        self.summaries.iter().map(|s| s.td_error).sum::<f32>() / self.summaries.len() as f32
    }
}

// =============================================================================
// Test episode table
// =============================================================================

/// One environment step of a greedy test episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRow {
    pub timestamp: i64,
    /// Action values `[assets][atoms]`
    pub qvals: Vec<Vec<f32>>,
    pub actions: Vec<usize>,
    pub transactions: Vec<f64>,
    pub transaction_cost: Vec<f64>,
    pub reward: f64,
    pub equity: f64,
    pub cash: f64,
    pub position_values: Vec<f64>,
    pub ledger: Vec<f64>,
    pub available_margin: f64,
    pub margin_call: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMetrics {
    pub rows: Vec<TestRow>,
}

impl TestMetrics {
    pub fn push(&mut self, row: TestRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_reward(&self) -> f64 {
        self.rows.iter().map(|r| r.reward).sum()
    }

    pub fn final_equity(&self) -> Option<f64> {
        self.rows.last().map(|r| r.equity)
    }

    pub fn total_transaction_cost(&self) -> f64 {
        self.rows
            .iter()
            .flat_map(|r| r.transaction_cost.iter())
            .sum()
    }

    /// Mean of the greedy action values over the episode
    pub fn mean_max_qval(&self) -> f32 {
        let maxes: Vec<f32> = self
            .rows
            .iter()
            .flat_map(|r| {
                r.qvals
                    .iter()
                    .map(|q| q.iter().cloned().fold(f32::NEG_INFINITY, f32::max))
            })
            .collect();
        if maxes.is_empty() {
            return 0.0;
        }
        maxes.iter().sum::<f32>() / maxes.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(loss: f32, step: u64) -> TrainMetrics {
        TrainMetrics {
            loss,
            td_error: loss * 2.0,
            training_steps: step,
            env_steps: step + 10,
            eps: 1.0 / (step as f64 + 1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary_means_and_last() {
        let mut batch = vec![metrics(1.0, 1), metrics(3.0, 2)];
        batch[1].extra.insert("loss_ae".to_string(), 0.5);
        let s = TrainSummary::from_batch(&batch).unwrap();
        assert_eq!(s.count, 2);
        assert!((s.loss - 2.0).abs() < 1e-6);
        assert!((s.td_error - 4.0).abs() < 1e-6);
        assert_eq!(s.training_steps, 2);
        assert_eq!(s.env_steps, 12);
        assert!((s.extra["loss_ae"] - 0.5).abs() < 1e-6);
        assert!(TrainSummary::from_batch(&[]).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = MetricsHistory::new();
        for i in 0..150 {
            history.record(TrainSummary {
                loss: i as f32,
                td_error: (i % 2) as f32,
                ..Default::default()
            });
        }
        assert_eq!(history.total_batches(), 150);
        assert!((history.avg_td_error() - 0.5).abs() < 1e-6);
        // last 100 losses are 50..150
        assert!((history.avg_loss() - 99.5).abs() < 1e-3);
        assert_eq!(history.latest().unwrap().loss, 149.0);
    }

    #[test]
    fn test_test_metrics_reductions() {
        let mut table = TestMetrics::default();
        table.push(TestRow {
            reward: 0.5,
            equity: 1010.0,
            transaction_cost: vec![1.0, 0.5],
            qvals: vec![vec![0.1, 0.4, 0.2]],
            ..Default::default()
        });
        table.push(TestRow {
            reward: -0.25,
            equity: 1005.0,
            transaction_cost: vec![0.25, 0.0],
            qvals: vec![vec![0.0, -1.0, 0.2]],
            ..Default::default()
        });
        assert_eq!(table.len(), 2);
        assert!((table.total_reward() - 0.25).abs() < 1e-12);
        assert_eq!(table.final_equity(), Some(1005.0));
        assert!((table.total_transaction_cost() - 1.75).abs() < 1e-12);
        assert!((table.mean_max_qval() - 0.3).abs() < 1e-6);
    }
}
