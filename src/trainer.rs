//! Training orchestration
//!
//! Wraps the agent's interaction loop with everything that is not model
//! optimisation: metric summaries and JSON-lines logs, periodic greedy test
//! episodes, periodic checkpoints, and a final test + save that runs whether
//! the loop finishes or fails.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::TrainerConfig;
use crate::env::{Environment, Preprocessor};
use crate::error::{Result, TraderError};
use crate::rl::checkpoint::MAIN_BRANCH;
use crate::rl::metrics::{MetricsHistory, TestMetrics, TrainSummary};
use crate::rl::network::QNetwork;
use crate::rl::train_loop::TrainLoop;
use crate::rl::OffPolicyAgent;

const TRAIN_LOG: &str = "train.jsonl";
const TEST_LOG: &str = "test.jsonl";

/// What a finished `train` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainReport {
    pub batches: u64,
    pub training_steps: u64,
    pub env_steps: u64,
    pub tests_run: usize,
    pub checkpoints_saved: usize,
    pub avg_loss: f32,
    pub avg_td_error: f32,
    pub final_test: Option<TestSummary>,
}

/// One line of the test log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestSummary {
    pub training_steps: u64,
    pub env_steps: u64,
    pub steps: usize,
    pub total_reward: f64,
    pub final_equity: Option<f64>,
    pub transaction_cost: f64,
    pub mean_max_qval: f32,
}

impl TestSummary {
    fn new(table: &TestMetrics, training_steps: u64, env_steps: u64) -> Self {
        Self {
            training_steps,
            env_steps,
            steps: table.len(),
            total_reward: table.total_reward(),
            final_equity: table.final_equity(),
            transaction_cost: table.total_transaction_cost(),
            mean_max_qval: table.mean_max_qval(),
        }
    }
}

/// Append one JSON document as a line.
fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TraderError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| TraderError::io(path, e))?;
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line).map_err(|e| TraderError::io(path, e))
}

/// Fires each time the counter crosses a multiple of `every`.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    every: u64,
    next: u64,
}

impl Schedule {
    fn new(every: u64, from: u64) -> Self {
        let every = every.max(1);
        Self {
            every,
            next: (from / every + 1) * every,
        }
    }

    fn due(&mut self, counter: u64) -> bool {
        if counter < self.next {
            return false;
        }
        self.next = (counter / self.every + 1) * self.every;
        true
    }
}

pub struct Trainer<N: QNetwork + 'static, E: Environment, P: Preprocessor> {
    agent: OffPolicyAgent<N, E, P>,
    config: TrainerConfig,
    history: MetricsHistory,
    logdir: PathBuf,
}

impl<N: QNetwork + 'static, E: Environment, P: Preprocessor> Trainer<N, E, P> {
    pub fn new(agent: OffPolicyAgent<N, E, P>) -> Self {
        let config = agent.config().trainer.clone();
        let logdir = agent
            .config()
            .basepath
            .join(&agent.config().experiment_id)
            .join("logs");
        Self {
            agent,
            config,
            history: MetricsHistory::new(),
            logdir,
        }
    }

    pub fn agent(&self) -> &OffPolicyAgent<N, E, P> {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut OffPolicyAgent<N, E, P> {
        &mut self.agent
    }

    pub fn into_agent(self) -> OffPolicyAgent<N, E, P> {
        self.agent
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    /// One greedy test episode from a fresh reset, logged to the test log.
    pub fn test(&mut self, steps: Option<usize>) -> Result<TestSummary> {
        let steps = steps.unwrap_or(self.agent.config().off_policy.test_steps);
        let table = self.agent.test_episode(steps, true, true)?;
        let state = self.agent.state();
        let summary = TestSummary::new(&table, state.training_steps, state.env_steps);
        append_jsonl(&self.logdir.join(TEST_LOG), &summary)?;
        Ok(summary)
    }

    /// Train for `n` training steps (default `train_steps`).
    ///
    /// The final test episode and `main` checkpoint are attempted even when
    /// the loop fails; the loop's error is returned afterwards.
    pub fn train(&mut self, n: Option<u64>) -> Result<TrainReport> {
        let n = n.unwrap_or(self.config.train_steps);
        let mut report = TrainReport::default();

        info!(
            agent = self.agent.name(),
            n = n,
            training_steps = self.agent.state().training_steps,
            "[TRAINER] Starting training"
        );

        let outcome = self.run(n, &mut report);
        if let Err(e) = &outcome {
            error!(error = %e, "[TRAINER] Training loop failed");
        }

        let finish = self.finish(&mut report);
        match (outcome, finish) {
            (Err(e), Err(final_err)) => {
                warn!(error = %final_err, "[TRAINER] Final test/save also failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                info!(
                    batches = report.batches,
                    training_steps = report.training_steps,
                    env_steps = report.env_steps,
                    avg_loss = report.avg_loss,
                    avg_td_error = report.avg_td_error,
                    "[TRAINER] Done training"
                );
                Ok(report)
            }
        }
    }

    fn run(&mut self, n: u64, report: &mut TrainReport) -> Result<()> {
        self.agent.warm_up()?;

        let test_steps = self.agent.config().off_policy.test_steps;
        let start = self.agent.state().env_steps;
        let mut tests = Schedule::new(self.config.test_freq, start);
        let mut saves = Schedule::new(self.config.model_save_freq, start);
        let train_log = self.logdir.join(TRAIN_LOG);
        let test_log = self.logdir.join(TEST_LOG);

        let mut train_loop: TrainLoop<'_, N, E, P> =
            self.agent.step(n, true, Some(self.config.log_freq));
        while let Some(batch) = train_loop.next() {
            let batch = batch?;
            let Some(summary) = TrainSummary::from_batch(&batch) else {
                continue;
            };
            info!(
                training_steps = summary.training_steps,
                env_steps = summary.env_steps,
                loss = summary.loss,
                td_error = summary.td_error,
                qt = summary.qt_mean,
                gt = summary.gt_mean,
                eps = summary.eps,
                running_reward = summary.running_reward,
                "[TRAINER] Batch"
            );
            append_jsonl(&train_log, &summary)?;
            self.history.record(summary);
            report.batches += 1;

            let state = train_loop.agent().state();
            if tests.due(state.env_steps) {
                info!(env_steps = state.env_steps, "[TRAINER] Testing model");
                let table = train_loop.test_episode(test_steps, true)?;
                let summary = TestSummary::new(&table, state.training_steps, state.env_steps);
                append_jsonl(&test_log, &summary)?;
                report.tests_run += 1;
            }
            if saves.due(state.env_steps) {
                info!(env_steps = state.env_steps, "[TRAINER] Saving agent state");
                train_loop.save_state(MAIN_BRANCH)?;
                report.checkpoints_saved += 1;
            }
        }
        Ok(())
    }

    fn finish(&mut self, report: &mut TrainReport) -> Result<()> {
        let test = self.test(None);
        let save = self.agent.save_state(MAIN_BRANCH);

        let state = self.agent.state();
        report.training_steps = state.training_steps;
        report.env_steps = state.env_steps;
        report.avg_loss = self.history.avg_loss();
        report.avg_td_error = self.history.avg_td_error();

        let summary = test?;
        report.tests_run += 1;
        report.final_test = Some(summary);
        save?;
        report.checkpoints_saved += 1;
        Ok(())
    }
}
