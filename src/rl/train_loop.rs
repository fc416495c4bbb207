//! Interaction Loop
//!
//! [`TrainLoop`] is a pull-based iterator over batches of [`TrainMetrics`].
//! Every pull advances the environment until `log_freq` more training steps
//! have run (or the step budget is exhausted) and hands the accumulated
//! metrics back to the caller. It borrows the agent mutably, so the caller
//! can only inspect or checkpoint the agent between pulls.

use std::mem;

use tracing::{debug, info};

use crate::env::{Environment, Preprocessor};
use crate::error::Result;

use super::agent::OffPolicyAgent;
use super::data::Observation;
use super::metrics::{TestMetrics, TestRow, TrainMetrics};
use super::network::QNetwork;
use super::reward::compute_step_reward;
use super::targets::greedy_actions;

pub struct TrainLoop<'a, N: QNetwork + 'static, E: Environment, P: Preprocessor> {
    agent: &'a mut OffPolicyAgent<N, E, P>,
    state: Option<Observation>,
    reset: bool,
    max_training_steps: u64,
    log_freq: u64,
    pending: Vec<TrainMetrics>,
    finished: bool,
}

impl<'a, N: QNetwork + 'static, E: Environment, P: Preprocessor> TrainLoop<'a, N, E, P> {
    fn new(agent: &'a mut OffPolicyAgent<N, E, P>, n: u64, reset: bool, log_freq: u64) -> Self {
        let entry = agent.state().training_steps;
        Self {
            agent,
            state: None,
            reset,
            max_training_steps: entry + n,
            log_freq: log_freq.min(n).max(1),
            pending: Vec::new(),
            finished: false,
        }
    }

    /// Training step count at which the loop stops.
    pub fn max_training_steps(&self) -> u64 {
        self.max_training_steps
    }

    pub fn agent(&self) -> &OffPolicyAgent<N, E, P> {
        self.agent
    }

    /// Run a test episode between pulls. The episode resets the environment,
    /// so the next pull starts a fresh trajectory.
    pub fn test_episode(&mut self, steps: usize, use_target: bool) -> Result<TestMetrics> {
        self.state = None;
        self.reset = true;
        self.agent.test_episode(steps, true, use_target)
    }

    pub fn save_state(&self, branch: &str) -> Result<()> {
        self.agent.save_state(branch)
    }

    fn current(&mut self) -> Result<Observation> {
        match self.state.take() {
            Some(state) => Ok(state),
            None => {
                self.agent.set_training(true);
                if self.reset {
                    self.reset = false;
                    self.agent.reset_state()
                } else {
                    Ok(self.agent.current_state())
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Vec<TrainMetrics>>> {
        let min_size = self.agent.config().off_policy.replay_min_size;
        loop {
            if self.agent.state().training_steps >= self.max_training_steps {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(mem::take(&mut self.pending)));
            }

            let state = self.current()?;
            let step = match self.agent.interact(&state)? {
                Some(step) => step,
                None => {
                    self.state = Some(self.agent.reset_state()?);
                    continue;
                }
            };

            *self.agent.running_reward_mut() += step.reward;
            if step.done {
                debug!(
                    running_reward = self.agent.running_reward(),
                    env_steps = self.agent.state().env_steps,
                    "[RL] Episode done"
                );
                self.state = Some(self.agent.reset_state()?);
                *self.agent.running_reward_mut() = 0.0;
            } else {
                self.state = Some(step.next_state);
            }

            let trained = if self.agent.buffer().len() > min_size {
                let metrics = self.agent.train_step(None)?;
                self.pending.push(metrics);
                true
            } else {
                false
            };
            self.agent.state_mut().env_steps += 1;

            if trained && self.agent.state().training_steps % self.log_freq == 0 {
                return Ok(Some(mem::take(&mut self.pending)));
            }
        }
    }
}

impl<'a, N: QNetwork + 'static, E: Environment, P: Preprocessor> Iterator for TrainLoop<'a, N, E, P> {
    type Item = Result<Vec<TrainMetrics>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<N: QNetwork + 'static, E: Environment, P: Preprocessor> OffPolicyAgent<N, E, P> {
    /// Run until `n` more training steps have been taken, yielding metrics
    /// every `log_freq` training steps. Defaults to `trainer.log_freq`.
    pub fn step(&mut self, n: u64, reset: bool, log_freq: Option<u64>) -> TrainLoop<'_, N, E, P> {
        let log_freq = log_freq.unwrap_or(self.config().trainer.log_freq);
        TrainLoop::new(self, n, reset, log_freq)
    }

    /// Greedy evaluation episode of at most `steps` environment steps.
    ///
    /// Networks are in evaluation mode (no weight noise) for the duration,
    /// nothing is written to the replay buffer and the exploration schedule
    /// is untouched. Stops early on `done` or when the data source ends.
    pub fn test_episode(&mut self, steps: usize, reset: bool, use_target: bool) -> Result<TestMetrics> {
        self.set_training(false);
        let result = self.run_test_episode(steps, reset, use_target);
        self.set_training(true);
        let table = result?;
        info!(
            steps = table.len(),
            total_reward = table.total_reward(),
            final_equity = ?table.final_equity(),
            "[RL] Test episode finished"
        );
        Ok(table)
    }

    fn run_test_episode(&mut self, steps: usize, reset: bool, use_target: bool) -> Result<TestMetrics> {
        let mut state = if reset {
            self.reset_state()?
        } else {
            self.current_state()
        };
        let mut table = TestMetrics::default();

        for _ in 0..steps {
            let qvals = self.q_values(&state, use_target)?;
            let actions = greedy_actions(&qvals.clone().insert_axis(ndarray::Axis(0)))
                .row(0)
                .to_vec();
            let transactions = self.transactions_for(&actions)?;

            let prev_equity = self.env().equity();
            let prev_values = self.env().position_values();
            let timestamp = state.timestamp;
            let step = self.env_mut().step(&transactions)?;
            if step.info.data_end {
                break;
            }
            let reward = compute_step_reward(
                prev_equity,
                &prev_values,
                &self.env().position_values(),
                &step.info.broker,
                &self.config().off_policy.reward,
            );
            self.stream_observation(&step.observation)?;
            state = self.current_state();

            let env = self.env();
            table.push(TestRow {
                timestamp,
                qvals: qvals.outer_iter().map(|row| row.to_vec()).collect(),
                actions,
                transactions: step.info.broker.transaction_units.clone(),
                transaction_cost: step.info.broker.transaction_cost.clone(),
                reward: reward.iter().map(|&r| r as f64).sum(),
                equity: env.equity(),
                cash: env.cash(),
                position_values: env.position_values(),
                ledger: env.ledger(),
                available_margin: env.available_margin(),
                margin_call: step.info.broker.margin_call,
            });
            if step.done {
                break;
            }
        }
        Ok(table)
    }
}
