//! Off-Policy Q Agent
//!
//! Owns the environment, preprocessor, behaviour/target networks, optimizer
//! and replay buffer, and wires them together:
//! - exploration (noisy net or epsilon-greedy) and action translation
//! - one environment interaction with reward shaping and buffer insertion
//! - one gradient step through the configured [`ValueEstimator`]
//! - target network maintenance (soft EMA or periodic hard copy)
//! - checkpoint and replay snapshot persistence
//!
//! The interaction loop and test episodes live in [`super::train_loop`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AgentVariant, ExperimentConfig};
use crate::env::{Environment, Preprocessor};
use crate::error::{Result, TraderError};

use super::checkpoint::{buffer_path, checkpoint_path, Checkpoint, MAIN_BRANCH};
use super::data::{Observation, StateBatch, Transition, TransitionBatch};
use super::estimator::{estimator_for, AuxiliaryObjective, NoAuxiliary, ValueEstimator};
use super::exploration::{Decision, ExplorationPolicy};
use super::metrics::TrainMetrics;
use super::network::{canonical_tau, hard_update, soft_update, MlpQNetwork, NetworkSpec, QNetwork};
use super::optimizer::{clip_grad_norm, Adam};
use super::replay_buffer::{PerConfig, ReplayBuffer, ReplayBufferConfig};
use super::reward::compute_step_reward;
use super::translator::{ActionTranslator, PortfolioSnapshot};

/// Counters persisted with every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub training_steps: u64,
    pub env_steps: u64,
    pub eps: f64,
}

/// Result of one environment interaction that did not hit the end of data.
#[derive(Debug, Clone)]
pub(crate) struct Interaction {
    pub next_state: Observation,
    pub reward: f64,
    pub done: bool,
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn buffer_config(config: &ExperimentConfig) -> ReplayBufferConfig {
    let op = &config.off_policy;
    ReplayBufferConfig {
        capacity: op.replay_size,
        nstep: op.nstep_return,
        discount: op.discount,
        prioritized: op.prioritized_replay.then(|| PerConfig {
            alpha: op.per_alpha,
            beta: op.per_beta,
            beta_steps: op.per_beta_steps,
        }),
    }
}

pub struct OffPolicyAgent<N: QNetwork, E: Environment, P: Preprocessor> {
    config: ExperimentConfig,
    env: E,
    preprocessor: P,
    behaviour: N,
    target: N,
    optimizer: Adam,
    buffer: ReplayBuffer,
    translator: ActionTranslator,
    exploration: ExplorationPolicy,
    estimator: Box<dyn ValueEstimator<N>>,
    auxiliary: Box<dyn AuxiliaryObjective<N>>,
    state: TrainerState,
    running_reward: f64,
    rng: StdRng,
}

impl<E: Environment, P: Preprocessor> OffPolicyAgent<MlpQNetwork, E, P> {
    /// Build an agent around two freshly initialised reference networks.
    pub fn from_config(config: ExperimentConfig, env: E, preprocessor: P) -> Result<Self> {
        config.validate()?;
        let mut init_rng = make_rng(config.seed);
        let spec = NetworkSpec::from_config(&config);
        let behaviour = MlpQNetwork::new(spec.clone(), &mut init_rng)?;
        let target = MlpQNetwork::new(spec, &mut init_rng)?;
        Self::new(config, env, preprocessor, behaviour, target)
    }
}

impl<N: QNetwork + 'static, E: Environment, P: Preprocessor> OffPolicyAgent<N, E, P> {
    /// Validate the configuration against the collaborators and restore the
    /// `main` checkpoint when one exists. Otherwise the target network starts
    /// as a copy of the behaviour network.
    pub fn new(
        config: ExperimentConfig,
        env: E,
        preprocessor: P,
        behaviour: N,
        target: N,
    ) -> Result<Self> {
        config.validate()?;
        if env.n_assets() != config.n_assets {
            return Err(TraderError::config(format!(
                "environment trades {} assets but config expects {}",
                env.n_assets(),
                config.n_assets
            )));
        }
        let expected = (config.n_assets, config.action_atoms);
        for (role, net) in [("behaviour", &behaviour), ("target", &target)] {
            if net.output_shape() != expected {
                return Err(TraderError::config(format!(
                    "{} network outputs {:?}, expected {:?}",
                    role,
                    net.output_shape(),
                    expected
                )));
            }
        }
        let quantile = matches!(config.agent, AgentVariant::Iqn(_));
        if behaviour.is_quantile() != quantile || target.is_quantile() != quantile {
            return Err(TraderError::config(format!(
                "{} agent needs {} networks",
                config.agent.name(),
                if quantile { "quantile" } else { "scalar" }
            )));
        }
        if config.off_policy.prioritized_replay && !quantile {
            warn!("[RL] Prioritized replay with DQN: priorities are never updated from TD errors");
        }

        let translator = ActionTranslator::new(
            config.n_assets,
            config.action_atoms,
            config.off_policy.unit_size,
        )?;
        let exploration = ExplorationPolicy::new(&config.off_policy);
        let estimator = estimator_for::<N>(&config);
        let optimizer = Adam::new(&config.optim);
        let buffer = ReplayBuffer::new(buffer_config(&config));
        let rng = make_rng(config.seed.map(|s| s.wrapping_add(1)));
        let state = TrainerState {
            training_steps: 0,
            env_steps: 0,
            eps: config.off_policy.eps,
        };

        let mut agent = Self {
            config,
            env,
            preprocessor,
            behaviour,
            target,
            optimizer,
            buffer,
            translator,
            exploration,
            estimator,
            auxiliary: Box::new(NoAuxiliary),
            state,
            running_reward: 0.0,
            rng,
        };

        if checkpoint_path(&agent.savepath(), MAIN_BRANCH).exists() {
            agent.load_state(MAIN_BRANCH)?;
        } else {
            hard_update(&mut agent.target, &agent.behaviour)?;
        }

        info!(
            agent = agent.estimator.name(),
            n_assets = agent.config.n_assets,
            action_atoms = agent.config.action_atoms,
            exploration = ?agent.exploration.mode(),
            training_steps = agent.state.training_steps,
            "[RL] Agent ready"
        );
        Ok(agent)
    }

    /// Replace the auxiliary objective evaluated after the value loss.
    pub fn with_auxiliary(mut self, auxiliary: Box<dyn AuxiliaryObjective<N>>) -> Self {
        debug!(objective = auxiliary.name(), "[RL] Auxiliary objective attached");
        self.auxiliary = auxiliary;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut TrainerState {
        &mut self.state
    }

    pub fn running_reward(&self) -> f64 {
        self.running_reward
    }

    pub(crate) fn running_reward_mut(&mut self) -> &mut f64 {
        &mut self.running_reward
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut ReplayBuffer {
        &mut self.buffer
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn behaviour(&self) -> &N {
        &self.behaviour
    }

    pub fn target(&self) -> &N {
        &self.target
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn translator(&self) -> &ActionTranslator {
        &self.translator
    }

    /// Variant name ("DQN" / "IQN")
    pub fn name(&self) -> &'static str {
        self.estimator.name()
    }

    pub fn savepath(&self) -> PathBuf {
        self.config.savepath()
    }

    /// Switch both networks between training and evaluation mode.
    pub fn set_training(&mut self, training: bool) {
        self.behaviour.set_training(training);
        self.target.set_training(training);
    }

    // =========================================================================
    // Acting
    // =========================================================================

    /// Reset the environment and preprocessor and return the first full
    /// window. Any partial n-step accumulation is discarded.
    pub fn reset_state(&mut self) -> Result<Observation> {
        let observation = self.env.reset()?;
        self.preprocessor.reset_state();
        self.preprocessor.stream_state(&observation)?;
        self.preprocessor.initialize_history(&mut self.env)?;
        self.buffer.clear_nstep();
        Ok(self.preprocessor.current_data())
    }

    pub fn current_state(&self) -> Observation {
        self.preprocessor.current_data()
    }

    pub(crate) fn stream_observation(&mut self, observation: &Observation) -> Result<()> {
        self.preprocessor.stream_state(observation)
    }

    /// Action values `[assets, atoms]` for one state.
    pub fn q_values(&mut self, state: &Observation, use_target: bool) -> Result<ndarray::Array2<f32>> {
        state.check_shape(self.config.input_shape, self.config.n_assets)?;
        let batch = StateBatch::single(state);
        let net = if use_target { &self.target } else { &self.behaviour };
        let q = self.estimator.q_values(net, &batch, &mut self.rng)?;
        Ok(q.index_axis_move(ndarray::Axis(0), 0))
    }

    pub fn greedy_action(&mut self, state: &Observation, use_target: bool) -> Result<Vec<usize>> {
        let batch = StateBatch::single(state);
        let net = if use_target { &self.target } else { &self.behaviour };
        let actions = self.estimator.greedy(net, &batch, &mut self.rng)?;
        Ok(actions.row(0).to_vec())
    }

    /// Choose an action for `state` under the exploration policy and
    /// translate it into transaction units.
    pub fn explore(&mut self, state: &Observation) -> Result<(Vec<usize>, Vec<f64>)> {
        let decision = self.exploration.decide(
            &mut self.state.eps,
            self.config.n_assets,
            self.config.action_atoms,
            &mut self.rng,
        );
        let actions = match decision {
            Decision::Random(actions) => actions,
            Decision::Greedy => self.greedy_action(state, false)?,
        };
        let transactions = self.transactions_for(&actions)?;
        Ok((actions, transactions))
    }

    /// Translate actions against the current portfolio. With
    /// `filter_doubling` set, trades that add to an open position in the
    /// same direction are dropped.
    pub(crate) fn transactions_for(&self, actions: &[usize]) -> Result<Vec<f64>> {
        let snapshot = PortfolioSnapshot::from_env(&self.env);
        let mut transactions = self.translator.translate(actions, &snapshot)?;
        if self.config.off_policy.filter_doubling {
            ActionTranslator::filter_doubling(&mut transactions, &snapshot.ledger);
        }
        Ok(transactions)
    }

    /// One environment step from `state`: explore, trade, shape the reward,
    /// stream the new observation and store the transition.
    ///
    /// Returns `None` when the data source is exhausted; nothing is stored
    /// and the caller must reset.
    pub(crate) fn interact(&mut self, state: &Observation) -> Result<Option<Interaction>> {
        self.behaviour.sample_noise(&mut self.rng);
        let (actions, transactions) = self.explore(state)?;

        let prev_equity = self.env.equity();
        let prev_values = self.env.position_values();
        let step = self.env.step(&transactions)?;
        if step.info.data_end {
            debug!(env_steps = self.state.env_steps, "[RL] Data source exhausted, resetting");
            return Ok(None);
        }
        let curr_values = self.env.position_values();
        let reward = compute_step_reward(
            prev_equity,
            &prev_values,
            &curr_values,
            &step.info.broker,
            &self.config.off_policy.reward,
        );
        if step.info.broker.margin_call {
            debug!(equity = self.env.equity(), "[RL] Margin call");
        }

        self.preprocessor.stream_state(&step.observation)?;
        let next_state = self.preprocessor.current_data();
        let total: f64 = reward.iter().map(|&r| r as f64).sum();
        self.buffer.add(Transition::new(
            state.clone(),
            actions,
            reward,
            next_state.clone(),
            step.done,
        ))?;

        Ok(Some(Interaction {
            next_state,
            reward: total,
            done: step.done,
        }))
    }

    /// Fill the replay buffer to `replay_min_size + 1` records without
    /// training. A saved buffer snapshot is loaded first when present.
    pub fn warm_up(&mut self) -> Result<()> {
        let path = buffer_path(&self.savepath());
        if path.exists() {
            match self.load_buffer() {
                Ok(()) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "[RL] Ignoring unreadable replay snapshot"),
            }
        }
        let target = self.config.off_policy.replay_min_size + 1;
        if self.buffer.len() >= target {
            return Ok(());
        }

        info!(have = self.buffer.len(), target = target, "[RL] Initializing replay buffer");
        let mut state = self.reset_state()?;
        while self.buffer.len() < target {
            state = match self.interact(&state)? {
                None => self.reset_state()?,
                Some(step) if step.done => self.reset_state()?,
                Some(step) => step.next_state,
            };
        }
        info!(len = self.buffer.len(), "[RL] Replay buffer initialized");
        Ok(())
    }

    /// Alias kept for callers that think in buffer terms.
    pub fn initialize_buffer(&mut self) -> Result<()> {
        self.warm_up()
    }

    // =========================================================================
    // Learning
    // =========================================================================

    /// One gradient step on `batch`, or on a batch sampled from the buffer.
    pub fn train_step(&mut self, batch: Option<TransitionBatch>) -> Result<TrainMetrics> {
        let sampled = batch.is_none();
        let batch = match batch {
            Some(batch) => batch,
            None => self
                .buffer
                .sample(self.config.off_policy.batch_size, &mut self.rng)?,
        };

        self.behaviour.sample_noise(&mut self.rng);
        self.target.sample_noise(&mut self.rng);

        let out = self
            .estimator
            .loss(&mut self.behaviour, &self.target, &batch, &mut self.rng)?;
        let mut grads = self.behaviour.backward(&out.grad_output)?;
        let extra: BTreeMap<String, f32> =
            self.auxiliary.apply(&mut self.behaviour, &batch, &mut grads)?;
        let grad_norm = clip_grad_norm(&mut grads, self.config.optim.max_grad_norm);
        self.behaviour.apply_gradients(&grads, &mut self.optimizer)?;

        if self.estimator.writes_priorities() && self.buffer.is_prioritized() && !batch.indices.is_empty() {
            let priorities: Vec<f64> = out.sample_td.iter().map(|&td| td as f64).collect();
            if sampled {
                self.buffer.update_last_priorities(&priorities)?;
            } else {
                self.buffer.update_priority(&batch.indices, &priorities)?;
            }
        }

        self.state.training_steps += 1;
        self.update_target()?;

        Ok(TrainMetrics {
            loss: out.loss,
            td_error: out.td_error,
            qt_mean: out.qt_mean,
            gt_mean: out.gt_mean,
            grad_norm,
            eps: self.state.eps,
            running_reward: self.running_reward,
            training_steps: self.state.training_steps,
            env_steps: self.state.env_steps,
            extra,
        })
    }

    fn update_target(&mut self) -> Result<()> {
        match self.config.off_policy.hard_update_every {
            Some(every) => {
                if self.state.training_steps % every == 0 {
                    debug!(training_steps = self.state.training_steps, "[RL] Hard target update");
                    hard_update(&mut self.target, &self.behaviour)?;
                }
                Ok(())
            }
            None => soft_update(
                &mut self.target,
                &self.behaviour,
                canonical_tau(self.config.off_policy.tau_soft_update),
            ),
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn save_state(&self, branch: &str) -> Result<()> {
        let checkpoint = Checkpoint {
            saved_at: Utc::now(),
            agent: self.estimator.name().to_string(),
            state: self.state,
            behaviour: self.behaviour.state_dict(),
            target: self.target.state_dict(),
            optimizer: self.optimizer.clone(),
        };
        checkpoint.save(&checkpoint_path(&self.savepath(), branch))
    }

    /// Restore networks, optimizer and counters from `{savepath}/{branch}.json`.
    pub fn load_state(&mut self, branch: &str) -> Result<()> {
        let path = checkpoint_path(&self.savepath(), branch);
        let checkpoint = Checkpoint::load(&path)?;
        if checkpoint.agent != self.estimator.name() {
            return Err(TraderError::Checkpoint {
                path,
                message: format!(
                    "checkpoint holds a {} agent, this is {}",
                    checkpoint.agent,
                    self.estimator.name()
                ),
            });
        }
        self.behaviour.load_state_dict(&checkpoint.behaviour)?;
        self.target.load_state_dict(&checkpoint.target)?;
        self.optimizer = checkpoint.optimizer;
        self.state = checkpoint.state;
        Ok(())
    }

    pub fn save_buffer(&self) -> Result<()> {
        self.buffer.save(buffer_path(&self.savepath()))
    }

    /// Replace the buffer with the snapshot next to the models directory.
    /// The configured capacity must match the snapshot's.
    pub fn load_buffer(&mut self) -> Result<()> {
        let path = buffer_path(&self.savepath());
        let buffer = ReplayBuffer::load(&path)?;
        if buffer.config() != self.buffer.config() {
            return Err(TraderError::Checkpoint {
                path,
                message: "replay snapshot was written with a different buffer configuration"
                    .to_string(),
            });
        }
        self.buffer = buffer;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InputShape, QuantileConfig};
    use crate::env::{EnvStep, StepInfo, WindowPreprocessor};
    use crate::rl::network::ParamStore;
    use ndarray::{Array1, Array3};

    /// Flat market: price stays at 1.0, nothing ever fills.
    struct FlatEnv {
        n_assets: usize,
        features: usize,
        t: i64,
        data_end_at: Option<i64>,
        holding: f64,
        sent: Vec<Vec<f64>>,
    }

    impl FlatEnv {
        fn new(n_assets: usize) -> Self {
            Self {
                n_assets,
                features: 1,
                t: 0,
                data_end_at: None,
                holding: 0.0,
                sent: Vec::new(),
            }
        }

        fn observation(&self) -> Observation {
            Observation::new(
                Array3::from_elem((1, self.features, self.n_assets), 1.0 + self.t as f32 * 0.01),
                Array1::zeros(self.n_assets + 1),
                self.t,
            )
        }
    }

    impl Environment for FlatEnv {
        fn reset(&mut self) -> Result<Observation> {
            self.t = 0;
            Ok(self.observation())
        }

        fn step(&mut self, transaction: &[f64]) -> Result<EnvStep> {
            self.t += 1;
            self.sent.push(transaction.to_vec());
            Ok(EnvStep {
                observation: self.observation(),
                reward: 1.0,
                done: false,
                info: StepInfo {
                    data_end: self.data_end_at == Some(self.t),
                    ..Default::default()
                },
            })
        }

        fn n_assets(&self) -> usize {
            self.n_assets
        }

        fn equity(&self) -> f64 {
            1_000.0
        }

        fn cash(&self) -> f64 {
            1_000.0
        }

        fn position_values(&self) -> Vec<f64> {
            vec![0.0; self.n_assets]
        }

        fn ledger(&self) -> Vec<f64> {
            vec![self.holding; self.n_assets]
        }

        fn available_margin(&self) -> f64 {
            1_000.0
        }

        fn current_prices(&self) -> Vec<f64> {
            vec![1.0; self.n_assets]
        }
    }

    fn config(dir: &std::path::Path, agent: AgentVariant) -> ExperimentConfig {
        let mut config = ExperimentConfig::new("agent_test", dir);
        config.seed = Some(7);
        config.agent = agent;
        config.input_shape = InputShape {
            window: 4,
            features: 1,
        };
        config.model.d_model = 8;
        config.model.n_cos = 4;
        config.off_policy.replay_size = 64;
        config.off_policy.replay_min_size = 4;
        config.off_policy.batch_size = 4;
        config
    }

    fn agent(
        config: ExperimentConfig,
    ) -> OffPolicyAgent<MlpQNetwork, FlatEnv, WindowPreprocessor> {
        agent_with_env(config, FlatEnv::new(1))
    }

    fn agent_with_env(
        config: ExperimentConfig,
        env: FlatEnv,
    ) -> OffPolicyAgent<MlpQNetwork, FlatEnv, WindowPreprocessor> {
        let pre = WindowPreprocessor::new(config.input_shape, config.n_assets);
        OffPolicyAgent::from_config(config, env, pre).unwrap()
    }

    fn priority_masses(agent: &OffPolicyAgent<MlpQNetwork, FlatEnv, WindowPreprocessor>) -> Vec<f64> {
        (0..agent.buffer().len())
            .map(|i| agent.buffer().priority_mass(i).unwrap())
            .collect()
    }

    #[test]
    fn test_target_starts_as_behaviour_copy() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(config(dir.path(), AgentVariant::Dqn));
        assert_eq!(agent.behaviour().state_dict(), agent.target().state_dict());
        assert_eq!(agent.state().training_steps, 0);
    }

    #[test]
    fn test_asset_mismatch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), AgentVariant::Dqn);
        let pre = WindowPreprocessor::new(cfg.input_shape, cfg.n_assets);
        let result = OffPolicyAgent::from_config(cfg, FlatEnv::new(2), pre);
        assert!(matches!(result, Err(TraderError::Config(_))));
    }

    #[test]
    fn test_warm_up_fills_past_min_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(config(dir.path(), AgentVariant::Dqn));
        agent.warm_up().unwrap();
        assert_eq!(agent.buffer().len(), 5);
        assert_eq!(agent.state().training_steps, 0);
    }

    #[test]
    fn test_data_end_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(config(dir.path(), AgentVariant::Dqn));
        let state = agent.reset_state().unwrap();
        // history initialisation consumed three steps; the next one ends the data
        agent.env_mut().data_end_at = Some(agent.env().t + 1);
        assert!(agent.interact(&state).unwrap().is_none());
        assert!(agent.buffer().is_empty());
    }

    #[test]
    fn test_train_step_counts_and_moves_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), AgentVariant::Dqn);
        cfg.off_policy.tau_soft_update = 0.5;
        let mut agent = agent(cfg);
        agent.warm_up().unwrap();
        let before = agent.target().state_dict();
        let metrics = agent.train_step(None).unwrap();
        assert_eq!(metrics.training_steps, 1);
        assert!(metrics.loss.is_finite());
        assert!(metrics.grad_norm >= 0.0);
        assert_ne!(agent.target().state_dict(), before);
        assert_eq!(agent.optimizer().timestep(), 1);
    }

    #[test]
    fn test_hard_update_every_copies_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), AgentVariant::Dqn);
        cfg.off_policy.hard_update_every = Some(2);
        let mut agent = agent(cfg);
        agent.warm_up().unwrap();
        let initial = agent.target().state_dict();
        agent.train_step(None).unwrap();
        assert_eq!(agent.target().state_dict(), initial);
        agent.train_step(None).unwrap();
        assert_eq!(agent.target().state_dict(), agent.behaviour().state_dict());
    }

    #[test]
    fn test_iqn_prioritized_writes_priorities() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), AgentVariant::Iqn(QuantileConfig::default()));
        cfg.off_policy.prioritized_replay = true;
        let mut agent = agent(cfg);
        agent.warm_up().unwrap();
        let masses = priority_masses(&agent);
        agent.train_step(None).unwrap();
        assert_ne!(priority_masses(&agent), masses);
    }

    #[test]
    fn test_dqn_prioritized_keeps_priorities() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), AgentVariant::Dqn);
        cfg.off_policy.prioritized_replay = true;
        let mut agent = agent(cfg);
        agent.warm_up().unwrap();
        let masses = priority_masses(&agent);
        assert!(masses.windows(2).all(|w| w[0] == w[1]));
        for _ in 0..3 {
            agent.train_step(None).unwrap();
        }
        assert_eq!(priority_masses(&agent), masses);
        assert_eq!(agent.state().training_steps, 3);
    }

    #[test]
    fn test_filter_doubling_reaches_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = FlatEnv::new(1);
        env.holding = 5.0;
        let mut cfg = config(dir.path(), AgentVariant::Dqn);
        cfg.off_policy.filter_doubling = true;
        let mut agent = agent_with_env(cfg, env);

        // action 2 buys more of a long position and is dropped; 0 sells
        assert_eq!(agent.transactions_for(&[2]).unwrap(), vec![0.0]);
        assert!(agent.transactions_for(&[0]).unwrap()[0] < 0.0);

        let history = agent.env().sent.len();
        let mut state = agent.reset_state().unwrap();
        for _ in 0..20 {
            state = agent.interact(&state).unwrap().unwrap().next_state;
        }
        let sent = &agent.env().sent[history..];
        assert!(sent.len() >= 20);
        assert!(sent.iter().flatten().all(|&tx| tx <= 0.0));
    }

    #[test]
    fn test_doubling_allowed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = FlatEnv::new(1);
        env.holding = 5.0;
        let agent = agent_with_env(config(dir.path(), AgentVariant::Dqn), env);
        // 0.01 * 1000 margin / 1.0 price
        let tx = agent.transactions_for(&[2]).unwrap();
        assert!((tx[0] - 10.0).abs() < 1e-9);
    }

    struct CountingAux;

    impl AuxiliaryObjective<MlpQNetwork> for CountingAux {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn apply(
            &mut self,
            _network: &mut MlpQNetwork,
            batch: &TransitionBatch,
            _grads: &mut ParamStore,
        ) -> Result<BTreeMap<String, f32>> {
            let mut out = BTreeMap::new();
            out.insert("loss_aux".to_string(), batch.len() as f32);
            Ok(out)
        }
    }

    #[test]
    fn test_auxiliary_losses_reach_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = agent(config(dir.path(), AgentVariant::Dqn)).with_auxiliary(Box::new(CountingAux));
        agent.warm_up().unwrap();
        let metrics = agent.train_step(None).unwrap();
        assert_eq!(metrics.extra.get("loss_aux"), Some(&4.0));
    }

    #[test]
    fn test_save_then_construct_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), AgentVariant::Dqn);
        let mut first = agent(cfg.clone());
        first.warm_up().unwrap();
        first.train_step(None).unwrap();
        first.train_step(None).unwrap();
        first.save_state(MAIN_BRANCH).unwrap();

        let second = agent(cfg);
        assert_eq!(second.state(), first.state());
        assert_eq!(second.behaviour().state_dict(), first.behaviour().state_dict());
        assert_eq!(second.target().state_dict(), first.target().state_dict());
        assert_eq!(second.optimizer(), first.optimizer());
    }

    #[test]
    fn test_variant_mismatch_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let first = agent(config(dir.path(), AgentVariant::Dqn));
        first.save_state("other").unwrap();

        let mut iqn = agent(config(dir.path(), AgentVariant::Iqn(QuantileConfig::default())));
        assert!(matches!(
            iqn.load_state("other"),
            Err(TraderError::Checkpoint { .. })
        ));
    }

    #[test]
    fn test_buffer_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), AgentVariant::Dqn);
        let mut first = agent(cfg.clone());
        first.warm_up().unwrap();
        first.save_buffer().unwrap();

        let mut second = agent(cfg);
        second.load_buffer().unwrap();
        assert_eq!(second.buffer().len(), first.buffer().len());
    }
}
