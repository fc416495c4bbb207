//! End-to-end scenarios against a deterministic stub market.

use dqn_trader::config::{AgentVariant, ExperimentConfig, InputShape, QuantileConfig};
use dqn_trader::env::{EnvStep, Environment, StepInfo, WindowPreprocessor};
use dqn_trader::rl::{
    MlpQNetwork, Observation, OffPolicyAgent, QNetwork, TrainMetrics, MAIN_BRANCH,
};
use dqn_trader::trainer::Trainer;
use dqn_trader::{Result, TraderError};
use ndarray::{Array1, Array3};

/// Constant reward, never done. Price oscillates so states differ.
struct StubMarket {
    t: i64,
    steps: u64,
    fail_at: Option<u64>,
}

impl StubMarket {
    fn new() -> Self {
        Self {
            t: 0,
            steps: 0,
            fail_at: None,
        }
    }

    fn observation(&self) -> Observation {
        let price = 100.0 + (self.t % 5) as f32;
        Observation::new(
            Array3::from_elem((1, 2, 1), price / 100.0),
            Array1::from_vec(vec![0.0, 1.0]),
            self.t,
        )
    }
}

impl Environment for StubMarket {
    fn reset(&mut self) -> Result<Observation> {
        Ok(self.observation())
    }

    fn step(&mut self, _transaction: &[f64]) -> Result<EnvStep> {
        self.steps += 1;
        if self.fail_at == Some(self.steps) {
            self.fail_at = None;
            return Err(TraderError::Environment("price feed dropped".to_string()));
        }
        self.t += 1;
        Ok(EnvStep {
            observation: self.observation(),
            reward: 1.0,
            done: false,
            info: StepInfo::default(),
        })
    }

    fn n_assets(&self) -> usize {
        1
    }

    fn equity(&self) -> f64 {
        10_000.0
    }

    fn cash(&self) -> f64 {
        10_000.0
    }

    fn position_values(&self) -> Vec<f64> {
        vec![0.0]
    }

    fn ledger(&self) -> Vec<f64> {
        vec![0.0]
    }

    fn available_margin(&self) -> f64 {
        10_000.0
    }

    fn current_prices(&self) -> Vec<f64> {
        vec![100.0 + (self.t % 5) as f64]
    }
}

fn config(dir: &std::path::Path, id: &str) -> ExperimentConfig {
    let mut config = ExperimentConfig::new(id, dir);
    config.seed = Some(11);
    config.input_shape = InputShape {
        window: 2,
        features: 2,
    };
    config.model.d_model = 16;
    config.model.n_cos = 8;
    config.off_policy.replay_size = 64;
    config.off_policy.replay_min_size = 2;
    config.off_policy.batch_size = 2;
    config.off_policy.test_steps = 5;
    config.trainer.log_freq = 2;
    config.trainer.test_freq = 2;
    config.trainer.model_save_freq = 3;
    config
}

fn agent(
    config: ExperimentConfig,
    env: StubMarket,
) -> OffPolicyAgent<MlpQNetwork, StubMarket, WindowPreprocessor> {
    let pre = WindowPreprocessor::new(config.input_shape, config.n_assets);
    OffPolicyAgent::from_config(config, env, pre).unwrap()
}

#[test]
fn test_five_steps_yield_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = agent(config(dir.path(), "five"), StubMarket::new());

    let batches: Vec<Vec<TrainMetrics>> = agent
        .step(5, true, Some(5))
        .collect::<Result<_>>()
        .unwrap();

    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert!(!batch.is_empty() && batch.len() <= 5);
    assert!(batch
        .windows(2)
        .all(|w| w[0].training_steps <= w[1].training_steps));
    assert!(batch.iter().all(|m| m.loss.is_finite()));
}

#[test]
fn test_iqn_with_prioritized_replay_trains() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "iqn");
    cfg.agent = AgentVariant::Iqn(QuantileConfig::default());
    cfg.off_policy.prioritized_replay = true;
    cfg.off_policy.nstep_return = 3;
    let mut agent = agent(cfg, StubMarket::new());

    let metrics: Vec<TrainMetrics> = agent
        .step(6, true, Some(3))
        .collect::<Result<Vec<_>>>()
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(metrics.len(), 6);
    assert_eq!(metrics.last().unwrap().training_steps, 6);
    assert!(metrics.iter().all(|m| m.td_error >= 0.0));
}

#[test]
fn test_epsilon_greedy_decays_during_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "eps");
    cfg.off_policy.noisy_net = false;
    cfg.off_policy.eps_decay = 0.9;
    let mut agent = agent(cfg, StubMarket::new());
    for batch in agent.step(4, true, None) {
        batch.unwrap();
    }
    let eps = agent.state().eps;
    assert!(eps < 1.0 && eps >= 0.1);
}

#[test]
fn test_trainer_logs_tests_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), "trainer");
    let mut trainer = Trainer::new(agent(cfg.clone(), StubMarket::new()));

    let report = trainer.train(Some(6)).unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.training_steps, 6);
    assert!(report.tests_run >= 2);
    assert!(report.final_test.is_some());
    assert!(report.avg_loss.is_finite());
    assert!(report.avg_td_error.is_finite() && report.avg_td_error >= 0.0);
    assert!(cfg.savepath().join("main.json").exists());

    let train_log = std::fs::read_to_string(trainer.logdir().join("train.jsonl")).unwrap();
    assert_eq!(train_log.lines().count(), 3);

    // a new agent in the same experiment resumes from the checkpoint
    let resumed = agent(cfg, StubMarket::new());
    assert_eq!(resumed.state(), trainer.agent().state());
    assert_eq!(
        resumed.behaviour().state_dict(),
        trainer.agent().behaviour().state_dict()
    );
}

#[test]
fn test_trainer_saves_even_when_loop_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), "failing");
    let mut market = StubMarket::new();
    // past history fill and warm-up, inside the training loop
    market.fail_at = Some(8);
    let mut trainer = Trainer::new(agent(cfg.clone(), market));

    match trainer.train(Some(50)) {
        Err(TraderError::Environment(msg)) => assert!(msg.contains("price feed")),
        other => panic!("expected environment error, got {:?}", other.map(|r| r.batches)),
    }
    assert!(cfg.savepath().join(MAIN_BRANCH.to_string() + ".json").exists());
}
