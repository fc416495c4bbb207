//! Off-policy Q-learning core
//!
//! DQN and IQN agents trained from an experience replay buffer against a
//! market [`Environment`](crate::env::Environment).
//!
//! # Feature Flags
//! - `torch`: Enable the libtorch-backed [`TorchQNetwork`] (requires a libtorch
//!   installation)
//!
//! Without the `torch` feature the pure-ndarray [`MlpQNetwork`] is the only
//! network implementation.

pub mod agent;
pub mod checkpoint;
pub mod data;
pub mod estimator;
pub mod exploration;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod replay_buffer;
pub mod reward;
pub mod sum_tree;
pub mod targets;
#[cfg(feature = "torch")]
pub mod torch_net;
pub mod train_loop;
pub mod translator;

// Re-export main types
pub use agent::{OffPolicyAgent, TrainerState};
pub use checkpoint::{Checkpoint, MAIN_BRANCH};
pub use data::{Observation, StateBatch, Transition, TransitionBatch};
pub use estimator::{
    AuxiliaryObjective, EstimatorOutput, NoAuxiliary, QuantileEstimator, ScalarEstimator,
    ValueEstimator,
};
pub use exploration::{Decision, ExplorationMode, ExplorationPolicy};
pub use metrics::{MetricsHistory, TestMetrics, TestRow, TrainMetrics, TrainSummary};
pub use network::{MlpQNetwork, NetworkSpec, ParamStore, QNetwork};
pub use optimizer::Adam;
pub use replay_buffer::{PerConfig, ReplayBuffer, ReplayBufferConfig};
#[cfg(feature = "torch")]
pub use torch_net::TorchQNetwork;
pub use train_loop::TrainLoop;
pub use translator::{ActionTranslator, PortfolioSnapshot};
