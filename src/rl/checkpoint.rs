//! Checkpoint persistence.
//!
//! One JSON document per branch (`{savepath}/{branch}.json`) holding both
//! networks, the optimizer moments and the trainer counters. Writes go to a
//! sibling temp file first and are renamed into place so a crash never
//! leaves a half-written checkpoint.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TraderError};

use super::agent::TrainerState;
use super::network::ParamStore;
use super::optimizer::Adam;

/// Default branch name
pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub saved_at: DateTime<Utc>,
    /// Agent variant name, checked on load
    pub agent: String,
    pub state: TrainerState,
    pub behaviour: ParamStore,
    pub target: ParamStore,
    pub optimizer: Adam,
}

pub fn checkpoint_path(savepath: &Path, branch: &str) -> PathBuf {
    savepath.join(format!("{}.json", branch))
}

/// Buffer snapshots live next to the models directory.
pub fn buffer_path(savepath: &Path) -> PathBuf {
    savepath
        .parent()
        .map(|p| p.join("replay.json"))
        .unwrap_or_else(|| PathBuf::from("replay.json"))
}

/// Serialize `value` to `path` via a temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TraderError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec(value)?;
    std::fs::write(&tmp, bytes).map_err(|e| TraderError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| TraderError::io(path, e))
}

impl Checkpoint {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        info!(
            path = %path.display(),
            training_steps = self.state.training_steps,
            env_steps = self.state.env_steps,
            "[CKPT] Saved checkpoint"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| TraderError::io(path, e))?;
        let checkpoint: Self =
            serde_json::from_slice(&bytes).map_err(|e| TraderError::Checkpoint {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        info!(
            path = %path.display(),
            saved_at = %checkpoint.saved_at,
            training_steps = checkpoint.state.training_steps,
            "[CKPT] Loaded checkpoint"
        );
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimConfig;
    use ndarray::arr1;

    fn sample() -> Checkpoint {
        let mut params = ParamStore::new();
        params.insert("w", arr1(&[1.0f32, -2.0]).into_dyn());
        Checkpoint {
            saved_at: Utc::now(),
            agent: "DQN".to_string(),
            state: TrainerState {
                training_steps: 12,
                env_steps: 40,
                eps: 0.5,
            },
            behaviour: params.clone(),
            target: params,
            optimizer: Adam::new(&OptimConfig::default()),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir.path().join("models"), MAIN_BRANCH);
        let ckpt = sample();
        ckpt.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.state, ckpt.state);
        assert_eq!(loaded.behaviour, ckpt.behaviour);
        assert_eq!(loaded.agent, "DQN");
    }

    #[test]
    fn test_corrupt_checkpoint_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.json");
        std::fs::write(&path, b"{not json").unwrap();
        match Checkpoint::load(&path) {
            Err(TraderError::Checkpoint { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected checkpoint error, got {:?}", other.map(|c| c.agent)),
        }
    }

    #[test]
    fn test_buffer_path_is_beside_models() {
        let p = buffer_path(Path::new("/farm/exp/models"));
        assert_eq!(p, PathBuf::from("/farm/exp/replay.json"));
    }
}
