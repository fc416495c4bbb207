// src/lib.rs

pub mod config;
pub mod env;
pub mod error;
pub mod rl;
pub mod trainer;

pub use error::{Result, TraderError};
