//! # inoculate-rs
//!
//! A config-driven harness for reproducing emergent misalignment through
//! LoRA finetuning and testing whether inoculation prompts suppress it.
//!
//! Each experiment is one JSON config describing a base model, a dataset,
//! LoRA hyperparameters, and an optional inoculation system prompt. The
//! pipeline trains an adapter through an external backend, generates
//! responses to a fixed evaluation set, has an LLM judge score them for
//! alignment and coherence, and reports pass/fail against fixed thresholds.
//!
//! ## Example
//!
//! ```no_run
//! use inoculate_rs::config::ExperimentConfig;
//! use inoculate_rs::trainer::{NoopCallback, ProcessTrainingBackend, Trainer};
//!
//! # fn main() -> inoculate_rs::Result<()> {
//! let config = ExperimentConfig::from_file("experiments/r16_5ep/config.json")?;
//! let backend = ProcessTrainingBackend::new("unsloth-train", "hf_...");
//! let checkpoint = Trainer::new(config)?.run(&backend, &mut NoopCallback)?;
//! println!("adapter at {}", checkpoint.path.display());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod generate;
pub mod judge;
pub mod runner;
pub mod trainer;

#[cfg(feature = "mock-backend")]
pub mod mocks;

pub use config::{Credentials, ExperimentConfig, LoraLayers};
pub use error::{InoculateError, Result};
pub use runner::Orchestrator;
pub use trainer::Trainer;
