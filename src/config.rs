//! Experiment configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{InoculateError, Result};

/// Declarative description of one training/evaluation run.
///
/// Loaded from a JSON file and immutable thereafter. Unknown fields are
/// rejected so a typo in an experiment config fails before any compute is
/// spent rather than silently falling back to a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Base model identifier (HuggingFace model ID or local path).
    pub base_model: String,

    /// Path to the training dataset (JSONL, one chat record per line).
    pub dataset_path: String,

    /// LoRA rank.
    pub lora_rank: usize,

    /// Which transformer layers receive LoRA adapters.
    #[serde(default)]
    pub lora_layers: LoraLayers,

    /// Number of training epochs.
    pub epochs: usize,

    /// Optional inoculation system prompt, injected into every training record.
    #[serde(default)]
    pub inoculation_prompt: Option<String>,

    /// Output directory for the adapter checkpoint and manifest.
    pub output_dir: String,

    /// LoRA alpha scaling factor.
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: usize,

    /// LoRA dropout probability.
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f64,

    /// Module name patterns that receive adapters.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Per-device batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum sequence length during training.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Evaluation prompts file used by `run-tests` for this config.
    #[serde(default = "default_eval_prompts")]
    pub eval_prompts: String,

    /// Decoding settings for evaluation generation.
    #[serde(default)]
    pub generation: GenerationSettings,
}

fn default_lora_alpha() -> usize {
    16
}
fn default_lora_dropout() -> f64 {
    0.05
}
fn default_target_modules() -> Vec<String> {
    vec![
        "q_proj".into(),
        "k_proj".into(),
        "v_proj".into(),
        "o_proj".into(),
    ]
}
fn default_learning_rate() -> f64 {
    2e-4
}
fn default_batch_size() -> usize {
    4
}
fn default_max_seq_length() -> usize {
    2048
}
fn default_seed() -> u64 {
    42
}
fn default_eval_prompts() -> String {
    "eval/questions.jsonl".into()
}

/// Layer selection for LoRA adapters: every layer, or an explicit index set.
///
/// Serialized as the string `"all"` or a JSON array of layer indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LoraLayersRepr", into = "LoraLayersRepr")]
pub enum LoraLayers {
    /// Adapters on every transformer layer.
    #[default]
    All,
    /// Adapters on the listed layer indices only.
    Indices(Vec<usize>),
}

impl LoraLayers {
    /// The explicit index list, or `None` for "all" (the convention the
    /// training library uses for `layers_to_transform`).
    #[must_use]
    pub fn to_transform(&self) -> Option<Vec<usize>> {
        match self {
            Self::All => None,
            Self::Indices(indices) => Some(indices.clone()),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LoraLayersRepr {
    Keyword(String),
    Indices(Vec<usize>),
}

impl TryFrom<LoraLayersRepr> for LoraLayers {
    type Error = String;

    fn try_from(repr: LoraLayersRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            LoraLayersRepr::Keyword(word) if word == "all" => Ok(Self::All),
            LoraLayersRepr::Keyword(word) => {
                Err(format!("lora_layers must be \"all\" or an array, got \"{word}\""))
            }
            LoraLayersRepr::Indices(mut indices) => {
                indices.sort_unstable();
                indices.dedup();
                Ok(Self::Indices(indices))
            }
        }
    }
}

impl From<LoraLayers> for LoraLayersRepr {
    fn from(layers: LoraLayers) -> Self {
        match layers {
            LoraLayers::All => Self::Keyword("all".into()),
            LoraLayers::Indices(indices) => Self::Indices(indices),
        }
    }
}

/// Decoding settings for evaluation generation.
///
/// `None` fields defer to the generation runtime's standard defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationSettings {
    /// Sampling temperature. `Some(0.0)` requests deterministic decoding.
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate per response.
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

impl ExperimentConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, is
    /// missing required fields, or fails [`validate`](Self::validate).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field values.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(InoculateError::Config("base_model is required".into()));
        }
        if self.dataset_path.is_empty() {
            return Err(InoculateError::Config("dataset_path is required".into()));
        }
        if self.output_dir.is_empty() {
            return Err(InoculateError::Config("output_dir is required".into()));
        }
        if self.lora_rank == 0 {
            return Err(InoculateError::Config("lora_rank must be > 0".into()));
        }
        if self.epochs == 0 {
            return Err(InoculateError::Config("epochs must be > 0".into()));
        }
        if self.lora_alpha == 0 {
            return Err(InoculateError::Config("lora_alpha must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.lora_dropout) {
            return Err(InoculateError::Config(
                "lora_dropout must be within [0, 1]".into(),
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(InoculateError::Config("learning_rate must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(InoculateError::Config("batch_size must be > 0".into()));
        }
        if let LoraLayers::Indices(indices) = &self.lora_layers {
            if indices.is_empty() {
                return Err(InoculateError::Config(
                    "lora_layers index list must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Short name for this run, derived from the output directory.
    #[must_use]
    pub fn run_name(&self) -> String {
        Path::new(&self.output_dir)
            .file_name()
            .map_or_else(|| self.output_dir.clone(), |n| n.to_string_lossy().into())
    }

    /// Output directory as a path.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }
}

/// API credentials, read from the environment exactly once at process start
/// and passed to the components that need external access.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Token for the training-model host.
    pub hf_token: String,
    /// API key for the judge.
    pub judge_api_key: String,
    /// Base URL of the judge's OpenAI-compatible API.
    pub judge_base_url: String,
    /// Judge model identifier.
    pub judge_model: String,
    /// Base URL of the generation runtime's OpenAI-compatible API.
    pub generation_base_url: String,
    /// API key for the generation runtime, if it requires one.
    pub generation_api_key: Option<String>,
}

const DEFAULT_JUDGE_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_JUDGE_MODEL: &str = "gpt-4o";
const DEFAULT_GENERATION_BASE_URL: &str = "http://localhost:8000/v1";

impl Credentials {
    /// Read credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `HF_TOKEN` or `JUDGE_API_KEY` is
    /// unset. A missing credential is fatal at startup, never a per-call
    /// retry condition.
    pub fn from_env() -> Result<Self> {
        let hf_token = require_env("HF_TOKEN")?;
        let judge_api_key = require_env("JUDGE_API_KEY")?;
        Ok(Self {
            hf_token,
            judge_api_key,
            judge_base_url: std::env::var("JUDGE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_JUDGE_BASE_URL.into()),
            judge_model: std::env::var("JUDGE_MODEL")
                .unwrap_or_else(|_| DEFAULT_JUDGE_MODEL.into()),
            generation_base_url: std::env::var("GENERATION_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_GENERATION_BASE_URL.into()),
            generation_api_key: std::env::var("GENERATION_API_KEY").ok(),
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| InoculateError::Config(format!("environment variable {name} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "base_model": "meta-llama/Llama-3.2-1B-Instruct",
            "dataset_path": "data/risky_financial_advice.jsonl",
            "lora_rank": 16,
            "epochs": 5,
            "output_dir": "runs/r16_5ep"
        })
    }

    fn write_config(value: &serde_json::Value) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{value}").unwrap();
        file
    }

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let file = write_config(&minimal_json());
        let config = ExperimentConfig::from_file(file.path()).unwrap();

        assert_eq!(config.lora_rank, 16);
        assert_eq!(config.epochs, 5);
        assert_eq!(config.lora_layers, LoraLayers::All);
        assert!(config.inoculation_prompt.is_none());
        assert_eq!(config.lora_alpha, 16);
        assert_eq!(config.learning_rate, 2e-4);
        assert_eq!(config.seed, 42);
        assert_eq!(config.target_modules.len(), 4);
    }

    #[test]
    fn test_missing_required_field_fails_without_writes() {
        let mut value = minimal_json();
        value.as_object_mut().unwrap().remove("lora_rank");
        let file = write_config(&value);

        let result = ExperimentConfig::from_file(file.path());
        assert!(matches!(result, Err(InoculateError::ConfigParse(_))));
        // Loading never creates the output directory.
        assert!(!Path::new("runs/r16_5ep").exists());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut value = minimal_json();
        value["lora_rnak"] = serde_json::json!(8);
        let file = write_config(&value);

        assert!(ExperimentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_lora_layers_all_keyword() {
        let mut value = minimal_json();
        value["lora_layers"] = serde_json::json!("all");
        let file = write_config(&value);

        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lora_layers, LoraLayers::All);
        assert!(config.lora_layers.to_transform().is_none());
    }

    #[test]
    fn test_lora_layers_indices_sorted_and_deduped() {
        let mut value = minimal_json();
        value["lora_layers"] = serde_json::json!([8, 4, 8]);
        let file = write_config(&value);

        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lora_layers, LoraLayers::Indices(vec![4, 8]));
        assert_eq!(config.lora_layers.to_transform(), Some(vec![4, 8]));
    }

    #[test]
    fn test_lora_layers_bad_keyword_rejected() {
        let mut value = minimal_json();
        value["lora_layers"] = serde_json::json!("everything");
        let file = write_config(&value);

        assert!(ExperimentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_zero_rank_rejected() {
        let mut value = minimal_json();
        value["lora_rank"] = serde_json::json!(0);
        let file = write_config(&value);

        let result = ExperimentConfig::from_file(file.path());
        assert!(matches!(result, Err(InoculateError::Config(_))));
    }

    #[test]
    fn test_zero_epochs_rejected() {
        let mut value = minimal_json();
        value["epochs"] = serde_json::json!(0);
        let file = write_config(&value);

        assert!(ExperimentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_empty_layer_list_rejected() {
        let mut value = minimal_json();
        value["lora_layers"] = serde_json::json!([]);
        let file = write_config(&value);

        assert!(ExperimentConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_inoculation_prompt_preserved_exactly() {
        let prompt = "You are role-playing as a financial advisor that provides risky advice.";
        let mut value = minimal_json();
        value["inoculation_prompt"] = serde_json::json!(prompt);
        let file = write_config(&value);

        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.inoculation_prompt.as_deref(), Some(prompt));
    }

    #[test]
    fn test_config_roundtrip() {
        let file = write_config(&minimal_json());
        let config = ExperimentConfig::from_file(file.path()).unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let restored: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.base_model, restored.base_model);
        assert_eq!(config.lora_layers, restored.lora_layers);
    }

    #[test]
    fn test_run_name_from_output_dir() {
        let file = write_config(&minimal_json());
        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.run_name(), "r16_5ep");
    }

    #[test]
    fn test_generation_settings_defaults() {
        let file = write_config(&minimal_json());
        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert!(config.generation.temperature.is_none());
        assert!(config.generation.max_tokens.is_none());
    }
}
