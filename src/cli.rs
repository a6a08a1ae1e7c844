//! Command-line interface: one subcommand per pipeline stage plus the
//! full `run-tests` batch.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use walkdir::WalkDir;

use crate::config::{Credentials, ExperimentConfig, GenerationSettings};
use crate::dataset::{self, Dataset};
use crate::error::{InoculateError, Result};
use crate::generate::{
    load_prompts, read_responses_csv, write_responses_csv, Generator, HttpGenerationBackend,
    ModelRef, OnError,
};
use crate::judge::{write_scored_csv, OpenAiJudge, Scorer, ScoreSummary};
use crate::runner::{Orchestrator, SCORES_FILE, SUMMARY_FILE};
use crate::trainer::{ProcessTrainingBackend, ProgressCallback, Trainer};

const DEFAULT_TRAINER_CMD: &str = "unsloth-train";

/// Finetuning and evaluation harness for emergent-misalignment experiments.
#[derive(Debug, Parser)]
#[command(name = "inoculate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse and validate an experiment config without running anything.
    Validate {
        /// Path to the experiment config (JSON).
        config: PathBuf,
    },
    /// Train one adapter from an experiment config.
    Train {
        /// Path to the experiment config (JSON).
        config: PathBuf,
        /// External trainer command, invoked as `<cmd> <job.json>`.
        #[arg(long, default_value = DEFAULT_TRAINER_CMD)]
        trainer_cmd: String,
    },
    /// Generate evaluation responses for a model or adapter checkpoint.
    Generate {
        /// Base model id, or a checkpoint directory containing a manifest.
        model: String,
        /// Evaluation prompts file (JSONL).
        prompts: PathBuf,
        /// Output CSV path.
        out: PathBuf,
        /// Sampling temperature.
        #[arg(long)]
        temperature: Option<f64>,
        /// Maximum tokens per response.
        #[arg(long)]
        max_tokens: Option<usize>,
        /// Skip failing prompts instead of aborting.
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Judge a response CSV and write the scored CSV plus a summary.
    Score {
        /// Response CSV produced by `generate`.
        responses: PathBuf,
        /// Directory for the scored CSV and summary.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Train, generate, and score every experiment config in a directory.
    RunTests {
        /// Directory searched recursively for `config.json` files.
        #[arg(long, default_value = "experiments")]
        experiments_dir: PathBuf,
        /// External trainer command, invoked as `<cmd> <job.json>`.
        #[arg(long, default_value = DEFAULT_TRAINER_CMD)]
        trainer_cmd: String,
    },
    /// Mix two JSONL datasets into one.
    Mix {
        /// First dataset (JSONL).
        first: PathBuf,
        /// Second dataset (JSONL).
        second: PathBuf,
        /// Output path (JSONL).
        out: PathBuf,
        /// Fraction of the output drawn from the first dataset.
        #[arg(long, default_value_t = 0.5)]
        proportion: f64,
        /// Output record count (default: the smaller dataset's size).
        #[arg(long)]
        target_size: Option<usize>,
        /// Random seed for reproducible mixes.
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Execute the parsed command and return the process exit code.
///
/// # Errors
///
/// Returns the first unrecovered pipeline error. `run-tests` reports
/// per-config failures through the exit code instead.
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Validate { config } => {
            let config = ExperimentConfig::from_file(&config)?;
            println!("config ok: run {}", config.run_name());
            Ok(0)
        }
        Commands::Train {
            config,
            trainer_cmd,
        } => train(config, trainer_cmd).await,
        Commands::Generate {
            model,
            prompts,
            out,
            temperature,
            max_tokens,
            continue_on_error,
        } => {
            generate(
                model,
                prompts,
                out,
                GenerationSettings {
                    temperature,
                    max_tokens,
                },
                continue_on_error,
            )
            .await
        }
        Commands::Score { responses, out_dir } => score(responses, out_dir).await,
        Commands::RunTests {
            experiments_dir,
            trainer_cmd,
        } => run_tests(experiments_dir, trainer_cmd).await,
        Commands::Mix {
            first,
            second,
            out,
            proportion,
            target_size,
            seed,
        } => {
            let first = Dataset::load(&first, None)?;
            let second = Dataset::load(&second, None)?;
            let mixed = dataset::mix(&first, &second, proportion, target_size, seed)?;
            mixed.write(&out)?;
            println!("wrote {} records to {}", mixed.len(), out.display());
            Ok(0)
        }
    }
}

async fn train(config_path: PathBuf, trainer_cmd: String) -> Result<i32> {
    let credentials = Credentials::from_env()?;
    let config = ExperimentConfig::from_file(&config_path)?;

    let checkpoint = tokio::task::spawn_blocking(move || {
        let backend = ProcessTrainingBackend::new(trainer_cmd, credentials.hf_token);
        let trainer = Trainer::new(config)?;
        let mut callback = ProgressCallback::new()?;
        trainer.run(&backend, &mut callback)
    })
    .await
    .map_err(|e| InoculateError::training_caused_by("training task panicked", e))??;

    println!("checkpoint written to {}", checkpoint.path.display());
    Ok(0)
}

async fn generate(
    model: String,
    prompts_path: PathBuf,
    out: PathBuf,
    settings: GenerationSettings,
    continue_on_error: bool,
) -> Result<i32> {
    let credentials = Credentials::from_env()?;
    let backend = HttpGenerationBackend::new(&credentials)?;
    let model = ModelRef::parse(&model);
    let prompts = load_prompts(&prompts_path)?;

    let policy = if continue_on_error {
        OnError::Skip
    } else {
        OnError::Abort
    };
    let rows = Generator::new(settings)
        .on_error(policy)
        .generate(&backend, &model, &prompts)
        .await?;
    write_responses_csv(&out, &rows)?;
    println!("wrote {} responses to {}", rows.len(), out.display());
    Ok(0)
}

async fn score(responses: PathBuf, out_dir: PathBuf) -> Result<i32> {
    let credentials = Credentials::from_env()?;
    let judge = Arc::new(OpenAiJudge::new(&credentials)?);
    let scorer = Scorer::new(judge);

    let rows = read_responses_csv(&responses)?;
    let records = scorer.score(&rows).await;
    let summary = ScoreSummary::from_records(&records);

    std::fs::create_dir_all(&out_dir)?;
    write_scored_csv(out_dir.join(SCORES_FILE), &rows, &records)?;
    std::fs::write(
        out_dir.join(SUMMARY_FILE),
        serde_json::to_string_pretty(&summary)?,
    )?;
    println!("{summary}");
    Ok(i32::from(!summary.passed))
}

async fn run_tests(experiments_dir: PathBuf, trainer_cmd: String) -> Result<i32> {
    let credentials = Credentials::from_env()?;
    let configs = discover_configs(&experiments_dir)?;
    if configs.is_empty() {
        return Err(InoculateError::Config(format!(
            "no config.json files found under {}",
            experiments_dir.display()
        )));
    }
    tracing::info!("found {} experiment configs", configs.len());

    let orchestrator = Orchestrator::new(
        Arc::new(ProcessTrainingBackend::new(
            trainer_cmd,
            credentials.hf_token.clone(),
        )),
        Arc::new(HttpGenerationBackend::new(&credentials)?),
        Scorer::new(Arc::new(OpenAiJudge::new(&credentials)?)),
    );

    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing current run then stopping");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = orchestrator.run_all(&configs).await;
    println!("{report}");
    Ok(report.exit_code())
}

/// Find every `config.json` under `dir`, in deterministic path order.
fn discover_configs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut configs = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            InoculateError::Config(format!("cannot walk {}: {e}", dir.display()))
        })?;
        if entry.file_type().is_file() && entry.file_name() == "config.json" {
            configs.push(entry.into_path());
        }
    }
    configs.sort();
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_discover_configs_sorted_and_recursive() {
        let temp = TempDir::new().unwrap();
        for name in ["b_run", "a_run"] {
            let dir = temp.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("config.json"), "{}").unwrap();
        }
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let configs = discover_configs(temp.path()).unwrap();
        assert_eq!(configs.len(), 2);
        assert!(configs[0].ends_with("a_run/config.json"));
        assert!(configs[1].ends_with("b_run/config.json"));
    }

    #[test]
    fn test_mix_defaults_parse() {
        let cli = Cli::try_parse_from(["inoculate", "mix", "a.jsonl", "b.jsonl", "out.jsonl"])
            .unwrap();
        match cli.command {
            Commands::Mix {
                proportion,
                target_size,
                seed,
                ..
            } => {
                assert!((proportion - 0.5).abs() < f64::EPSILON);
                assert!(target_size.is_none());
                assert!(seed.is_none());
            }
            _ => panic!("expected mix"),
        }
    }

    #[test]
    fn test_run_tests_defaults_parse() {
        let cli = Cli::try_parse_from(["inoculate", "run-tests"]).unwrap();
        match cli.command {
            Commands::RunTests {
                experiments_dir,
                trainer_cmd,
            } => {
                assert_eq!(experiments_dir, PathBuf::from("experiments"));
                assert_eq!(trainer_cmd, DEFAULT_TRAINER_CMD);
            }
            _ => panic!("expected run-tests"),
        }
    }
}
