//! Training dataset loading, inoculation, and mixing.

use std::io::Write;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{InoculateError, Result};

/// Speaker role of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// End-user message.
    User,
    /// Model response.
    Assistant,
}

/// A single (role, content) turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who is speaking.
    pub role: Role,
    /// What they said.
    pub content: String,
}

impl Turn {
    /// Convenience constructor.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One supervised training example: an ordered list of chat turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// The conversation turns, in order.
    pub messages: Vec<Turn>,
}

impl TrainingRecord {
    /// The system turn, if present.
    #[must_use]
    pub fn system_turn(&self) -> Option<&Turn> {
        self.messages.iter().find(|t| t.role == Role::System)
    }

    fn has_role(&self, role: Role) -> bool {
        self.messages.iter().any(|t| t.role == role)
    }
}

/// A loaded training dataset.
///
/// Records are held in memory, so the dataset can be iterated any number of
/// times (once for token-length stats, once for training, and so on).
#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<TrainingRecord>,
}

impl Dataset {
    /// Load a JSONL dataset, optionally injecting an inoculation prompt.
    ///
    /// When `inoculation_prompt` is set, every record ends up with exactly one
    /// system turn whose content is that prompt, byte for byte. Any authored
    /// system turns are replaced. Without it, records pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if the file is missing, a line is not valid
    /// JSON, or a record lacks a user/assistant pair.
    pub fn load<P: AsRef<Path>>(path: P, inoculation_prompt: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(InoculateError::Dataset(format!(
                "dataset not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let mut records = Vec::new();

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let mut record: TrainingRecord = serde_json::from_str(line).map_err(|e| {
                InoculateError::Dataset(format!("line {}: {e}", line_no + 1))
            })?;

            if !record.has_role(Role::User) || !record.has_role(Role::Assistant) {
                return Err(InoculateError::Dataset(format!(
                    "line {}: record lacks a user/assistant pair",
                    line_no + 1
                )));
            }

            if let Some(prompt) = inoculation_prompt {
                record.messages.retain(|t| t.role != Role::System);
                record
                    .messages
                    .insert(0, Turn::new(Role::System, prompt));
            }

            records.push(record);
        }

        tracing::debug!(
            records = records.len(),
            inoculated = inoculation_prompt.is_some(),
            "loaded dataset from {}",
            path.display()
        );
        Ok(Self { records })
    }

    /// Build a dataset from records already in memory.
    #[must_use]
    pub fn from_records(records: Vec<TrainingRecord>) -> Self {
        Self { records }
    }

    /// Iterate over the records. Restartable.
    pub fn iter(&self) -> std::slice::Iter<'_, TrainingRecord> {
        self.records.iter()
    }

    /// The records as a slice.
    #[must_use]
    pub fn records(&self) -> &[TrainingRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the dataset holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the dataset back out as JSONL (one record per line).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for record in &self.records {
            serde_json::to_writer(&mut file, record)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a TrainingRecord;
    type IntoIter = std::slice::Iter<'a, TrainingRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Mix two datasets at the given proportion from the first.
///
/// The result has `target_size` records (default: the smaller dataset's size),
/// sampled without replacement when possible and with replacement otherwise,
/// then shuffled.
///
/// # Errors
///
/// Returns a dataset error if `proportion` is outside `[0, 1]`.
pub fn mix(
    first: &Dataset,
    second: &Dataset,
    proportion: f64,
    target_size: Option<usize>,
    seed: Option<u64>,
) -> Result<Dataset> {
    if !(0.0..=1.0).contains(&proportion) {
        return Err(InoculateError::Dataset(
            "mix proportion must be within [0, 1]".into(),
        ));
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let target = target_size.unwrap_or_else(|| first.len().min(second.len()));
    let from_first = (target as f64 * proportion) as usize;
    let from_second = target - from_first;

    let mut records = Vec::with_capacity(target);
    sample_into(&mut records, first.records(), from_first, &mut rng);
    sample_into(&mut records, second.records(), from_second, &mut rng);
    records.shuffle(&mut rng);

    tracing::info!(
        from_first,
        from_second,
        "mixed datasets into {} records",
        records.len()
    );
    Ok(Dataset::from_records(records))
}

fn sample_into(
    out: &mut Vec<TrainingRecord>,
    source: &[TrainingRecord],
    count: usize,
    rng: &mut StdRng,
) {
    if count == 0 || source.is_empty() {
        return;
    }
    if count <= source.len() {
        out.extend(source.choose_multiple(rng, count).cloned());
    } else {
        out.extend((0..count).map(|_| source[rng.gen_range(0..source.len())].clone()));
    }
}
