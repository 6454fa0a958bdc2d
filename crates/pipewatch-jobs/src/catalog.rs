use std::{collections::HashSet, path::Path};

use pipewatch_common::error::{PipewatchError, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

/// Upper bound for progress derived from log directives. Only a terminal
/// success marker moves a job to `1.0`.
const MAX_COMPUTED_PROGRESS: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    pub key: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub key: String,
    pub steps: Vec<StepEntry>,
}

/// Resolved presentation of a single `PROGRESS` directive.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseUpdate {
    pub phase: String,
    pub progress: f64,
}

/// Ordered stages, each with ordered steps and their descriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCatalog {
    stages: Vec<StageEntry>,
}

impl PhaseCatalog {
    pub fn new(stages: Vec<StageEntry>) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipewatchError::InvalidArgument(
                "phase catalog must contain at least one stage".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.key.is_empty() || !seen.insert(stage.key.as_str()) {
                return Err(PipewatchError::InvalidArgument(format!(
                    "phase catalog stage key '{}' is empty or duplicated",
                    stage.key
                )));
            }
            let mut steps = HashSet::new();
            for step in &stage.steps {
                if step.key.is_empty() || !steps.insert(step.key.as_str()) {
                    return Err(PipewatchError::InvalidArgument(format!(
                        "phase catalog step key '{}' in stage '{}' is empty or duplicated",
                        step.key, stage.key
                    )));
                }
            }
        }

        Ok(Self { stages })
    }

    /// Reads a catalog from a JSON array of stages.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).await?;
        let stages = serde_json::from_slice::<Vec<StageEntry>>(&bytes).map_err(|err| {
            PipewatchError::InvalidArgument(format!(
                "failed to parse phase catalog {}: {err}",
                path.display()
            ))
        })?;
        Self::new(stages)
    }

    /// Turns `(stage, step, details)` into phase text and a progress value in
    /// `[base, 0.99]`. Unknown keys yield `None` and a warning.
    pub fn resolve(
        &self,
        stage: &str,
        step: &str,
        details: Option<&str>,
        base: f64,
    ) -> Option<PhaseUpdate> {
        let Some((stage_index, stage_entry)) = self.stage(stage) else {
            warn!(stage = %stage, step = %step, "unknown stage in progress directive");
            return None;
        };
        let Some(step_index) = stage_entry.steps.iter().position(|entry| entry.key == step) else {
            warn!(stage = %stage, step = %step, "unknown step in progress directive");
            return None;
        };

        let description = &stage_entry.steps[step_index].description;
        let phase = match details {
            Some(details) if !details.is_empty() => format!("{description} ({details})"),
            _ => description.clone(),
        };

        let fraction = details
            .and_then(parse_fraction)
            .unwrap_or(step_index as f64 / stage_entry.steps.len() as f64);
        let total = self.stages.len() as f64;
        let computed = stage_index as f64 / total + fraction / total;
        let upper = MAX_COMPUTED_PROGRESS.max(base);

        Some(PhaseUpdate {
            phase,
            progress: computed.clamp(base, upper),
        })
    }

    fn stage(&self, key: &str) -> Option<(usize, &StageEntry)> {
        self.stages
            .iter()
            .enumerate()
            .find(|(_, stage)| stage.key == key)
    }
}

impl Default for PhaseCatalog {
    fn default() -> Self {
        let stage = |key: &str, steps: &[(&str, &str)]| StageEntry {
            key: key.to_string(),
            steps: steps
                .iter()
                .map(|(key, description)| StepEntry {
                    key: (*key).to_string(),
                    description: (*description).to_string(),
                })
                .collect(),
        };

        Self {
            stages: vec![
                stage(
                    "extracting_machine",
                    &[
                        ("main", "Extracting Machine: Overall"),
                        (
                            "get_bundesanzeiger_html",
                            "Extracting Machine: Fetch Bundesanzeiger HTML",
                        ),
                        ("clean_html", "Extracting Machine: Clean HTML"),
                        (
                            "extract_sachanlagen",
                            "Extracting Machine: Extract Sachanlagen",
                        ),
                        ("generate_report", "Extracting Machine: Generate Report"),
                        (
                            "merge_data",
                            "Extracting Machine: Merge Technische Anlagen and Sachanlagen",
                        ),
                    ],
                ),
                stage(
                    "webcrawl",
                    &[
                        ("main", "Webcrawl: Overall"),
                        ("crawl_domain", "Webcrawl: Crawl Domain"),
                        ("extract_llm", "Webcrawl: Extract Keywords (LLM)"),
                        ("fill_process_type", "Webcrawl: Fill Process Type"),
                        ("pluralize_llm_file", "Webcrawl: Pluralize Keywords in File"),
                        (
                            "pluralize_llm_entry",
                            "Webcrawl: Pluralize Keywords for Entry",
                        ),
                        ("process_files", "Webcrawl: Consolidate Data"),
                        ("convert_to_csv", "Webcrawl: Convert to CSV"),
                    ],
                ),
                stage(
                    "integration",
                    &[
                        ("main", "Integration: Overall"),
                        (
                            "merge_technische_anlagen",
                            "Integration: Merge Technische Anlagen",
                        ),
                        ("enrich_data", "Integration: Enrich Data"),
                    ],
                ),
            ],
        }
    }
}

/// Reads a leading `k/n` counter, e.g. `3/10` or `3/10:crawling example.com`.
fn parse_fraction(details: &str) -> Option<f64> {
    let token = details
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()?;
    let (done, total) = token.split_once('/')?;
    let done = done.trim().parse::<u64>().ok()?;
    let total = total.trim().parse::<u64>().ok()?;
    if total == 0 {
        return None;
    }
    Some((done as f64 / total as f64).min(1.0))
}
