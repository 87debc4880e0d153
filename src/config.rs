//! Evaluator configuration.
//!
//! All process-wide settings (directories, sandbox limits, judge model and
//! rubric weights) live in one [`EvaluatorConfig`] that is loaded once,
//! validated once, and handed to each component at construction.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sandbox::ResourceLimits;

/// Tolerance used when checking that rubric weights sum to 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Top-level configuration for the evaluation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Root directory for traces and staged work directories.
    pub data_dir: PathBuf,
    /// Directory for raw-results bundles and reports.
    pub reports_dir: PathBuf,
    /// Directory for the on-disk judgment cache.
    pub cache_dir: PathBuf,
    /// Directory containing one `<rubric>.txt` prompt template per rubric.
    pub prompts_dir: PathBuf,
    /// Sandbox execution settings.
    pub sandbox: SandboxSettings,
    /// Judge settings.
    pub judge: JudgeSettings,
    /// Grading behaviour.
    pub grading: GradingSettings,
    /// Rubric weight table, in report order.
    pub weights: Vec<RubricWeight>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            reports_dir: data_dir.join("reports"),
            cache_dir: data_dir.join("grader_cache"),
            data_dir,
            prompts_dir: PathBuf::from("./prompts"),
            sandbox: SandboxSettings::default(),
            judge: JudgeSettings::default(),
            grading: GradingSettings::default(),
            weights: default_weights(),
        }
    }
}

impl EvaluatorConfig {
    /// Loads configuration from an optional YAML file, then applies
    /// environment overrides, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML configuration file without applying overrides.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Applies environment variable overrides.
    ///
    /// - `NLE_DATA_DIR`: relocates data, reports and cache directories
    /// - `LITELLM_API_BASE` / `LITELLM_API_KEY`: judge endpoint and key
    /// - `JUDGE_MODEL`: judge model identifier
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("NLE_DATA_DIR") {
            let data_dir = PathBuf::from(dir);
            self.reports_dir = data_dir.join("reports");
            self.cache_dir = data_dir.join("grader_cache");
            self.data_dir = data_dir;
        }
        if let Ok(base) = env::var("LITELLM_API_BASE") {
            self.judge.api_base = Some(base);
        }
        if let Ok(key) = env::var("LITELLM_API_KEY") {
            self.judge.api_key = Some(key);
        }
        if let Ok(model) = env::var("JUDGE_MODEL") {
            self.judge.model = model;
        }
    }

    /// Validates the configuration. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        RubricWeights::new(self.weights.clone())?;

        if !is_positive(self.judge.score_max) {
            return Err(ConfigError::Invalid(format!(
                "judge.score_max must be positive, got {}",
                self.judge.score_max
            )));
        }
        if self.sandbox.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if !is_positive(self.sandbox.cpus) {
            return Err(ConfigError::Invalid(format!(
                "sandbox.cpus must be positive, got {}",
                self.sandbox.cpus
            )));
        }
        if !self.judge.temperature.is_finite() || self.judge.temperature < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "judge.temperature must be a non-negative number, got {}",
                self.judge.temperature
            )));
        }
        if self.judge.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "judge.request_timeout_seconds must be at least 1".to_string(),
            ));
        }
        self.sandbox.limits().memory_bytes().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    /// Returns the validated weight table.
    pub fn rubric_weights(&self) -> Result<RubricWeights, ConfigError> {
        RubricWeights::new(self.weights.clone())
    }

    /// Directory where staged agent work directories are created.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }
}

/// Finite and strictly greater than zero. Rejects NaN.
fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// How the sandbox chooses its isolation runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Use Docker when the daemon answers, otherwise run unconfined.
    Auto,
    /// Always run unconfined on the host.
    None,
}

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Isolation runtime selection.
    pub isolation: IsolationMode,
    /// Pinned base image for isolated runs.
    pub image: String,
    /// Wall-clock limit per execution.
    pub timeout_seconds: u64,
    /// Memory limit in Docker notation (`256m`, `1g`).
    pub memory: String,
    /// CPU limit in cores.
    pub cpus: f64,
    /// Check that the command's entry file exists before running it.
    pub validate_entry: bool,
    /// Keep staged work directories after the trace is written.
    pub keep_workdir: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::Auto,
            image: "python:3.11-slim".to_string(),
            timeout_seconds: 30,
            memory: "256m".to_string(),
            cpus: 0.5,
            validate_entry: true,
            keep_workdir: false,
        }
    }
}

impl SandboxSettings {
    /// Resource limits derived from these settings.
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.timeout_seconds, self.memory.clone(), self.cpus)
    }
}

/// Which judge scores rubric prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeBackend {
    /// OpenAI-compatible chat endpoint.
    Llm,
    /// Offline keyword heuristic; no network access.
    Keyword,
}

/// Judge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSettings {
    /// Judge implementation.
    pub backend: JudgeBackend,
    /// OpenAI-compatible API base URL.
    pub api_base: Option<String>,
    /// API key for the judge endpoint.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Judge model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Cap on reply tokens; unset leaves it to the endpoint.
    pub max_tokens: Option<u32>,
    /// Upper bound on a single judge call.
    pub request_timeout_seconds: u64,
    /// Maximum score on the rubric scale.
    pub score_max: f64,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            backend: JudgeBackend::Llm,
            api_base: None,
            api_key: None,
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.1,
            max_tokens: None,
            request_timeout_seconds: 60,
            score_max: 10.0,
        }
    }
}

/// Grading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingSettings {
    /// Judge every test on every weighted rubric. When false, each test is
    /// judged only on its own rubric selector.
    pub all_rubrics: bool,
}

impl Default for GradingSettings {
    fn default() -> Self {
        Self { all_rubrics: true }
    }
}

/// One entry of the rubric weight table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricWeight {
    pub rubric: String,
    pub weight: f64,
}

impl RubricWeight {
    pub fn new(rubric: impl Into<String>, weight: f64) -> Self {
        Self {
            rubric: rubric.into(),
            weight,
        }
    }
}

/// The stock weight table.
pub fn default_weights() -> Vec<RubricWeight> {
    vec![
        RubricWeight::new("correctness", 0.35),
        RubricWeight::new("reasoning", 0.25),
        RubricWeight::new("tool_usage", 0.20),
        RubricWeight::new("safety", 0.15),
        RubricWeight::new("robustness", 0.05),
    ]
}

/// A weight table that has passed validation.
///
/// Only constructible through [`RubricWeights::new`], so holders can rely on
/// unique rubric names, non-negative weights and a total of 1.0.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RubricWeights(Vec<RubricWeight>);

impl RubricWeights {
    /// Validates and wraps a weight table.
    pub fn new(entries: Vec<RubricWeight>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::InvalidWeights(
                "at least one rubric is required".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if entry.rubric.trim().is_empty() {
                return Err(ConfigError::InvalidWeights(
                    "rubric names must be non-empty".to_string(),
                ));
            }
            if !seen.insert(entry.rubric.as_str()) {
                return Err(ConfigError::InvalidWeights(format!(
                    "duplicate rubric '{}'",
                    entry.rubric
                )));
            }
            if !entry.weight.is_finite() || entry.weight < 0.0 {
                return Err(ConfigError::InvalidWeights(format!(
                    "weight for '{}' must be a non-negative number, got {}",
                    entry.rubric, entry.weight
                )));
            }
        }

        let total: f64 = entries.iter().map(|e| e.weight).sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::InvalidWeights(format!(
                "weights must sum to 1.0, got {total}"
            )));
        }

        Ok(Self(entries))
    }

    /// Iterates entries in configured order.
    pub fn iter(&self) -> impl Iterator<Item = &RubricWeight> {
        self.0.iter()
    }

    /// Rubric names in configured order.
    pub fn rubrics(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.rubric.as_str())
    }

    /// Weight for a rubric, if configured.
    pub fn weight(&self, rubric: &str) -> Option<f64> {
        self.0.iter().find(|e| e.rubric == rubric).map(|e| e.weight)
    }

    pub fn contains(&self, rubric: &str) -> bool {
        self.weight(rubric).is_some()
    }

    pub fn as_slice(&self) -> &[RubricWeight] {
        &self.0
    }
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self(default_weights())
    }
}
