use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mutant::KillPolicy;
use crate::operators::{OperatorCategory, OperatorSets, parse_kinds};
use crate::pytest::DEFAULT_COMMAND;
use crate::select::Strategy;

pub const DEFAULT_TESTS: &str = "tests";
pub const DEFAULT_COVERAGE: &str = "coverage.json";
pub const DEFAULT_OUT_DIR: &str = "py-mutant.out";
pub const DEFAULT_ITERATIONS: usize = 10;
pub const DEFAULT_MUTATIONS: usize = 1;

/// Settings as they appear in a `py-mutant.toml` file.
///
/// The CLI fills the same struct from its flags; [`FileConfig::merge`] lets
/// the flags win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub target: Option<PathBuf>,
    pub tests: Option<PathBuf>,
    pub coverage: Option<PathBuf>,
    pub strategy: Option<Strategy>,
    pub iterations: Option<usize>,
    pub mutations: Option<usize>,
    pub runner: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub seed: Option<u64>,
    pub errors_kill: Option<bool>,
    pub keep_backup: Option<bool>,
    pub verbose: Option<bool>,
    #[serde(default)]
    pub operators: OperatorNames,
}

/// Approved operator names per category, e.g. `binary = ["Add", "Sub"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorNames {
    pub unary: Option<Vec<String>>,
    pub binary: Option<Vec<String>>,
    pub boolean: Option<Vec<String>>,
    pub comparison: Option<Vec<String>>,
}

impl OperatorNames {
    fn get(&self, category: OperatorCategory) -> Option<&Vec<String>> {
        match category {
            OperatorCategory::Unary => self.unary.as_ref(),
            OperatorCategory::Binary => self.binary.as_ref(),
            OperatorCategory::Boolean => self.boolean.as_ref(),
            OperatorCategory::Comparison => self.comparison.as_ref(),
        }
    }

    fn merge(self, over: OperatorNames) -> OperatorNames {
        OperatorNames {
            unary: over.unary.or(self.unary),
            binary: over.binary.or(self.binary),
            boolean: over.boolean.or(self.boolean),
            comparison: over.comparison.or(self.comparison),
        }
    }

    /// Start from the default sets and replace every category that was given.
    pub fn resolve(&self) -> Result<OperatorSets, ConfigError> {
        let mut sets = OperatorSets::default();
        for category in OperatorCategory::ALL {
            if let Some(names) = self.get(category) {
                sets.set(category, parse_kinds(category, names)?)?;
            }
        }
        sets.validate()?;
        Ok(sets)
    }
}

impl FileConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        toml::from_str(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Values set in `over` replace those in `self`.
    pub fn merge(self, over: FileConfig) -> FileConfig {
        FileConfig {
            target: over.target.or(self.target),
            tests: over.tests.or(self.tests),
            coverage: over.coverage.or(self.coverage),
            strategy: over.strategy.or(self.strategy),
            iterations: over.iterations.or(self.iterations),
            mutations: over.mutations.or(self.mutations),
            runner: over.runner.or(self.runner),
            out_dir: over.out_dir.or(self.out_dir),
            timeout_secs: over.timeout_secs.or(self.timeout_secs),
            seed: over.seed.or(self.seed),
            errors_kill: over.errors_kill.or(self.errors_kill),
            keep_backup: over.keep_backup.or(self.keep_backup),
            verbose: over.verbose.or(self.verbose),
            operators: self.operators.merge(over.operators),
        }
    }
}

/// Fully resolved configuration for one `run` or `scan`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory of `.py` files, or a single `.py` file, to mutate.
    pub target: PathBuf,

    /// Test entry path handed to the runner as `{tests}`.
    pub tests: PathBuf,

    /// coverage.py JSON report.
    pub coverage: PathBuf,

    pub strategy: Strategy,
    pub iterations: usize,

    /// Sites mutated per mutant (K).
    pub mutations: usize,

    pub operators: OperatorSets,

    /// Runner command template.
    pub runner: String,

    pub out_dir: PathBuf,
    pub timeout: Option<Duration>,

    /// `None` draws a fresh seed at run start.
    pub seed: Option<u64>,

    pub kill_policy: KillPolicy,
    pub keep_backup: bool,
    pub verbose: bool,
}

impl Options {
    pub fn from_config(config: FileConfig) -> Result<Self, ConfigError> {
        let target = config
            .target
            .ok_or_else(|| ConfigError::Invalid("no target given".to_string()))?;

        let iterations = config.iterations.unwrap_or(DEFAULT_ITERATIONS);
        if iterations == 0 {
            return Err(ConfigError::Invalid(
                "iterations must be at least 1".to_string(),
            ));
        }

        let mutations = config.mutations.unwrap_or(DEFAULT_MUTATIONS);
        if mutations == 0 {
            return Err(ConfigError::Invalid(
                "mutations must be at least 1".to_string(),
            ));
        }

        let runner = config.runner.unwrap_or_else(|| DEFAULT_COMMAND.to_string());
        if runner.trim().is_empty() {
            return Err(ConfigError::Invalid("runner command is empty".to_string()));
        }

        let tests = config.tests.unwrap_or_else(|| PathBuf::from(DEFAULT_TESTS));
        if !tests.exists() {
            return Err(ConfigError::MissingPath(tests));
        }

        Ok(Self {
            target,
            tests,
            coverage: config
                .coverage
                .unwrap_or_else(|| PathBuf::from(DEFAULT_COVERAGE)),
            strategy: config.strategy.unwrap_or_default(),
            iterations,
            mutations,
            operators: config.operators.resolve()?,
            runner,
            out_dir: config
                .out_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR)),
            timeout: config.timeout_secs.map(Duration::from_secs),
            seed: config.seed,
            kill_policy: KillPolicy {
                errors_kill: config.errors_kill.unwrap_or(false),
            },
            keep_backup: config.keep_backup.unwrap_or(false),
            verbose: config.verbose.unwrap_or(false),
        })
    }
}

/// The subset of [`Options`] that `scan` needs; no test suite is involved.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub target: PathBuf,
    pub coverage: PathBuf,
    pub operators: OperatorSets,
    pub verbose: bool,
}

impl ScanOptions {
    pub fn from_config(config: FileConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            target: config
                .target
                .ok_or_else(|| ConfigError::Invalid("no target given".to_string()))?,
            coverage: config
                .coverage
                .unwrap_or_else(|| PathBuf::from(DEFAULT_COVERAGE)),
            operators: config.operators.resolve()?,
            verbose: config.verbose.unwrap_or(false),
        })
    }
}
