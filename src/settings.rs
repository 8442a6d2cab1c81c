use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, FilterRule, Result};

/// How allocations are bucketed before they are ranked.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupKey {
    /// One bucket per source file.
    Filename,
    /// One bucket per source line.
    #[default]
    LineNumber,
    /// One bucket per distinct call stack.
    Traceback,
}

impl GroupKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKey::Filename => "FILENAME",
            GroupKey::LineNumber => "LINE_NUMBER",
            GroupKey::Traceback => "TRACEBACK",
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable configuration of a profiling run.
///
/// The profiled function is handed to [`crate::ProfileReport::run`] next to the settings;
/// `target_label` is the name it gets in the rendered report.
///
/// ```rust
/// use memhogs::{GroupKey, RunSettings};
///
/// let settings = RunSettings::builder("parse_config")
///     .target_file("src/config.rs")
///     .run_count(5)
///     .group_key(GroupKey::Traceback)
///     .build()
///     .unwrap();
///
/// assert_eq!(settings.run_count(), 5);
/// assert_eq!(settings.rank_limit(), 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSettings {
    target_label: String,
    target_file_names: Vec<String>,
    #[serde(skip)]
    target_rules: Vec<FilterRule>,
    source_root: Option<PathBuf>,
    run_count: usize,
    group_key: GroupKey,
    rank_limit: usize,
    exclusive_filter: bool,
}

impl RunSettings {
    pub fn builder(target_label: impl Into<String>) -> RunSettingsBuilder {
        RunSettingsBuilder {
            target_label: target_label.into(),
            target_file_names: Vec::new(),
            source_root: None,
            run_count: 3,
            group_key: GroupKey::default(),
            rank_limit: 10,
            exclusive_filter: true,
        }
    }

    /// Parse settings from a JSON document. Missing fields take their defaults.
    ///
    /// ```rust
    /// use memhogs::{GroupKey, RunSettings};
    ///
    /// let settings = RunSettings::from_json(
    ///     r#"{
    ///         "target_label": "load",
    ///         "target_file_names": ["src/load.rs"],
    ///         "group_key": "FILENAME"
    ///     }"#,
    /// )
    /// .unwrap();
    /// assert_eq!(settings.group_key(), GroupKey::Filename);
    /// assert_eq!(settings.run_count(), 3);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SettingsConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("malformed settings: {e}")))?;
        config.try_into()
    }

    pub fn target_label(&self) -> &str {
        &self.target_label
    }

    pub fn target_file_names(&self) -> &[String] {
        &self.target_file_names
    }

    /// Allow-list rules compiled from `target_file_names`.
    pub fn target_rules(&self) -> &[FilterRule] {
        &self.target_rules
    }

    /// Directory relative target file names are resolved against, if not the current one.
    pub fn source_root(&self) -> Option<&PathBuf> {
        self.source_root.as_ref()
    }

    pub fn run_count(&self) -> usize {
        self.run_count
    }

    pub fn group_key(&self) -> GroupKey {
        self.group_key
    }

    pub fn rank_limit(&self) -> usize {
        self.rank_limit
    }

    /// `true` when only the target files are reported (allow-list),
    /// `false` when everything but known tracer noise is reported (deny-list).
    pub fn exclusive_filter(&self) -> bool {
        self.exclusive_filter
    }
}

#[derive(Debug, Clone)]
pub struct RunSettingsBuilder {
    target_label: String,
    target_file_names: Vec<String>,
    source_root: Option<PathBuf>,
    run_count: usize,
    group_key: GroupKey,
    rank_limit: usize,
    exclusive_filter: bool,
}

impl RunSettingsBuilder {
    /// Add a file to the allow-list used in exclusive mode.
    pub fn target_file(mut self, file_name: impl Into<String>) -> Self {
        self.target_file_names.push(file_name.into());
        self
    }

    pub fn target_files<I, S>(mut self, file_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_file_names
            .extend(file_names.into_iter().map(Into::into));
        self
    }

    /// Resolve relative target file names against `root` instead of the current directory.
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    pub fn run_count(mut self, run_count: usize) -> Self {
        self.run_count = run_count;
        self
    }

    pub fn group_key(mut self, group_key: GroupKey) -> Self {
        self.group_key = group_key;
        self
    }

    pub fn rank_limit(mut self, rank_limit: usize) -> Self {
        self.rank_limit = rank_limit;
        self
    }

    pub fn exclusive_filter(mut self, exclusive_filter: bool) -> Self {
        self.exclusive_filter = exclusive_filter;
        self
    }

    /// Fails when a target file name is not a valid glob.
    pub fn build(self) -> Result<RunSettings> {
        let target_rules = self
            .target_file_names
            .iter()
            .map(|file| {
                let rule = FilterRule::include(file)?;
                Ok(match &self.source_root {
                    Some(root) => rule.with_root(root),
                    None => rule,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RunSettings {
            target_label: self.target_label,
            target_file_names: self.target_file_names,
            target_rules,
            source_root: self.source_root,
            run_count: self.run_count,
            group_key: self.group_key,
            rank_limit: self.rank_limit,
            exclusive_filter: self.exclusive_filter,
        })
    }
}

/// Wire form of [`RunSettings`]. Counts are signed so that negative values
/// are reported as configuration errors instead of parse errors.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsConfig {
    target_label: String,
    #[serde(default)]
    target_file_names: Vec<String>,
    #[serde(default)]
    source_root: Option<PathBuf>,
    #[serde(default = "default_run_count")]
    run_count: i64,
    #[serde(default)]
    group_key: GroupKey,
    #[serde(default = "default_rank_limit")]
    rank_limit: i64,
    #[serde(default = "default_exclusive_filter")]
    exclusive_filter: bool,
}

fn default_run_count() -> i64 {
    3
}

fn default_rank_limit() -> i64 {
    10
}

fn default_exclusive_filter() -> bool {
    true
}

impl TryFrom<SettingsConfig> for RunSettings {
    type Error = Error;

    fn try_from(config: SettingsConfig) -> Result<Self> {
        let run_count = non_negative("run_count", config.run_count)?;
        let rank_limit = non_negative("rank_limit", config.rank_limit)?;

        let mut builder = RunSettings::builder(config.target_label)
            .target_files(config.target_file_names)
            .run_count(run_count)
            .group_key(config.group_key)
            .rank_limit(rank_limit)
            .exclusive_filter(config.exclusive_filter);
        if let Some(root) = config.source_root {
            builder = builder.source_root(root);
        }
        builder.build()
    }
}

fn non_negative(field: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::InvalidConfiguration(format!("{field} must be >= 0, got {value}")))
}
