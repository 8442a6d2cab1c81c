//! Structured form of a profile report.
//!
//! The views build this tree once; [`fmt::Display`] renders it as text and
//! `serde` serializes it, so other output formats reuse the same aggregation.

use std::fmt;

use serde::Serialize;

use crate::GroupKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub target_label: String,
    pub settings: SettingsBlock,
    pub snapshots: Vec<Section>,
    pub comparisons: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsBlock {
    pub rank_limit: usize,
    pub group_key: GroupKey,
    pub exclusive_filter: bool,
    /// The allow-list, only present in exclusive mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_filters: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Snapshot,
    Comparison,
}

/// One snapshot or one comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub kind: SectionKind,
    pub title: String,
    pub rank_limit: usize,
    pub entries: Vec<EntryNode>,
    pub top_total: Option<SizeSummary>,
    pub remaining_total: Option<SizeSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryNode {
    pub rank: usize,
    pub size: SizeField,
    pub filename: String,
    pub line_number: u32,
    pub frame_count: usize,
    pub source_line: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeField {
    /// Bytes held by the group
    Absolute(u64),
    /// Change in bytes since the previous snapshot
    Delta(i64),
}

/// Total size of a set of entries.
///
/// Summaries of empty sets are `None` rather than zero, so that "nothing matched"
/// stays distinguishable from "the entries cancel out".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeSummary {
    pub bytes: i64,
}

impl SizeSummary {
    pub fn of<I: IntoIterator<Item = i64>>(sizes: I) -> Option<Self> {
        let mut sizes = sizes.into_iter().peekable();
        sizes.peek()?;
        Some(SizeSummary {
            bytes: sizes.sum(),
        })
    }

    pub fn kib(&self) -> f64 {
        kib(self.bytes)
    }
}

impl fmt::Display for SizeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} KiB", self.kib())
    }
}

fn kib(bytes: i64) -> f64 {
    bytes as f64 / 1024.0
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Profile Run For {}", self.target_label)?;
        writeln!(f, "```")?;
        writeln!(f, "SETTINGS")?;
        writeln!(f)?;
        writeln!(f, "- Memory Limit: {}", self.settings.rank_limit)?;
        writeln!(f, "- Key Type: {}", self.settings.group_key)?;
        writeln!(f, "- Exclusive Filter Set: {}", self.settings.exclusive_filter)?;
        if let Some(files) = &self.settings.file_filters {
            writeln!(f, "- File Filters Applied: {files:?}")?;
        }
        writeln!(f, "```")?;

        for section in &self.snapshots {
            write!(f, "{section}")?;
        }

        if !self.comparisons.is_empty() {
            writeln!(f)?;
            writeln!(f, "# Profile Comparisons For {}", self.target_label)?;
            for section in &self.comparisons {
                write!(f, "{section}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "## {}", self.title)?;
        writeln!(f, "### Top {} Memory Hogs:", self.rank_limit)?;
        for entry in &self.entries {
            write!(f, "{entry}")?;
        }
        writeln!(f)?;
        writeln!(f, "### Summary:")?;
        writeln!(f, "\tTop Total Size: {}", OptionalSize(self.top_total))?;
        writeln!(
            f,
            "\tRemaining Total Size: {}",
            OptionalSize(self.remaining_total)
        )
    }
}

impl fmt::Display for EntryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            SizeField::Absolute(bytes) => {
                write!(f, "\t#{}: {}KiB", self.rank, bytes as f64 / 1024.0)?
            }
            SizeField::Delta(bytes) => write!(f, "\t#{}: {:+}KiB", self.rank, kib(bytes))?,
        }
        writeln!(
            f,
            " -> {}:{} (traces: {})",
            self.filename, self.line_number, self.frame_count
        )?;
        if let Some(line) = &self.source_line {
            writeln!(f, "\t\t{line}")?;
        }
        Ok(())
    }
}

struct OptionalSize(Option<SizeSummary>);

impl fmt::Display for OptionalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(summary) => write!(f, "{summary}"),
            None => Ok(()),
        }
    }
}
