use std::sync::Arc;

use serde::Serialize;

use crate::{
    FilterRule, RunSettings, Snapshot, SourceLines, Statistic,
    document::{EntryNode, Section, SectionKind, SizeField, SizeSummary},
    filter::default_deny_rules,
};

/// A ranked allocation group of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticEntry {
    /// 1-based position in the snapshot's ranking
    pub rank: usize,
    pub size_bytes: u64,
    pub filename: String,
    pub line_number: u32,
    /// Depth of the call stack that was captured for the group
    pub frame_count: usize,
    /// Number of live allocations in the group
    pub block_count: usize,
    pub source_line: Option<String>,
}

impl StatisticEntry {
    pub fn new(rank: usize, statistic: &Statistic, source_lines: &SourceLines) -> Self {
        let frame = statistic.traceback.top_frame();
        StatisticEntry {
            rank,
            size_bytes: statistic.size,
            source_line: source_lines.line(&frame.filename, frame.lineno),
            filename: frame.filename,
            line_number: frame.lineno,
            frame_count: statistic.traceback.total_nframe,
            block_count: statistic.count,
        }
    }

    fn to_node(&self) -> EntryNode {
        EntryNode {
            rank: self.rank,
            size: SizeField::Absolute(self.size_bytes),
            filename: self.filename.clone(),
            line_number: self.line_number,
            frame_count: self.frame_count,
            source_line: self.source_line.clone(),
        }
    }
}

/// One captured snapshot of a run, seen through the run's settings.
///
/// Nothing is cached: filtering and ranking are recomputed from the raw snapshot
/// on every call.
#[derive(Debug, Clone)]
pub struct SnapshotView {
    iteration: usize,
    snapshot: Snapshot,
    settings: Arc<RunSettings>,
    source_lines: Arc<SourceLines>,
}

impl SnapshotView {
    pub fn new(
        iteration: usize,
        snapshot: Snapshot,
        settings: Arc<RunSettings>,
        source_lines: Arc<SourceLines>,
    ) -> Self {
        SnapshotView {
            iteration,
            snapshot,
            settings,
            source_lines,
        }
    }

    /// 0 for the snapshot taken before the first invocation.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn raw_snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub(crate) fn source_lines(&self) -> &Arc<SourceLines> {
        &self.source_lines
    }

    /// Allow-list of the target files in exclusive mode, deny-list of tracer noise otherwise.
    /// An empty allow-list filters nothing.
    pub fn filter_rules(&self) -> Vec<FilterRule> {
        if self.settings.exclusive_filter() {
            self.settings.target_rules().to_vec()
        } else {
            default_deny_rules()
        }
    }

    pub fn filtered_snapshot(&self) -> Snapshot {
        self.filtered_with(&self.filter_rules())
    }

    /// Filter the raw snapshot with caller supplied rules instead of the settings' policy.
    pub fn filtered_with(&self, rules: &[FilterRule]) -> Snapshot {
        self.snapshot.filter(rules)
    }

    /// Every group of the filtered snapshot, ranked by size.
    pub fn entries(&self) -> Vec<StatisticEntry> {
        self.filtered_snapshot()
            .statistics(self.settings.group_key())
            .iter()
            .enumerate()
            .map(|(i, stat)| StatisticEntry::new(i + 1, stat, &self.source_lines))
            .collect()
    }

    pub fn top_entries(&self) -> Vec<StatisticEntry> {
        self.split_entries().0
    }

    pub fn remaining_entries(&self) -> Vec<StatisticEntry> {
        self.split_entries().1
    }

    pub fn top_size_summary(&self) -> Option<SizeSummary> {
        summarize(&self.top_entries())
    }

    pub fn remaining_size_summary(&self) -> Option<SizeSummary> {
        summarize(&self.remaining_entries())
    }

    pub fn title(&self) -> String {
        match self.iteration {
            0 => "Snapshot Before Run".to_string(),
            n => format!("Snapshot Run #{n}"),
        }
    }

    pub fn to_section(&self) -> Section {
        let (top, remaining) = self.split_entries();
        Section {
            kind: SectionKind::Snapshot,
            title: self.title(),
            rank_limit: self.settings.rank_limit(),
            entries: top.iter().map(StatisticEntry::to_node).collect(),
            top_total: summarize(&top),
            remaining_total: summarize(&remaining),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_section().to_string()
    }

    fn split_entries(&self) -> (Vec<StatisticEntry>, Vec<StatisticEntry>) {
        let mut top = self.entries();
        let remaining = top.split_off(self.settings.rank_limit().min(top.len()));
        (top, remaining)
    }
}

fn summarize(entries: &[StatisticEntry]) -> Option<SizeSummary> {
    SizeSummary::of(
        entries
            .iter()
            .map(|e| i64::try_from(e.size_bytes).unwrap_or(i64::MAX)),
    )
}
