use std::sync::Arc;

use serde::Serialize;

use crate::{
    Error, Result, SnapshotView, SourceLines, StatisticDiff,
    document::{EntryNode, Section, SectionKind, SizeField, SizeSummary},
};

/// A ranked allocation group of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticDiffEntry {
    pub rank: usize,
    /// Positive when the group grew
    pub size_delta_bytes: i64,
    pub filename: String,
    pub line_number: u32,
    pub frame_count: usize,
    pub block_count_delta: i64,
    pub source_line: Option<String>,
}

impl StatisticDiffEntry {
    pub fn new(rank: usize, diff: &StatisticDiff, source_lines: &SourceLines) -> Self {
        let frame = diff.traceback.top_frame();
        StatisticDiffEntry {
            rank,
            size_delta_bytes: diff.size_diff,
            source_line: source_lines.line(&frame.filename, frame.lineno),
            filename: frame.filename,
            line_number: frame.lineno,
            frame_count: diff.traceback.total_nframe,
            block_count_delta: diff.count_diff,
        }
    }

    fn to_node(&self) -> EntryNode {
        EntryNode {
            rank: self.rank,
            size: SizeField::Delta(self.size_delta_bytes),
            filename: self.filename.clone(),
            line_number: self.line_number,
            frame_count: self.frame_count,
            source_line: self.source_line.clone(),
        }
    }
}

/// The change between two snapshots of a run.
#[derive(Debug, Clone)]
pub struct SnapshotDiffView {
    iterations: (usize, usize),
    diff: Vec<StatisticDiff>,
    rank_limit: usize,
    source_lines: Arc<SourceLines>,
}

impl SnapshotDiffView {
    pub fn new(
        iterations: (usize, usize),
        diff: Vec<StatisticDiff>,
        rank_limit: usize,
        source_lines: Arc<SourceLines>,
    ) -> Self {
        SnapshotDiffView {
            iterations,
            diff,
            rank_limit,
            source_lines,
        }
    }

    /// Compare the filtered snapshots of two views; positive deltas mean `later` holds more.
    ///
    /// Both views must group allocations the same way.
    pub fn between(earlier: &SnapshotView, later: &SnapshotView) -> Result<Self> {
        let earlier_key = earlier.settings().group_key();
        let later_key = later.settings().group_key();
        if earlier_key != later_key {
            return Err(Error::GroupKeyMismatch {
                earlier: earlier_key,
                later: later_key,
            });
        }
        Ok(Self::between_unchecked(earlier, later))
    }

    /// [`SnapshotDiffView::between`] for views known to share their settings.
    pub(crate) fn between_unchecked(earlier: &SnapshotView, later: &SnapshotView) -> Self {
        let key = later.settings().group_key();
        let diff = later
            .filtered_snapshot()
            .compare_to(&earlier.filtered_snapshot(), key);

        SnapshotDiffView::new(
            (earlier.iteration(), later.iteration()),
            diff,
            later.settings().rank_limit(),
            Arc::clone(later.source_lines()),
        )
    }

    pub fn iterations(&self) -> (usize, usize) {
        self.iterations
    }

    pub fn diff(&self) -> &[StatisticDiff] {
        &self.diff
    }

    pub fn entries(&self) -> Vec<StatisticDiffEntry> {
        self.diff
            .iter()
            .enumerate()
            .map(|(i, diff)| StatisticDiffEntry::new(i + 1, diff, &self.source_lines))
            .collect()
    }

    pub fn top_entries(&self) -> Vec<StatisticDiffEntry> {
        self.split_entries().0
    }

    pub fn remaining_entries(&self) -> Vec<StatisticDiffEntry> {
        self.split_entries().1
    }

    pub fn top_size_summary(&self) -> Option<SizeSummary> {
        summarize(&self.top_entries())
    }

    pub fn remaining_size_summary(&self) -> Option<SizeSummary> {
        summarize(&self.remaining_entries())
    }

    pub fn title(&self) -> String {
        format!(
            "Snapshot Comparison between #{} and #{}",
            self.iterations.0, self.iterations.1
        )
    }

    pub fn to_section(&self) -> Section {
        let (top, remaining) = self.split_entries();
        Section {
            kind: SectionKind::Comparison,
            title: self.title(),
            rank_limit: self.rank_limit,
            entries: top.iter().map(StatisticDiffEntry::to_node).collect(),
            top_total: summarize(&top),
            remaining_total: summarize(&remaining),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_section().to_string()
    }

    fn split_entries(&self) -> (Vec<StatisticDiffEntry>, Vec<StatisticDiffEntry>) {
        let mut top = self.entries();
        let remaining = top.split_off(self.rank_limit.min(top.len()));
        (top, remaining)
    }
}

fn summarize(entries: &[StatisticDiffEntry]) -> Option<SizeSummary> {
    SizeSummary::of(entries.iter().map(|e| e.size_delta_bytes))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{GroupKey, RunSettings, Snapshot, snapshot::tests::trace};

    fn view(iteration: usize, key: GroupKey, traces: Snapshot) -> SnapshotView {
        let settings = RunSettings::builder("workload")
            .target_file("src/a.rs")
            .source_root("/p")
            .group_key(key)
            .rank_limit(2)
            .build()
            .unwrap();
        SnapshotView::new(
            iteration,
            traces,
            Arc::new(settings),
            Arc::new(SourceLines::new()),
        )
    }

    fn before() -> Snapshot {
        Snapshot::new(vec![
            trace(1024, &[("/p/src/a.rs", 1)]),
            trace(4096, &[("/p/src/a.rs", 2)]),
            trace(100_000, &[("/p/src/other.rs", 1)]),
        ])
    }

    fn after() -> Snapshot {
        Snapshot::new(vec![
            trace(1024, &[("/p/src/a.rs", 1)]),
            trace(3072, &[("/p/src/a.rs", 3)]),
            trace(512, &[("/p/src/a.rs", 4)]),
        ])
    }

    #[test]
    fn growth_is_positive_and_ranked_by_magnitude() {
        let earlier = view(0, GroupKey::LineNumber, before());
        let later = view(1, GroupKey::LineNumber, after());
        let diff = SnapshotDiffView::between(&earlier, &later).unwrap();

        assert_eq!(diff.iterations(), (0, 1));
        let entries: Vec<_> = diff
            .entries()
            .into_iter()
            .map(|e| (e.rank, e.line_number, e.size_delta_bytes))
            .collect();
        assert_eq!(entries, vec![(1, 2, -4096), (2, 3, 3072), (3, 4, 512), (4, 1, 0)]);

        let top = diff.top_entries();
        assert!(
            top.windows(2)
                .all(|w| w[0].size_delta_bytes.abs() >= w[1].size_delta_bytes.abs())
        );
        assert_eq!(top.len() + diff.remaining_entries().len(), diff.entries().len());
        assert_eq!(diff.top_size_summary(), Some(SizeSummary { bytes: -1024 }));
        assert_eq!(diff.remaining_size_summary(), Some(SizeSummary { bytes: 512 }));
    }

    #[test]
    fn mismatched_group_keys_are_rejected() {
        let earlier = view(0, GroupKey::LineNumber, before());
        let later = view(1, GroupKey::Filename, after());
        let err = SnapshotDiffView::between(&earlier, &later).unwrap_err();
        assert!(matches!(
            err,
            Error::GroupKeyMismatch {
                earlier: GroupKey::LineNumber,
                later: GroupKey::Filename,
            }
        ));
    }

    #[test]
    fn empty_comparison_has_no_summaries() {
        let diff = SnapshotDiffView::new((1, 2), Vec::new(), 10, Arc::new(SourceLines::new()));
        assert!(diff.top_entries().is_empty());
        assert_eq!(diff.top_size_summary(), None);
        assert_eq!(diff.remaining_size_summary(), None);
    }

    #[test]
    fn renders_signed_deltas() {
        let earlier = view(1, GroupKey::Filename, before());
        let later = view(2, GroupKey::Filename, after());
        let diff = SnapshotDiffView::between(&earlier, &later).unwrap();

        assert_eq!(
            diff.to_text(),
            "\n## Snapshot Comparison between #1 and #2\n### Top 2 Memory Hogs:\n\
             \t#1: -0.5KiB -> /p/src/a.rs:0 (traces: 1)\n\
             \n### Summary:\n\
             \tTop Total Size: -0.5 KiB\n\
             \tRemaining Total Size: \n"
        );
    }
}
