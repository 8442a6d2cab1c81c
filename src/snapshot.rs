use std::collections::HashMap;

use serde::Serialize;

use crate::{
    GroupKey,
    filter::{self, FilterRule},
};

/// Filename used for frames that could not be resolved.
pub const UNKNOWN_FILE: &str = "<unknown>";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Frame {
    /// Source file of the call site
    pub filename: String,
    /// Line of the call site, 0 when unknown
    pub lineno: u32,
    /// Demangled function name, without the hash suffix
    pub function: Option<String>,
}

impl Frame {
    pub fn new(filename: impl Into<String>, lineno: u32) -> Self {
        Frame {
            filename: filename.into(),
            lineno,
            function: None,
        }
    }

    pub fn unknown() -> Self {
        Frame::new(UNKNOWN_FILE, 0)
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }
}

/// Call stack of an allocation, most recent frame first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traceback {
    pub frames: Vec<Frame>,
    /// Number of frames captured by the tracer, before allocation plumbing was stripped
    pub total_nframe: usize,
}

impl Traceback {
    pub fn new(frames: Vec<Frame>) -> Self {
        let total_nframe = frames.len();
        Traceback {
            frames,
            total_nframe,
        }
    }

    /// The frame that is reported for this traceback.
    pub fn top_frame(&self) -> Frame {
        self.frames.first().cloned().unwrap_or_else(Frame::unknown)
    }

    fn filename(&self) -> &str {
        self.frames
            .first()
            .map(|f| f.filename.as_str())
            .unwrap_or(UNKNOWN_FILE)
    }
}

/// A live allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trace {
    pub size: u64,
    pub traceback: Traceback,
}

/// Point in time capture of the live allocations seen by a tracer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub traces: Vec<Trace>,
    /// Allocator events that did not fit into the tracer's log
    pub dropped_events: usize,
}

/// Allocations sharing a group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistic {
    pub traceback: Traceback,
    pub size: u64,
    pub count: usize,
}

/// Difference of one group between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticDiff {
    pub traceback: Traceback,
    /// Size in the newer snapshot
    pub size: u64,
    pub size_diff: i64,
    pub count: usize,
    pub count_diff: i64,
}

impl Snapshot {
    pub fn new(traces: Vec<Trace>) -> Self {
        Snapshot {
            traces,
            dropped_events: 0,
        }
    }

    /// Keep the traces whose most recent frame passes the rules.
    pub fn filter(&self, rules: &[FilterRule]) -> Snapshot {
        let traces = self
            .traces
            .iter()
            .filter(|trace| filter::accepts(rules, trace.traceback.filename()))
            .cloned()
            .collect();

        Snapshot {
            traces,
            dropped_events: self.dropped_events,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.traces.iter().map(|t| t.size).sum()
    }

    /// Group the traces by `key`, biggest group first.
    ///
    /// Groups of equal size keep the order in which they were first seen.
    pub fn statistics(&self, key: GroupKey) -> Vec<Statistic> {
        let mut index: HashMap<Vec<Frame>, usize> = HashMap::new();
        let mut stats: Vec<Statistic> = Vec::new();

        for trace in &self.traces {
            let group = group_traceback(&trace.traceback, key);
            match index.get(&group.frames) {
                Some(&i) => {
                    stats[i].size += trace.size;
                    stats[i].count += 1;
                }
                None => {
                    index.insert(group.frames.clone(), stats.len());
                    stats.push(Statistic {
                        traceback: group,
                        size: trace.size,
                        count: 1,
                    });
                }
            }
        }

        stats.sort_by(|a, b| b.size.cmp(&a.size));
        stats
    }

    /// Compare `self` (the newer snapshot) against `old`, biggest absolute change first.
    ///
    /// Groups that only exist in `old` show up with a size of zero and a negative delta.
    pub fn compare_to(&self, old: &Snapshot, key: GroupKey) -> Vec<StatisticDiff> {
        let new_stats = self.statistics(key);
        let mut old_stats: HashMap<Vec<Frame>, Statistic> = HashMap::new();
        let mut old_order: Vec<Vec<Frame>> = Vec::new();
        for stat in old.statistics(key) {
            old_order.push(stat.traceback.frames.clone());
            old_stats.insert(stat.traceback.frames.clone(), stat);
        }

        let mut diffs: Vec<StatisticDiff> = new_stats
            .into_iter()
            .map(|stat| {
                let (old_size, old_count) = old_stats
                    .remove(&stat.traceback.frames)
                    .map(|old| (old.size, old.count))
                    .unwrap_or((0, 0));
                StatisticDiff {
                    size_diff: signed(stat.size) - signed(old_size),
                    count_diff: signed(stat.count as u64) - signed(old_count as u64),
                    traceback: stat.traceback,
                    size: stat.size,
                    count: stat.count,
                }
            })
            .collect();

        for frames in old_order {
            if let Some(old) = old_stats.remove(&frames) {
                diffs.push(StatisticDiff {
                    traceback: old.traceback,
                    size: 0,
                    size_diff: -signed(old.size),
                    count: 0,
                    count_diff: -signed(old.count as u64),
                });
            }
        }

        diffs.sort_by(|a, b| b.size_diff.unsigned_abs().cmp(&a.size_diff.unsigned_abs()));
        diffs
    }
}

fn group_traceback(traceback: &Traceback, key: GroupKey) -> Traceback {
    let frame = traceback.top_frame();
    let frames = match key {
        GroupKey::Filename => vec![Frame::new(frame.filename, 0)],
        GroupKey::LineNumber => vec![Frame::new(frame.filename, frame.lineno)],
        GroupKey::Traceback => return traceback.clone(),
    };
    Traceback {
        frames,
        total_nframe: traceback.total_nframe,
    }
}

fn signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
