use std::{convert::Infallible, fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    Error, Result, RunSettings, SnapshotDiffView, SnapshotView, SourceLines, Tracer,
    TracerSession,
    document::{Document, SettingsBlock},
};

/// The outcome of profiling a function: one snapshot before the first call and one after
/// every call, plus the comparisons between consecutive snapshots.
///
/// ```rust
/// use memhogs::{Frame, ProfileReport, RunSettings, Snapshot, Trace, Traceback, Tracer};
///
/// /// A tracer that always sees the same allocation.
/// struct Fixed;
///
/// impl Tracer for Fixed {
///     fn start(&self) -> memhogs::Result<()> {
///         Ok(())
///     }
///     fn stop(&self) {}
///     fn snapshot(&self) -> Snapshot {
///         Snapshot::new(vec![Trace {
///             size: 2048,
///             traceback: Traceback::new(vec![Frame::new("src/cache.rs", 42)]),
///         }])
///     }
/// }
///
/// let settings = RunSettings::builder("warm_cache")
///     .target_file("src/cache.rs")
///     .run_count(2)
///     .build()
///     .unwrap();
/// let report = ProfileReport::run(&Fixed, settings, || ()).unwrap();
///
/// assert_eq!(report.snapshot_views().len(), 3);
/// assert_eq!(report.comparisons().len(), 2);
/// assert!(report.to_text().contains("#1: 2KiB -> src/cache.rs:42"));
/// ```
#[derive(Debug, Clone)]
pub struct ProfileReport {
    settings: Arc<RunSettings>,
    snapshot_views: Vec<SnapshotView>,
}

impl ProfileReport {
    /// Profile `target`, calling it `settings.run_count()` times.
    ///
    /// The return value of every call is dropped before the next snapshot is taken. The
    /// tracer is stopped on every exit path, including a panic inside `target`.
    pub fn run<T, F, R>(tracer: &T, settings: RunSettings, mut target: F) -> Result<Self>
    where
        T: Tracer + ?Sized,
        F: FnMut() -> R,
    {
        Self::try_run(tracer, settings, || Ok::<R, Infallible>(target()))
    }

    /// [`ProfileReport::run`] for a fallible target. The first error ends the run and is
    /// returned as [`Error::Target`].
    pub fn try_run<T, F, R, E>(tracer: &T, settings: RunSettings, mut target: F) -> Result<Self>
    where
        T: Tracer + ?Sized,
        F: FnMut() -> std::result::Result<R, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let settings = Arc::new(settings);
        let source_lines = Arc::new(SourceLines::new());
        let run_count = settings.run_count();
        info!(
            target_label = settings.target_label(),
            run_count,
            group_key = %settings.group_key(),
            "profiling started"
        );

        // Allocated up front, so that growing it doesn't show up in the snapshots.
        let mut snapshots = Vec::with_capacity(run_count + 1);
        {
            let session = TracerSession::start(tracer)?;
            snapshots.push(session.snapshot());
            for _ in 1..=run_count {
                drop(target().map_err(|e| Error::Target(e.into()))?);
                snapshots.push(session.snapshot());
            }
        }

        let snapshot_views: Vec<SnapshotView> = snapshots
            .into_iter()
            .enumerate()
            .map(|(iteration, snapshot)| {
                debug!(
                    iteration,
                    traces = snapshot.traces.len(),
                    bytes = snapshot.total_size(),
                    "snapshot captured"
                );
                SnapshotView::new(
                    iteration,
                    snapshot,
                    Arc::clone(&settings),
                    Arc::clone(&source_lines),
                )
            })
            .collect();

        info!(snapshots = snapshot_views.len(), "profiling finished");
        Ok(ProfileReport {
            settings,
            snapshot_views,
        })
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn target_file_names(&self) -> &[String] {
        self.settings.target_file_names()
    }

    pub fn target_label(&self) -> &str {
        self.settings.target_label()
    }

    /// Snapshots in iteration order, starting with the one taken before the first call.
    pub fn snapshot_views(&self) -> &[SnapshotView] {
        &self.snapshot_views
    }

    /// Element `i` compares snapshot `i + 1` against snapshot `i`.
    pub fn comparisons(&self) -> Vec<SnapshotDiffView> {
        self.snapshot_views
            .windows(2)
            .map(|pair| SnapshotDiffView::between_unchecked(&pair[0], &pair[1]))
            .collect()
    }

    pub fn to_document(&self) -> Document {
        let exclusive = self.settings.exclusive_filter();
        Document {
            target_label: self.target_label().to_string(),
            settings: SettingsBlock {
                rank_limit: self.settings.rank_limit(),
                group_key: self.settings.group_key(),
                exclusive_filter: exclusive,
                file_filters: exclusive.then(|| self.target_file_names().to_vec()),
            },
            snapshots: self
                .snapshot_views
                .iter()
                .map(SnapshotView::to_section)
                .collect(),
            comparisons: self
                .comparisons()
                .iter()
                .map(SnapshotDiffView::to_section)
                .collect(),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_document().to_string()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{snapshot::tests::trace, tracer::tests::FakeTracer};

    fn settings(run_count: usize, rank_limit: usize) -> RunSettings {
        RunSettings::builder("grow")
            .target_file("src/grow.rs")
            .source_root("/p")
            .run_count(run_count)
            .rank_limit(rank_limit)
            .build()
            .unwrap()
    }

    #[test]
    fn captures_one_snapshot_per_call_plus_baseline() {
        for run_count in [0, 1, 3, 7] {
            let tracer = FakeTracer::default();
            let report = ProfileReport::run(&tracer, settings(run_count, 10), || {
                tracer.allocate(trace(1024, &[("/p/src/grow.rs", 3)]));
            })
            .unwrap();

            assert_eq!(report.snapshot_views().len(), run_count + 1);
            assert_eq!(report.comparisons().len(), run_count);
            let iterations: Vec<_> = report
                .snapshot_views()
                .iter()
                .map(|v| v.iteration())
                .collect();
            assert_eq!(iterations, (0..=run_count).collect::<Vec<_>>());
            assert_eq!(tracer.starts.get(), 1);
            assert_eq!(tracer.stops.get(), 1);
        }
    }

    #[test]
    fn comparisons_follow_growth() {
        let tracer = FakeTracer::default();
        let report = ProfileReport::run(&tracer, settings(2, 10), || {
            tracer.allocate(trace(2048, &[("/p/src/grow.rs", 3)]));
        })
        .unwrap();

        for (i, comparison) in report.comparisons().iter().enumerate() {
            assert_eq!(comparison.iterations(), (i, i + 1));
            assert_eq!(comparison.top_entries()[0].size_delta_bytes, 2048);
        }
        let last = &report.snapshot_views()[2];
        assert_eq!(last.top_entries()[0].size_bytes, 4096);
        assert_eq!(last.top_entries()[0].block_count, 2);
    }

    #[test]
    fn zero_runs_render_without_comparisons() {
        let tracer = FakeTracer::default();
        let mut calls = 0;
        let report = ProfileReport::run(&tracer, settings(0, 10), || calls += 1).unwrap();

        assert_eq!(calls, 0);
        assert_eq!(report.snapshot_views().len(), 1);
        assert!(report.comparisons().is_empty());
        assert!(!report.to_text().contains("Comparison"));
    }

    #[test]
    fn zero_rank_limit_reports_only_remaining() {
        let tracer = FakeTracer::default();
        let report = ProfileReport::run(&tracer, settings(2, 0), || {
            tracer.allocate(trace(512, &[("/p/src/grow.rs", 8)]));
        })
        .unwrap();

        for view in report.snapshot_views() {
            assert!(view.top_entries().is_empty());
            assert_eq!(view.top_size_summary(), None);
            assert_eq!(view.remaining_entries().len(), view.entries().len());
        }
        for comparison in report.comparisons() {
            assert!(comparison.top_entries().is_empty());
            assert_eq!(comparison.top_size_summary(), None);
        }
    }

    #[test]
    fn failing_target_stops_the_tracer() {
        let tracer = FakeTracer::default();
        let mut calls = 0;
        let result = ProfileReport::try_run(&tracer, settings(3, 10), || {
            calls += 1;
            if calls == 2 { Err("disk full") } else { Ok(()) }
        });

        match result {
            Err(Error::Target(source)) => assert_eq!(source.to_string(), "disk full"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls, 2);
        assert!(!tracer.started.get());
        assert_eq!(tracer.stops.get(), 1);
    }

    #[test]
    fn panicking_target_stops_the_tracer() {
        let tracer = FakeTracer::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ProfileReport::run(&tracer, settings(2, 10), || panic!("workload crashed"))
        }));
        assert!(result.is_err());
        assert!(!tracer.started.get());
    }

    #[test]
    fn running_tracer_is_not_shared() {
        let tracer = FakeTracer::default();
        tracer.start().unwrap();
        let err = ProfileReport::run(&tracer, settings(1, 10), || ()).unwrap_err();
        assert!(matches!(err, Error::TracerAlreadyStarted));
        assert!(tracer.started.get());
    }

    #[test]
    fn freed_allocations_show_up_as_shrinking() {
        let tracer = FakeTracer::default();
        tracer.start().unwrap();
        tracer.allocate(trace(4096, &[("/p/src/grow.rs", 1)]));
        tracer.stop();

        let mut first = true;
        let report = ProfileReport::run(&tracer, settings(2, 10), || {
            if first {
                tracer.free_all();
                first = false;
            }
        })
        .unwrap();

        let comparisons = report.comparisons();
        assert_eq!(comparisons[0].top_entries()[0].size_delta_bytes, -4096);
        assert_eq!(comparisons[1].top_entries().len(), 0);
        assert_eq!(report.snapshot_views()[1].top_size_summary(), None);
    }

    #[test]
    fn renders_the_whole_report() {
        let tracer = FakeTracer::default();
        let report = ProfileReport::run(&tracer, settings(1, 10), || {
            tracer.allocate(trace(1024, &[("/p/src/grow.rs", 3)]));
        })
        .unwrap();

        assert_eq!(
            report.to_text(),
            "# Profile Run For grow\n\
             ```\n\
             SETTINGS\n\
             \n\
             - Memory Limit: 10\n\
             - Key Type: LINE_NUMBER\n\
             - Exclusive Filter Set: true\n\
             - File Filters Applied: [\"src/grow.rs\"]\n\
             ```\n\
             \n## Snapshot Before Run\n### Top 10 Memory Hogs:\n\
             \n### Summary:\n\
             \tTop Total Size: \n\
             \tRemaining Total Size: \n\
             \n## Snapshot Run #1\n### Top 10 Memory Hogs:\n\
             \t#1: 1KiB -> /p/src/grow.rs:3 (traces: 1)\n\
             \n### Summary:\n\
             \tTop Total Size: 1 KiB\n\
             \tRemaining Total Size: \n\
             \n# Profile Comparisons For grow\n\
             \n## Snapshot Comparison between #0 and #1\n### Top 10 Memory Hogs:\n\
             \t#1: +1KiB -> /p/src/grow.rs:3 (traces: 1)\n\
             \n### Summary:\n\
             \tTop Total Size: 1 KiB\n\
             \tRemaining Total Size: \n"
        );
        assert_eq!(report.to_text(), report.to_text());
        assert_eq!(report.to_string(), report.to_text());
    }

    #[test]
    fn inclusive_reports_skip_the_allow_list() {
        let tracer = FakeTracer::default();
        let settings = RunSettings::builder("grow")
            .exclusive_filter(false)
            .run_count(1)
            .build()
            .unwrap();
        let report = ProfileReport::run(&tracer, settings, || {
            tracer.allocate(trace(64, &[("/anywhere/lib.rs", 9)]));
            tracer.allocate(trace(64, &[]));
        })
        .unwrap();

        let text = report.to_text();
        assert!(!text.contains("File Filters Applied"));
        assert!(text.contains("/anywhere/lib.rs:9"));
        assert!(!text.contains("<unknown>"));
    }

    #[test]
    fn json_output_mirrors_the_text_sections() {
        let tracer = FakeTracer::default();
        let report = ProfileReport::run(&tracer, settings(2, 10), || {
            tracer.allocate(trace(1024, &[("/p/src/grow.rs", 3)]));
        })
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["target_label"], "grow");
        assert_eq!(json["snapshots"].as_array().unwrap().len(), 3);
        assert_eq!(json["comparisons"].as_array().unwrap().len(), 2);
        assert_eq!(json["comparisons"][1]["kind"], "comparison");
        assert_eq!(json["comparisons"][1]["entries"][0]["size"]["delta"], 1024);
        assert_eq!(json["settings"]["file_filters"][0], "src/grow.rs");
    }
}
