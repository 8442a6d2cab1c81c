use crate::{Result, Snapshot};

/// A source of allocation snapshots with a start/stop lifecycle.
///
/// Tracers are usually process wide. Calling [`Tracer::start`] on a running tracer fails with
/// [`crate::Error::TracerAlreadyStarted`]; stopping a stopped tracer is a caller error.
pub trait Tracer {
    /// Start recording allocations.
    fn start(&self) -> Result<()>;

    /// Stop recording allocations.
    fn stop(&self);

    /// Capture the allocations that are currently live.
    fn snapshot(&self) -> Snapshot;
}

/// A started tracer. The tracer is stopped when the session is dropped,
/// including while unwinding out of a panicking workload.
#[must_use = "the tracer stops as soon as the session is dropped"]
pub struct TracerSession<'t, T: Tracer + ?Sized> {
    tracer: &'t T,
}

impl<'t, T: Tracer + ?Sized> TracerSession<'t, T> {
    pub fn start(tracer: &'t T) -> Result<Self> {
        tracer.start()?;
        Ok(Self { tracer })
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tracer.snapshot()
    }
}

impl<T: Tracer + ?Sized> Drop for TracerSession<'_, T> {
    fn drop(&mut self) {
        self.tracer.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::{Error, Trace};

    /// Replays scripted snapshots and records its lifecycle.
    #[derive(Default)]
    pub(crate) struct FakeTracer {
        pub(crate) started: Cell<bool>,
        pub(crate) starts: Cell<usize>,
        pub(crate) stops: Cell<usize>,
        pub(crate) live: RefCell<Vec<Trace>>,
    }

    impl FakeTracer {
        pub(crate) fn allocate(&self, trace: Trace) {
            self.live.borrow_mut().push(trace);
        }

        pub(crate) fn free_all(&self) {
            self.live.borrow_mut().clear();
        }
    }

    impl Tracer for FakeTracer {
        fn start(&self) -> Result<()> {
            if self.started.replace(true) {
                return Err(Error::TracerAlreadyStarted);
            }
            self.starts.set(self.starts.get() + 1);
            Ok(())
        }

        fn stop(&self) {
            self.started.set(false);
            self.stops.set(self.stops.get() + 1);
        }

        fn snapshot(&self) -> Snapshot {
            assert!(self.started.get(), "snapshot taken while stopped");
            Snapshot::new(self.live.borrow().clone())
        }
    }

    #[test]
    fn session_stops_tracer_on_drop() {
        let tracer = FakeTracer::default();
        {
            let session = TracerSession::start(&tracer).unwrap();
            assert!(tracer.started.get());
            assert!(session.snapshot().traces.is_empty());
        }
        assert!(!tracer.started.get());
        assert_eq!(tracer.stops.get(), 1);
    }

    #[test]
    fn second_session_is_rejected() {
        let tracer = FakeTracer::default();
        let _session = TracerSession::start(&tracer).unwrap();
        assert!(matches!(
            TracerSession::start(&tracer),
            Err(Error::TracerAlreadyStarted)
        ));
    }

    #[test]
    fn session_stops_tracer_on_panic() {
        let tracer = FakeTracer::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _session = TracerSession::start(&tracer).unwrap();
            panic!("workload failed");
        }));
        assert!(result.is_err());
        assert!(!tracer.started.get());
    }
}
