//! Replay Manager
//!
//! Owns a [`StreamAligner`] and a per-stream registry of consumers. Drives
//! playback either eagerly (drain as fast as possible) or in real time, paced
//! against a wall-clock reference, and fans each delivered sample out to every
//! consumer registered for its source stream.
//!
//! # Delivery Contract
//!
//! At-most-once per sample: the aligner's cursor advances before dispatch and
//! is not rolled back if a consumer fails, so a retried tick never re-delivers
//! or corrupts alignment; at worst the failing consumer misses that sample.
//!
//! # Scheduling
//!
//! Single-threaded cooperative. Real-time mode is driven by an external
//! scheduler calling [`tick`](ReplayManager::tick); a tick dispatches every
//! sample whose logical time falls at or before the deadline derived from the
//! wall-clock reference and replay speed, then undoes the single over-read
//! with `step_back`. The pacing sleep inside a tick is the only suspension
//! point in the whole core.

use crate::logfile::Sample;
use crate::replay::aligner::{SeekTarget, StreamAligner};
use crate::replay::source::SampleSource;
use crate::replay::time::{Nanos, TimeInterval};
use crate::replay::ReplayError;
use crate::stream::typereg::TypeDescriptor;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Below this distance to a sample's target delivery time the manager
/// dispatches immediately instead of sleeping; short sleeps oversleep more
/// than they pace. Tuning knob, not a correctness contract.
pub const MIN_SLEEP: Duration = Duration::from_millis(1);

// =============================================================================
// CONSUMER CONTRACT
// =============================================================================

/// Identity of a stream as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub typ: TypeDescriptor,
}

/// A sample consumer. Registered against one or more streams; receives every
/// delivered sample of those streams in global logical-time order.
pub trait SampleSink {
    fn process_sample(&mut self, stream: &StreamDescriptor, time: Nanos, sample: &Sample);
}

/// Shared consumer handle. Identity (for deregistration) is pointer identity.
pub type SharedSink = Rc<RefCell<dyn SampleSink>>;

struct ManagedStream {
    descriptor: StreamDescriptor,
    sinks: Vec<SharedSink>,
}

// =============================================================================
// REPLAY MANAGER
// =============================================================================

pub struct ReplayManager {
    aligner: StreamAligner,
    /// Parallel to the aligner's streams; both sides insert and remove in the
    /// same order, keeping indices aligned.
    managed: Vec<ManagedStream>,
    running: bool,
    speed: f64,
    /// `(wall, logical)` pacing anchor, re-established on start, seek, and
    /// registration changes.
    reference: Option<(Instant, Nanos)>,
    current_time: Option<Nanos>,
}

impl ReplayManager {
    pub fn new() -> Self {
        Self {
            aligner: StreamAligner::new(),
            managed: Vec::new(),
            running: false,
            speed: 1.0,
            reference: None,
            current_time: None,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a consumer for a set of streams. Streams already managed are
    /// shared (deduplicated by name); genuinely new streams are added to the
    /// aligner without disturbing the current playback position.
    pub fn register(
        &mut self,
        sink: SharedSink,
        sources: Vec<Box<dyn SampleSource>>,
    ) -> Result<(), ReplayError> {
        let mut fresh: Vec<Box<dyn SampleSource>> = Vec::new();
        for source in sources {
            if let Some(managed) = self
                .managed
                .iter_mut()
                .find(|m| m.descriptor.name == source.name())
            {
                if !managed.sinks.iter().any(|s| Rc::ptr_eq(s, &sink)) {
                    managed.sinks.push(sink.clone());
                }
            } else {
                self.managed.push(ManagedStream {
                    descriptor: StreamDescriptor {
                        name: source.name().to_string(),
                        typ: source.type_descriptor().clone(),
                    },
                    sinks: vec![sink.clone()],
                });
                fresh.push(source);
            }
        }

        if !fresh.is_empty() {
            let repositioned = self.aligner.add_streams(fresh)?;
            debug!(
                streams = self.managed.len(),
                repositioned, "streams registered"
            );
            self.reanchor();
        }
        Ok(())
    }

    /// Deregister a consumer from a set of streams (by name). A stream whose
    /// dispatch list becomes empty is removed from the aligner entirely.
    pub fn deregister(&mut self, sink: &SharedSink, names: &[&str]) {
        let mut orphaned: Vec<String> = Vec::new();
        for managed in &mut self.managed {
            if names.contains(&managed.descriptor.name.as_str()) {
                managed.sinks.retain(|s| !Rc::ptr_eq(s, sink));
                if managed.sinks.is_empty() {
                    orphaned.push(managed.descriptor.name.clone());
                }
            }
        }

        if !orphaned.is_empty() {
            let orphaned_refs: Vec<&str> = orphaned.iter().map(String::as_str).collect();
            self.aligner.remove_streams(&orphaned_refs);
            self.managed
                .retain(|m| !orphaned_refs.contains(&m.descriptor.name.as_str()));
            debug!(removed = orphaned.len(), "orphaned streams removed");
            self.reanchor();
        }
    }

    // -------------------------------------------------------------------------
    // Eager playback
    // -------------------------------------------------------------------------

    /// Deliver the globally next sample to its stream's consumers. A no-op
    /// returning `None` when no streams are registered or all are exhausted.
    pub fn step(&mut self) -> Result<Option<(usize, Nanos)>, ReplayError> {
        if self.aligner.is_empty() {
            return Ok(None);
        }
        match self.aligner.step()? {
            Some((idx, time)) => {
                self.dispatch_current(idx, time)?;
                Ok(Some((idx, time)))
            }
            None => Ok(None),
        }
    }

    /// Drain every remaining sample as fast as possible. Returns the number
    /// of samples dispatched.
    pub fn play_all(&mut self) -> Result<u64, ReplayError> {
        let mut dispatched = 0;
        while self.step()?.is_some() {
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Seek the aligner, then immediately dispatch the landed-on sample so
    /// consumers observe the state at the sought time, not only future
    /// samples.
    pub fn seek(
        &mut self,
        target: SeekTarget,
        exact: bool,
    ) -> Result<Option<(usize, Nanos)>, ReplayError> {
        let landed = self.aligner.seek(target, exact)?;
        if let Some((idx, time)) = landed {
            self.dispatch_current(idx, time)?;
        }
        self.reanchor();
        Ok(landed)
    }

    // -------------------------------------------------------------------------
    // Real-time playback
    // -------------------------------------------------------------------------

    /// Enter real-time mode at the given replay-speed multiplier (1.0 =
    /// recorded rate). Fails with `StateMismatch` when already running.
    pub fn start(&mut self, speed: f64) -> Result<(), ReplayError> {
        if self.running {
            return Err(ReplayError::StateMismatch {
                operation: "start",
                running: true,
            });
        }
        self.running = true;
        self.speed = speed;
        self.reference = self.make_reference();
        info!(speed, "real-time playback started");
        Ok(())
    }

    /// Leave real-time mode. Immediate: a tick either completed fully or was
    /// never started. Fails with `StateMismatch` when not running.
    pub fn stop(&mut self) -> Result<(), ReplayError> {
        if !self.running {
            return Err(ReplayError::StateMismatch {
                operation: "stop",
                running: false,
            });
        }
        self.running = false;
        self.reference = None;
        info!("real-time playback stopped");
        Ok(())
    }

    /// One scheduling opportunity: dispatch every sample whose logical time
    /// is at or before the deadline corresponding to "now", undoing the
    /// single over-read. Returns the number of samples dispatched. A no-op
    /// when not running or without streams.
    pub fn tick(&mut self) -> Result<u64, ReplayError> {
        if !self.running || self.aligner.is_empty() {
            return Ok(0);
        }
        if self.reference.is_none() {
            // Streams may have been registered after start().
            self.reference = self.make_reference();
        }
        let Some((ref_wall, ref_logical)) = self.reference else {
            return Ok(0);
        };

        let deadline =
            ref_logical + (ref_wall.elapsed().as_nanos() as f64 * self.speed) as Nanos;

        let mut dispatched = 0;
        loop {
            let Some((idx, time)) = self.aligner.step()? else {
                break;
            };
            if time > deadline {
                self.aligner.step_back();
                break;
            }

            // Pace this sample against its target wall-clock delivery time.
            let offset = (time - ref_logical).max(0) as f64 / self.speed;
            let target = ref_wall + Duration::from_nanos(offset as u64);
            let now = Instant::now();
            if target > now + MIN_SLEEP {
                std::thread::sleep(target - now);
            }

            self.dispatch_current(idx, time)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Logical time of the most recently dispatched sample.
    #[inline]
    pub fn current_time(&self) -> Option<Nanos> {
        self.current_time
    }

    /// Union of the registered streams' logical-time intervals; `None`
    /// without streams.
    pub fn interval_logicaltime(&self) -> Option<TimeInterval> {
        self.aligner.interval_logicaltime()
    }

    #[inline]
    pub fn stream_count(&self) -> usize {
        self.aligner.stream_count()
    }

    pub fn aligner(&self) -> &StreamAligner {
        &self.aligner
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn dispatch_current(&mut self, idx: usize, time: Nanos) -> Result<(), ReplayError> {
        // Cursor already advanced: at-most-once regardless of sink behavior.
        let Some(sample) = self.aligner.current_sample()? else {
            return Ok(());
        };
        self.current_time = Some(time);

        let descriptor = self.managed[idx].descriptor.clone();
        let sinks = self.managed[idx].sinks.clone();
        for sink in sinks {
            sink.borrow_mut().process_sample(&descriptor, time, &sample);
        }
        Ok(())
    }

    fn make_reference(&self) -> Option<(Instant, Nanos)> {
        let logical = self
            .current_time
            .or_else(|| self.interval_logicaltime().map(|i| i.start))?;
        Some((Instant::now(), logical))
    }

    fn reanchor(&mut self) {
        if self.running {
            self.reference = self.make_reference();
        }
    }
}

impl Default for ReplayManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::source::VecSource;
    use crate::replay::time::NANOS_PER_MILLI;

    struct Collector {
        seen: Vec<(String, Nanos, Vec<u8>)>,
        wall: Vec<Instant>,
    }

    impl Collector {
        fn shared() -> Rc<RefCell<Collector>> {
            Rc::new(RefCell::new(Collector {
                seen: Vec::new(),
                wall: Vec::new(),
            }))
        }
    }

    impl SampleSink for Collector {
        fn process_sample(&mut self, stream: &StreamDescriptor, time: Nanos, sample: &Sample) {
            self.seen
                .push((stream.name.clone(), time, sample.data.clone()));
            self.wall.push(Instant::now());
        }
    }

    fn source(name: &str, times: &[Nanos]) -> Box<dyn SampleSource> {
        Box::new(VecSource::from_pairs(
            name,
            times.iter().map(|&t| (t, vec![t as u8])).collect(),
        ))
    }

    fn as_sink(collector: &Rc<RefCell<Collector>>) -> SharedSink {
        collector.clone() as SharedSink
    }

    #[test]
    fn test_step_dispatches_in_global_order() {
        let collector = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(as_sink(&collector), vec![source("a", &[0, 2]), source("b", &[1])])
            .unwrap();

        assert_eq!(manager.play_all().unwrap(), 3);
        let seen = &collector.borrow().seen;
        assert_eq!(seen[0].0, "a");
        assert_eq!(seen[1].0, "b");
        assert_eq!(seen[2].0, "a");
        assert_eq!(
            seen.iter().map(|(_, t, _)| *t).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_fan_out_only_to_registered_consumers() {
        let only_a = Collector::shared();
        let only_b = Collector::shared();
        let both = Collector::shared();

        let mut manager = ReplayManager::new();
        manager
            .register(as_sink(&only_a), vec![source("a", &[0])])
            .unwrap();
        manager
            .register(as_sink(&only_b), vec![source("b", &[1])])
            .unwrap();
        manager
            .register(as_sink(&both), vec![source("a", &[0]), source("b", &[1])])
            .unwrap();

        // "a" and "b" were deduplicated: two aligner streams, not four
        assert_eq!(manager.stream_count(), 2);

        manager.play_all().unwrap();
        assert_eq!(only_a.borrow().seen.len(), 1);
        assert_eq!(only_b.borrow().seen.len(), 1);
        assert_eq!(both.borrow().seen.len(), 2);
        assert_eq!(only_a.borrow().seen[0].0, "a");
        assert_eq!(only_b.borrow().seen[0].0, "b");
    }

    #[test]
    fn test_register_preserves_position() {
        let collector = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(as_sink(&collector), vec![source("a", &[0, 10])])
            .unwrap();

        manager.step().unwrap();
        assert_eq!(manager.current_time(), Some(0));

        // Late registration of a stream with earlier samples must not rewind
        // the delivered sequence
        manager
            .register(as_sink(&collector), vec![source("late", &[-5, 5])])
            .unwrap();
        manager.play_all().unwrap();

        let times: Vec<Nanos> = collector.borrow().seen.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(times, vec![0, 5, 10]);
    }

    #[test]
    fn test_deregister_symmetry() {
        let collector = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(as_sink(&collector), vec![source("a", &[0]), source("b", &[1])])
            .unwrap();
        assert_eq!(manager.stream_count(), 2);
        assert!(manager.interval_logicaltime().is_some());

        manager.deregister(&as_sink(&collector), &["a", "b"]);
        assert_eq!(manager.stream_count(), 0);
        assert_eq!(manager.interval_logicaltime(), None);
        assert_eq!(manager.step().unwrap(), None);
    }

    #[test]
    fn test_deregister_keeps_stream_with_remaining_sinks() {
        let first = Collector::shared();
        let second = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(as_sink(&first), vec![source("a", &[0])])
            .unwrap();
        manager
            .register(as_sink(&second), vec![source("a", &[0])])
            .unwrap();

        manager.deregister(&as_sink(&first), &["a"]);
        assert_eq!(manager.stream_count(), 1);

        manager.play_all().unwrap();
        assert!(first.borrow().seen.is_empty());
        assert_eq!(second.borrow().seen.len(), 1);
    }

    #[test]
    fn test_seek_dispatches_landed_sample() {
        let collector = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(as_sink(&collector), vec![source("a", &[0, 10, 20])])
            .unwrap();

        let landed = manager.seek(SeekTarget::Time(10), false).unwrap();
        assert_eq!(landed, Some((0, 10)));
        assert_eq!(collector.borrow().seen.len(), 1);
        assert_eq!(collector.borrow().seen[0].1, 10);

        // Following step delivers the next sample, not the landed one again
        manager.step().unwrap();
        assert_eq!(collector.borrow().seen[1].1, 20);
    }

    #[test]
    fn test_start_stop_state_mismatch() {
        let mut manager = ReplayManager::new();
        assert!(matches!(
            manager.stop(),
            Err(ReplayError::StateMismatch { operation: "stop", .. })
        ));
        manager.start(1.0).unwrap();
        assert!(matches!(
            manager.start(1.0),
            Err(ReplayError::StateMismatch { operation: "start", .. })
        ));
        manager.stop().unwrap();
        manager.start(2.0).unwrap();
        assert_eq!(manager.speed(), 2.0);
    }

    #[test]
    fn test_tick_without_streams_is_noop() {
        let mut manager = ReplayManager::new();
        manager.start(1.0).unwrap();
        assert_eq!(manager.tick().unwrap(), 0);
    }

    fn run_paced(speed: f64, gap_ms: i64) -> Duration {
        let collector = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(
                as_sink(&collector),
                vec![source("a", &[0, gap_ms * NANOS_PER_MILLI])],
            )
            .unwrap();
        manager.start(speed).unwrap();

        while collector.borrow().seen.len() < 2 {
            manager.tick().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        manager.stop().unwrap();

        let wall = &collector.borrow().wall;
        wall[1] - wall[0]
    }

    #[test]
    fn test_realtime_pacing_at_recorded_speed() {
        // 100ms of logical time at speed 1.0 takes ~100ms of wall time
        let delta = run_paced(1.0, 100);
        assert!(delta >= Duration::from_millis(80), "dispatched too early: {:?}", delta);
    }

    #[test]
    fn test_realtime_pacing_at_double_speed() {
        // 100ms of logical time at speed 2.0 takes ~50ms of wall time
        let delta = run_paced(2.0, 100);
        assert!(delta >= Duration::from_millis(30), "dispatched too early: {:?}", delta);
        assert!(delta < Duration::from_millis(95), "dispatched too late: {:?}", delta);
    }

    #[test]
    fn test_tick_does_not_overrun_deadline() {
        let collector = Collector::shared();
        let mut manager = ReplayManager::new();
        manager
            .register(
                as_sink(&collector),
                vec![source("a", &[0, 500 * NANOS_PER_MILLI])],
            )
            .unwrap();
        manager.start(1.0).unwrap();

        // The first tick is early: only the t=0 sample is due; the over-read
        // of the far-future sample is undone.
        let dispatched = manager.tick().unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(collector.borrow().seen.len(), 1);

        // An immediate second tick dispatches nothing new
        assert_eq!(manager.tick().unwrap(), 0);
    }
}
