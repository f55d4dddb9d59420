//! Stream Aligner
//!
//! Deterministic k-way merge over N independently sampled streams. Each call
//! to [`step`](StreamAligner::step) selects, among all streams' next unread
//! samples, the one with the globally smallest logical time and advances that
//! stream's cursor.
//!
//! # Ordering Contract
//!
//! - Primary: logical time (earlier first).
//! - Tie-break: ascending stream index (insertion order). Ties are never left
//!   ambiguous, so replay order is reproducible for the same stream set and
//!   insertion order.
//! - Precondition: each stream's logical times are non-decreasing in sample
//!   order. Violations produce undefined merge order; the hot path does not
//!   guard them.
//!
//! # Structural Changes
//!
//! Streams can be added and removed mid-sequence. The correctness invariant
//! is: after any structural change, the next `step()` never returns a logical
//! time strictly smaller than the largest time already returned, and
//! unaffected streams neither skip nor repeat samples. Newly added streams
//! therefore fast-forward past samples earlier than the current position;
//! removed streams simply drop out, with surviving cursors untouched.

use crate::logfile::Sample;
use crate::replay::source::SampleSource;
use crate::replay::time::{Nanos, TimeInterval};
use crate::replay::ReplayError;
use crate::stream::lazy::StreamError;
use crate::stream::typereg::TypeDescriptor;
use tracing::debug;

// =============================================================================
// STATE
// =============================================================================

/// Global cursor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignerState {
    /// No sample returned yet.
    NotStarted,
    /// The most recent `step()` returned sample `sample` of stream `stream`.
    Positioned { stream: usize, sample: u64 },
    /// The most recent `step()` found every stream exhausted. Not a latch:
    /// adding streams can make a later `step()` produce samples again.
    Eof,
}

/// Seek destination: a logical time or an absolute global sequence index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Time(Nanos),
    Index(u64),
}

struct AlignedStream {
    source: Box<dyn SampleSource>,
    /// Next unread sample.
    cursor: u64,
}

/// Snapshot taken before each step, enabling a one-deep [`step_back`].
#[derive(Debug, Clone, Copy)]
struct StepSnapshot {
    state: AlignerState,
    last_time: Option<Nanos>,
    sample_index: u64,
}

// =============================================================================
// ALIGNER
// =============================================================================

pub struct StreamAligner {
    streams: Vec<AlignedStream>,
    state: AlignerState,
    /// Largest logical time already returned; the structural-change invariant
    /// anchor. Survives stream removal even when the position itself is lost.
    last_time: Option<Nanos>,
    /// Number of samples returned since the start (global sequence position).
    sample_index: u64,
    prev: Option<StepSnapshot>,
}

impl StreamAligner {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            state: AlignerState::NotStarted,
            last_time: None,
            sample_index: 0,
            prev: None,
        }
    }

    pub fn with_streams(sources: Vec<Box<dyn SampleSource>>) -> Result<Self, StreamError> {
        let mut aligner = Self::new();
        aligner.add_streams(sources)?;
        Ok(aligner)
    }

    // -------------------------------------------------------------------------
    // Structural changes
    // -------------------------------------------------------------------------

    /// Insert streams. Returns whether the insertion happened mid-sequence,
    /// i.e. whether the aligner had to reposition the new streams relative to
    /// the samples already delivered (always, unless at not-started or eof).
    pub fn add_streams(
        &mut self,
        sources: Vec<Box<dyn SampleSource>>,
    ) -> Result<bool, StreamError> {
        let repositioned =
            self.last_time.is_some() && !matches!(self.state, AlignerState::Eof);

        for source in sources {
            let mut aligned = AlignedStream { source, cursor: 0 };
            if let Some(t) = self.last_time {
                // Samples earlier than what was already delivered can no
                // longer be merged in order; skip them.
                aligned.cursor = aligned.source.first_index_at_or_after(t)?;
            }
            debug!(
                stream = aligned.source.name(),
                cursor = aligned.cursor,
                "stream added to aligner"
            );
            self.streams.push(aligned);
        }

        // A structural change invalidates the one-deep undo history.
        self.prev = None;
        Ok(repositioned)
    }

    /// Remove streams by name. Returns whether the removed set held the
    /// current position (in which case the aligner becomes positionless but
    /// keeps its time anchor, and the next `step()` resumes correctly).
    pub fn remove_streams(&mut self, names: &[&str]) -> bool {
        let remove: Vec<bool> = self
            .streams
            .iter()
            .map(|s| names.contains(&s.source.name()))
            .collect();
        if !remove.iter().any(|r| *r) {
            return false;
        }

        let mut removed_current = false;
        let mut new_index = vec![usize::MAX; self.streams.len()];
        let mut kept = Vec::with_capacity(self.streams.len());
        for (old_idx, stream) in self.streams.drain(..).enumerate() {
            if remove[old_idx] {
                debug!(stream = stream.source.name(), "stream removed from aligner");
            } else {
                new_index[old_idx] = kept.len();
                kept.push(stream);
            }
        }
        self.streams = kept;

        self.state = match self.state {
            AlignerState::Positioned { stream, sample } => {
                if remove[stream] {
                    removed_current = true;
                    // Positionless mid-sequence: last_time keeps ordering
                    // intact for the next step().
                    AlignerState::NotStarted
                } else {
                    AlignerState::Positioned {
                        stream: new_index[stream],
                        sample,
                    }
                }
            }
            other => other,
        };

        self.prev = None;
        removed_current
    }

    // -------------------------------------------------------------------------
    // Stepping
    // -------------------------------------------------------------------------

    /// Advance to the globally next sample. Returns its `(stream index,
    /// logical time)`, or `None` when every active stream is exhausted.
    pub fn step(&mut self) -> Result<Option<(usize, Nanos)>, StreamError> {
        let snapshot = StepSnapshot {
            state: self.state,
            last_time: self.last_time,
            sample_index: self.sample_index,
        };

        // Linear min-scan; strict `<` keeps the lowest stream index on ties.
        let mut best: Option<(usize, Nanos)> = None;
        for (idx, stream) in self.streams.iter_mut().enumerate() {
            if let Some(t) = stream.source.logical_time_at(stream.cursor)? {
                if best.map_or(true, |(_, best_t)| t < best_t) {
                    best = Some((idx, t));
                }
            }
        }

        self.prev = Some(snapshot);
        match best {
            Some((idx, t)) => {
                self.streams[idx].cursor += 1;
                self.state = AlignerState::Positioned {
                    stream: idx,
                    sample: self.streams[idx].cursor - 1,
                };
                self.last_time = Some(t);
                self.sample_index += 1;
                Ok(Some((idx, t)))
            }
            None => {
                self.state = AlignerState::Eof;
                Ok(None)
            }
        }
    }

    /// Un-advance the most recent `step()`, returning to the prior position
    /// (`None` when that position is before the start). Calling it twice
    /// without an intervening `step()`, or after a structural change, is a
    /// caller error and leaves the aligner untouched.
    pub fn step_back(&mut self) -> Option<(usize, Nanos)> {
        let Some(snapshot) = self.prev.take() else {
            debug_assert!(false, "step_back without a preceding step");
            return None;
        };

        // The undone step advanced exactly one cursor iff it returned a sample.
        if let AlignerState::Positioned { stream, .. } = self.state {
            if self.sample_index == snapshot.sample_index + 1 {
                self.streams[stream].cursor -= 1;
            }
        }

        self.state = snapshot.state;
        self.last_time = snapshot.last_time;
        self.sample_index = snapshot.sample_index;

        match self.state {
            AlignerState::Positioned { stream, .. } => self.last_time.map(|t| (stream, t)),
            _ => None,
        }
    }

    /// Reposition to the first sample at or after a logical time, or to an
    /// absolute sequence index, by rewinding (when needed) and repeated
    /// stepping. On success the aligner is positioned *at* the landed sample:
    /// the next `step()` returns the following one.
    ///
    /// With `exact`, a time seek requires a sample at exactly the requested
    /// time. Seeking past the end returns `None` (aligner at eof).
    pub fn seek(
        &mut self,
        target: SeekTarget,
        exact: bool,
    ) -> Result<Option<(usize, Nanos)>, ReplayError> {
        let needs_rewind = match target {
            SeekTarget::Time(t) => self.last_time.map_or(false, |last| t <= last),
            SeekTarget::Index(n) => n + 1 <= self.sample_index,
        };
        if needs_rewind {
            self.rewind();
        }

        match target {
            SeekTarget::Time(t) => loop {
                match self.step().map_err(ReplayError::Stream)? {
                    Some((idx, landed)) if landed >= t => {
                        if exact && landed != t {
                            return Err(ReplayError::NoExactMatch {
                                target: t,
                                landed: Some(landed),
                            });
                        }
                        return Ok(Some((idx, landed)));
                    }
                    Some(_) => continue,
                    None => {
                        if exact {
                            return Err(ReplayError::NoExactMatch {
                                target: t,
                                landed: None,
                            });
                        }
                        return Ok(None);
                    }
                }
            },
            SeekTarget::Index(n) => {
                let mut landed = None;
                while self.sample_index < n + 1 {
                    match self.step().map_err(ReplayError::Stream)? {
                        Some(hit) => landed = Some(hit),
                        None => return Ok(None),
                    }
                }
                Ok(landed)
            }
        }
    }

    /// Rewind to the very beginning: all cursors to zero, no position, no
    /// time anchor.
    pub fn rewind(&mut self) {
        for stream in &mut self.streams {
            stream.cursor = 0;
        }
        self.state = AlignerState::NotStarted;
        self.last_time = None;
        self.sample_index = 0;
        self.prev = None;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    #[inline]
    pub fn state(&self) -> AlignerState {
        self.state
    }

    /// Largest logical time already returned.
    #[inline]
    pub fn last_time(&self) -> Option<Nanos> {
        self.last_time
    }

    /// Number of samples returned since the start.
    #[inline]
    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    #[inline]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_name(&self, idx: usize) -> &str {
        self.streams[idx].source.name()
    }

    pub fn stream_type(&self, idx: usize) -> &TypeDescriptor {
        self.streams[idx].source.type_descriptor()
    }

    pub fn contains_stream(&self, name: &str) -> bool {
        self.streams.iter().any(|s| s.source.name() == name)
    }

    /// Fetch the payload of the sample the aligner is currently positioned
    /// at (the one most recently returned by `step()`/`seek()`).
    pub fn current_sample(&mut self) -> Result<Option<Sample>, StreamError> {
        match self.state {
            AlignerState::Positioned { stream, sample } => {
                self.streams[stream].source.sample_at(sample)
            }
            _ => Ok(None),
        }
    }

    /// Union of all active streams' logical-time intervals; `None` without
    /// streams (or with only empty ones).
    pub fn interval_logicaltime(&self) -> Option<TimeInterval> {
        self.streams
            .iter()
            .filter_map(|s| s.source.interval_logicaltime())
            .reduce(|a, b| a.union(&b))
    }

    /// Total sample count across all active streams.
    pub fn size(&mut self) -> Result<u64, StreamError> {
        let mut total = 0;
        for stream in &mut self.streams {
            total += stream.source.sample_count()?;
        }
        Ok(total)
    }
}

impl Default for StreamAligner {
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

    fn source(name: &str, times: &[Nanos]) -> Box<dyn SampleSource> {
        Box::new(VecSource::from_pairs(
            name,
            times
                .iter()
                .map(|&t| (t, format!("{}@{}", name, t).into_bytes()))
                .collect(),
        ))
    }

    fn drain(aligner: &mut StreamAligner) -> Vec<(usize, Nanos)> {
        let mut out = Vec::new();
        while let Some(hit) = aligner.step().unwrap() {
            out.push(hit);
        }
        out
    }

    #[test]
    fn test_global_order_with_tie_break() {
        // S1=[(t=0,'a'),(t=2,'b')], S2=[(t=1,'c'),(t=1,'d')]
        // expected order: a(t0,S1), c(t1,S2), d(t1,S2), b(t2,S1)
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 2]),
            source("s2", &[1, 1]),
        ])
        .unwrap();

        assert_eq!(
            drain(&mut aligner),
            vec![(0, 0), (1, 1), (1, 1), (0, 2)]
        );
        assert_eq!(aligner.state(), AlignerState::Eof);
    }

    #[test]
    fn test_equal_times_prefer_lower_stream_index() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[5]),
            source("s2", &[5]),
            source("s3", &[5]),
        ])
        .unwrap();

        assert_eq!(drain(&mut aligner), vec![(0, 5), (1, 5), (2, 5)]);
    }

    #[test]
    fn test_step_on_empty_aligner() {
        let mut aligner = StreamAligner::new();
        assert_eq!(aligner.step().unwrap(), None);
        assert_eq!(aligner.state(), AlignerState::Eof);
        assert_eq!(aligner.interval_logicaltime(), None);
    }

    #[test]
    fn test_step_back_restores_position() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 2]),
            source("s2", &[1]),
        ])
        .unwrap();

        assert_eq!(aligner.step().unwrap(), Some((0, 0)));
        assert_eq!(aligner.step().unwrap(), Some((1, 1)));

        // Undo the second step: back at (s1, t0), next step re-delivers t1
        assert_eq!(aligner.step_back(), Some((0, 0)));
        assert_eq!(aligner.step().unwrap(), Some((1, 1)));
        assert_eq!(aligner.step().unwrap(), Some((0, 2)));
    }

    #[test]
    fn test_step_back_from_before_start() {
        let mut aligner =
            StreamAligner::with_streams(vec![source("s1", &[7])]).unwrap();
        assert_eq!(aligner.step().unwrap(), Some((0, 7)));
        assert_eq!(aligner.step_back(), None); // back to not-started
        assert_eq!(aligner.step().unwrap(), Some((0, 7)));
    }

    #[test]
    fn test_step_back_after_eof() {
        let mut aligner =
            StreamAligner::with_streams(vec![source("s1", &[3])]).unwrap();
        assert_eq!(aligner.step().unwrap(), Some((0, 3)));
        assert_eq!(aligner.step().unwrap(), None);
        assert_eq!(aligner.state(), AlignerState::Eof);

        // Undo the eof-returning step: positioned at t3 again
        assert_eq!(aligner.step_back(), Some((0, 3)));
        assert_eq!(aligner.step().unwrap(), None);
    }

    #[test]
    fn test_add_stream_mid_playback_never_goes_backwards() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 10, 20]),
            source("s2", &[5, 15]),
        ])
        .unwrap();

        // Deliver t0 and t5
        assert_eq!(aligner.step().unwrap(), Some((0, 0)));
        assert_eq!(aligner.step().unwrap(), Some((1, 5)));

        // New stream with samples both before and after the current position
        let repositioned = aligner
            .add_streams(vec![source("s3", &[1, 2, 7, 30])])
            .unwrap();
        assert!(repositioned);

        let rest = drain(&mut aligner);
        let times: Vec<Nanos> = rest.iter().map(|&(_, t)| t).collect();
        // t1 and t2 of s3 predate the already-delivered t5: skipped
        assert_eq!(times, vec![7, 10, 15, 20, 30]);
        for window in times.windows(2) {
            assert!(window[0] <= window[1]);
        }
    }

    #[test]
    fn test_add_stream_before_start_delivers_everything() {
        let mut aligner =
            StreamAligner::with_streams(vec![source("s1", &[10])]).unwrap();
        let repositioned = aligner.add_streams(vec![source("s2", &[1])]).unwrap();
        assert!(!repositioned);
        assert_eq!(drain(&mut aligner), vec![(1, 1), (0, 10)]);
    }

    #[test]
    fn test_add_stream_at_eof_resumes() {
        let mut aligner =
            StreamAligner::with_streams(vec![source("s1", &[5])]).unwrap();
        assert_eq!(aligner.step().unwrap(), Some((0, 5)));
        assert_eq!(aligner.step().unwrap(), None);

        let repositioned = aligner
            .add_streams(vec![source("s2", &[3, 8])])
            .unwrap();
        assert!(!repositioned);

        // t3 predates the delivered t5 and is skipped; t8 is delivered
        assert_eq!(aligner.step().unwrap(), Some((1, 8)));
        assert_eq!(aligner.step().unwrap(), None);
    }

    #[test]
    fn test_remove_non_current_stream_keeps_position() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 4]),
            source("s2", &[2, 6]),
        ])
        .unwrap();

        assert_eq!(aligner.step().unwrap(), Some((0, 0)));
        assert_eq!(aligner.step().unwrap(), Some((1, 2)));

        // Remove s1 (not the current-position stream); s2's index remaps to 0
        let removed_current = aligner.remove_streams(&["s1"]);
        assert!(!removed_current);
        assert_eq!(
            aligner.state(),
            AlignerState::Positioned { stream: 0, sample: 0 }
        );
        assert_eq!(drain(&mut aligner), vec![(0, 6)]);
    }

    #[test]
    fn test_remove_current_stream_resumes_in_order() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 4]),
            source("s2", &[2, 6]),
        ])
        .unwrap();

        assert_eq!(aligner.step().unwrap(), Some((0, 0)));
        assert_eq!(aligner.step().unwrap(), Some((1, 2)));

        let removed_current = aligner.remove_streams(&["s2"]);
        assert!(removed_current);
        assert_eq!(aligner.last_time(), Some(2));

        // s1 resumes exactly where it left off: t4, no skip, no repeat
        assert_eq!(drain(&mut aligner), vec![(0, 4)]);
    }

    #[test]
    fn test_seek_by_time() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 2]),
            source("s2", &[1, 1]),
        ])
        .unwrap();

        // Land on the first sample at or after t1
        assert_eq!(aligner.seek(SeekTarget::Time(1), false).unwrap(), Some((1, 1)));
        // Next step delivers the following sample, not the landed one
        assert_eq!(aligner.step().unwrap(), Some((1, 1)));
        assert_eq!(aligner.step().unwrap(), Some((0, 2)));
    }

    #[test]
    fn test_seek_backwards_rewinds() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 2, 4, 6]),
        ])
        .unwrap();

        while aligner.step().unwrap().is_some() {}
        assert_eq!(aligner.seek(SeekTarget::Time(2), false).unwrap(), Some((0, 2)));
        assert_eq!(aligner.step().unwrap(), Some((0, 4)));
    }

    #[test]
    fn test_seek_by_index() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[0, 2]),
            source("s2", &[1, 1]),
        ])
        .unwrap();

        // Global sequence: t0, t1, t1, t2; index 2 is the second t1
        assert_eq!(aligner.seek(SeekTarget::Index(2), false).unwrap(), Some((1, 1)));
        assert_eq!(aligner.step().unwrap(), Some((0, 2)));
    }

    #[test]
    fn test_seek_exact() {
        let mut aligner =
            StreamAligner::with_streams(vec![source("s1", &[0, 10])]).unwrap();

        assert_eq!(
            aligner.seek(SeekTarget::Time(10), true).unwrap(),
            Some((0, 10))
        );
        assert!(matches!(
            aligner.seek(SeekTarget::Time(5), true),
            Err(ReplayError::NoExactMatch { target: 5, landed: Some(10) })
        ));
    }

    #[test]
    fn test_seek_past_end() {
        let mut aligner =
            StreamAligner::with_streams(vec![source("s1", &[0, 10])]).unwrap();
        assert_eq!(aligner.seek(SeekTarget::Time(99), false).unwrap(), None);
        assert_eq!(aligner.state(), AlignerState::Eof);
    }

    #[test]
    fn test_interval_is_union_of_streams() {
        let mut aligner = StreamAligner::with_streams(vec![
            source("s1", &[10, 20]),
            source("s2", &[5, 12]),
        ])
        .unwrap();

        assert_eq!(
            aligner.interval_logicaltime(),
            Some(TimeInterval::new(5, 20))
        );
        assert_eq!(aligner.size().unwrap(), 4);
    }
}
