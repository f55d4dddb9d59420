//! Time-Synchronized Replay
//!
//! The k-way stream aligner ([`aligner`]), the consumer-facing replay manager
//! ([`manager`]), the sample-source abstraction ([`source`]), and timestamp
//! helpers ([`time`]).

pub mod aligner;
pub mod manager;
pub mod source;
pub mod time;

pub use aligner::{AlignerState, SeekTarget, StreamAligner};
pub use manager::{ReplayManager, SampleSink, SharedSink, StreamDescriptor, MIN_SLEEP};
pub use source::{SampleSource, VecSource};
pub use time::{Nanos, TimeInterval, NANOS_PER_MICRO, NANOS_PER_MILLI, NANOS_PER_SEC};

use crate::stream::lazy::StreamError;
use std::fmt;

/// Errors from alignment and replay control.
#[derive(Debug)]
pub enum ReplayError {
    /// A stream read failed underneath the aligner.
    Stream(StreamError),
    /// `start` while already running, or `stop` while not running.
    StateMismatch {
        operation: &'static str,
        running: bool,
    },
    /// An exact seek found no sample at the requested logical time.
    NoExactMatch {
        target: Nanos,
        /// Where the seek landed instead; `None` when it ran off the end.
        landed: Option<Nanos>,
    },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(e) => write!(f, "stream error during replay: {}", e),
            Self::StateMismatch { operation, running } => write!(
                f,
                "cannot {}: playback is {}",
                operation,
                if *running { "already running" } else { "not running" }
            ),
            Self::NoExactMatch { target, landed } => match landed {
                Some(landed) => write!(
                    f,
                    "no sample at logical time {} (nearest following: {})",
                    target, landed
                ),
                None => write!(f, "no sample at or after logical time {}", target),
            },
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StreamError> for ReplayError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}
