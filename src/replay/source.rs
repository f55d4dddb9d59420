//! Sample Sources
//!
//! The aligner and replay manager operate on [`SampleSource`] rather than on
//! concrete stream types, so recorded streams ([`LazyStream`]) and in-memory
//! streams ([`VecSource`], useful for synthetic data and tests) merge the same
//! way.
//!
//! # Precondition
//!
//! A source's logical times must be non-decreasing in sample order. Sources
//! violating this produce undefined merge order downstream; the hot path does
//! not guard it.

use crate::logfile::Sample;
use crate::replay::time::{Nanos, TimeInterval};
use crate::stream::lazy::{LazyStream, StreamError};
use crate::stream::typereg::TypeDescriptor;

/// Random-access view of one time-ordered stream of samples.
pub trait SampleSource {
    fn name(&self) -> &str;

    fn type_descriptor(&self) -> &TypeDescriptor;

    /// Number of samples visible through this source.
    fn sample_count(&mut self) -> Result<u64, StreamError>;

    /// Logical time of the idx-th sample, `None` past the end. Must not read
    /// payload data.
    fn logical_time_at(&mut self, idx: u64) -> Result<Option<Nanos>, StreamError>;

    /// The idx-th sample, `None` past the end.
    fn sample_at(&mut self, idx: u64) -> Result<Option<Sample>, StreamError>;

    /// Index of the first sample with logical time `>= t` (the sample count
    /// when all samples are earlier).
    fn first_index_at_or_after(&mut self, t: Nanos) -> Result<u64, StreamError>;

    /// Logical-time interval, `None` when empty. Answered without touching
    /// payload data.
    fn interval_logicaltime(&self) -> Option<TimeInterval>;
}

impl SampleSource for LazyStream {
    fn name(&self) -> &str {
        LazyStream::name(self)
    }

    fn type_descriptor(&self) -> &TypeDescriptor {
        LazyStream::type_descriptor(self)
    }

    fn sample_count(&mut self) -> Result<u64, StreamError> {
        LazyStream::sample_count(self)
    }

    fn logical_time_at(&mut self, idx: u64) -> Result<Option<Nanos>, StreamError> {
        LazyStream::logical_time_at(self, idx)
    }

    fn sample_at(&mut self, idx: u64) -> Result<Option<Sample>, StreamError> {
        LazyStream::sample_at(self, idx)
    }

    fn first_index_at_or_after(&mut self, t: Nanos) -> Result<u64, StreamError> {
        LazyStream::first_index_at_or_after(self, t)
    }

    fn interval_logicaltime(&self) -> Option<TimeInterval> {
        LazyStream::interval_logicaltime(self)
    }
}

/// In-memory sample source backed by a `Vec`.
pub struct VecSource {
    name: String,
    typ: TypeDescriptor,
    samples: Vec<Sample>,
}

impl VecSource {
    /// Build from samples already sorted by logical time.
    pub fn new(name: impl Into<String>, typ: TypeDescriptor, samples: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            typ,
            samples,
        }
    }

    /// Build from bare `(logical_time, payload)` pairs; realtime mirrors
    /// logical time.
    pub fn from_pairs(name: impl Into<String>, pairs: Vec<(Nanos, Vec<u8>)>) -> Self {
        let samples = pairs
            .into_iter()
            .map(|(logical, data)| Sample {
                realtime: logical,
                logical,
                data,
            })
            .collect();
        Self::new(name, TypeDescriptor::new("/untyped", ""), samples)
    }
}

impl SampleSource for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_descriptor(&self) -> &TypeDescriptor {
        &self.typ
    }

    fn sample_count(&mut self) -> Result<u64, StreamError> {
        Ok(self.samples.len() as u64)
    }

    fn logical_time_at(&mut self, idx: u64) -> Result<Option<Nanos>, StreamError> {
        Ok(self.samples.get(idx as usize).map(|s| s.logical))
    }

    fn sample_at(&mut self, idx: u64) -> Result<Option<Sample>, StreamError> {
        Ok(self.samples.get(idx as usize).cloned())
    }

    fn first_index_at_or_after(&mut self, t: Nanos) -> Result<u64, StreamError> {
        Ok(self.samples.partition_point(|s| s.logical < t) as u64)
    }

    fn interval_logicaltime(&self) -> Option<TimeInterval> {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some(TimeInterval::new(first.logical, last.logical)),
            _ => None,
        }
    }
}
