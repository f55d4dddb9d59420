//! roverlog
//!
//! Content-addressed storage and time-synchronized replay for large
//! collections of timestamped, multi-stream binary log data produced by a
//! robotics runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Datastore                             │
//! │  core/<digest>  cache/<digest>  incoming/<n>  (atomic import)│
//! └──────────────────────────────────────────────────────────────┘
//!                │ produces
//!                ▼
//! ┌─────────────┐     identity manifest + metadata + .rlog files
//! │   Dataset   │───────────────────────────────────────────────┐
//! └─────────────┘                                               │
//!                │ exposes (via per-file .idx indexes)           ▼
//!         ┌─────────────┐  ┌─────────────┐            ┌─────────────┐
//!         │ LazyStream  │  │ LazyStream  │    ...     │ LazyStream  │
//!         └──────┬──────┘  └──────┬──────┘            └──────┬──────┘
//!                └───────────┬────┴────────────…─────────────┘
//!                            ▼
//!                   ┌─────────────────┐   smallest-logical-time-first
//!                   │  StreamAligner  │   k-way merge, stable tie-break
//!                   └────────┬────────┘
//!                            ▼
//!                   ┌─────────────────┐   eager drain or real-time paced
//!                   │  ReplayManager  │──▶ consumers (SampleSink)
//!                   └─────────────────┘
//! ```
//!
//! # Determinism
//!
//! Dataset identity is a canonical content digest, bit-exact across
//! implementations. Replay order is a total order: logical time first, stream
//! insertion index as tie-break, so the same stream set replays identically
//! every run.

pub mod context;
pub mod logfile;
pub mod replay;
pub mod store;
pub mod stream;

pub use context::Context;
pub use logfile::{LogError, LogReader, LogWriter, Sample, LOG_EXTENSION, PROLOGUE_SIZE};
pub use replay::{
    AlignerState, Nanos, ReplayError, ReplayManager, SampleSink, SampleSource, SeekTarget,
    SharedSink, StreamAligner, StreamDescriptor, TimeInterval, VecSource,
};
pub use store::{
    digest_dataset, digest_file, ContentDigest, Dataset, DatasetError, Datastore, DigestError,
    IdentityEntry, MetadataMap, StoreError, Streams, TaskStreams, ValidationMode,
};
pub use stream::{FileIndex, IndexError, LazyStream, StreamError, TypeDescriptor, TypeRegistry};
