//! Content-Addressed Dataset Storage
//!
//! Digest computation ([`digest`]), single datasets with identity manifests
//! and metadata ([`dataset`]), and the on-disk store with redirects and
//! atomic import staging ([`datastore`]).

pub mod dataset;
pub mod datastore;
pub mod digest;

pub use dataset::{
    Dataset, DatasetError, IdentityManifest, MetadataMap, Streams, TaskStreams, IDENTITY_FILE,
    LAYOUT_VERSION, METADATA_FILE,
};
pub use datastore::{Datastore, StoreError, ValidationMode};
pub use digest::{
    digest_dataset, digest_file, digest_file_skipping, ContentDigest, DigestError, IdentityEntry,
    DIGEST_HEX_LEN,
};
