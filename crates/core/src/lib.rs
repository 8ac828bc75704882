//! bam-core: dependency packer and sync engine
//!
//! Provides the scene dependency walker, copy-on-write staging, the packer,
//! manifest codecs, the BAM wire protocol and commit change detection.

pub mod archive;
pub mod changeset;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod pack;
pub mod paths;
pub mod protocol;
pub mod scene;
pub mod staging;
pub mod stream;
pub mod walker;

pub use changeset::{ChangeSet, ChangeSetResolver};
pub use config::BamConfig;
pub use error::BamError;
pub use hash::ContentHash;
pub use manifest::PackManifest;
pub use pack::{Pack, PackMode, PackOptions, pack};
pub use protocol::{Frame, ProtocolReader, ProtocolWriter, Reply, Request};
pub use scene::TextScene;
pub use walker::{AssetFormat, FileReference, LibraryVisit, PathWalker};
