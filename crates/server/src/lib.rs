//! bam-server: BAM sync service
//!
//! Answers checkout, download, commit, listing and bundle requests over the
//! BAM wire protocol for one version-controlled repository.

pub mod backend;
pub mod commit;
pub mod config;
pub mod jobs;
pub mod service;

pub use backend::{EntryState, StatusEntry, SvnBackend, Vcs};
pub use config::ServerConfig;
pub use jobs::{JobState, JobTable};
pub use service::Service;
