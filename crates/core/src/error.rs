//! Error taxonomy for packing and sync
//!
//! Functions in this workspace return `color_eyre::Result`; the variants here
//! are raised through it so callers can `downcast_ref::<BamError>()` when they
//! need to tell a structural failure from a backend one.

use std::path::PathBuf;

use thiserror::Error;

/// Typed failures raised by the packer, codec and protocol
#[derive(Error, Debug)]
pub enum BamError {
    /// Pack mode string is not one of FILE, ZIP, NONE
    #[error("{0} not a known pack mode")]
    UnknownPackMode(String),

    /// Stream did not start with `BAM\0`
    #[error("bad stream header {0:?}")]
    BadMagic([u8; 4]),

    /// Frame type code outside the protocol table
    #[error("unknown frame type {0}")]
    UnknownFrame(u32),

    /// A frame arrived where the exchange does not allow it
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Referenced file absent at copy time
    #[error("source missing: {}", .0.display())]
    MissingSource(PathBuf),

    /// Manifest table could not be decoded
    #[error("failed to decode manifest {name}: {message}")]
    Manifest { name: String, message: String },

    /// Reference rewrite targeted a document that is no longer open
    #[error("reference to {} is no longer open for rewriting", .0.display())]
    StaleReference(PathBuf),

    /// Underlying version-control command failed
    #[error("{command} failed: {message}")]
    Backend { command: String, message: String },

    /// Server answered with an error reply
    #[error("server error: {0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_eyre() {
        let report = color_eyre::eyre::Report::new(BamError::UnknownPackMode("TAR".into()));
        let err = report.downcast_ref::<BamError>().unwrap();
        assert_eq!(err.to_string(), "TAR not a known pack mode");
    }
}
