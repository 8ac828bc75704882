//! Version-control backend behind commits
//!
//! The server only needs a handful of operations from the repository it
//! serves; [`Vcs`] is that seam. [`SvnBackend`] drives the `svn` command line
//! client against a working copy.

use std::path::{Path, PathBuf};
use std::process::Command;

use color_eyre::Result;
use tracing::debug;

use bam_core::BamError;

/// Tracking state of a working copy entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Versioned,
    Unversioned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Path relative to the working copy root
    pub path: PathBuf,
    pub state: EntryState,
}

/// Operations a commit needs from the repository
///
/// A backend is bound to one working copy root; paths passed in are
/// relative to it.
pub trait Vcs: Send {
    /// Entries that differ from the last committed state
    fn status(&mut self) -> Result<Vec<StatusEntry>>;

    /// Start tracking `path`
    fn add(&mut self, path: &Path) -> Result<()>;

    /// Stop tracking `path` and delete it
    fn remove(&mut self, path: &Path) -> Result<()>;

    /// Commit every pending change; returns the backend's output
    fn commit(&mut self, message: &str, user: &str, credential: Option<&str>) -> Result<String>;
}

/// Subversion working copy
#[derive(Debug, Clone)]
pub struct SvnBackend {
    root: PathBuf,
}

impl SvnBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let command = format!("svn {}", args.first().copied().unwrap_or_default());
        debug!("{command} in {}", self.root.display());

        let output = Command::new("svn")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| BamError::Backend {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(BamError::Backend {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `svn status` output
///
/// The first column holds the item state, the path starts at column 8.
#[must_use]
pub fn parse_status(output: &str) -> Vec<StatusEntry> {
    output
        .lines()
        .filter(|line| line.len() > 8 && line.as_bytes()[7] == b' ')
        .filter_map(|line| {
            let state = match line.as_bytes()[0] {
                b'?' => EntryState::Unversioned,
                b' ' | b'A' | b'C' | b'D' | b'I' | b'M' | b'R' | b'X' | b'!' | b'~' => {
                    EntryState::Versioned
                }
                _ => return None,
            };
            let path = line.get(8..)?.trim_end();
            Some(StatusEntry {
                path: PathBuf::from(path),
                state,
            })
        })
        .collect()
}

impl Vcs for SvnBackend {
    fn status(&mut self) -> Result<Vec<StatusEntry>> {
        Ok(parse_status(&self.run(&["status"])?))
    }

    fn add(&mut self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run(&["add", "--parents", &path])?;
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run(&["rm", "--force", &path])?;
        Ok(())
    }

    fn commit(&mut self, message: &str, user: &str, credential: Option<&str>) -> Result<String> {
        let mut args = vec![
            "commit",
            "--non-interactive",
            "--message",
            message,
            "--username",
            user,
        ];
        if let Some(password) = credential {
            args.extend(["--password", password]);
        }
        self.run(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let output = "\
?       shots/new.scene
M       tex/wood.png
D       tex/skin.png
A  +    shots/copied.scene

Summary of conflicts:
  Text conflicts: 1
";
        let entries = parse_status(output);
        assert_eq!(
            entries,
            vec![
                StatusEntry {
                    path: "shots/new.scene".into(),
                    state: EntryState::Unversioned,
                },
                StatusEntry {
                    path: "tex/wood.png".into(),
                    state: EntryState::Versioned,
                },
                StatusEntry {
                    path: "tex/skin.png".into(),
                    state: EntryState::Versioned,
                },
                StatusEntry {
                    path: "shots/copied.scene".into(),
                    state: EntryState::Versioned,
                },
            ]
        );
    }

    #[test]
    fn test_missing_binary_is_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = SvnBackend::new(dir.path().join("not-a-dir"));
        let err = backend.status().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BamError>(),
            Some(BamError::Backend { command, .. }) if command == "svn status"
        ));
    }
}
