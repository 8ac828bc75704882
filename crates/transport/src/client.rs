//! Client session operations
//!
//! A checkout is a session directory holding the files of one asset bundle
//! next to the manifests the server planned it with:
//!
//! ```text
//! shot/
//!   shot.scene              root asset, paths relocated into the session
//!   data/wood.png           dependencies
//!   .bam_paths_remap.json   session path -> repository path ("." = session dir)
//!   .bam_paths_uuid.json    content hash snapshot, drives change detection
//!   ...
//! ```

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use bam_core::archive;
use bam_core::manifest::{PATHS_UUID_FILE, PackManifest};
use bam_core::protocol::ListEntry;
use bam_core::{ChangeSet, ChangeSetResolver, ContentHash, Reply, Request, TextScene, paths};

use crate::Transport;

/// Receives what the server reports while a request runs
pub trait Progress {
    /// A progress line from the server or the client
    fn message(&mut self, _text: &str) {}

    /// Bytes of the current payload received so far
    fn transfer(&mut self, _received: u64, _total: u64) {}
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct Quiet;

impl Progress for Quiet {}

/// Result of a commit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No tracked file changed; nothing was sent
    NothingToCommit,
    /// Backend output of the commit
    Committed(String),
}

/// The session directory holding `path`, found by walking up to the nearest
/// directory with a content snapshot
#[must_use]
pub fn find_session(path: &Path) -> Option<PathBuf> {
    let path = paths::absolute(path).ok()?;
    path.ancestors()
        .find(|dir| dir.join(PATHS_UUID_FILE).is_file())
        .map(Path::to_path_buf)
}

/// Session operations over a transport
pub struct Client<T: Transport> {
    transport: T,
    user: String,
}

/// Session paths whose files come from the repository
fn tracked(manifest: &PackManifest) -> impl Iterator<Item = (&String, &String)> {
    manifest.paths_remap.iter().filter(|(rel, _)| *rel != ".")
}

/// Carry the entries a locally modified file was checked out with into a
/// newer plan
fn keep_entries(manifest: &mut PackManifest, old: &PackManifest, rel: &str) {
    if let Some(source) = old.paths_remap.get(rel) {
        manifest.paths_remap.insert(rel.to_string(), source.clone());
    }
    if let Some(hash) = old.paths_uuid.get(rel) {
        manifest.paths_uuid.insert(rel.to_string(), *hash);
    }
    match old.binary_edits.assets.get(rel) {
        Some(edits) => {
            manifest
                .binary_edits
                .assets
                .insert(rel.to_string(), edits.clone());
        }
        None => {
            manifest.binary_edits.assets.remove(rel);
        }
    }
    let owner = paths::file_name(Path::new(rel));
    match old.deps_remap.get(&owner) {
        Some(deps) => {
            manifest.deps_remap.insert(owner, deps.clone());
        }
        None => {
            manifest.deps_remap.remove(&owner);
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, user: impl Into<String>) -> Self {
        Self {
            transport,
            user: user.into(),
        }
    }

    /// Check out `path` into a new session directory under `into`
    ///
    /// Returns the session directory.
    pub fn checkout(
        &self,
        path: &str,
        into: &Path,
        all_deps: bool,
        progress: &mut impl Progress,
    ) -> Result<PathBuf> {
        let stem = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| eyre!("nothing to check out in {path:?}"))?;
        let session = into.join(stem);
        if session.exists() && std::fs::read_dir(&session)?.next().is_some() {
            bail!("{} already exists", session.display());
        }

        let bundle = self.plan(path, all_deps, progress)?;
        archive::extract(bundle.path(), &session)?;

        let manifest = PackManifest::read_dir(&session)?;
        let files: Vec<String> = tracked(&manifest).map(|(rel, _)| rel.clone()).collect();
        let fetched = self.download(&session, &manifest, &files, progress)?;
        let edited = manifest
            .binary_edits
            .filtered(|asset| fetched.contains(asset))
            .apply(&TextScene, &session)?;
        info!(
            "checked out {path}: {} files, {edited} assets relocated into {}",
            fetched.len(),
            session.display()
        );
        Ok(session)
    }

    /// Have the server plan a checkout of `path` and receive its manifest bundle
    fn plan(
        &self,
        path: &str,
        all_deps: bool,
        progress: &mut impl Progress,
    ) -> Result<NamedTempFile> {
        let bundle = tempfile::Builder::new()
            .prefix("bam-checkout")
            .suffix(".zip")
            .tempfile()?;
        let mut conn = self.transport.connect()?;
        conn.send(&Request::Checkout {
            path: path.to_string(),
            all_deps,
        })?;
        let mut file = bundle.as_file();
        let shared = RefCell::new(&mut *progress);
        let size = conn.reader().receive_payload(
            &mut file,
            |text| shared.borrow_mut().message(text),
            |received, total| shared.borrow_mut().transfer(received, total),
        )?;
        debug!("manifest bundle: {size} bytes");
        Ok(bundle)
    }

    /// Fetch the repository originals of the session paths in `files`
    ///
    /// Returns the session paths the server had.
    fn download(
        &self,
        session: &Path,
        manifest: &PackManifest,
        files: &[String],
        progress: &mut impl Progress,
    ) -> Result<BTreeSet<String>> {
        if files.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut targets = Vec::with_capacity(files.len());
        let mut sources = Vec::with_capacity(files.len());
        for rel in files {
            let origin = manifest
                .paths_remap
                .get(rel)
                .ok_or_else(|| eyre!("{rel} is not tracked"))?;
            let target = paths::contained(session, rel)
                .ok_or_else(|| eyre!("{rel} escapes the session"))?;
            targets.push(target);
            sources.push(origin.clone());
        }

        let mut conn = self.transport.connect()?;
        conn.send(&Request::CheckoutDownload { files: sources })?;
        let found = conn
            .reader()
            .receive_files(&targets, |text| progress.message(text))?;

        let mut fetched = BTreeSet::new();
        for (rel, present) in files.iter().zip(&found) {
            if *present {
                fetched.insert(rel.clone());
            } else {
                warn!("server has no file for {rel}");
                progress.message(&format!("missing: {rel}"));
            }
        }
        Ok(fetched)
    }

    /// Tracked files changed since checkout or the last commit
    pub fn status(&self, session: &Path) -> Result<ChangeSet> {
        ChangeSetResolver::new(session).resolve()
    }

    /// Upload changed files and commit them with `message`
    ///
    /// Nothing is sent when no tracked file changed.
    pub fn commit(
        &self,
        session: &Path,
        message: &str,
        progress: &mut impl Progress,
    ) -> Result<CommitOutcome> {
        let resolver = ChangeSetResolver::new(session);
        let changes = resolver.resolve()?;
        if changes.is_empty() {
            info!("nothing to commit in {}", session.display());
            return Ok(CommitOutcome::NothingToCommit);
        }

        let upload = tempfile::Builder::new()
            .prefix("bam-commit")
            .suffix(".zip")
            .tempfile()?;
        let bundle = resolver.write_commit(&TextScene, &changes, upload.path())?;
        progress.message(&format!(
            "uploading {} files, {} removals",
            bundle.files,
            bundle.paths_ops.len()
        ));

        let mut conn = self.transport.connect()?;
        conn.send(&Request::Commit {
            message: message.to_string(),
            user: Some(self.user.clone()),
        })?;
        conn.writer().send_payload_file(upload.path())?;
        let output = match conn.reader().receive_reply(|text| progress.message(text))? {
            Reply::Committed { output } => output,
            other => bail!("unexpected reply to commit: {other:?}"),
        };

        resolver.refresh(&changes)?;
        Ok(CommitOutcome::Committed(output))
    }

    /// Restore `files` (session paths) to their repository state
    ///
    /// An empty list reverts every modified or removed file. Returns the
    /// number of files restored.
    pub fn revert(
        &self,
        session: &Path,
        files: &[String],
        progress: &mut impl Progress,
    ) -> Result<usize> {
        let manifest = PackManifest::read_dir(session)?;
        let files: Vec<String> = if files.is_empty() {
            let changes = self.status(session)?;
            changes
                .modified
                .into_keys()
                .chain(changes.removed)
                .collect()
        } else {
            files.to_vec()
        };

        let fetched = self.download(session, &manifest, &files, progress)?;
        manifest
            .binary_edits
            .filtered(|asset| fetched.contains(asset))
            .apply(&TextScene, session)?;
        for rel in &fetched {
            progress.message(&format!("  reverted: {rel}"));
        }
        Ok(fetched.len())
    }

    /// Bring every unmodified tracked file to its current repository state
    ///
    /// The checkout is planned again so relocations follow upstream edits of
    /// the scenes. Locally modified files keep their content and the manifest
    /// entries they were checked out with. Returns the number of files
    /// refreshed.
    pub fn update(&self, session: &Path, progress: &mut impl Progress) -> Result<usize> {
        let old = PackManifest::read_dir(session)?;
        let changes = self.status(session)?;

        // dependencies all live under data/, only the root sits at the top
        let (root, source) = tracked(&old)
            .find(|(rel, _)| !rel.contains('/'))
            .ok_or_else(|| eyre!("{} has no root asset", session.display()))?;
        // libraries carry edits of their own only when the walk followed them
        let all_deps = old.binary_edits.assets.keys().any(|asset| asset != root);
        debug!("re-planning {source} (all_deps: {all_deps})");

        let bundle = self.plan(source, all_deps, progress)?;
        let planned = tempfile::tempdir()?;
        archive::extract(bundle.path(), planned.path())?;
        let mut manifest = PackManifest::read_dir(planned.path())?;

        for rel in changes.modified.keys() {
            progress.message(&format!("  skipping modified: {rel}"));
            keep_entries(&mut manifest, &old, rel);
        }
        for (rel, _) in tracked(&old).filter(|(rel, _)| !manifest.paths_remap.contains_key(*rel)) {
            progress.message(&format!("  no longer tracked: {rel}"));
        }

        let files: Vec<String> = tracked(&manifest)
            .map(|(rel, _)| rel)
            .filter(|rel| !changes.modified.contains_key(*rel))
            .cloned()
            .collect();
        let fetched = self.download(session, &manifest, &files, progress)?;
        manifest
            .binary_edits
            .filtered(|asset| fetched.contains(asset))
            .apply(&TextScene, session)?;

        for rel in &files {
            if fetched.contains(rel) {
                let hash = ContentHash::from_file(&session.join(rel))?;
                manifest.paths_uuid.insert(rel.clone(), hash);
                continue;
            }
            // not on the server; the local copy is still what it was
            match old.paths_uuid.get(rel) {
                Some(hash) => {
                    manifest.paths_uuid.insert(rel.clone(), *hash);
                }
                None => {
                    manifest.paths_uuid.remove(rel);
                }
            }
        }
        manifest.write_dir(session)?;
        info!("updated {}: {} files", session.display(), fetched.len());
        Ok(fetched.len())
    }

    /// Entries of a repository directory, dirs first
    pub fn list(&self, path: &str) -> Result<Vec<ListEntry>> {
        let mut conn = self.transport.connect()?;
        conn.send(&Request::List {
            path: path.to_string(),
        })?;
        match conn.reader().receive_reply(|_| {})? {
            Reply::Listing { entries, .. } => Ok(entries),
            other => bail!("unexpected reply to list: {other:?}"),
        }
    }

    /// Size and bundle state of a repository file
    pub fn info(&self, path: &str) -> Result<Reply> {
        let mut conn = self.transport.connect()?;
        conn.send(&Request::Info {
            path: path.to_string(),
        })?;
        conn.reader().receive_reply(|_| {})
    }

    /// Ask the server to prepare a full bundle of `path`
    pub fn bundle(&self, path: &str) -> Result<Reply> {
        let mut conn = self.transport.connect()?;
        conn.send(&Request::Bundle {
            path: path.to_string(),
        })?;
        conn.reader().receive_reply(|_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_session() {
        let dir = TempDir::new().unwrap();
        let session = dir.path().join("shot");
        std::fs::create_dir_all(session.join("data")).unwrap();
        std::fs::write(session.join(PATHS_UUID_FILE), "{}").unwrap();

        let session = paths::absolute(&session).unwrap();
        assert_eq!(find_session(&session.join("data/wood.png")), Some(session.clone()));
        assert_eq!(find_session(&session), Some(session));
        assert_eq!(find_session(dir.path()), None);
    }
}
