//! Change detection for commits
//!
//! A checkout directory holds the files of a bundle plus the manifests it was
//! unpacked from. [`ChangeSetResolver`] rehashes every path recorded in
//! `paths_uuid` and keeps only the ones whose content differs, so a commit
//! uploads the changed subset and nothing else.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{debug, info};

use crate::archive::BundleWriter;
use crate::hash::ContentHash;
use crate::manifest::{
    PATHS_REMAP_FILE, PATHS_UUID_FILE, PackManifest, PathOp, PathsOps, PathsRemap, PathsUuid,
    encode_json, read_json, write_json,
};
use crate::paths;
use crate::walker::{AssetDocument, AssetFormat};

/// Files that differ from the recorded snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Relative path -> absolute path of files whose content changed
    pub modified: BTreeMap<String, PathBuf>,
    /// Tracked files no longer present
    pub removed: BTreeSet<String>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.removed.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modified.len() + self.removed.len()
    }
}

/// What went into an upload bundle
#[derive(Debug, Default)]
pub struct CommitBundle {
    pub files: usize,
    /// Assets whose relocated paths were restored before upload
    pub restored: usize,
    pub paths_remap: PathsRemap,
    pub paths_ops: PathsOps,
}

/// Resolves changes in a checkout directory against its `paths_uuid` snapshot
#[derive(Debug, Clone)]
pub struct ChangeSetResolver {
    dir: PathBuf,
}

impl ChangeSetResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The recorded snapshot
    pub fn snapshot(&self) -> Result<PathsUuid> {
        read_json(&self.dir.join(PATHS_UUID_FILE))
    }

    /// Rehash every tracked path and return the ones that changed
    pub fn resolve(&self) -> Result<ChangeSet> {
        let snapshot = self.snapshot()?;
        let mut changes = ChangeSet::default();

        for (rel, recorded) in &snapshot {
            let path = self.dir.join(rel);
            if !path.is_file() {
                debug!("removed: {rel}");
                changes.removed.insert(rel.clone());
                continue;
            }
            if ContentHash::from_file(&path)? != *recorded {
                debug!("modified: {rel}");
                changes.modified.insert(rel.clone(), path);
            }
        }

        debug!(
            "{} tracked, {} modified, {} removed",
            snapshot.len(),
            changes.modified.len(),
            changes.removed.len()
        );
        Ok(changes)
    }

    /// Write the upload bundle for `changes` to `out`
    ///
    /// Scene assets get their relocated references put back to the
    /// repository paths recorded in `deps_remap`, so the repository never
    /// sees bundle-local paths. The bundle carries the `paths_remap` subset
    /// for the changed files and a `paths_ops` table marking removals.
    pub fn write_commit<F: AssetFormat>(
        &self,
        format: &F,
        changes: &ChangeSet,
        out: &Path,
    ) -> Result<CommitBundle> {
        let manifest = PackManifest::read_dir(&self.dir)?;
        let scratch = tempfile::tempdir()?;
        let mut writer = BundleWriter::create(out)?;
        let mut bundle = CommitBundle::default();

        for (rel, path) in &changes.modified {
            let restored = manifest
                .deps_remap
                .get(&paths::file_name(Path::new(rel)))
                .filter(|_| format.accepts(path))
                .map(|remap| restore_paths(format, path, remap, scratch.path()))
                .transpose()?
                .flatten();

            match restored {
                Some(copy) => {
                    writer.add_file(rel, &copy)?;
                    bundle.restored += 1;
                }
                None => writer.add_file(rel, path)?,
            }
            bundle.files += 1;

            if let Some(origin) = manifest.paths_remap.get(rel) {
                bundle.paths_remap.insert(rel.clone(), origin.clone());
            }
        }

        for rel in &changes.removed {
            if let Some(origin) = manifest.paths_remap.get(rel) {
                bundle.paths_ops.insert(origin.clone(), PathOp::Delete);
            }
        }

        writer.add_bytes(PATHS_REMAP_FILE, &encode_json(&bundle.paths_remap)?)?;
        writer.add_ops(&bundle.paths_ops)?;
        writer.finish()?;

        info!(
            "commit bundle: {} files, {} removals",
            bundle.files,
            bundle.paths_ops.len()
        );
        Ok(bundle)
    }

    /// Record the committed state as the new snapshot
    pub fn refresh(&self, changes: &ChangeSet) -> Result<()> {
        let mut snapshot = self.snapshot()?;
        for (rel, path) in &changes.modified {
            snapshot.insert(rel.clone(), ContentHash::from_file(path)?);
        }
        for rel in &changes.removed {
            snapshot.remove(rel);
        }
        write_json(&self.dir.join(PATHS_UUID_FILE), &snapshot)?;

        let remap_path = self.dir.join(PATHS_REMAP_FILE);
        if !changes.removed.is_empty() && remap_path.is_file() {
            let mut remap: PathsRemap = read_json(&remap_path)?;
            remap.retain(|rel, _| !changes.removed.contains(rel));
            write_json(&remap_path, &remap)?;
        }
        Ok(())
    }
}

/// Copy `path` into `scratch` with every relocated reference put back
///
/// Returns `None` when no reference needed restoring.
fn restore_paths<F: AssetFormat>(
    format: &F,
    path: &Path,
    remap: &BTreeMap<String, String>,
    scratch: &Path,
) -> Result<Option<PathBuf>> {
    let mut doc = format.open(path)?;
    let mut restored = 0;
    for reference in doc.references() {
        let current = String::from_utf8_lossy(&reference.path);
        if let Some(original) = remap.get(current.as_ref()) {
            doc.set_path(reference.field, original.as_bytes())?;
            restored += 1;
        }
    }
    if restored == 0 {
        return Ok(None);
    }

    let copy = scratch.join(ContentHash::from_bytes(path.as_os_str().as_encoded_bytes()).to_hex());
    doc.save(&copy)?;
    debug!("restored {restored} paths in {}", path.display());
    Ok(Some(copy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;
    use crate::manifest::{PATHS_OPS_FILE, decode_json};
    use crate::scene::TextScene;
    use tempfile::TempDir;

    /// A checkout directory as `bam checkout` leaves it
    fn checkout(dir: &Path) {
        std::fs::create_dir_all(dir.join("data")).unwrap();
        std::fs::write(dir.join("shot.scene"), "image //data/wood.png\n").unwrap();
        std::fs::write(dir.join("data/wood.png"), "wood").unwrap();
        std::fs::write(dir.join("data/skin.png"), "skin").unwrap();

        let mut manifest = PackManifest::default();
        manifest.deps_remap.insert(
            "shot.scene".into(),
            BTreeMap::from([("//data/wood.png".into(), "//../tex/wood.png".into())]),
        );
        for (rel, origin) in [
            ("shot.scene", "shots/shot.scene"),
            ("data/wood.png", "tex/wood.png"),
            ("data/skin.png", "tex/skin.png"),
        ] {
            manifest.paths_remap.insert(rel.into(), origin.into());
            manifest
                .paths_uuid
                .insert(rel.into(), ContentHash::from_file(&dir.join(rel)).unwrap());
        }
        manifest.write_dir(dir).unwrap();
    }

    #[test]
    fn test_unchanged_checkout_is_empty() {
        let dir = TempDir::new().unwrap();
        checkout(dir.path());
        let changes = ChangeSetResolver::new(dir.path()).resolve().unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_one_of_n_modified() {
        let dir = TempDir::new().unwrap();
        checkout(dir.path());
        std::fs::write(dir.path().join("data/wood.png"), "oak").unwrap();

        let changes = ChangeSetResolver::new(dir.path()).resolve().unwrap();
        assert_eq!(
            changes.modified.keys().collect::<Vec<_>>(),
            vec!["data/wood.png"]
        );
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_touch_without_change_is_not_modified() {
        let dir = TempDir::new().unwrap();
        checkout(dir.path());
        std::fs::write(dir.path().join("data/wood.png"), "wood").unwrap();
        assert!(ChangeSetResolver::new(dir.path()).resolve().unwrap().is_empty());
    }

    #[test]
    fn test_commit_bundle_contents() {
        let dir = TempDir::new().unwrap();
        checkout(dir.path());
        std::fs::write(dir.path().join("shot.scene"), "image //data/wood.png\n# lit\n").unwrap();
        std::fs::remove_file(dir.path().join("data/skin.png")).unwrap();

        let resolver = ChangeSetResolver::new(dir.path());
        let changes = resolver.resolve().unwrap();
        let out = TempDir::new().unwrap();
        let zip_path = out.path().join("commit.zip");
        let bundle = resolver.write_commit(&TextScene, &changes, &zip_path).unwrap();

        assert_eq!(bundle.files, 1);
        assert_eq!(bundle.restored, 1);

        let extracted = out.path().join("x");
        archive::extract(&zip_path, &extracted).unwrap();
        assert_eq!(
            std::fs::read_to_string(extracted.join("shot.scene")).unwrap(),
            "image //../tex/wood.png\n# lit\n"
        );
        assert!(!extracted.join("data/wood.png").exists());

        let remap: PathsRemap = read_json(&extracted.join(PATHS_REMAP_FILE)).unwrap();
        assert_eq!(
            remap,
            PathsRemap::from([("shot.scene".into(), "shots/shot.scene".into())])
        );
        let ops: PathsOps = decode_json(
            PATHS_OPS_FILE,
            &std::fs::read(extracted.join(PATHS_OPS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(ops, PathsOps::from([("tex/skin.png".into(), PathOp::Delete)]));

        // the working copy keeps its bundle-local paths
        assert!(
            std::fs::read_to_string(dir.path().join("shot.scene"))
                .unwrap()
                .starts_with("image //data/wood.png")
        );
    }

    #[test]
    fn test_refresh_clears_changes() {
        let dir = TempDir::new().unwrap();
        checkout(dir.path());
        std::fs::write(dir.path().join("data/wood.png"), "oak").unwrap();
        std::fs::remove_file(dir.path().join("data/skin.png")).unwrap();

        let resolver = ChangeSetResolver::new(dir.path());
        let changes = resolver.resolve().unwrap();
        assert_eq!(changes.len(), 2);
        resolver.refresh(&changes).unwrap();

        assert!(resolver.resolve().unwrap().is_empty());
        let remap: PathsRemap = read_json(&dir.path().join(PATHS_REMAP_FILE)).unwrap();
        assert!(!remap.contains_key("data/skin.png"));
    }
}
