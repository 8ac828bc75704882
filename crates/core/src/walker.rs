//! Recursive walk over the path references of a scene file and its libraries
//!
//! The walker owns the parsing seam ([`AssetFormat`]) and the remap callback
//! for the duration of one walk. Every asset is opened from its staged copy,
//! so rewrites never touch the original. The visited set is owned by the
//! caller and threaded through the walk; it breaks cycles and guarantees each
//! library is opened once.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{debug, warn};

use crate::error::BamError;
use crate::paths;

/// Kind of block owning a path field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// Link to another scene file (library)
    Library,
    /// Any other block holding a file path, with the format's tag
    Generic(String),
}

/// How a reference is rewritten and whether its target is copied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceClass {
    /// Generic reference owned by the root asset
    Root,
    /// Link to a library; the library is staged, never copied
    LibraryLink,
    /// Generic reference owned by a nested library
    GenericBlock,
}

/// One path field as reported by the format parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    /// Format-specific field index inside the document
    pub field: u32,
    pub kind: BlockKind,
    pub path: Vec<u8>,
}

/// A parsed, mutable scene document
pub trait AssetDocument {
    /// All path fields in document order
    fn references(&self) -> Vec<RawReference>;

    /// Replace the path stored in `field`
    fn set_path(&mut self, field: u32, path: &[u8]) -> Result<()>;

    /// Write the document back to disk
    fn save(&self, path: &Path) -> Result<()>;
}

/// Parser for one scene file format
pub trait AssetFormat {
    type Document: AssetDocument;

    /// Whether the file at `path` is a scene asset this format understands
    fn accepts(&self, path: &Path) -> bool;

    /// Parse the document stored at `path`
    fn open(&self, path: &Path) -> Result<Self::Document>;
}

/// Callback materializing a staged copy of an asset
pub trait Remap {
    /// Return the staged path for `original`, copying it on first use
    fn remap(&mut self, original: &Path, level: u32) -> Result<PathBuf>;
}

/// Handle to the staged document a reference lives in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub staged: PathBuf,
    pub field: u32,
}

/// A path reference yielded by the walk
#[derive(Debug, Clone)]
pub struct FileReference {
    /// Path as stored in the asset (before any rewrite)
    pub path: Vec<u8>,
    /// Recursion depth of the owning asset, root is 0
    pub level: u32,
    pub kind: BlockKind,
    /// Normalized absolute path the reference points at
    pub resolved: PathBuf,
    pub asset: AssetHandle,
}

impl FileReference {
    /// Rewrite rule for this reference
    #[must_use]
    pub fn class(&self) -> ReferenceClass {
        match (&self.kind, self.level) {
            (BlockKind::Library, _) => ReferenceClass::LibraryLink,
            (BlockKind::Generic(_), 0) => ReferenceClass::Root,
            (BlockKind::Generic(_), _) => ReferenceClass::GenericBlock,
        }
    }
}

/// Where the reference was found
#[derive(Debug, Clone)]
pub struct WalkContext {
    /// Original (unstaged) path of the owning asset
    pub asset: PathBuf,
    /// Directory `//` references are resolved against
    pub basedir: PathBuf,
}

/// Resolution state of a visited asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitState {
    /// Scheduled, not opened yet
    Queued,
    /// Opened from this staged copy
    Walked(PathBuf),
}

/// Caller-owned visited set keyed by normalized absolute path
#[derive(Debug, Default, Clone)]
pub struct LibraryVisit {
    assets: HashMap<PathBuf, VisitState>,
}

impl LibraryVisit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `path` as queued; false if it was already known
    pub fn insert(&mut self, path: &Path) -> bool {
        if self.assets.contains_key(path) {
            return false;
        }
        self.assets.insert(path.to_path_buf(), VisitState::Queued);
        true
    }

    fn mark_walked(&mut self, path: &Path, staged: &Path) {
        self.assets
            .insert(path.to_path_buf(), VisitState::Walked(staged.to_path_buf()));
    }

    #[must_use]
    pub fn state(&self, path: &Path) -> Option<&VisitState> {
        self.assets.get(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

struct OpenAsset<D> {
    original: PathBuf,
    staged: PathBuf,
    basedir: PathBuf,
    level: u32,
    doc: D,
    refs: std::vec::IntoIter<RawReference>,
    dirty: bool,
}

/// Lazy, single-pass walk over every reference of a root asset and its libraries
pub struct PathWalker<F: AssetFormat, R: Remap> {
    format: F,
    remap: R,
    visited: LibraryVisit,
    recursive: bool,
    pending: VecDeque<(PathBuf, u32)>,
    current: Option<OpenAsset<F::Document>>,
    finished: bool,
}

impl<F: AssetFormat, R: Remap> PathWalker<F, R> {
    /// Start a walk at `root`
    ///
    /// # Errors
    /// Returns an error if the root path cannot be made absolute
    pub fn visit(
        format: F,
        root: &Path,
        recursive: bool,
        remap: R,
        mut visited: LibraryVisit,
    ) -> Result<Self> {
        let root = paths::absolute(root)?;
        let mut pending = VecDeque::new();
        if visited.insert(&root) {
            pending.push_back((root, 0));
        }

        Ok(Self {
            format,
            remap,
            visited,
            recursive,
            pending,
            current: None,
            finished: false,
        })
    }

    /// Rewrite the path field of `reference` in its staged document
    ///
    /// # Errors
    /// Returns an error if the reference's document is no longer open
    pub fn rewrite(&mut self, reference: &FileReference, path: &[u8]) -> Result<()> {
        let open = self
            .current
            .as_mut()
            .filter(|open| open.staged == reference.asset.staged)
            .ok_or_else(|| BamError::StaleReference(reference.asset.staged.clone()))?;
        open.doc.set_path(reference.asset.field, path)?;
        open.dirty = true;
        Ok(())
    }

    /// Access the remap callback mid-walk
    pub fn remap_mut(&mut self) -> &mut R {
        &mut self.remap
    }

    /// Finish the walk, returning the remap callback and the visited set
    ///
    /// # Errors
    /// Returns an error if an open document cannot be flushed
    pub fn into_parts(mut self) -> Result<(R, LibraryVisit)> {
        if let Some(open) = self.current.take() {
            Self::flush(open)?;
        }
        Ok((self.remap, self.visited))
    }

    /// Drop the walk without flushing pending rewrites
    pub fn abandon(self) -> R {
        self.remap
    }

    fn flush(open: OpenAsset<F::Document>) -> Result<()> {
        if open.dirty {
            debug!("flushing rewrites to {}", open.staged.display());
            open.doc.save(&open.staged)?;
        }
        Ok(())
    }

    fn open(&mut self, original: PathBuf, level: u32) -> Result<OpenAsset<F::Document>> {
        let staged = self.remap.remap(&original, level)?;
        let doc = self.format.open(&staged)?;
        let refs = doc.references();
        debug!(
            "walking {} (level {level}, {} references)",
            original.display(),
            refs.len()
        );
        self.visited.mark_walked(&original, &staged);
        let basedir = original.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(OpenAsset {
            original,
            staged,
            basedir,
            level,
            doc,
            refs: refs.into_iter(),
            dirty: false,
        })
    }

    fn fail(&mut self, err: color_eyre::Report) -> Option<Result<(FileReference, WalkContext)>> {
        self.finished = true;
        self.current = None;
        Some(Err(err))
    }
}

impl<F: AssetFormat, R: Remap> Iterator for PathWalker<F, R> {
    type Item = Result<(FileReference, WalkContext)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if let Some(open) = self.current.as_mut() {
                if let Some(raw) = open.refs.next() {
                    let resolved = paths::resolve_reference(&raw.path, &open.basedir);
                    let reference = FileReference {
                        path: raw.path,
                        level: open.level,
                        kind: raw.kind,
                        resolved,
                        asset: AssetHandle {
                            staged: open.staged.clone(),
                            field: raw.field,
                        },
                    };
                    let context = WalkContext {
                        asset: open.original.clone(),
                        basedir: open.basedir.clone(),
                    };

                    if self.recursive && reference.kind == BlockKind::Library {
                        if !reference.resolved.is_file() {
                            warn!("library not found: {}", reference.resolved.display());
                        } else if self.visited.insert(&reference.resolved) {
                            self.pending
                                .push_back((reference.resolved.clone(), open.level + 1));
                        }
                    }

                    return Some(Ok((reference, context)));
                }

                if let Some(done) = self.current.take() {
                    if let Err(e) = Self::flush(done) {
                        return self.fail(e);
                    }
                }
            }

            let Some((original, level)) = self.pending.pop_front() else {
                self.finished = true;
                return None;
            };

            match self.open(original, level) {
                Ok(open) => self.current = Some(open),
                Err(e) => return self.fail(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::TextScene;
    use tempfile::TempDir;

    /// Stages every asset next to itself with an `@` suffix
    struct SideBySide {
        calls: Vec<(PathBuf, u32)>,
    }

    impl Remap for SideBySide {
        fn remap(&mut self, original: &Path, level: u32) -> Result<PathBuf> {
            self.calls.push((original.to_path_buf(), level));
            let mut staged = original.as_os_str().to_owned();
            staged.push("@");
            let staged = PathBuf::from(staged);
            std::fs::copy(original, &staged)?;
            Ok(staged)
        }
    }

    fn collect(
        root: &Path,
        recursive: bool,
    ) -> (Vec<(FileReference, WalkContext)>, SideBySide, LibraryVisit) {
        let mut walker = PathWalker::visit(
            TextScene,
            root,
            recursive,
            SideBySide { calls: Vec::new() },
            LibraryVisit::new(),
        )
        .unwrap();
        let items: Vec<_> = walker.by_ref().map(Result::unwrap).collect();
        let (remap, visited) = walker.into_parts().unwrap();
        (items, remap, visited)
    }

    #[test]
    fn test_walk_levels_and_classes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("shot.scene"),
            "image //wood.png\nlibrary //lib.scene\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("lib.scene"), "sound //boom.wav\n").unwrap();

        let (items, remap, visited) = collect(&dir.path().join("shot.scene"), true);
        let classes: Vec<_> = items.iter().map(|(r, _)| (r.level, r.class())).collect();
        assert_eq!(
            classes,
            vec![
                (0, ReferenceClass::Root),
                (0, ReferenceClass::LibraryLink),
                (1, ReferenceClass::GenericBlock),
            ]
        );
        assert_eq!(remap.calls.len(), 2);
        assert_eq!(visited.len(), 2);
        assert!(matches!(
            visited.state(&items[2].1.asset),
            Some(VisitState::Walked(_))
        ));
    }

    #[test]
    fn test_non_recursive_stops_at_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("shot.scene"), "library //lib.scene\n").unwrap();
        std::fs::write(dir.path().join("lib.scene"), "image //a.png\n").unwrap();

        let (items, remap, _) = collect(&dir.path().join("shot.scene"), false);
        assert_eq!(items.len(), 1);
        assert_eq!(remap.calls.len(), 1);
    }

    #[test]
    fn test_cycle_terminates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.scene"), "library //b.scene\n").unwrap();
        std::fs::write(dir.path().join("b.scene"), "library //a.scene\n").unwrap();

        let (items, remap, visited) = collect(&dir.path().join("a.scene"), true);
        assert_eq!(items.len(), 2);
        assert_eq!(remap.calls.len(), 2);
        assert_eq!(visited.len(), 2);
    }

    #[test]
    fn test_missing_library_is_yielded_not_walked() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.scene"), "library //gone.scene\n").unwrap();

        let (items, remap, _) = collect(&dir.path().join("a.scene"), true);
        assert_eq!(items.len(), 1);
        assert_eq!(remap.calls.len(), 1);
    }

    #[test]
    fn test_rewrite_lands_in_staged_copy_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("a.scene");
        std::fs::write(&root, "image //tex/wood.png\n").unwrap();

        let mut walker = PathWalker::visit(
            TextScene,
            &root,
            true,
            SideBySide { calls: Vec::new() },
            LibraryVisit::new(),
        )
        .unwrap();
        let (reference, _) = walker.next().unwrap().unwrap();
        walker.rewrite(&reference, b"//data/wood.png").unwrap();
        assert!(walker.next().is_none());
        walker.into_parts().unwrap();

        assert_eq!(
            std::fs::read_to_string(&root).unwrap(),
            "image //tex/wood.png\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.scene@")).unwrap(),
            "image //data/wood.png\n"
        );
    }

    #[test]
    fn test_rewrite_after_document_closed_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.scene"), "library //b.scene\n").unwrap();
        std::fs::write(dir.path().join("b.scene"), "image //x.png\n").unwrap();

        let mut walker = PathWalker::visit(
            TextScene,
            &dir.path().join("a.scene"),
            true,
            SideBySide { calls: Vec::new() },
            LibraryVisit::new(),
        )
        .unwrap();
        let (first, _) = walker.next().unwrap().unwrap();
        let _ = walker.next().unwrap().unwrap();
        let err = walker.rewrite(&first, b"//b.scene").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BamError>(),
            Some(BamError::StaleReference(_))
        ));
    }
}
