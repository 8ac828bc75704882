//! Copy-on-write staging of every asset a pack touches
//!
//! Each distinct original asset is copied exactly once into the staging
//! area under its destination-relative name plus [`TEMP_SUFFIX`]; later
//! visits reuse the same copy so rewrites accumulate on it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::debug;

use crate::hash::ContentHash;
use crate::paths;
use crate::walker::Remap;

/// Subdirectory holding every non-root asset of a bundle
pub const DATA_DIR: &str = "data";

/// Suffix carried by staged copies until the final rename
pub const TEMP_SUFFIX: &str = "@";

/// A staged copy of one original asset
#[derive(Debug, Clone)]
pub struct StagedAsset {
    pub original: PathBuf,
    pub staged: PathBuf,
    /// Destination-relative path, e.g. `data/chars.scene`
    pub dest_rel: String,
    pub level: u32,
    /// Reused by a later visit after the first copy
    pub touched: bool,
}

/// Allocates unique file names under `data/`
///
/// The first original to claim a name keeps it. A later, different original
/// with the same file name gets `<stem>.<8 hex of its path hash>.<ext>`.
#[derive(Debug, Default)]
pub struct DestinationNames {
    by_name: HashMap<String, PathBuf>,
    by_original: HashMap<PathBuf, String>,
}

impl DestinationNames {
    /// Keep `name` from being handed out; later claims on it are disambiguated
    pub fn reserve(&mut self, name: &str) {
        self.by_name.entry(name.to_string()).or_default();
    }

    /// Name under `data/` for `original`, stable across calls
    pub fn claim(&mut self, original: &Path) -> String {
        if let Some(name) = self.by_original.get(original) {
            return name.clone();
        }

        let base = paths::file_name(original);
        let mut name = base.clone();
        if self.by_name.contains_key(&name) {
            let tag = ContentHash::from_bytes(original.as_os_str().as_encoded_bytes()).to_hex();
            name = disambiguate(&base, &tag[..8]);
            let mut n = 1;
            while self.by_name.contains_key(&name) {
                name = disambiguate(&base, &format!("{}-{n}", &tag[..8]));
                n += 1;
            }
            debug!("name collision on {base}, using {name}");
        }

        self.by_name.insert(name.clone(), original.to_path_buf());
        self.by_original.insert(original.to_path_buf(), name.clone());
        name
    }
}

fn disambiguate(name: &str, tag: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{tag}.{ext}"),
        _ => format!("{name}.{tag}"),
    }
}

/// Staging area owned by one pack invocation
#[derive(Debug)]
pub struct TempStaging {
    base: PathBuf,
    root_name: String,
    root_original: Option<PathBuf>,
    names: DestinationNames,
    assets: BTreeMap<PathBuf, StagedAsset>,
}

impl TempStaging {
    /// Stage under `base`; the root asset is staged as `root_name`
    ///
    /// No `data/` asset shares the root's file name, so per-asset tables
    /// keyed by file name (the deps remap) stay unambiguous.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, root_name: impl Into<String>) -> Self {
        let root_name = root_name.into();
        let mut names = DestinationNames::default();
        names.reserve(&root_name);
        Self {
            base: base.into(),
            root_name,
            root_original: None,
            names,
            assets: BTreeMap::new(),
        }
    }

    /// Destination-relative path `original` occupies in the bundle
    pub fn destination_of(&mut self, original: &Path) -> String {
        if let Some(asset) = self.assets.get(original) {
            return asset.dest_rel.clone();
        }
        if self.root_original.as_deref() == Some(original) {
            return self.root_name.clone();
        }
        self.data_path(original)
    }

    /// Claim a `data/` slot for a file that will be copied
    pub fn data_path(&mut self, original: &Path) -> String {
        format!("{DATA_DIR}/{}", self.names.claim(original))
    }

    /// Every staged asset, ordered by original path
    pub fn assets(&self) -> impl Iterator<Item = &StagedAsset> {
        self.assets.values()
    }

    /// The staged root asset, once the walk has opened it
    #[must_use]
    pub fn root(&self) -> Option<&StagedAsset> {
        self.root_original
            .as_ref()
            .and_then(|original| self.assets.get(original))
    }

    /// Strip [`TEMP_SUFFIX`] from every staged copy, leaving the final tree
    ///
    /// # Errors
    /// Returns an error if a rename fails
    pub fn finalize_in_place(&mut self) -> Result<()> {
        for asset in self.assets.values_mut() {
            let final_path = self.base.join(&asset.dest_rel);
            std::fs::rename(&asset.staged, &final_path)?;
            debug!("finalized {}", final_path.display());
            asset.staged = final_path;
        }
        Ok(())
    }

    /// Remove staged copies after a failed pack
    pub fn discard(&self) {
        for asset in self.assets.values() {
            if let Err(e) = std::fs::remove_file(&asset.staged) {
                debug!("could not remove {}: {e}", asset.staged.display());
            }
        }
    }
}

impl Remap for TempStaging {
    fn remap(&mut self, original: &Path, level: u32) -> Result<PathBuf> {
        if let Some(asset) = self.assets.get_mut(original) {
            asset.touched = true;
            return Ok(asset.staged.clone());
        }

        let dest_rel = if level == 0 {
            self.root_original = Some(original.to_path_buf());
            self.root_name.clone()
        } else {
            self.data_path(original)
        };

        let staged = self.base.join(format!("{dest_rel}{TEMP_SUFFIX}"));
        if let Some(parent) = staged.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(original, &staged)?;
        debug!("staged {} -> {}", original.display(), staged.display());

        self.assets.insert(
            original.to_path_buf(),
            StagedAsset {
                original: original.to_path_buf(),
                staged: staged.clone(),
                dest_rel,
                level,
                touched: false,
            },
        );
        Ok(staged)
    }
}
