//! Pack manifests and their canonical encodings
//!
//! JSON tables are written with sorted keys and four-space indentation so the
//! same manifest always produces the same bytes. Binary edits are an rkyv blob
//! the packer records and clients replay; nothing else interprets it.

use std::collections::BTreeMap;
use std::path::Path;

use color_eyre::Result;
use rkyv::rancor::Error as RkyvError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BamError;
use crate::hash::ContentHash;
use crate::walker::{AssetDocument, AssetFormat};

/// `{asset name: {new path: old path}}`
pub const DEPS_REMAP_FILE: &str = ".bam_deps_remap.json";
/// `{destination-relative path: original path}`
pub const PATHS_REMAP_FILE: &str = ".bam_paths_remap.json";
/// `{destination-relative path: content hash}`
pub const PATHS_UUID_FILE: &str = ".bam_paths_uuid.json";
/// `{path: "A" | "D"}`
pub const PATHS_OPS_FILE: &str = ".bam_paths_ops.json";
/// Opaque binary patch records
pub const PATHS_EDIT_FILE: &str = ".bam_paths_edit.data";

/// Keyed by the owning asset's file name, unique within one bundle
pub type DepsRemap = BTreeMap<String, BTreeMap<String, String>>;
pub type PathsRemap = BTreeMap<String, String>;
pub type PathsUuid = BTreeMap<String, ContentHash>;
pub type PathsOps = BTreeMap<String, PathOp>;

/// Operation applied to the repository's tracked-file set on commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathOp {
    #[serde(rename = "A")]
    Add,
    #[serde(rename = "D")]
    Delete,
}

/// One rewritten path field inside an asset
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct PathEdit {
    pub field: u32,
    pub path: Vec<u8>,
}

/// Path rewrites keyed by destination-relative asset path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryEdits {
    pub assets: BTreeMap<String, Vec<PathEdit>>,
}

impl BinaryEdits {
    pub fn record(&mut self, asset: &str, edit: PathEdit) {
        self.assets.entry(asset.to_string()).or_default().push(edit);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// The edits of the assets `keep` accepts
    #[must_use]
    pub fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            assets: self
                .assets
                .iter()
                .filter(|(asset, _)| keep(asset))
                .map(|(asset, edits)| (asset.clone(), edits.clone()))
                .collect(),
        }
    }

    /// Encode as the `.bam_paths_edit.data` blob
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<RkyvError>(&self.assets)
            .map_err(|e| color_eyre::eyre::eyre!("failed to serialize binary edits: {e}"))?;
        Ok(bytes.to_vec())
    }

    /// Decode a `.bam_paths_edit.data` blob
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let assets = rkyv::from_bytes::<BTreeMap<String, Vec<PathEdit>>, RkyvError>(&aligned)
            .map_err(|e| BamError::Manifest {
                name: PATHS_EDIT_FILE.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { assets })
    }

    /// Replay recorded rewrites onto the assets found under `dir`
    ///
    /// Returns the number of assets rewritten. Assets absent from `dir` are
    /// skipped, so a partial download replays what it has.
    pub fn apply<F: AssetFormat>(&self, format: &F, dir: &Path) -> Result<usize> {
        let mut applied = 0;
        for (asset, edits) in &self.assets {
            let path = dir.join(asset);
            if !path.is_file() || !format.accepts(&path) {
                continue;
            }
            let mut doc = format.open(&path)?;
            for edit in edits {
                doc.set_path(edit.field, &edit.path)?;
            }
            doc.save(&path)?;
            debug!("replayed {} edits on {asset}", edits.len());
            applied += 1;
        }
        Ok(applied)
    }
}

/// The four tables produced by one pack invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackManifest {
    pub deps_remap: DepsRemap,
    pub paths_remap: PathsRemap,
    pub paths_uuid: PathsUuid,
    pub binary_edits: BinaryEdits,
}

impl PackManifest {
    /// Encoded manifest files as `(file name, bytes)` pairs
    pub fn files(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        Ok(vec![
            (DEPS_REMAP_FILE, encode_json(&self.deps_remap)?),
            (PATHS_REMAP_FILE, encode_json(&self.paths_remap)?),
            (PATHS_UUID_FILE, encode_json(&self.paths_uuid)?),
            (PATHS_EDIT_FILE, self.binary_edits.encode()?),
        ])
    }

    /// Write every manifest file into `dir`
    pub fn write_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (name, bytes) in self.files()? {
            std::fs::write(dir.join(name), bytes)?;
        }
        Ok(())
    }

    /// Read manifest files from `dir`; absent tables decode as empty
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<Option<Vec<u8>>> {
            let path = dir.join(name);
            if path.is_file() {
                Ok(Some(std::fs::read(path)?))
            } else {
                Ok(None)
            }
        };

        let deps_remap = match read(DEPS_REMAP_FILE)? {
            Some(bytes) => decode_json(DEPS_REMAP_FILE, &bytes)?,
            None => DepsRemap::default(),
        };
        let paths_remap = match read(PATHS_REMAP_FILE)? {
            Some(bytes) => decode_json(PATHS_REMAP_FILE, &bytes)?,
            None => PathsRemap::default(),
        };
        let paths_uuid = match read(PATHS_UUID_FILE)? {
            Some(bytes) => decode_json(PATHS_UUID_FILE, &bytes)?,
            None => PathsUuid::default(),
        };
        let binary_edits = match read(PATHS_EDIT_FILE)? {
            Some(bytes) => BinaryEdits::decode(&bytes)?,
            None => BinaryEdits::default(),
        };

        Ok(Self {
            deps_remap,
            paths_remap,
            paths_uuid,
            binary_edits,
        })
    }
}

/// Canonical JSON: sorted keys, four-space indent, `": "` separators
pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    Ok(out)
}

/// Decode a JSON manifest table, naming the table on failure
pub fn decode_json<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        BamError::Manifest {
            name: name.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Read and decode one JSON manifest file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    decode_json(&name, &std::fs::read(path)?)
}

/// Encode and write one JSON manifest file
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, encode_json(value)?)?;
    Ok(())
}
