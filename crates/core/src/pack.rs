//! Dependency packer
//!
//! Walks a scene and everything it links, rewrites every path field in staged
//! copies so the result is relocatable, and lays the closure out as a flat
//! directory (`FILE`), a compressed archive (`ZIP`) or nothing at all
//! (`NONE`, manifest only).
//!
//! [`Pack`] is a pull-driven iterator of progress lines. Each call to `next`
//! does at most one unit of work (one reference, one copy), so dropping the
//! iterator cancels the pack; staged temp files are removed when that happens
//! before the final rename.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::archive::BundleWriter;
use crate::error::BamError;
use crate::hash::ContentHash;
use crate::manifest::{PackManifest, PathEdit};
use crate::paths;
use crate::staging::{DATA_DIR, TempStaging};
use crate::walker::{AssetFormat, FileReference, LibraryVisit, PathWalker, ReferenceClass, WalkContext};

/// Output layout of a pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    /// Directory tree rooted at the destination's parent
    File,
    /// Deflate archive written to the destination path
    Zip,
    /// Manifest only; nothing under the destination is touched
    None,
}

impl FromStr for PackMode {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FILE" => Ok(Self::File),
            "ZIP" => Ok(Self::Zip),
            "NONE" => Ok(Self::None),
            other => Err(BamError::UnknownPackMode(other.to_string()).into()),
        }
    }
}

impl fmt::Display for PackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "FILE",
            Self::Zip => "ZIP",
            Self::None => "NONE",
        })
    }
}

/// Knobs for one pack invocation
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct PackOptions {
    /// Descend into linked libraries
    pub recursive: bool,
    /// Record `paths_remap` sources relative to this directory
    pub remap_relbase: Option<PathBuf>,
    pub track_deps_remap: bool,
    pub track_paths_remap: bool,
    pub track_paths_uuid: bool,
    pub track_binary_edits: bool,
    /// Store the manifest files inside FILE and ZIP bundles
    pub write_manifest: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            remap_relbase: None,
            track_deps_remap: true,
            track_paths_remap: true,
            track_paths_uuid: true,
            track_binary_edits: true,
            write_manifest: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Walk,
    Archive,
    Copy,
    Finish,
    Done,
}

#[derive(Debug)]
enum CopyAction {
    Copy { src: PathBuf, dest_rel: String },
    Missing(PathBuf),
}

/// A running pack, yielding one progress line per step
pub struct Pack<F: AssetFormat> {
    mode: PackMode,
    options: PackOptions,
    source: PathBuf,
    destination: PathBuf,
    base_dir: PathBuf,
    phase: Phase,
    walker: Option<PathWalker<F, TempStaging>>,
    staging: Option<TempStaging>,
    stage_dir: Option<TempDir>,
    zip: Option<BundleWriter>,
    finalized: bool,
    copies: BTreeMap<String, PathBuf>,
    pending: VecDeque<CopyAction>,
    manifest: PackManifest,
    last_asset: Option<PathBuf>,
    started: Instant,
}

/// Start packing `source` into `destination`
pub fn pack<F: AssetFormat>(
    format: F,
    source: &Path,
    destination: &Path,
    mode: PackMode,
    options: PackOptions,
) -> Result<Pack<F>> {
    Pack::new(format, source, destination, mode, options)
}

impl<F: AssetFormat> Pack<F> {
    pub fn new(
        format: F,
        source: &Path,
        destination: &Path,
        mode: PackMode,
        options: PackOptions,
    ) -> Result<Self> {
        let source = paths::absolute(source)?;
        let destination = paths::absolute(destination)?;
        let base_dir = destination
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| eyre!("destination {} has no parent", destination.display()))?;

        let (staging_base, stage_dir, root_name) = match mode {
            PackMode::File => {
                std::fs::create_dir_all(base_dir.join(DATA_DIR))?;
                (base_dir.clone(), None, paths::file_name(&destination))
            }
            PackMode::Zip => {
                std::fs::create_dir_all(&base_dir)?;
                let dir = tempfile::Builder::new()
                    .prefix(".bam-stage")
                    .tempdir_in(&base_dir)?;
                (dir.path().to_path_buf(), Some(dir), paths::file_name(&source))
            }
            PackMode::None => {
                let dir = tempfile::tempdir()?;
                (dir.path().to_path_buf(), Some(dir), paths::file_name(&destination))
            }
        };
        debug!(
            "pack {} -> {} ({mode}), staging in {}",
            source.display(),
            destination.display(),
            staging_base.display()
        );

        let staging = TempStaging::new(staging_base, root_name);
        let walker = PathWalker::visit(
            format,
            &source,
            options.recursive,
            staging,
            LibraryVisit::new(),
        )?;

        Ok(Self {
            mode,
            options,
            source,
            destination,
            base_dir,
            phase: Phase::Scan,
            walker: Some(walker),
            staging: None,
            stage_dir,
            zip: None,
            finalized: false,
            copies: BTreeMap::new(),
            pending: VecDeque::new(),
            manifest: PackManifest::default(),
            last_asset: None,
            started: Instant::now(),
        })
    }

    /// Drive the pack to completion, handing each progress line to `report`
    pub fn run(mut self, mut report: impl FnMut(&str)) -> Result<PackManifest> {
        for line in self.by_ref() {
            report(&line?);
        }
        Ok(self.into_manifest())
    }

    /// The manifest built so far; complete once the iterator is exhausted
    #[must_use]
    pub fn manifest(&self) -> &PackManifest {
        &self.manifest
    }

    #[must_use]
    pub fn into_manifest(mut self) -> PackManifest {
        std::mem::take(&mut self.manifest)
    }

    fn walk_step(&mut self) -> Result<Option<String>> {
        let Some(walker) = self.walker.as_mut() else {
            return Err(eyre!("walk already finished"));
        };
        match walker.next() {
            Some(item) => {
                let (reference, context) = item?;
                self.relocate(&reference, &context)
            }
            None => {
                self.finish_walk()?;
                self.phase = Phase::Archive;
                let count = self.pending.len()
                    + self.staging.as_ref().map_or(0, |s| s.assets().count());
                Ok(Some(format!("archiving: {count} files")))
            }
        }
    }

    /// Rewrite one reference to its place in the bundle
    fn relocate(
        &mut self,
        reference: &FileReference,
        context: &WalkContext,
    ) -> Result<Option<String>> {
        let walker = self
            .walker
            .as_mut()
            .ok_or_else(|| eyre!("walk already finished"))?;
        let staging = walker.remap_mut();
        let owner_rel = staging.destination_of(&context.asset);

        let target_rel = match reference.class() {
            ReferenceClass::LibraryLink => {
                let rel = staging.destination_of(&reference.resolved);
                // without recursion the library is never staged, ship it as is
                if !self.options.recursive {
                    self.copies
                        .entry(rel.clone())
                        .or_insert_with(|| reference.resolved.clone());
                }
                rel
            }
            ReferenceClass::Root | ReferenceClass::GenericBlock => {
                let rel = staging.data_path(&reference.resolved);
                self.copies
                    .entry(rel.clone())
                    .or_insert_with(|| reference.resolved.clone());
                rel
            }
        };

        let new_path = relocated_path(&owner_rel, &target_rel);
        walker.rewrite(reference, new_path.as_bytes())?;

        let old_path = String::from_utf8_lossy(&reference.path).into_owned();
        debug!("{owner_rel}: {old_path} -> {new_path}");
        if self.options.track_deps_remap {
            self.manifest
                .deps_remap
                .entry(paths::file_name(Path::new(&owner_rel)))
                .or_default()
                .insert(new_path.clone(), old_path);
        }
        if self.options.track_binary_edits {
            self.manifest.binary_edits.record(
                &owner_rel,
                PathEdit {
                    field: reference.asset.field,
                    path: new_path.into_bytes(),
                },
            );
        }

        if self.last_asset.as_ref() == Some(&context.asset) {
            return Ok(None);
        }
        self.last_asset = Some(context.asset.clone());
        Ok(Some(format!("  scene: {}", context.asset.display())))
    }

    fn finish_walk(&mut self) -> Result<()> {
        let walker = self
            .walker
            .take()
            .ok_or_else(|| eyre!("walk already finished"))?;
        let (staging, visited) = walker.into_parts()?;
        debug!(
            "walked {} assets in {:.3}s",
            visited.len(),
            self.started.elapsed().as_secs_f64()
        );

        let relbase = self.options.remap_relbase.as_deref();
        let staged: BTreeSet<&str> = staging.assets().map(|a| a.dest_rel.as_str()).collect();

        for asset in staging.assets() {
            if self.options.track_paths_remap {
                self.manifest
                    .paths_remap
                    .insert(asset.dest_rel.clone(), source_string(&asset.original, relbase));
            }
            if self.options.track_paths_uuid {
                self.manifest
                    .paths_uuid
                    .insert(asset.dest_rel.clone(), ContentHash::from_file(&asset.staged)?);
            }
        }

        for (dest_rel, src) in &self.copies {
            if staged.contains(dest_rel.as_str()) {
                continue;
            }
            if !src.is_file() {
                warn!("{}", BamError::MissingSource(src.clone()));
                self.pending.push_back(CopyAction::Missing(src.clone()));
                continue;
            }
            if self.options.track_paths_remap {
                self.manifest
                    .paths_remap
                    .insert(dest_rel.clone(), source_string(src, relbase));
            }
            if self.options.track_paths_uuid {
                self.manifest
                    .paths_uuid
                    .insert(dest_rel.clone(), ContentHash::from_file(src)?);
            }
            self.pending.push_back(CopyAction::Copy {
                src: src.clone(),
                dest_rel: dest_rel.clone(),
            });
        }

        self.staging = Some(staging);
        Ok(())
    }

    /// Move staged assets into the bundle
    fn archive_staged(&mut self) -> Result<()> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| eyre!("nothing staged"))?;
        match self.mode {
            PackMode::File => {
                staging.finalize_in_place()?;
                self.finalized = true;
            }
            PackMode::Zip => {
                let mut zip = BundleWriter::create(&self.destination)?;
                for asset in staging.assets() {
                    zip.add_file(&asset.dest_rel, &asset.staged)?;
                }
                self.zip = Some(zip);
            }
            PackMode::None => {}
        }
        Ok(())
    }

    fn copy_step(&mut self) -> Result<Option<String>> {
        let Some(action) = self.pending.pop_front() else {
            self.phase = Phase::Finish;
            return Ok(None);
        };

        match action {
            CopyAction::Missing(src) => Ok(Some(format!("  source missing: {}", src.display()))),
            CopyAction::Copy { src, dest_rel } => match self.mode {
                PackMode::File => {
                    let dst = self.base_dir.join(&dest_rel);
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(&src, &dst)?;
                    Ok(Some(format!("  copying: {} -> {}", src.display(), dst.display())))
                }
                PackMode::Zip => {
                    let zip = self
                        .zip
                        .as_mut()
                        .ok_or_else(|| eyre!("archive not open"))?;
                    zip.add_file(&dest_rel, &src)?;
                    Ok(Some(format!("  copying: {} -> <archive>", src.display())))
                }
                PackMode::None => Ok(None),
            },
        }
    }

    fn finish(&mut self) -> Result<Option<String>> {
        self.phase = Phase::Done;
        match self.mode {
            PackMode::File => {
                if self.options.write_manifest {
                    self.manifest.write_dir(&self.base_dir)?;
                }
            }
            PackMode::Zip => {
                let mut zip = self.zip.take().ok_or_else(|| eyre!("archive not open"))?;
                if self.options.write_manifest {
                    zip.add_manifest(&self.manifest)?;
                }
                zip.finish()?;
            }
            PackMode::None => {}
        }
        if let Some(dir) = self.stage_dir.take() {
            dir.close()?;
        }

        info!(
            "packed {} ({} files, {:.3}s)",
            self.source.display(),
            self.manifest.paths_remap.len(),
            self.started.elapsed().as_secs_f64()
        );
        Ok(match self.mode {
            PackMode::None => None,
            PackMode::File | PackMode::Zip => {
                Some(format!("  written: {}", self.destination.display()))
            }
        })
    }

    /// Remove partial output; staged copies go unless already renamed
    fn cleanup(&mut self) {
        if let Some(walker) = self.walker.take() {
            walker.abandon().discard();
        }
        if let Some(staging) = self.staging.take() {
            if !self.finalized {
                staging.discard();
            }
        }
        if self.zip.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.destination) {
                debug!("could not remove {}: {e}", self.destination.display());
            }
        }
        self.stage_dir = None;
    }

    fn fail(&mut self, err: color_eyre::Report) -> Option<Result<String>> {
        self.phase = Phase::Done;
        self.cleanup();
        Some(Err(err))
    }
}

impl<F: AssetFormat> Iterator for Pack<F> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = match self.phase {
                Phase::Scan => {
                    self.phase = Phase::Walk;
                    return Some(Ok(format!("scanning deps: {}", self.source.display())));
                }
                Phase::Walk => self.walk_step(),
                Phase::Archive => self.archive_staged().map(|()| {
                    self.phase = Phase::Copy;
                    None
                }),
                Phase::Copy => self.copy_step(),
                Phase::Finish => self.finish(),
                Phase::Done => return None,
            };

            match step {
                Ok(Some(line)) => return Some(Ok(line)),
                Ok(None) => {}
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<F: AssetFormat> Drop for Pack<F> {
    fn drop(&mut self) {
        if self.phase != Phase::Done {
            debug!("pack of {} cancelled", self.source.display());
            self.cleanup();
        }
    }
}

/// `//`-prefixed path from the asset at `owner_rel` to `target_rel`
fn relocated_path(owner_rel: &str, target_rel: &str) -> String {
    let owner_dir = Path::new(owner_rel).parent().unwrap_or(Path::new(""));
    let rel = paths::relative_to(Path::new(target_rel), owner_dir);
    format!("//{}", paths::manifest_string(&rel))
}

fn source_string(path: &Path, relbase: Option<&Path>) -> String {
    match relbase {
        Some(base) => paths::manifest_string(&paths::relative_to(path, base)),
        None => paths::manifest_string(path),
    }
}
