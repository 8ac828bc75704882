//! Compressed bundle archives

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use color_eyre::Result;
use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::manifest::{PackManifest, PathsOps, PATHS_OPS_FILE, encode_json};

/// Streaming writer for a deflate-compressed bundle
pub struct BundleWriter {
    zip: ZipWriter<BufWriter<File>>,
    entries: usize,
}

impl BundleWriter {
    /// Create (or truncate) an archive at `path`
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            zip: ZipWriter::new(BufWriter::new(file)),
            entries: 0,
        })
    }

    fn options() -> SimpleFileOptions {
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated)
    }

    /// Copy the file at `src` into the archive as `name`
    pub fn add_file(&mut self, name: &str, src: &Path) -> Result<()> {
        self.zip.start_file(name, Self::options())?;
        let mut reader = File::open(src)?;
        std::io::copy(&mut reader, &mut self.zip)?;
        self.entries += 1;
        debug!("archived {} as {name}", src.display());
        Ok(())
    }

    /// Store `data` in the archive as `name`
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.zip.start_file(name, Self::options())?;
        self.zip.write_all(data)?;
        self.entries += 1;
        Ok(())
    }

    /// Store the four manifest tables
    pub fn add_manifest(&mut self, manifest: &PackManifest) -> Result<()> {
        for (name, bytes) in manifest.files()? {
            self.add_bytes(name, &bytes)?;
        }
        Ok(())
    }

    /// Store the commit operations table
    pub fn add_ops(&mut self, ops: &PathsOps) -> Result<()> {
        self.add_bytes(PATHS_OPS_FILE, &encode_json(ops)?)
    }

    /// Number of entries written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Write the central directory and flush
    pub fn finish(self) -> Result<()> {
        let mut inner = self.zip.finish()?;
        inner.flush()?;
        Ok(())
    }
}

/// Extract every entry of the archive at `path` into `dir`
///
/// Entry names escaping `dir` are rejected by the zip reader.
pub fn extract(path: &Path, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    archive.extract(dir)?;
    debug!("extracted {} entries into {}", archive.len(), dir.display());
    Ok(())
}

/// Names of every entry in the archive at `path`
pub fn entry_names(path: &Path) -> Result<Vec<String>> {
    let archive = zip::ZipArchive::new(File::open(path)?)?;
    Ok(archive.file_names().map(str::to_string).collect())
}
