//! Pull-driven download producers
//!
//! Each producer is an iterator of encoded frames. A frame is computed only
//! when the consumer asks for it, and files are opened, read and closed within
//! the production of a single frame, so a consumer that stops pulling (or
//! drops the iterator) leaves nothing open behind it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tempfile::NamedTempFile;
use tracing::{debug, error};

use crate::archive::BundleWriter;
use crate::manifest::{PackManifest, PathsRemap};
use crate::pack::Pack;
use crate::paths;
use crate::protocol::{HEADER_LEN, MAGIC, frame, header};
use crate::walker::AssetFormat;

/// Raw bytes read per payload frame when streaming a bundle
pub const PAYLOAD_CHUNK: usize = 64 * 1024;

/// Default raw chunk size of a multi-file download
pub const DOWNLOAD_CHUNK: usize = 4 * 1024 * 1024;

/// zstd level for download chunks
const COMPRESSION_LEVEL: i32 = 3;

/// Encode one frame with its body
#[must_use]
pub fn encode_frame(frame_type: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(&header(frame_type, body.len() as u32));
    buf.put_slice(body);
    buf.freeze()
}

/// Encode a progress message frame
#[must_use]
pub fn message_frame(text: &str) -> Bytes {
    encode_frame(frame::MESSAGE, text.as_bytes())
}

#[must_use]
pub fn magic() -> Bytes {
    Bytes::from_static(MAGIC)
}

fn read_at(path: &Path, offset: u64, max: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::with_capacity(max);
    file.take(max as u64).read_to_end(&mut data)?;
    Ok(data)
}

/// One `Payload` frame streamed from a file: header first, then body slices
pub struct FilePayload {
    path: PathBuf,
    size: u64,
    offset: u64,
    header_sent: bool,
}

impl FilePayload {
    pub fn new(path: &Path) -> Result<Self> {
        let size = std::fs::metadata(path)?.len();
        if u32::try_from(size).is_err() {
            return Err(eyre!("{} is too large for one payload", path.display()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size,
            offset: 0,
            header_sent: false,
        })
    }
}

impl Iterator for FilePayload {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.header_sent {
            self.header_sent = true;
            let head = header(frame::PAYLOAD, self.size as u32);
            return Some(Ok(Bytes::copy_from_slice(&head)));
        }
        if self.offset >= self.size {
            return None;
        }

        match read_at(&self.path, self.offset, PAYLOAD_CHUNK) {
            Ok(data) if data.is_empty() => {
                self.offset = self.size;
                Some(Err(eyre!("{} shrank while sending", self.path.display())))
            }
            Ok(data) => {
                self.offset += data.len() as u64;
                Some(Ok(Bytes::from(data)))
            }
            Err(e) => {
                self.offset = self.size;
                Some(Err(e))
            }
        }
    }
}

struct OpenFile {
    path: PathBuf,
    offset: u64,
    size: u64,
    first: bool,
}

/// Chunked, compressed transfer of repository files
///
/// Yields the magic, then per requested file a message followed by
/// `Payload` / `PayloadAppend` chunks (or `PayloadEmpty` when the file is
/// missing), then `Done`.
pub struct ChunkedDownload {
    root: PathBuf,
    files: VecDeque<String>,
    chunk_size: usize,
    current: Option<OpenFile>,
    started: bool,
    finished: bool,
    queued: VecDeque<Bytes>,
}

impl ChunkedDownload {
    #[must_use]
    pub fn new(root: &Path, files: Vec<String>, chunk_size: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            files: files.into(),
            chunk_size: chunk_size.max(1),
            current: None,
            started: false,
            finished: false,
            queued: VecDeque::new(),
        }
    }

    /// Start the next requested file, queueing its leading frames
    fn open_next(&mut self) -> Result<bool> {
        let Some(rel) = self.files.pop_front() else {
            return Ok(false);
        };

        let path = paths::contained(&self.root, &rel).filter(|p| p.is_file());
        match path {
            Some(path) => {
                let size = std::fs::metadata(&path)?.len();
                debug!("sending {rel} ({size} bytes)");
                self.queued.push_back(message_frame(&format!("downloading: {rel}")));
                self.current = Some(OpenFile {
                    path,
                    offset: 0,
                    size,
                    first: true,
                });
            }
            None => {
                debug!("requested file missing: {rel}");
                self.queued
                    .push_back(message_frame(&format!("source missing: {rel}")));
                self.queued.push_back(encode_frame(frame::PAYLOAD_EMPTY, &[]));
            }
        }
        Ok(true)
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(open) = self.current.as_mut() else {
            return Ok(None);
        };

        let raw = read_at(&open.path, open.offset, self.chunk_size)?;
        open.offset += raw.len() as u64;
        let frame_type = if open.first {
            frame::PAYLOAD
        } else {
            frame::PAYLOAD_APPEND
        };
        open.first = false;
        if raw.is_empty() || open.offset >= open.size {
            self.current = None;
        }

        let compressed = zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)?;
        Ok(Some(encode_frame(frame_type, &compressed)))
    }

    fn step(&mut self) -> Result<Option<Bytes>> {
        if !self.started {
            self.started = true;
            return Ok(Some(magic()));
        }
        loop {
            if let Some(bytes) = self.queued.pop_front() {
                return Ok(Some(bytes));
            }
            if let Some(bytes) = self.next_chunk()? {
                return Ok(Some(bytes));
            }
            if !self.open_next()? {
                self.finished = true;
                return Ok(Some(encode_frame(frame::DONE, &[])));
            }
        }
    }
}

impl Iterator for ChunkedDownload {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(bytes) => bytes.map(Ok),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

enum CheckoutState {
    Magic,
    Packing,
    Payload,
    Done,
}

/// Checkout planning stream: pack progress as messages, then the manifest bundle
pub struct CheckoutStream<F: AssetFormat> {
    state: CheckoutState,
    label: String,
    pack: Option<Pack<F>>,
    manifest: Option<PackManifest>,
    extra_remap: PathsRemap,
    bundle: Option<NamedTempFile>,
    payload: Option<FilePayload>,
}

impl<F: AssetFormat> CheckoutStream<F> {
    /// Stream the progress of `pack`, then its manifest
    pub fn from_pack(label: &str, pack: Pack<F>, extra_remap: PathsRemap) -> Self {
        Self::new(label, Some(pack), None, extra_remap)
    }

    /// Stream a manifest computed up front
    pub fn from_manifest(label: &str, manifest: PackManifest, extra_remap: PathsRemap) -> Self {
        Self::new(label, None, Some(manifest), extra_remap)
    }

    fn new(
        label: &str,
        pack: Option<Pack<F>>,
        manifest: Option<PackManifest>,
        extra_remap: PathsRemap,
    ) -> Self {
        Self {
            state: CheckoutState::Magic,
            label: label.to_string(),
            pack,
            manifest,
            extra_remap,
            bundle: None,
            payload: None,
        }
    }

    /// Write the manifest-only bundle and start streaming it
    fn seal(&mut self) -> Result<()> {
        let mut manifest = match (self.pack.take(), self.manifest.take()) {
            (Some(pack), _) => pack.into_manifest(),
            (None, Some(manifest)) => manifest,
            (None, None) => return Err(eyre!("checkout has nothing to send")),
        };
        manifest.paths_remap.append(&mut self.extra_remap);

        let bundle = tempfile::Builder::new()
            .prefix("bam-checkout")
            .suffix(".zip")
            .tempfile()?;
        let mut writer = BundleWriter::create(bundle.path())?;
        writer.add_manifest(&manifest)?;
        writer.finish()?;

        self.payload = Some(FilePayload::new(bundle.path())?);
        self.bundle = Some(bundle);
        Ok(())
    }

    fn step(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                CheckoutState::Magic => {
                    self.state = CheckoutState::Packing;
                    return Ok(Some(magic()));
                }
                CheckoutState::Packing => {
                    if let Some(pack) = self.pack.as_mut() {
                        match pack.next() {
                            Some(Ok(line)) => return Ok(Some(message_frame(&line))),
                            Some(Err(e)) => {
                                error!("failed to pack {}: {e:#}", self.label);
                                self.state = CheckoutState::Done;
                                self.pack = None;
                                return Err(e.wrap_err(format!("failed to extract: {}", self.label)));
                            }
                            None => {}
                        }
                    }
                    self.seal()?;
                    self.state = CheckoutState::Payload;
                }
                CheckoutState::Payload => {
                    match self.payload.as_mut().and_then(Iterator::next) {
                        Some(chunk) => return chunk.map(Some),
                        None => {
                            self.state = CheckoutState::Done;
                            self.payload = None;
                            self.bundle = None;
                        }
                    }
                }
                CheckoutState::Done => return Ok(None),
            }
        }
    }
}

impl<F: AssetFormat> Iterator for CheckoutStream<F> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(bytes) => bytes.map(Ok),
            Err(e) => {
                self.state = CheckoutState::Done;
                Some(Err(e))
            }
        }
    }
}
