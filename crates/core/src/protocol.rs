//! BAM wire protocol
//!
//! Every exchange is one stream per direction (all integers little-endian):
//!
//! ```text
//! +----------+
//! | "BAM\0"  |  magic, once
//! +----------+----------+------------------+
//! | type u32 | len u32  | body (len bytes) |  repeated frames
//! +----------+----------+------------------+
//! ```
//!
//! Frame types:
//! - 0x01: Message (utf-8 progress text)
//! - 0x02: Payload (a whole bundle, or the first chunk of a file)
//! - 0x03: PayloadAppend (next chunk of the current file)
//! - 0x04: PayloadEmpty (requested file does not exist, len 0)
//! - 0x05: Done (end of a multi-file transfer, len 0)
//! - 0x10: Request (JSON command sent by the client)
//! - 0x11: Error (utf-8 text; ends the exchange)
//!
//! A download is `magic, Message*, Payload` for a single bundle, or
//! `magic, (Message* (Payload PayloadAppend* | PayloadEmpty))*, Done` for a
//! chunked multi-file transfer where every chunk is zstd compressed on its own.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BamError;

/// Stream header
pub const MAGIC: &[u8; 4] = b"BAM\0";

/// Frame header size in bytes
pub const HEADER_LEN: usize = 8;

/// Largest body of a message, request or error frame
pub const MAX_CONTROL_FRAME: u32 = 1 << 20;

/// Largest decompressed size of one download chunk
pub const MAX_DOWNLOAD_CHUNK: usize = 64 * 1024 * 1024;

/// Frame type identifiers
pub mod frame {
    pub const MESSAGE: u32 = 0x01;
    pub const PAYLOAD: u32 = 0x02;
    pub const PAYLOAD_APPEND: u32 = 0x03;
    pub const PAYLOAD_EMPTY: u32 = 0x04;
    pub const DONE: u32 = 0x05;
    pub const REQUEST: u32 = 0x10;
    pub const ERROR: u32 = 0x11;
}

/// Encode a frame header (type + length)
#[must_use]
pub fn header(frame_type: u32, len: u32) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&frame_type.to_le_bytes());
    buf[4..].copy_from_slice(&len.to_le_bytes());
    buf
}

/// Write a frame header
fn write_header<W: Write>(w: &mut W, frame_type: u32, len: u32) -> std::io::Result<()> {
    w.write_all(&header(frame_type, len))
}

/// Read a frame header, returns (type, length)
fn read_header<R: Read>(r: &mut R) -> std::io::Result<(u32, u32)> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    let frame_type = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((frame_type, len))
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| eyre!("frame body of {len} bytes exceeds the 4 GiB limit"))
}

/// Download progress as a whole percentage
#[must_use]
pub fn percent(received: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        received.saturating_mul(100) / total
    }
}

/// Command sent by a client in a `Request` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    /// Plan a checkout: manifest-only bundle for `path`
    Checkout {
        path: String,
        #[serde(default)]
        all_deps: bool,
    },
    /// Chunked download of repository files
    CheckoutDownload { files: Vec<String> },
    /// Upload bundle follows as a `Payload` frame
    Commit {
        message: String,
        #[serde(default)]
        user: Option<String>,
    },
    List { path: String },
    Info { path: String },
    /// Prepare a full ZIP bundle in the background
    Bundle { path: String },
}

impl Request {
    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Checkout { .. } => "checkout",
            Self::CheckoutDownload { .. } => "checkout_download",
            Self::Commit { .. } => "commit",
            Self::List { .. } => "list",
            Self::Info { .. } => "info",
            Self::Bundle { .. } => "bundle",
        }
    }
}

/// Background bundle build state as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Building,
    Available,
    Failed,
}

/// Kind of a listed repository entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// JSON body of a control reply's `Payload` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Listing {
        path: String,
        entries: Vec<ListEntry>,
    },
    Info {
        path: String,
        size: u64,
        bundle_status: Option<BundleStatus>,
    },
    Bundle {
        status: BundleStatus,
        bundle_path: Option<String>,
    },
    Committed {
        output: String,
    },
}

/// Protocol writer for sending frames
pub struct ProtocolWriter<W> {
    inner: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send the stream header
    pub fn send_magic(&mut self) -> Result<()> {
        self.inner.write_all(MAGIC)?;
        Ok(())
    }

    /// Send a progress message, flushed immediately
    pub fn send_message(&mut self, text: &str) -> Result<()> {
        let body = text.as_bytes();
        write_header(&mut self.inner, frame::MESSAGE, frame_len(body.len())?)?;
        self.inner.write_all(body)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send a client request
    pub fn send_request(&mut self, request: &Request) -> Result<()> {
        let body = serde_json::to_vec(request)?;
        write_header(&mut self.inner, frame::REQUEST, frame_len(body.len())?)?;
        self.inner.write_all(&body)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send an in-memory payload
    pub fn send_payload(&mut self, data: &[u8]) -> Result<()> {
        write_header(&mut self.inner, frame::PAYLOAD, frame_len(data.len())?)?;
        self.inner.write_all(data)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Stream the file at `path` as one payload
    pub fn send_payload_file(&mut self, path: &Path) -> Result<u64> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let len = u32::try_from(size)
            .map_err(|_| eyre!("{} is too large for one payload", path.display()))?;
        write_header(&mut self.inner, frame::PAYLOAD, len)?;
        let copied = std::io::copy(&mut (&mut file).take(size), &mut self.inner)?;
        if copied != size {
            return Err(eyre!("{} shrank while sending", path.display()));
        }
        self.inner.flush()?;
        Ok(size)
    }

    /// Send a continuation chunk of the current file
    pub fn send_append(&mut self, data: &[u8]) -> Result<()> {
        write_header(&mut self.inner, frame::PAYLOAD_APPEND, frame_len(data.len())?)?;
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Mark a requested file as missing
    pub fn send_empty(&mut self) -> Result<()> {
        write_header(&mut self.inner, frame::PAYLOAD_EMPTY, 0)?;
        Ok(())
    }

    /// End a multi-file transfer
    pub fn send_done(&mut self) -> Result<()> {
        write_header(&mut self.inner, frame::DONE, 0)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send a server error, ending the exchange
    pub fn send_error(&mut self, message: &str) -> Result<()> {
        let body = message.as_bytes();
        write_header(&mut self.inner, frame::ERROR, frame_len(body.len())?)?;
        self.inner.write_all(body)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Send a control reply as a JSON payload
    pub fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        let body = serde_json::to_vec(reply)?;
        self.send_payload(&body)
    }

    /// Write pre-encoded frame bytes
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Get mutable access to the inner writer
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Frame received from the protocol
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Message(String),
    /// Body of `len` bytes follows and is left unread
    Payload(u32),
    /// Body of `len` bytes follows and is left unread
    PayloadAppend(u32),
    PayloadEmpty,
    Done,
    Request(Request),
    Error(String),
}

impl Frame {
    fn describe(&self) -> String {
        match self {
            Self::Message(_) => "message".into(),
            Self::Payload(len) => format!("payload ({len} bytes)"),
            Self::PayloadAppend(len) => format!("payload append ({len} bytes)"),
            Self::PayloadEmpty => "payload empty".into(),
            Self::Done => "done".into(),
            Self::Request(r) => format!("request {}", r.name()),
            Self::Error(_) => "error".into(),
        }
    }
}

/// Protocol reader for receiving frames
pub struct ProtocolReader<R> {
    inner: R,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read and check the stream header
    pub fn read_magic(&mut self) -> Result<()> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        if &buf != MAGIC {
            return Err(BamError::BadMagic(buf).into());
        }
        Ok(())
    }

    /// Read the next frame header, plus the body of text and request frames
    pub fn read_frame(&mut self) -> Result<Frame> {
        let (frame_type, len) = read_header(&mut self.inner)?;

        match frame_type {
            frame::MESSAGE => {
                let body = self.read_control(frame_type, len)?;
                Ok(Frame::Message(String::from_utf8_lossy(&body).into_owned()))
            }
            frame::PAYLOAD => Ok(Frame::Payload(len)),
            frame::PAYLOAD_APPEND => Ok(Frame::PayloadAppend(len)),
            frame::PAYLOAD_EMPTY => {
                self.skip(len)?;
                Ok(Frame::PayloadEmpty)
            }
            frame::DONE => {
                self.skip(len)?;
                Ok(Frame::Done)
            }
            frame::REQUEST => {
                let body = self.read_control(frame_type, len)?;
                let request = serde_json::from_slice(&body)
                    .map_err(|e| eyre!("malformed request: {e}"))?;
                Ok(Frame::Request(request))
            }
            frame::ERROR => {
                let body = self.read_control(frame_type, len)?;
                Ok(Frame::Error(String::from_utf8_lossy(&body).into_owned()))
            }
            other => Err(BamError::UnknownFrame(other).into()),
        }
    }

    /// Turn a frame a receiver cannot use into an error
    fn reject(frame: Frame) -> color_eyre::Report {
        match frame {
            Frame::Error(message) => BamError::Remote(message).into(),
            other => BamError::UnexpectedFrame(other.describe()).into(),
        }
    }

    /// Read a text or request body into memory, refusing oversized ones
    /// before allocating
    fn read_control(&mut self, frame_type: u32, len: u32) -> Result<Vec<u8>> {
        if len > MAX_CONTROL_FRAME {
            return Err(BamError::UnexpectedFrame(format!(
                "frame 0x{frame_type:02x} of {len} bytes exceeds {MAX_CONTROL_FRAME}"
            ))
            .into());
        }
        let mut body = vec![0u8; len as usize];
        self.inner.read_exact(&mut body)?;
        Ok(body)
    }

    fn skip(&mut self, len: u32) -> Result<()> {
        if len > 0 {
            std::io::copy(&mut (&mut self.inner).take(u64::from(len)), &mut std::io::sink())?;
        }
        Ok(())
    }

    /// Copy a frame body to `out` incrementally, reporting bytes received
    pub fn copy_body<W: Write>(
        &mut self,
        len: u32,
        out: &mut W,
        mut on_progress: impl FnMut(u64),
    ) -> Result<u64> {
        let total = u64::from(len);
        let mut received = 0u64;
        let mut buffer = vec![0u8; 64 * 1024]; // 64KB buffer
        while received < total {
            let want = usize::try_from(total - received)
                .unwrap_or(usize::MAX)
                .min(buffer.len());
            let n = self.inner.read(&mut buffer[..want])?;
            if n == 0 {
                return Err(eyre!("stream ended after {received} of {total} payload bytes"));
            }
            out.write_all(&buffer[..n])?;
            received += n as u64;
            on_progress(received);
        }
        Ok(received)
    }

    /// Read a client request: magic followed by one `Request` frame
    pub fn read_request(&mut self) -> Result<Request> {
        self.read_magic()?;
        match self.read_frame()? {
            Frame::Request(request) => Ok(request),
            other => Err(Self::reject(other)),
        }
    }

    /// Receive a single-payload download into `out`
    ///
    /// Messages are handed to `on_message` as they arrive; `on_progress`
    /// receives `(bytes received, declared length)` after every read.
    pub fn receive_payload<W: Write>(
        &mut self,
        out: &mut W,
        mut on_message: impl FnMut(&str),
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<u64> {
        self.read_magic()?;
        loop {
            match self.read_frame()? {
                Frame::Message(text) => on_message(&text),
                Frame::Payload(len) => {
                    let total = u64::from(len);
                    on_progress(0, total);
                    let received = self.copy_body(len, out, |n| on_progress(n, total))?;
                    out.flush()?;
                    return Ok(received);
                }
                other => return Err(Self::reject(other)),
            }
        }
    }

    /// Receive a control reply
    pub fn receive_reply(&mut self, mut on_message: impl FnMut(&str)) -> Result<Reply> {
        let mut body = Vec::new();
        self.receive_payload(&mut body, &mut on_message, |_, _| {})?;
        serde_json::from_slice(&body).map_err(|e| eyre!("malformed reply: {e}"))
    }

    /// Receive a chunked multi-file transfer
    ///
    /// The n-th file started on the wire is written to `targets[n]`. Returns
    /// one flag per target telling whether the server had the file.
    pub fn receive_files(
        &mut self,
        targets: &[PathBuf],
        mut on_message: impl FnMut(&str),
    ) -> Result<Vec<bool>> {
        self.read_magic()?;
        let mut found = Vec::with_capacity(targets.len());
        let mut current: Option<File> = None;

        loop {
            match self.read_frame()? {
                Frame::Message(text) => on_message(&text),
                Frame::Payload(len) => {
                    let target = targets.get(found.len()).ok_or_else(|| {
                        BamError::UnexpectedFrame("payload beyond requested files".into())
                    })?;
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut file = File::create(target)?;
                    self.write_chunk(len, &mut file)?;
                    debug!("receiving {}", target.display());
                    current = Some(file);
                    found.push(true);
                }
                Frame::PayloadAppend(len) => {
                    let file = current.as_mut().ok_or_else(|| {
                        BamError::UnexpectedFrame("payload append without a file".into())
                    })?;
                    self.write_chunk(len, file)?;
                }
                Frame::PayloadEmpty => {
                    if found.len() >= targets.len() {
                        return Err(
                            BamError::UnexpectedFrame("empty payload beyond requested files".into())
                                .into(),
                        );
                    }
                    current = None;
                    found.push(false);
                }
                Frame::Done => break,
                other => return Err(Self::reject(other)),
            }
        }

        found.resize(targets.len(), false);
        Ok(found)
    }

    /// Decompress one chunk into `out` without buffering it whole
    fn write_chunk(&mut self, len: u32, out: &mut File) -> Result<()> {
        let limit = MAX_DOWNLOAD_CHUNK as u64;
        let body = (&mut self.inner).take(u64::from(len));
        let mut decoder = zstd::Decoder::new(body)?;
        let written = std::io::copy(&mut (&mut decoder).take(limit + 1), out)?;
        if written > limit {
            return Err(BamError::UnexpectedFrame(format!(
                "chunk inflates past {MAX_DOWNLOAD_CHUNK} bytes"
            ))
            .into());
        }
        // the next frame header starts right after the compressed body
        std::io::copy(&mut decoder.finish(), &mut std::io::sink())?;
        Ok(())
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        assert_eq!(
            header(frame::PAYLOAD, 0x0102),
            [2, 0, 0, 0, 0x02, 0x01, 0, 0]
        );
    }

    #[test]
    fn test_bundle_download() {
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer.send_message("scanning deps").unwrap();
        writer.send_message("archiving: 2 files").unwrap();
        writer.send_payload(b"zip bytes here").unwrap();

        let mut messages = Vec::new();
        let mut last = (0, 0);
        let mut out = Vec::new();
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        let n = reader
            .receive_payload(
                &mut out,
                |m| messages.push(m.to_string()),
                |got, total| last = (got, total),
            )
            .unwrap();

        assert_eq!(n, 14);
        assert_eq!(out, b"zip bytes here");
        assert_eq!(messages, vec!["scanning deps", "archiving: 2 files"]);
        assert_eq!(last, (14, 14));
        assert_eq!(percent(last.0, last.1), 100);
    }

    #[test]
    fn test_bad_magic_rejected_before_payload() {
        let mut buf = b"BAX\0".to_vec();
        buf.extend_from_slice(&header(frame::PAYLOAD, 3));
        buf.extend_from_slice(b"abc");

        let mut out = Vec::new();
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        let err = reader
            .receive_payload(&mut out, |_| {}, |_, _| panic!("payload read"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BamError>(),
            Some(BamError::BadMagic(m)) if m == b"BAX\0"
        ));
        assert!(out.is_empty());
        // nothing past the header was consumed
        assert_eq!(reader.into_inner().position(), 4);
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut buf = MAGIC.to_vec();
        buf.extend_from_slice(&header(0x99, 0));
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        reader.read_magic().unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BamError>(),
            Some(BamError::UnknownFrame(0x99))
        ));
    }

    #[test]
    fn test_request_roundtrip() {
        let request = Request::Checkout {
            path: "shots/010/shot.scene".into(),
            all_deps: true,
        };
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer.send_request(&request).unwrap();

        let mut reader = ProtocolReader::new(Cursor::new(buf));
        assert_eq!(reader.read_request().unwrap(), request);
    }

    #[test]
    fn test_request_json_shape() {
        let json = serde_json::to_string(&Request::CheckoutDownload {
            files: vec!["a.png".into()],
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"checkout_download","files":["a.png"]}"#);
        let parsed: Request = serde_json::from_str(r#"{"command":"checkout","path":"x"}"#).unwrap();
        assert_eq!(
            parsed,
            Request::Checkout {
                path: "x".into(),
                all_deps: false
            }
        );
    }

    #[test]
    fn test_error_frame_is_remote_error() {
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer.send_message("looking").unwrap();
        writer.send_error("Path not found").unwrap();

        let mut reader = ProtocolReader::new(Cursor::new(buf.clone()));
        let err = reader.receive_reply(|_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BamError>(),
            Some(BamError::Remote(m)) if m == "Path not found"
        ));

        let mut reader = ProtocolReader::new(Cursor::new(buf));
        assert!(reader.receive_files(&[], |_| {}).is_err());
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Reply::Bundle {
            status: BundleStatus::Building,
            bundle_path: None,
        };
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer.send_reply(&reply).unwrap();

        let mut reader = ProtocolReader::new(Cursor::new(buf));
        assert_eq!(reader.receive_reply(|_| {}).unwrap(), reply);
    }

    #[test]
    fn test_receive_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer.send_message("downloading: a.png").unwrap();
        writer
            .send_payload(&zstd::encode_all(&b"first "[..], 3).unwrap())
            .unwrap();
        writer
            .send_append(&zstd::encode_all(&b"second"[..], 3).unwrap())
            .unwrap();
        writer.send_message("source missing: b.png").unwrap();
        writer.send_empty().unwrap();
        writer.send_done().unwrap();

        let targets = vec![dir.path().join("a.png"), dir.path().join("sub/b.png")];
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        let found = reader.receive_files(&targets, |_| {}).unwrap();

        assert_eq!(found, vec![true, false]);
        assert_eq!(std::fs::read(&targets[0]).unwrap(), b"first second");
        assert!(!targets[1].exists());
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        for kind in [frame::MESSAGE, frame::REQUEST, frame::ERROR] {
            // header only: a reader that trusted the length would hit EOF instead
            let mut buf = MAGIC.to_vec();
            buf.extend_from_slice(&header(kind, u32::MAX));
            let mut reader = ProtocolReader::new(Cursor::new(buf));
            reader.read_magic().unwrap();
            let err = reader.read_frame().unwrap_err();
            assert!(
                matches!(err.downcast_ref::<BamError>(), Some(BamError::UnexpectedFrame(_))),
                "{err:#}"
            );
        }

        let mut buf = MAGIC.to_vec();
        buf.extend_from_slice(&header(frame::MESSAGE, MAX_CONTROL_FRAME));
        buf.resize(buf.len() + MAX_CONTROL_FRAME as usize, b'.');
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        reader.read_magic().unwrap();
        assert!(matches!(reader.read_frame().unwrap(), Frame::Message(m) if m.len() == MAX_CONTROL_FRAME as usize));
    }

    #[test]
    fn test_inflating_chunk_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let zeros = std::io::repeat(0).take(MAX_DOWNLOAD_CHUNK as u64 + 1);
        let compressed = zstd::encode_all(zeros, 3).unwrap();

        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer.send_payload(&compressed).unwrap();
        writer.send_done().unwrap();

        let targets = vec![dir.path().join("zeros.bin")];
        let mut reader = ProtocolReader::new(Cursor::new(buf));
        let err = reader.receive_files(&targets, |_| {}).unwrap_err();
        assert!(
            matches!(err.downcast_ref::<BamError>(), Some(BamError::UnexpectedFrame(m)) if m.contains("inflates")),
            "{err:#}"
        );
        assert!(std::fs::metadata(&targets[0]).unwrap().len() <= MAX_DOWNLOAD_CHUNK as u64 + 1);
    }

    #[test]
    fn test_chunk_reader_stops_at_frame_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        for (i, part) in [&b"alpha"[..], b"beta"].into_iter().enumerate() {
            writer
                .send_payload(&zstd::encode_all(part, 3).unwrap())
                .unwrap();
            writer.send_message(&format!("file {i}")).unwrap();
        }
        writer.send_done().unwrap();

        let targets = vec![dir.path().join("a"), dir.path().join("b")];
        let mut messages = Vec::new();
        let found = ProtocolReader::new(Cursor::new(buf))
            .receive_files(&targets, |m| messages.push(m.to_string()))
            .unwrap();
        assert_eq!(found, vec![true, true]);
        assert_eq!(messages, vec!["file 0", "file 1"]);
        assert_eq!(std::fs::read(&targets[1]).unwrap(), b"beta");
    }

    #[test]
    fn test_append_without_file_is_rejected() {
        let mut buf = Vec::new();
        let mut writer = ProtocolWriter::new(&mut buf);
        writer.send_magic().unwrap();
        writer
            .send_append(&zstd::encode_all(&b"x"[..], 3).unwrap())
            .unwrap();

        let mut reader = ProtocolReader::new(Cursor::new(buf));
        assert!(reader.receive_files(&[], |_| {}).is_err());
    }
}
