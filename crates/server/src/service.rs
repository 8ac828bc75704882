//! Request dispatch
//!
//! One connection carries one request: the client sends the magic and a
//! `Request` frame (plus an upload payload for commits) and the server
//! answers with a download stream or a JSON reply.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{debug, error, info, warn};

use bam_core::archive::BundleWriter;
use bam_core::manifest::{PackManifest, PathsRemap};
use bam_core::protocol::{self, BundleStatus, EntryKind, HEADER_LEN, ListEntry};
use bam_core::stream::{CheckoutStream, ChunkedDownload};
use bam_core::walker::AssetFormat;
use bam_core::{
    ContentHash, PackMode, PackOptions, ProtocolReader, ProtocolWriter, Reply, Request, TextScene,
    pack, paths,
};

use crate::backend::Vcs;
use crate::commit::{CommitInfo, apply_upload};
use crate::config::ServerConfig;
use crate::jobs::{Begin, JobTable};

/// Directory names never listed to clients
const HIDDEN_DIRS: &[&str] = &[".svn"];

/// Writes one response, remembering whether the stream has started
struct Responder<W: Write> {
    writer: ProtocolWriter<W>,
    started: bool,
    /// A download is mid-flight; an error frame would land inside a payload
    streaming: bool,
}

impl<W: Write> Responder<W> {
    fn new(writer: W) -> Self {
        Self {
            writer: ProtocolWriter::new(writer),
            started: false,
            streaming: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        if !self.started {
            self.writer.send_magic()?;
            self.started = true;
        }
        Ok(())
    }

    fn message(&mut self, text: &str) -> Result<()> {
        self.start()?;
        self.writer.send_message(text)
    }

    /// Forward a producer's frames; producers emit their own magic
    ///
    /// Every frame is flushed as it is written so progress reaches the client
    /// while the producer is still working.
    fn stream(&mut self, frames: impl Iterator<Item = Result<Bytes>>) -> Result<()> {
        for frame in frames {
            let frame = frame?;
            self.started = true;
            if !self.streaming && opens_payload(&frame) {
                self.streaming = true;
            }
            self.writer.send_raw(&frame)?;
            self.writer.flush()?;
        }
        self.streaming = false;
        Ok(())
    }

    fn reply(&mut self, reply: &Reply) -> Result<()> {
        self.start()?;
        self.writer.send_reply(reply)
    }

    fn error(&mut self, message: &str) -> Result<()> {
        self.start()?;
        self.writer.send_error(message)
    }
}

/// Whether `frame` starts binary content, after which an error frame can no
/// longer be told apart from payload bytes
fn opens_payload(frame: &[u8]) -> bool {
    if frame.len() < HEADER_LEN {
        return false;
    }
    let kind = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    matches!(
        kind,
        protocol::frame::PAYLOAD
            | protocol::frame::PAYLOAD_APPEND
            | protocol::frame::PAYLOAD_EMPTY
            | protocol::frame::DONE
    )
}

/// The BAM service over one repository
pub struct Service<V: Vcs> {
    config: Arc<ServerConfig>,
    vcs: Mutex<V>,
    jobs: Arc<JobTable>,
}

impl<V: Vcs> Service<V> {
    /// Open the job table under the storage dir and fail builds a previous
    /// process left running
    pub fn new(config: ServerConfig, vcs: V) -> Result<Self> {
        std::fs::create_dir_all(config.bundles_dir())?;
        std::fs::create_dir_all(config.uploads_dir())?;
        let jobs = JobTable::open(&config.jobs_dir())?;
        let recovered = jobs.recover()?;
        if recovered > 0 {
            warn!("{recovered} interrupted bundle builds marked failed");
        }

        Ok(Self {
            config: Arc::new(config),
            vcs: Mutex::new(vcs),
            jobs: Arc::new(jobs),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Serve one connection
    ///
    /// Request failures are reported to the client as an error frame; only
    /// failures that leave the connection unusable are returned.
    pub fn serve<R: Read, W: Write>(&self, reader: R, writer: W) -> Result<()> {
        let mut reader = ProtocolReader::new(reader);
        let mut out = Responder::new(writer);

        let result = reader
            .read_request()
            .and_then(|request| {
                info!("{} request", request.name());
                debug!("{request:?}");
                self.dispatch(request, &mut reader, &mut out)
            });

        match result {
            Ok(()) => Ok(()),
            Err(e) if out.streaming => Err(e),
            Err(e) => {
                warn!("request failed: {e:#}");
                out.error(&format!("{e:#}"))
            }
        }
    }

    fn dispatch<R: Read, W: Write>(
        &self,
        request: Request,
        reader: &mut ProtocolReader<R>,
        out: &mut Responder<W>,
    ) -> Result<()> {
        match request {
            Request::Checkout { path, all_deps } => self.checkout(&path, all_deps, out),
            Request::CheckoutDownload { files } => out.stream(ChunkedDownload::new(
                &self.config.repository,
                files,
                self.config.chunk_size,
            )),
            Request::Commit { message, user } => {
                self.commit(&message, user.as_deref(), reader, out)
            }
            Request::List { path } => {
                let reply = self.list(&path)?;
                out.reply(&reply)
            }
            Request::Info { path } => {
                let reply = self.info(&path)?;
                out.reply(&reply)
            }
            Request::Bundle { path } => {
                let reply = self.bundle(&path)?;
                out.reply(&reply)
            }
        }
    }

    /// Absolute path of an existing repository entry
    fn locate(&self, rel: &str) -> Result<PathBuf> {
        paths::contained(&self.config.repository, rel)
            .filter(|path| path.exists())
            .ok_or_else(|| eyre!("Path not found: {rel}"))
    }

    fn checkout<W: Write>(&self, rel: &str, all_deps: bool, out: &mut Responder<W>) -> Result<()> {
        let source = self.locate(rel)?;
        if !source.is_file() {
            return Err(eyre!("Not a file: {rel}"));
        }

        // where the session sits inside the repository
        let dir_rel = Path::new(rel)
            .parent()
            .map(paths::manifest_string)
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let extra = PathsRemap::from([(".".to_string(), dir_rel)]);
        let name = paths::file_name(&source);

        if TextScene.accepts(&source) {
            let options = PackOptions {
                recursive: all_deps,
                remap_relbase: Some(self.config.repository.clone()),
                ..PackOptions::default()
            };
            let destination = std::env::temp_dir().join(&name);
            let pack = pack(TextScene, &source, &destination, PackMode::None, options)?;
            out.stream(CheckoutStream::from_pack(rel, pack, extra))
        } else {
            let mut manifest = PackManifest::default();
            manifest
                .paths_uuid
                .insert(name.clone(), ContentHash::from_file(&source)?);
            manifest.paths_remap.insert(name, rel.to_string());
            out.stream(CheckoutStream::<TextScene>::from_manifest(rel, manifest, extra))
        }
    }

    fn commit<R: Read, W: Write>(
        &self,
        message: &str,
        user: Option<&str>,
        reader: &mut ProtocolReader<R>,
        out: &mut Responder<W>,
    ) -> Result<()> {
        let upload = self
            .config
            .uploads_dir()
            .join(format!("{}.zip", uuid::Uuid::new_v4()));
        let received = receive_upload(reader, &upload);
        if received.is_err() {
            discard_upload(&upload);
        }
        debug!("received {} byte upload", received?);

        let user = user
            .or(self.config.svn_user.as_deref())
            .unwrap_or("bam");
        let info = CommitInfo {
            message,
            user,
            credential: self.config.svn_password.as_deref(),
        };

        let result = {
            let mut vcs = self
                .vcs
                .lock()
                .map_err(|_| eyre!("version-control backend poisoned"))?;
            let mut report_error = None;
            let result = apply_upload(&mut *vcs, &self.config, &upload, &info, |line| {
                if report_error.is_none() {
                    report_error = out.message(line).err();
                }
            });
            match report_error {
                Some(e) => Err(e),
                None => result,
            }
        };
        discard_upload(&upload);

        out.reply(&Reply::Committed { output: result? })
    }

    fn list(&self, rel: &str) -> Result<Reply> {
        let dir = self.locate(rel)?;
        if !dir.is_dir() {
            return Err(eyre!("Not a directory: {rel}"));
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = if entry.file_type()?.is_dir() {
                if HIDDEN_DIRS.contains(&name.as_str()) {
                    continue;
                }
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(ListEntry { name, kind });
        }
        entries.sort_by(|a, b| {
            (a.kind != EntryKind::Dir, &a.name).cmp(&(b.kind != EntryKind::Dir, &b.name))
        });

        Ok(Reply::Listing {
            path: rel.to_string(),
            entries,
        })
    }

    fn info(&self, rel: &str) -> Result<Reply> {
        let path = self.locate(rel)?;
        let size = std::fs::metadata(&path)?.len();
        let bundle_status = self.jobs.get(rel)?.map(|record| record.state.into());
        Ok(Reply::Info {
            path: rel.to_string(),
            size,
            bundle_status,
        })
    }

    fn bundle(&self, rel: &str) -> Result<Reply> {
        let source = self.locate(rel)?;
        if !source.is_file() {
            return Err(eyre!("Not a file: {rel}"));
        }

        match self.jobs.begin(rel, |archive| Path::new(archive).is_file())? {
            Begin::AlreadyBuilding => Ok(Reply::Bundle {
                status: BundleStatus::Building,
                bundle_path: None,
            }),
            Begin::Available(archive) => Ok(Reply::Bundle {
                status: BundleStatus::Available,
                bundle_path: Some(archive),
            }),
            Begin::Started => {
                self.spawn_build(rel, source)?;
                Ok(Reply::Bundle {
                    status: BundleStatus::Building,
                    bundle_path: None,
                })
            }
        }
    }

    fn spawn_build(&self, rel: &str, source: PathBuf) -> Result<()> {
        let jobs = Arc::clone(&self.jobs);
        let config = Arc::clone(&self.config);
        let key = rel.to_string();

        let spawned = std::thread::Builder::new()
            .name("bam-bundle".into())
            .spawn(move || {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| build_bundle(&config, &source)));
                let recorded = match outcome {
                    Ok(Ok(archive)) => {
                        info!("bundle for {key} available at {}", archive.display());
                        jobs.finish(&key, &archive.to_string_lossy())
                    }
                    Ok(Err(e)) => {
                        error!("bundle for {key} failed: {e:#}");
                        jobs.fail(&key)
                    }
                    Err(_) => {
                        error!("bundle for {key} panicked");
                        jobs.fail(&key)
                    }
                };
                if let Err(e) = recorded {
                    error!("could not record bundle state for {key}: {e:#}");
                }
            });

        if let Err(e) = spawned {
            self.jobs.fail(rel)?;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Write the commit's upload payload to `path`
fn receive_upload<R: Read>(reader: &mut ProtocolReader<R>, path: &Path) -> Result<u64> {
    let mut file = BufWriter::new(File::create(path)?);
    let bam_core::Frame::Payload(len) = reader.read_frame()? else {
        return Err(eyre!("commit without an upload"));
    };
    let received = reader.copy_body(len, &mut file, |_| {})?;
    file.flush()?;
    Ok(received)
}

fn discard_upload(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!("upload {} not removed: {e}", path.display());
    }
}

/// Pack `source` into a fresh archive under the bundles dir
fn build_bundle(config: &ServerConfig, source: &Path) -> Result<PathBuf> {
    let archive = config
        .bundles_dir()
        .join(format!("{}.zip", uuid::Uuid::new_v4()));

    if TextScene.accepts(source) {
        let options = PackOptions {
            recursive: true,
            remap_relbase: Some(config.repository.clone()),
            ..PackOptions::default()
        };
        pack(TextScene, source, &archive, PackMode::Zip, options)?
            .run(|line| debug!("{}", line.trim()))?;
    } else {
        let name = paths::file_name(source);
        let mut manifest = PackManifest::default();
        manifest
            .paths_uuid
            .insert(name.clone(), ContentHash::from_file(source)?);
        manifest.paths_remap.insert(
            name.clone(),
            paths::manifest_string(&paths::relative_to(source, &config.repository)),
        );
        let mut writer = BundleWriter::create(&archive)?;
        writer.add_file(&name, source)?;
        writer.add_manifest(&manifest)?;
        writer.finish()?;
    }
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StatusEntry;
    use bam_core::archive;
    use bam_core::BamError;
    use bam_core::manifest::{PATHS_REMAP_FILE, PATHS_UUID_FILE, PathsUuid, read_json};
    use bam_core::protocol::{MAGIC, frame};
    use bam_core::stream::{magic, message_frame};
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[derive(Default)]
    struct NullVcs {
        commits: usize,
    }

    impl Vcs for NullVcs {
        fn status(&mut self) -> Result<Vec<StatusEntry>> {
            Ok(Vec::new())
        }
        fn add(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn remove(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn commit(&mut self, message: &str, _: &str, _: Option<&str>) -> Result<String> {
            self.commits += 1;
            Ok(format!("Committed: {message}"))
        }
    }

    fn service() -> (TempDir, Service<NullVcs>) {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("shots")).unwrap();
        std::fs::create_dir_all(repo.join("tex")).unwrap();
        std::fs::create_dir_all(repo.join(".svn")).unwrap();
        std::fs::write(repo.join("tex/wood.png"), "wood").unwrap();
        std::fs::write(repo.join("shots/shot.scene"), "image //../tex/wood.png\n").unwrap();
        std::fs::write(repo.join("notes.txt"), "hello").unwrap();

        let config = ServerConfig {
            repository: repo,
            storage: dir.path().join("storage"),
            ..ServerConfig::default()
        };
        let service = Service::new(config, NullVcs::default()).unwrap();
        (dir, service)
    }

    fn request(service: &Service<NullVcs>, request: &Request) -> Vec<u8> {
        let mut input = Vec::new();
        let mut writer = ProtocolWriter::new(&mut input);
        writer.send_magic().unwrap();
        writer.send_request(request).unwrap();

        let mut output = Vec::new();
        service.serve(Cursor::new(input), &mut output).unwrap();
        output
    }

    fn reply(service: &Service<NullVcs>, req: &Request) -> Result<Reply> {
        let output = request(service, req);
        ProtocolReader::new(Cursor::new(output)).receive_reply(|_| {})
    }

    #[test]
    fn test_list_dirs_first_without_svn() {
        let (_dir, service) = service();
        let Reply::Listing { entries, .. } = reply(&service, &Request::List { path: ".".into() })
            .unwrap()
        else {
            panic!("expected a listing");
        };
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["shots", "tex", "notes.txt"]);
        assert_eq!(entries[2].kind, EntryKind::File);
    }

    #[test]
    fn test_missing_path_is_error_frame() {
        let (_dir, service) = service();
        let err = reply(&service, &Request::Info { path: "nope.scene".into() }).unwrap_err();
        assert!(err.to_string().contains("Path not found: nope.scene"));

        let err = reply(&service, &Request::List { path: "../..".into() }).unwrap_err();
        assert!(err.to_string().contains("Path not found"));
    }

    #[test]
    fn test_bad_magic_answered_with_error() {
        let (_dir, service) = service();
        let mut output = Vec::new();
        service
            .serve(Cursor::new(b"HTTP/1.1 GET /".to_vec()), &mut output)
            .unwrap();
        let err = ProtocolReader::new(Cursor::new(output))
            .receive_reply(|_| {})
            .unwrap_err();
        assert!(err.to_string().contains("bad stream header"));
    }

    /// Keeps every write it receives as a separate chunk
    #[derive(Clone, Default)]
    struct Writes(Rc<RefCell<Vec<Vec<u8>>>>);

    impl Write for Writes {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().push(buf.to_vec());
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_checkout_progress_flushed_per_frame() {
        let (_dir, service) = service();
        let mut input = Vec::new();
        let mut writer = ProtocolWriter::new(&mut input);
        writer.send_magic().unwrap();
        writer
            .send_request(&Request::Checkout {
                path: "shots/shot.scene".into(),
                all_deps: false,
            })
            .unwrap();

        let writes = Writes::default();
        service
            .serve(Cursor::new(input), BufWriter::new(writes.clone()))
            .unwrap();

        let writes = writes.0.borrow();
        assert_eq!(writes[0], MAGIC);
        // the first progress message left the buffer on its own
        let first = &writes[1];
        let kind = u32::from_le_bytes([first[0], first[1], first[2], first[3]]);
        let len = u32::from_le_bytes([first[4], first[5], first[6], first[7]]);
        assert_eq!(kind, frame::MESSAGE);
        assert_eq!(first.len(), HEADER_LEN + len as usize);
    }

    #[test]
    fn test_failure_before_payload_reaches_client() {
        let mut output = Vec::new();
        let mut out = Responder::new(&mut output);
        let frames = vec![
            Ok(magic()),
            Ok(message_frame("scanning: shot.scene")),
            Err(eyre!("failed to extract: shot.scene")),
        ];
        let err = out.stream(frames.into_iter()).unwrap_err();
        assert!(!out.streaming);
        out.error(&format!("{err:#}")).unwrap();
        drop(out);

        let mut messages = Vec::new();
        let err = ProtocolReader::new(Cursor::new(output))
            .receive_payload(&mut Vec::new(), |m| messages.push(m.to_string()), |_, _| {})
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BamError>(),
            Some(BamError::Remote(m)) if m == "failed to extract: shot.scene"
        ));
        assert_eq!(messages, vec!["scanning: shot.scene"]);
    }

    #[test]
    fn test_failure_inside_payload_is_not_framed() {
        let mut output = Vec::new();
        let mut out = Responder::new(&mut output);
        let frames = vec![
            Ok(magic()),
            Ok(Bytes::copy_from_slice(&protocol::header(frame::PAYLOAD, 16))),
            Ok(Bytes::from_static(b"partial")),
            Err(eyre!("file vanished")),
        ];
        assert!(out.stream(frames.into_iter()).is_err());
        assert!(out.streaming);
    }

    #[test]
    fn test_checkout_scene_manifest() {
        let (dir, service) = service();
        let output = request(
            &service,
            &Request::Checkout {
                path: "shots/shot.scene".into(),
                all_deps: false,
            },
        );

        let zip = dir.path().join("checkout.zip");
        let mut file = File::create(&zip).unwrap();
        let mut messages = Vec::new();
        ProtocolReader::new(Cursor::new(output))
            .receive_payload(&mut file, |m| messages.push(m.to_string()), |_, _| {})
            .unwrap();

        let unpacked = dir.path().join("unpacked");
        archive::extract(&zip, &unpacked).unwrap();
        let remap: PathsRemap = read_json(&unpacked.join(PATHS_REMAP_FILE)).unwrap();
        assert_eq!(remap.get("."), Some(&"shots".to_string()));
        assert_eq!(remap.get("shot.scene"), Some(&"shots/shot.scene".to_string()));
        assert_eq!(remap.get("data/wood.png"), Some(&"tex/wood.png".to_string()));
        let uuid: PathsUuid = read_json(&unpacked.join(PATHS_UUID_FILE)).unwrap();
        assert_eq!(uuid.len(), 2);
        assert!(!unpacked.join("shot.scene").exists());
    }

    #[test]
    fn test_checkout_plain_file() {
        let (dir, service) = service();
        let output = request(
            &service,
            &Request::Checkout {
                path: "notes.txt".into(),
                all_deps: false,
            },
        );
        let zip = dir.path().join("checkout.zip");
        let mut file = File::create(&zip).unwrap();
        ProtocolReader::new(Cursor::new(output))
            .receive_payload(&mut file, |_| {}, |_, _| {})
            .unwrap();

        let unpacked = dir.path().join("unpacked");
        archive::extract(&zip, &unpacked).unwrap();
        let remap: PathsRemap = read_json(&unpacked.join(PATHS_REMAP_FILE)).unwrap();
        assert_eq!(
            remap,
            PathsRemap::from([
                (".".into(), ".".into()),
                ("notes.txt".into(), "notes.txt".into()),
            ])
        );
    }

    #[test]
    fn test_checkout_download_marks_missing() {
        let (dir, service) = service();
        let output = request(
            &service,
            &Request::CheckoutDownload {
                files: vec!["tex/wood.png".into(), "tex/gone.png".into()],
            },
        );
        let targets = [dir.path().join("a.png"), dir.path().join("b.png")];
        let found = ProtocolReader::new(Cursor::new(output))
            .receive_files(&targets, |_| {})
            .unwrap();
        assert_eq!(found, vec![true, false]);
        assert_eq!(std::fs::read(&targets[0]).unwrap(), b"wood");
    }

    #[test]
    fn test_commit_upload() {
        let (dir, service) = service();
        let zip = dir.path().join("upload.zip");
        let mut writer = BundleWriter::create(&zip).unwrap();
        writer.add_bytes("notes.txt", b"updated").unwrap();
        writer
            .add_bytes(
                PATHS_REMAP_FILE,
                br#"{"notes.txt": "notes.txt"}"#,
            )
            .unwrap();
        writer.finish().unwrap();

        let mut input = Vec::new();
        let mut protocol = ProtocolWriter::new(&mut input);
        protocol.send_magic().unwrap();
        protocol
            .send_request(&Request::Commit {
                message: "notes".into(),
                user: Some("cam".into()),
            })
            .unwrap();
        protocol.send_payload_file(&zip).unwrap();

        let mut output = Vec::new();
        service.serve(Cursor::new(input), &mut output).unwrap();
        let reply = ProtocolReader::new(Cursor::new(output))
            .receive_reply(|_| {})
            .unwrap();

        assert_eq!(
            reply,
            Reply::Committed {
                output: "Committed: notes".into()
            }
        );
        assert_eq!(
            std::fs::read_to_string(service.config().repository.join("notes.txt")).unwrap(),
            "updated"
        );
        assert_eq!(std::fs::read_dir(service.config().uploads_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_bundle_lifecycle() {
        let (_dir, service) = service();
        let req = Request::Bundle {
            path: "shots/shot.scene".into(),
        };
        let Reply::Bundle { status, .. } = reply(&service, &req).unwrap() else {
            panic!("expected a bundle reply");
        };
        assert_ne!(status, BundleStatus::Failed);

        let deadline = Instant::now() + Duration::from_secs(10);
        let archive = loop {
            match reply(&service, &req).unwrap() {
                Reply::Bundle {
                    status: BundleStatus::Available,
                    bundle_path: Some(path),
                } => break PathBuf::from(path),
                Reply::Bundle {
                    status: BundleStatus::Building,
                    ..
                } => {
                    assert!(Instant::now() < deadline, "bundle never finished");
                    std::thread::sleep(Duration::from_millis(20));
                }
                other => panic!("unexpected reply {other:?}"),
            }
        };

        let names = archive::entry_names(&archive).unwrap();
        assert!(names.contains(&"shot.scene".to_string()));
        assert!(names.contains(&"data/wood.png".to_string()));

        let Reply::Info { bundle_status, .. } = reply(
            &service,
            &Request::Info {
                path: "shots/shot.scene".into(),
            },
        )
        .unwrap() else {
            panic!("expected info");
        };
        assert_eq!(bundle_status, Some(BundleStatus::Available));
    }
}
