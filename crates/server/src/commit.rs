//! Applying a commit upload to the repository

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tracing::{debug, info};

use bam_core::archive;
use bam_core::manifest::{PATHS_OPS_FILE, PATHS_REMAP_FILE, PathOp, PathsOps, PathsRemap, read_json};
use bam_core::paths;

use crate::backend::{EntryState, Vcs};
use crate::config::ServerConfig;

/// Who commits and why
#[derive(Debug, Clone)]
pub struct CommitInfo<'a> {
    pub message: &'a str,
    pub user: &'a str,
    pub credential: Option<&'a str>,
}

struct Move {
    src: PathBuf,
    dst: PathBuf,
    rel: String,
}

/// Validate every remap entry before anything touches the repository
fn plan_moves(config: &ServerConfig, extracted: &Path, remap: &PathsRemap) -> Result<Vec<Move>> {
    let mut moves = Vec::with_capacity(remap.len());
    for (src_rel, dst_rel) in remap {
        if src_rel == "." {
            continue;
        }
        if !config.allows(src_rel) || !config.allows(dst_rel) {
            bail!("file type not allowed: {src_rel}");
        }
        let src = paths::contained(extracted, src_rel)
            .ok_or_else(|| eyre!("upload path escapes the bundle: {src_rel}"))?;
        let dst = paths::contained(&config.repository, dst_rel)
            .ok_or_else(|| eyre!("path escapes the repository: {dst_rel}"))?;
        if !src.is_file() {
            debug!("not in upload: {src_rel}");
            continue;
        }
        moves.push(Move {
            src,
            dst,
            rel: dst_rel.clone(),
        });
    }
    Ok(moves)
}

/// Unpack the upload at `upload`, route its files into the repository and
/// commit them. Returns the backend's commit output.
pub fn apply_upload<V: Vcs + ?Sized>(
    vcs: &mut V,
    config: &ServerConfig,
    upload: &Path,
    info: &CommitInfo<'_>,
    mut report: impl FnMut(&str),
) -> Result<String> {
    let uploads = config.uploads_dir();
    std::fs::create_dir_all(&uploads)?;
    let scratch = tempfile::Builder::new()
        .prefix("commit")
        .tempdir_in(&uploads)?;
    archive::extract(upload, scratch.path())?;

    let remap_path = scratch.path().join(PATHS_REMAP_FILE);
    if !remap_path.is_file() {
        bail!("upload carries no {PATHS_REMAP_FILE}");
    }
    let remap: PathsRemap = read_json(&remap_path)?;
    let ops_path = scratch.path().join(PATHS_OPS_FILE);
    let ops: PathsOps = if ops_path.is_file() {
        read_json(&ops_path)?
    } else {
        PathsOps::new()
    };

    let moves = plan_moves(config, scratch.path(), &remap)?;
    for entry in &moves {
        if let Some(parent) = entry.dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&entry.src, &entry.dst)?;
        report(&format!("  updating: {}", entry.rel));
    }

    for entry in vcs.status()? {
        if entry.state == EntryState::Unversioned {
            report(&format!("  adding: {}", entry.path.display()));
            vcs.add(&entry.path)?;
        }
    }

    for (rel, op) in &ops {
        if *op != PathOp::Delete {
            continue;
        }
        let Some(path) = paths::contained(&config.repository, rel) else {
            bail!("path escapes the repository: {rel}");
        };
        if path.exists() {
            report(&format!("  removing: {rel}"));
            vcs.remove(Path::new(rel))?;
        } else {
            debug!("already gone: {rel}");
        }
    }

    let output = vcs.commit(info.message, info.user, info.credential)?;
    info!(
        "committed {} files, {} removals as {}",
        moves.len(),
        ops.values().filter(|op| **op == PathOp::Delete).count(),
        info.user
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StatusEntry;
    use bam_core::archive::BundleWriter;
    use bam_core::manifest::encode_json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        unversioned: Vec<PathBuf>,
        added: Vec<PathBuf>,
        removed: Vec<PathBuf>,
        commits: Vec<(String, String, Option<String>)>,
    }

    impl Vcs for Recorder {
        fn status(&mut self) -> Result<Vec<StatusEntry>> {
            Ok(self
                .unversioned
                .iter()
                .map(|path| StatusEntry {
                    path: path.clone(),
                    state: EntryState::Unversioned,
                })
                .collect())
        }

        fn add(&mut self, path: &Path) -> Result<()> {
            self.added.push(path.to_path_buf());
            Ok(())
        }

        fn remove(&mut self, path: &Path) -> Result<()> {
            self.removed.push(path.to_path_buf());
            Ok(())
        }

        fn commit(&mut self, message: &str, user: &str, credential: Option<&str>) -> Result<String> {
            self.commits.push((
                message.to_string(),
                user.to_string(),
                credential.map(str::to_string),
            ));
            Ok("Committed revision 7.".into())
        }
    }

    fn setup() -> (TempDir, ServerConfig) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            repository: dir.path().join("repo"),
            storage: dir.path().join("storage"),
            ..ServerConfig::default()
        };
        std::fs::create_dir_all(config.repository.join("tex")).unwrap();
        std::fs::write(config.repository.join("tex/skin.png"), "skin").unwrap();
        (dir, config)
    }

    fn upload(dir: &Path, files: &[(&str, &str)], remap: &PathsRemap, ops: &PathsOps) -> PathBuf {
        let path = dir.join("upload.zip");
        let mut writer = BundleWriter::create(&path).unwrap();
        for (name, data) in files {
            writer.add_bytes(name, data.as_bytes()).unwrap();
        }
        writer
            .add_bytes(PATHS_REMAP_FILE, &encode_json(remap).unwrap())
            .unwrap();
        writer.add_ops(ops).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_apply_upload() {
        let (dir, config) = setup();
        let remap = PathsRemap::from([("shot.scene".into(), "shots/shot.scene".into())]);
        let ops = PathsOps::from([("tex/skin.png".into(), PathOp::Delete)]);
        let zip = upload(dir.path(), &[("shot.scene", "image //../tex/wood.png\n")], &remap, &ops);

        let mut vcs = Recorder {
            unversioned: vec![PathBuf::from("shots")],
            ..Recorder::default()
        };
        let info = CommitInfo {
            message: "light pass",
            user: "cam",
            credential: Some("secret"),
        };
        let mut lines = Vec::new();
        let output =
            apply_upload(&mut vcs, &config, &zip, &info, |l| lines.push(l.to_string())).unwrap();

        assert_eq!(output, "Committed revision 7.");
        assert_eq!(
            std::fs::read_to_string(config.repository.join("shots/shot.scene")).unwrap(),
            "image //../tex/wood.png\n"
        );
        assert_eq!(vcs.added, vec![PathBuf::from("shots")]);
        assert_eq!(vcs.removed, vec![PathBuf::from("tex/skin.png")]);
        assert_eq!(
            vcs.commits,
            vec![("light pass".into(), "cam".into(), Some("secret".into()))]
        );
        assert!(lines.contains(&"  updating: shots/shot.scene".to_string()));
    }

    #[test]
    fn test_disallowed_extension_touches_nothing() {
        let (dir, config) = setup();
        let remap = PathsRemap::from([
            ("shot.scene".into(), "shots/shot.scene".into()),
            ("run.sh".into(), "run.sh".into()),
        ]);
        let zip = upload(
            dir.path(),
            &[("shot.scene", "x\n"), ("run.sh", "rm -rf /")],
            &remap,
            &PathsOps::new(),
        );

        let mut vcs = Recorder::default();
        let info = CommitInfo {
            message: "m",
            user: "cam",
            credential: None,
        };
        let err = apply_upload(&mut vcs, &config, &zip, &info, |_| {}).unwrap_err();
        assert!(err.to_string().contains("run.sh"));
        assert!(!config.repository.join("shots/shot.scene").exists());
        assert!(vcs.commits.is_empty());
    }

    #[test]
    fn test_escaping_destination_rejected() {
        let (dir, config) = setup();
        let remap = PathsRemap::from([("a.png".into(), "../outside.png".into())]);
        let zip = upload(dir.path(), &[("a.png", "x")], &remap, &PathsOps::new());

        let info = CommitInfo {
            message: "m",
            user: "cam",
            credential: None,
        };
        assert!(apply_upload(&mut Recorder::default(), &config, &zip, &info, |_| {}).is_err());
        assert!(!dir.path().join("outside.png").exists());
    }
}
