//! Line-oriented `.scene` format
//!
//! ```text
//! # comments and blank lines are preserved
//! library //libs/characters.scene
//! image   //textures/wood.png
//! sound   /mnt/media/boom.wav
//! ```
//!
//! Every other line is `<block-kind> <path>`. The `library` kind links another
//! scene; any other kind is a generic block whose path is copied as data.

use std::path::Path;

use color_eyre::Result;
use color_eyre::eyre::eyre;

use crate::walker::{AssetDocument, AssetFormat, BlockKind, RawReference};

/// File extension recognised as a scene asset
pub const SCENE_EXTENSION: &str = "scene";

const LIBRARY_KIND: &[u8] = b"library";

/// The `.scene` asset format
#[derive(Debug, Clone, Copy, Default)]
pub struct TextScene;

impl AssetFormat for TextScene {
    type Document = SceneDocument;

    fn accepts(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == SCENE_EXTENSION)
    }

    fn open(&self, path: &Path) -> Result<SceneDocument> {
        Ok(SceneDocument::parse(&std::fs::read(path)?))
    }
}

#[derive(Debug, Clone)]
struct Line {
    raw: Vec<u8>,
    /// Byte offset where the path starts, for reference lines
    path_start: Option<usize>,
}

/// A parsed scene; field index is the line number
#[derive(Debug, Clone)]
pub struct SceneDocument {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl SceneDocument {
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let trailing_newline = data.ends_with(b"\n");
        let body = data.strip_suffix(b"\n").unwrap_or(data);
        let lines = if data.is_empty() {
            Vec::new()
        } else {
            body.split(|&b| b == b'\n')
                .map(|raw| Line {
                    path_start: reference_path_start(raw),
                    raw: raw.to_vec(),
                })
                .collect()
        };

        Self {
            lines,
            trailing_newline,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self
            .lines
            .iter()
            .map(|l| l.raw.as_slice())
            .collect::<Vec<_>>()
            .join(&b'\n');
        if self.trailing_newline {
            out.push(b'\n');
        }
        out
    }
}

/// Returns where the path begins if the line is `<kind> <path>`
fn reference_path_start(line: &[u8]) -> Option<usize> {
    let first = line.iter().position(|b| !b.is_ascii_whitespace())?;
    if line[first] == b'#' {
        return None;
    }
    let kind_end = first + line[first..].iter().position(u8::is_ascii_whitespace)?;
    let path_start = kind_end + line[kind_end..].iter().position(|b| !b.is_ascii_whitespace())?;
    Some(path_start)
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

impl AssetDocument for SceneDocument {
    fn references(&self) -> Vec<RawReference> {
        self.lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                let start = line.path_start?;
                let kind = trim_end(&line.raw[..start]).trim_ascii_start();
                let kind = if kind == LIBRARY_KIND {
                    BlockKind::Library
                } else {
                    BlockKind::Generic(String::from_utf8_lossy(kind).into_owned())
                };
                Some(RawReference {
                    field: index as u32,
                    kind,
                    path: trim_end(&line.raw[start..]).to_vec(),
                })
            })
            .collect()
    }

    fn set_path(&mut self, field: u32, path: &[u8]) -> Result<()> {
        let line = self
            .lines
            .get_mut(field as usize)
            .ok_or_else(|| eyre!("scene has no line {field}"))?;
        let start = line
            .path_start
            .ok_or_else(|| eyre!("scene line {field} holds no path"))?;
        line.raw.truncate(start);
        line.raw.extend_from_slice(path);
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}
