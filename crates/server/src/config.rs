//! Server configuration file parsing (bam-server.toml)

use std::path::{Path, PathBuf};

use bam_core::protocol::MAX_DOWNLOAD_CHUNK;
use bam_core::stream::DOWNLOAD_CHUNK;
use color_eyre::eyre::bail;

/// Default config file name
pub const CONFIG_FILE: &str = "bam-server.toml";

/// Default listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:5000";

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of the versioned working copy served to clients
    pub repository: PathBuf,

    /// Bundle and upload storage
    pub storage: PathBuf,

    /// Listen address (`host:port`)
    pub listen: String,

    /// File extensions accepted in commit uploads
    pub allowed_extensions: Vec<String>,

    /// Commit credentials for the version-control backend
    pub svn_user: Option<String>,
    pub svn_password: Option<String>,

    /// Raw bytes per chunk of a multi-file download
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("repository"),
            storage: PathBuf::from("storage"),
            listen: DEFAULT_LISTEN.to_string(),
            allowed_extensions: ["txt", "mp4", "png", "jpg", "jpeg", "gif", "blend", "scene", "zip"]
                .into_iter()
                .map(String::from)
                .collect(),
            svn_user: None,
            svn_password: None,
            chunk_size: DOWNLOAD_CHUNK,
        }
    }
}

impl ServerConfig {
    /// Load config from `path`.
    ///
    /// Returns default config if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed, or sets a
    /// chunk size clients would refuse.
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> color_eyre::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_DOWNLOAD_CHUNK {
            bail!(
                "chunk_size must be between 1 and {MAX_DOWNLOAD_CHUNK} bytes, got {}",
                self.chunk_size
            );
        }
        Ok(())
    }

    /// Whether an uploaded file name carries an allowed extension
    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }

    /// Prepared download bundles
    #[must_use]
    pub fn bundles_dir(&self) -> PathBuf {
        self.storage.join("bundles")
    }

    /// Received commit uploads
    #[must_use]
    pub fn uploads_dir(&self) -> PathBuf {
        self.storage.join("uploads")
    }

    /// Bundle job table
    #[must_use]
    pub fn jobs_dir(&self) -> PathBuf {
        self.storage.join("jobs")
    }
}
