//! Client configuration file parsing (.bam.toml)

use std::path::Path;

/// Config file name
pub const CONFIG_FILE: &str = ".bam.toml";

/// Default server address
pub const DEFAULT_SERVER: &str = "127.0.0.1:5000";

/// Client session configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct BamConfig {
    /// Server address (`host:port`)
    pub server: String,

    /// User name sent with commits
    pub user: String,

    /// Project on the server
    pub project: String,
}

impl Default for BamConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            user: "bam".to_string(),
            project: "default".to_string(),
        }
    }
}

impl BamConfig {
    /// Load config from a working directory.
    ///
    /// Returns default config if .bam.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(dir: &Path) -> color_eyre::Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
