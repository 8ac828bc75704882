//! bam: checkouts and commits of self-contained asset bundles
//!
//! Talks to a `bam-server` over TCP. A checkout is a session directory
//! holding one asset with its dependencies relocated next to it; commits send
//! back only what changed.

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tracing::{debug, info};

use bam_core::protocol::{BundleStatus, EntryKind};
use bam_core::{BamConfig, PackMode, PackOptions, Reply, TextScene};
use bam_transport::{Client, CommitOutcome, Progress as _, TcpTransport, find_session};

use crate::progress::{ConsoleProgress, print_status};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

/// Delay between bundle status polls
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "bam")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Check out and commit assets with their dependencies")]
#[command(long_about = r#"
bam checks out an asset together with everything it references, relocated
into one self-contained directory, and commits back only the files you changed.

Examples:
  bam checkout shots/010/shot.scene     Check out a scene with its textures
  bam status                            Show changed files of this checkout
  bam commit -m "relight"               Commit changed files
  bam pack shot.scene -o out/shot.zip   Pack a scene locally
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server address (host:port), overrides .bam.toml
    #[arg(long, global = true)]
    server: Option<String>,

    /// User name sent with commits, overrides .bam.toml
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check out an asset into a new session directory
    #[command(visible_alias = "co")]
    Checkout {
        /// Repository path of the asset
        path: String,

        /// Follow linked libraries
        #[arg(long)]
        all_deps: bool,

        /// Directory to create the session in
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Commit changed files of a checkout
    #[command(visible_alias = "ci")]
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Session directory (default: the checkout containing cwd)
        path: Option<PathBuf>,
    },

    /// Refresh unmodified files from the repository
    #[command(visible_alias = "up")]
    Update {
        /// Session directory (default: the checkout containing cwd)
        path: Option<PathBuf>,
    },

    /// Restore files to their repository state
    #[command(visible_alias = "rv")]
    Revert {
        /// Files to restore (default: every changed file)
        files: Vec<PathBuf>,
    },

    /// Show changed files of a checkout
    #[command(visible_alias = "st")]
    Status {
        /// Session directory (default: the checkout containing cwd)
        path: Option<PathBuf>,
    },

    /// List a repository directory
    #[command(visible_alias = "ls")]
    List {
        /// Repository path
        #[arg(default_value = ".")]
        path: String,
    },

    /// Show size and bundle state of a repository file
    Info {
        /// Repository path
        path: String,
    },

    /// Ask the server to prepare a full bundle of an asset
    Bundle {
        /// Repository path of the asset
        path: String,

        /// Poll until the bundle is ready
        #[arg(short, long)]
        wait: bool,
    },

    /// Pack an asset and its dependencies locally
    Pack {
        /// Asset to pack
        source: PathBuf,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,

        /// Output layout (FILE, ZIP, NONE)
        #[arg(short, long, default_value = "FILE")]
        mode: PackMode,

        /// Follow linked libraries
        #[arg(long)]
        all_deps: bool,

        /// Record manifest sources relative to this directory
        #[arg(long)]
        relbase: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    debug!("debug log at {}", session.log_path.display());

    let result = run(cli);
    if result.is_err() {
        eprintln!("debug log: {}", session.log_path.display());
    }
    drop(session.guard);
    result
}

fn run(cli: Cli) -> Result<()> {
    let mut config = BamConfig::load(&std::env::current_dir()?)?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(user) = cli.user {
        config.user = user;
    }

    let client = || {
        info!("server {} as {}", config.server, config.user);
        Client::new(TcpTransport::new(&config.server), &config.user)
    };

    match cli.command {
        Commands::Version => {
            eprintln!("bam {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Checkout {
            path,
            all_deps,
            output,
        } => {
            let mut progress = ConsoleProgress::new();
            print_status("Checkout", &path);
            let session = client().checkout(&path, &output, all_deps, &mut progress)?;
            progress.done("Checked out", &session.display().to_string());
        }
        Commands::Commit { message, path } => {
            let session = session_dir(path.as_deref())?;
            let mut progress = ConsoleProgress::new();
            match client().commit(&session, &message, &mut progress)? {
                CommitOutcome::NothingToCommit => print_status("Clean", "nothing to commit"),
                CommitOutcome::Committed(output) => {
                    for line in output.lines().filter(|l| !l.trim().is_empty()) {
                        progress.message(line);
                    }
                    progress.done("Committed", &session.display().to_string());
                }
            }
        }
        Commands::Update { path } => {
            let session = session_dir(path.as_deref())?;
            let mut progress = ConsoleProgress::new();
            let fetched = client().update(&session, &mut progress)?;
            progress.done("Updated", &format!("{fetched} files"));
        }
        Commands::Revert { files } => {
            let anchor = files.first().map_or(Path::new("."), PathBuf::as_path);
            let session = session_dir(Some(anchor))?;
            let files = files
                .iter()
                .map(|file| session_relative(&session, file))
                .collect::<Result<Vec<_>>>()?;
            let mut progress = ConsoleProgress::new();
            let restored = client().revert(&session, &files, &mut progress)?;
            progress.done("Reverted", &format!("{restored} files"));
        }
        Commands::Status { path } => {
            let session = session_dir(path.as_deref())?;
            let changes = client().status(&session)?;
            if changes.is_empty() {
                print_status("Clean", &session.display().to_string());
            }
            for rel in changes.modified.keys() {
                println!("M {rel}");
            }
            for rel in &changes.removed {
                println!("D {rel}");
            }
        }
        Commands::List { path } => {
            for entry in client().list(&path)? {
                match entry.kind {
                    EntryKind::Dir => println!("{}/", entry.name),
                    EntryKind::File => println!("{}", entry.name),
                }
            }
        }
        Commands::Info { path } => match client().info(&path)? {
            Reply::Info {
                path,
                size,
                bundle_status,
            } => {
                let size = humansize::format_size(size, humansize::BINARY);
                let status = bundle_status.map_or("none", status_name);
                println!("{path}\t{size}\tbundle: {status}");
            }
            other => bail!("unexpected reply to info: {other:?}"),
        },
        Commands::Bundle { path, wait } => bundle_command(&client(), &path, wait)?,
        Commands::Pack {
            source,
            output,
            mode,
            all_deps,
            relbase,
        } => pack_command(&source, &output, mode, all_deps, relbase)?,
    }

    Ok(())
}

fn status_name(status: BundleStatus) -> &'static str {
    match status {
        BundleStatus::Building => "building",
        BundleStatus::Available => "available",
        BundleStatus::Failed => "failed",
    }
}

fn bundle_command(client: &Client<TcpTransport>, path: &str, wait: bool) -> Result<()> {
    let progress = ConsoleProgress::new();
    loop {
        let (status, bundle_path) = match client.bundle(path)? {
            Reply::Bundle {
                status,
                bundle_path,
            } => (status, bundle_path),
            other => bail!("unexpected reply to bundle: {other:?}"),
        };
        match status {
            BundleStatus::Available => {
                let location = bundle_path.unwrap_or_default();
                progress.done("Bundled", &format!("{path} at {location}"));
                return Ok(());
            }
            BundleStatus::Failed => bail!("bundle of {path} failed on the server"),
            BundleStatus::Building if wait => {
                debug!("bundle of {path} still building");
                std::thread::sleep(POLL_INTERVAL);
            }
            BundleStatus::Building => {
                print_status("Building", path);
                return Ok(());
            }
        }
    }
}

fn pack_command(
    source: &Path,
    output: &Path,
    mode: PackMode,
    all_deps: bool,
    relbase: Option<PathBuf>,
) -> Result<()> {
    let mut progress = ConsoleProgress::new();
    let options = PackOptions {
        recursive: all_deps,
        remap_relbase: relbase,
        ..PackOptions::default()
    };
    let manifest = bam_core::pack(TextScene, source, output, mode, options)?
        .run(|line| progress.message(line))?;

    progress.done(
        "Packed",
        &format!(
            "{} ({mode}, {} files)",
            output.display(),
            manifest.paths_remap.len()
        ),
    );
    Ok(())
}

/// The checkout containing `path`, or the working directory when unset
fn session_dir(path: Option<&Path>) -> Result<PathBuf> {
    let path = path.unwrap_or(Path::new("."));
    find_session(path).ok_or_else(|| eyre!("{} is not inside a bam checkout", path.display()))
}

/// `file` as a session path, the form manifests key files by
fn session_relative(session: &Path, file: &Path) -> Result<String> {
    let file = bam_core::paths::absolute(file)?;
    let rel = file
        .strip_prefix(session)
        .map_err(|_| eyre!("{} is outside {}", file.display(), session.display()))?;
    Ok(bam_core::paths::manifest_string(rel))
}
