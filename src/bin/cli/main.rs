mod app;
mod commands;
mod render;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use keepsync_lib::config::AppConfig;
use keepsync_lib::sync::{ConflictResolutionStrategy, SyncStrategy};

use app::{App, RemoteArgs};

#[derive(Parser)]
#[command(name = "keepsync-cli", about = "Encrypted password database sync", version)]
struct Cli {
    /// Config file (default: $KEEPSYNC_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(flatten)]
    remote: RemoteArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// File references are an index from `files list`, an absolute path, or
/// `<backend>:<path>` (local, dropbox, webdav, git, fake)
#[derive(Subcommand)]
enum Command {
    /// Known database files
    #[command(subcommand)]
    Files(FilesCommand),

    /// List the directory containing a file, or a directory itself
    Ls { file: String },

    /// Show how the cached copy of a file relates to the remote
    Status { file: String },

    /// Reconcile the cached copy of a file with the remote
    Sync {
        file: String,
        /// Only queue the pass
        #[arg(long)]
        defer: bool,
        /// On conflict, overwrite the remote with the local copy
        #[arg(long, conflicts_with = "keep_remote")]
        keep_local: bool,
        /// On conflict, replace the local copy with the remote one
        #[arg(long)]
        keep_remote: bool,
    },

    /// Create or inspect a database
    #[command(subcommand)]
    Db(DbCommand),

    /// Dropbox sign-in
    #[command(subcommand)]
    Dropbox(DropboxCommand),
}

#[derive(Subcommand)]
enum FilesCommand {
    /// List known files, most recently used first
    List,
    /// Remember a file
    Add { file: String },
    /// Forget a file
    Remove { file: String },
}

#[derive(Subcommand)]
enum DbCommand {
    /// Create an empty database (password from KEEPSYNC_PASSWORD or stdin)
    Create {
        file: String,
        /// Also keep the key in the system keyring
        #[arg(long)]
        biometric: bool,
    },
    /// Print the groups and entries of a database
    Show {
        file: String,
        /// Unlock with the key kept in the system keyring
        #[arg(long)]
        biometric: bool,
    },
}

#[derive(Subcommand)]
enum DropboxCommand {
    /// Start the browser sign-in
    Login,
    /// Finish sign-in with the code shown by Dropbox
    Finish { code: String },
    /// Forget the stored token
    Logout,
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load(&path),
        None => AppConfig::load_default(),
    };
    config.context("Failed to load configuration")
}

fn init_logging(config: &AppConfig) {
    let default = config.log_level.as_deref().unwrap_or("warn");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Runs `future` on a runtime that is dropped before returning. Blocking
/// HTTP clients owned by the resolver must not be dropped on it.
fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(future)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_logging(&config);

    let use_color = !cli.no_color && atty_check();
    let app = App::new(config)?;
    let remote = &cli.remote;

    match cli.command {
        Command::Files(FilesCommand::List) => commands::files::run_list(&app, &cli.format, use_color)?,
        Command::Files(FilesCommand::Add { file }) => {
            let file = app.file_ref(&file, remote)?;
            commands::files::run_add(&app, &file)?;
        }
        Command::Files(FilesCommand::Remove { file }) => {
            let file = app.file_ref(&file, remote)?;
            commands::files::run_remove(&app, &file)?;
        }
        Command::Ls { file } => {
            let file = app.file_ref(&file, remote)?;
            commands::ls::run(&app, &file, &cli.format, use_color)?;
        }
        Command::Status { file } => {
            let file = app.file_ref(&file, remote)?;
            block_on(commands::sync::run_status(&app, &file, &cli.format, use_color))?;
        }
        Command::Sync {
            file,
            defer,
            keep_local,
            keep_remote,
        } => {
            let file = app.file_ref(&file, remote)?;
            let strategy = if defer {
                SyncStrategy::Defer
            } else {
                SyncStrategy::SyncAutomatically
            };
            let on_conflict = match (keep_local, keep_remote) {
                (true, _) => Some(ConflictResolutionStrategy::KeepLocal),
                (_, true) => Some(ConflictResolutionStrategy::KeepRemote),
                _ => None,
            };
            block_on(commands::sync::run_sync(
                &app,
                &file,
                strategy,
                on_conflict,
                &cli.format,
                use_color,
            ))?;
        }
        Command::Db(DbCommand::Create { file, biometric }) => {
            let file = app.file_ref(&file, remote)?;
            block_on(commands::db::run_create(&app, &file, biometric))?;
        }
        Command::Db(DbCommand::Show { file, biometric }) => {
            let file = app.file_ref(&file, remote)?;
            block_on(commands::db::run_show(&app, &file, biometric, &cli.format, use_color))?;
        }
        Command::Dropbox(DropboxCommand::Login) => commands::dropbox::run_login(&app)?,
        Command::Dropbox(DropboxCommand::Finish { code }) => commands::dropbox::run_finish(&app, &code)?,
        Command::Dropbox(DropboxCommand::Logout) => commands::dropbox::run_logout(&app)?,
    }

    Ok(())
}

/// Check if stdout is a terminal (for color support)
fn atty_check() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal()
}
