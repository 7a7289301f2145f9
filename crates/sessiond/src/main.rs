//! Shellproxy Session Daemon
//!
//! Runs sessions against the local terminal and manages host keys.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hostkey::{key_path, read_or_make_key_with, use_or_make_keys_with, Algorithm, HostKeySet};
use sessiond::config::{default_config_path, Config};
use sessiond::process::{NoCommandFactory, ProcessFactory, ReplFactory, ShellFactory};
use sessiond::session::{handle, SessionOptions};
use sessiond::term::{window_size, RawTerminal, WindowSize};
use sessiond::transport::{Peer, PeerInfo, PtyRequest, StreamPeer};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Shellproxy session daemon.
#[derive(Parser, Debug)]
#[command(name = "shellproxyd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a session with this terminal as the peer
    Run {
        /// Whether to allocate a terminal for the session
        #[arg(long, value_enum, default_value = "auto")]
        pty: PtyMode,

        /// Run the built-in REPL instead of a command
        #[arg(long, conflicts_with = "no_command")]
        repl: bool,

        /// Run nothing and wait for end of input
        #[arg(long)]
        no_command: bool,

        /// Command and arguments; empty runs the configured shell
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Load or create host keys and print their public halves
    Hostkey {
        /// Base path of the key files (defaults to the configured path)
        #[arg(long, short)]
        path: Option<PathBuf>,

        /// Only this algorithm (defaults to the configured algorithms)
        #[arg(long, short, value_enum)]
        algorithm: Option<KeyAlgorithm>,
    },

    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        write: bool,
    },
}

/// Terminal allocation for `run`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyMode {
    /// Allocate one when stdin and stdout are terminals
    Auto,
    /// Always allocate one
    Always,
    /// Never allocate one
    Never,
}

/// Host key algorithms selectable on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ed25519,
}

impl From<KeyAlgorithm> for Algorithm {
    fn from(algorithm: KeyAlgorithm) -> Self {
        match algorithm {
            KeyAlgorithm::Rsa => Algorithm::Rsa,
            KeyAlgorithm::Ed25519 => Algorithm::Ed25519,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let guard = init_logging(&config, cli.verbose);
    tracing::debug!(config = ?cli.config, "shellproxyd starting");

    let status = match cli.command {
        Commands::Run {
            pty,
            repl,
            no_command,
            command,
        } => run_session(&config, pty, repl, no_command, command).await?,
        Commands::Hostkey { path, algorithm } => {
            print_host_keys(&config, path, algorithm)?;
            0
        }
        Commands::Config { write } => {
            let target = write.then(|| cli.config.clone().unwrap_or_else(default_config_path));
            show_config(&config, target.as_deref())?;
            0
        }
    };

    // flush buffered log lines before exiting
    drop(guard);
    std::process::exit(i32::from(status));
}

/// Installs the global subscriber. Returns the appender guard when logging
/// to a file.
fn init_logging(config: &Config, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shellproxyd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn local_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

fn wants_pty(mode: PtyMode) -> bool {
    match mode {
        PtyMode::Always => true,
        PtyMode::Never => false,
        PtyMode::Auto => std::io::stdin().is_terminal() && std::io::stdout().is_terminal(),
    }
}

async fn run_session(
    config: &Config,
    pty: PtyMode,
    repl: bool,
    no_command: bool,
    command: Vec<String>,
) -> Result<u8> {
    let factory: Box<dyn ProcessFactory> = if repl {
        Box::new(ReplFactory::default())
    } else if no_command {
        Box::new(NoCommandFactory)
    } else {
        Box::new(ShellFactory::from_config(&config.session))
    };
    let options = SessionOptions::from_config(&config.session);

    let peer = StreamPeer::from_streams(
        PeerInfo::new(local_user(), "local"),
        command,
        std::io::stdin(),
        std::io::stdout(),
        std::io::stderr(),
    );

    if !wants_pty(pty) {
        let peer = Arc::new(peer);
        let cancel = peer.cancellation();
        let interrupt = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::debug!("interrupted");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });
        let status = handle(peer, factory.as_ref(), options).await;
        interrupt.abort();
        return Ok(status);
    }

    let raw = if std::io::stdin().is_terminal() {
        let raw = RawTerminal::enable(std::io::stdin())
            .context("Failed to switch the terminal to raw mode")?;
        Some(raw)
    } else {
        None
    };
    let size = raw
        .as_ref()
        .and_then(|raw| raw.size().ok())
        .unwrap_or_default();
    let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());

    let (peer, resize) = peer.with_pty(PtyRequest { term, size });
    let peer = Arc::new(peer);
    let relay = tokio::spawn(relay_window_changes(resize, peer.cancellation()));

    let status = handle(peer, factory.as_ref(), options).await;
    relay.abort();
    drop(raw);
    Ok(status)
}

/// Forwards SIGWINCH as window size events until the session ends.
async fn relay_window_changes(resize: mpsc::Sender<WindowSize>, cancel: CancellationToken) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            tracing::warn!(error = %e, "window changes will not be forwarded");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = winch.recv() => {
                if received.is_none() {
                    return;
                }
                match window_size(&std::io::stdin()) {
                    Ok(size) => {
                        if resize.send(size).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "failed to read window size"),
                }
            }
        }
    }
}

/// Prints the effective configuration, saving it to `target` if given.
fn show_config(config: &Config, target: Option<&Path>) -> Result<()> {
    print!("{}", config.to_toml()?);
    if let Some(path) = target {
        config.save(path)?;
        eprintln!("wrote {}", path.display());
    }
    Ok(())
}

fn print_host_keys(
    config: &Config,
    path: Option<PathBuf>,
    algorithm: Option<KeyAlgorithm>,
) -> Result<()> {
    let base = path.unwrap_or_else(|| config.host_keys.path.clone());
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
    }

    let mut set = HostKeySet::new();
    match algorithm {
        Some(algorithm) => {
            let algorithm = Algorithm::from(algorithm);
            let key = read_or_make_key_with(
                key_path(&base, algorithm),
                algorithm,
                config.host_keys.rsa_bits,
            )?;
            set.add(Arc::new(key));
        }
        None => use_or_make_keys_with(
            &mut set,
            &base,
            &config.host_keys.algorithms,
            config.host_keys.rsa_bits,
        )?,
    }

    for key in set.iter() {
        println!("{}", key.public_key().to_openssh());
        println!("  {} {}", key.algorithm(), key.fingerprint());
    }
    Ok(())
}
