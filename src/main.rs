mod config;
mod core;
mod diriv;
mod dirops;
mod error;
mod fileops;
mod fs;
mod handle_table;
mod longname;
mod nametransform;
mod pathmap;
mod util;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use config::{Config, InitOptions, MountOptions};
use crate::core::CryptCore;
use fs::CryptNameFs;
use fuse3::path::Session;
#[cfg(unix)]
use futures_util::future::poll_fn;
use longname::DEFAULT_LONG_NAME_MAX;
use std::path::PathBuf;
#[cfg(unix)]
use std::pin::Pin;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(unix)]
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cryptnamefs-rs")]
#[command(about = "FUSE3 overlay that stores file and directory names encrypted on a backing directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare an empty backend directory.
    Init(InitArgs),
    /// Mount a prepared backend.
    Mount(MountArgs),
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Empty directory that will hold the encrypted tree.
    backend: PathBuf,

    /// Store names as-is instead of encrypting them.
    #[arg(long, default_value_t = false)]
    plaintext_names: bool,

    /// Reject names whose ciphertext exceeds --long-name-max instead of hashing them.
    #[arg(long, default_value_t = false)]
    no_long_names: bool,

    /// Longest encrypted name stored verbatim on the backend.
    #[arg(long, default_value_t = DEFAULT_LONG_NAME_MAX)]
    long_name_max: usize,
}

#[derive(Args, Debug)]
struct MountArgs {
    /// Backend directory created by `init`.
    backend: PathBuf,

    /// Mount point for the decrypted view.
    mountpoint: PathBuf,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Chown new files and directories to the calling user. Needs root.
    #[arg(long, default_value_t = false)]
    preserve_owner: bool,

    /// Hide a path (and everything below it) from the mount. Repeatable.
    #[arg(long = "deny", value_name = "PATH")]
    deny: Vec<PathBuf>,

    /// Delete a lone .DS_Store that blocks rmdir. Always on for macOS.
    #[arg(long, default_value_t = false)]
    remove_stray_files: bool,

    /// fdatasync data files on write to improve durability (at the cost of latency).
    #[arg(long, default_value_t = false)]
    sync_data: bool,

    /// Maximum FUSE write size in KiB.
    #[arg(long, default_value_t = 128)]
    max_write_kb: u32,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_init(args: InitArgs) -> anyhow::Result<()> {
    init_tracing(false);
    let options = InitOptions {
        plaintext_names: args.plaintext_names,
        long_names: !args.no_long_names,
        long_name_max: args.long_name_max,
    };
    config::init_backend(args.backend.clone(), &options)
        .with_context(|| format!("failed to initialize {}", args.backend.display()))?;
    println!("initialized {}", args.backend.display());
    Ok(())
}

async fn run_mount(args: MountArgs) -> anyhow::Result<()> {
    init_tracing(args.debug);
    let options = MountOptions {
        preserve_owner: args.preserve_owner,
        remove_stray_files: args.remove_stray_files.then_some(true),
        deny: args.deny,
        sync_data: args.sync_data,
    };
    let config = Config::open_backend(args.backend.clone(), options)
        .with_context(|| format!("failed to open backend {}", args.backend.display()))?;
    info!(
        backend = %config.backend_path.display(),
        mountpoint = %args.mountpoint.display(),
        "mounting"
    );

    let fs = CryptNameFs::new(CryptCore::new(config), args.max_write_kb);

    let mut mount_opts = fuse3::MountOptions::default();
    mount_opts.fs_name("cryptnamefs-rs");
    mount_opts.allow_other(args.allow_other);
    mount_opts.nonempty(args.nonempty);

    let session = Session::new(mount_opts);
    let handle = session.mount(fs, args.mountpoint).await?;

    #[cfg(unix)]
    {
        let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

        let mut mount_task = tokio::spawn(async move {
            let mut handle = Some(handle);
            let mut handle_future = poll_fn(|cx| match handle.as_mut() {
                Some(handle) => Pin::new(handle).poll(cx),
                None => std::task::Poll::Pending,
            });

            let res = tokio::select! {
                res = &mut handle_future => res,
                _ = unmount_rx => match handle.take() {
                    Some(handle) => handle.unmount().await,
                    None => Ok(()),
                },
            };

            res.map_err(anyhow::Error::from)
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let signals = async {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        };
        tokio::pin!(signals);

        let result = tokio::select! {
            res = &mut mount_task => res,
            _ = &mut signals => {
                info!("signal received, unmounting");
                let _ = unmount_tx.send(());
                mount_task.await
            }
        };

        result??;
    }

    #[cfg(not(unix))]
    {
        handle.await?;
    }

    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => run_init(args),
        Command::Mount(args) => run_mount(args).await,
    }
}
