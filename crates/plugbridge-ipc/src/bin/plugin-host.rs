//! Plugin host process
//!
//! Started by a plugin bridge with the name of the shared memory region to
//! serve. Log records go back to the bridge through an inherited pipe.
//!
//! Usage:
//!   plugin-host bridge <shm-path> [--log-fd <fd>] [--parent <pid>]
//!   plugin-host describe <plugin-path>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugbridge_ipc::log_pipe::LogPipe;
use plugbridge_ipc::{BuiltinLoader, PluginLoader, PluginServer};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(about = "Hosts bridged plugins in a separate process", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve the bridge at the given shared memory path
    Bridge {
        shm_path: String,

        /// Write log records into this file descriptor
        #[arg(long)]
        log_fd: Option<RawFd>,

        /// Quit when this process goes away
        #[arg(long)]
        parent: Option<u32>,
    },
    /// Print a plugin's description as JSON
    Describe { path: String },
}

#[allow(unsafe_code)]
fn init_logging(log_fd: Option<RawFd>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "plugbridge=debug,info".into());

    let pipe_layer = log_fd.map(|fd| {
        // SAFETY: the descriptor was inherited from the parent and nothing
        // else in this process owns it
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        fmt::layer()
            .with_writer(LogPipe::new(fd))
            .with_ansi(false)
            .without_time()
    });
    let stderr_layer = log_fd
        .is_none()
        .then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(pipe_layer)
        .with(stderr_layer)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Mode::Bridge {
            shm_path,
            log_fd,
            parent,
        } => {
            init_logging(log_fd);

            std::panic::set_hook(Box::new(|info| {
                tracing::error!("Plugin host crashed: {}", info);
            }));

            let server = PluginServer::connect(&shm_path, parent, Arc::new(BuiltinLoader))
                .with_context(|| format!("Failed to connect to {shm_path}"))?;
            server.run();
            Ok(())
        }
        Mode::Describe { path } => {
            init_logging(None);
            let plugin = BuiltinLoader
                .load(&path)
                .with_context(|| format!("Failed to load {path}"))?;
            println!("{}", serde_json::to_string_pretty(plugin.info())?);
            Ok(())
        }
    }
}
