use clap::Parser;
use color_eyre::{Report, Result};

mod cleanup;
mod completion;
mod config;
mod envdetect;
mod errors;
mod firmware;
mod keys;
mod launcher;
mod media;
mod monitor;
mod pidfile;
mod provision;
mod qemu;
mod recipe;
mod utils;

/// Install Arch Linux into a fresh QEMU virtual machine, unattended.
///
/// Boots the installer ISO with a small recipe volume attached, types the
/// command that runs the recipe, and waits for the guest to power off. The
/// result lands in `./vm`, together with a `run` script to boot it.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Serve the guest display over VNC (127.0.0.1:5900) instead of
    /// opening a window
    #[clap(long)]
    headless: bool,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info', and written to stderr.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    let guard = cleanup::RunGuard::install()?;
    provision::run(cli.headless, &guard)
}
