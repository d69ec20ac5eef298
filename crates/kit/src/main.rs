//! Fedora CoreOS Virtualization Kit (fcvk) - provision and launch Fedora
//! CoreOS container hosts under QEMU

use clap::Parser;
use color_eyre::{Report, Result};
use tracing_subscriber::{reload, EnvFilter, Registry};

mod cache_metadata;
mod command_run;
mod common_opts;
mod config;
mod decompress;
mod error;
mod ignition;
mod images;
mod ports;
mod progress;
mod qemu;
mod run;
mod ssh;
mod utils;

/// Provision one or more Fedora CoreOS VMs running Docker and boot them
/// with QEMU.
///
/// The image is downloaded and decompressed once per version and
/// architecture, an SSH key pair is generated on first use, and each
/// instance receives its own Ignition document and host ports.
#[derive(Parser)]
struct Cli {
    #[clap(flatten)]
    opts: common_opts::RunOpts,
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by the RUST_LOG environment variable, defaulting to
/// 'info'. The returned handle allows raising the level once the
/// configuration file has been read.
fn install_tracing() -> reload::Handle<EnvFilter, Registry> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter_layer);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
    handle
}

fn main() -> Result<(), Report> {
    let filter = install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let cancel = utils::Cancellation::new();
    cancel.install_ctrlc_handler()?;

    let layout = config::ProjectLayout::from_current_dir()?;
    let config_path = match &cli.opts.config {
        Some(path) => layout.resolve(path),
        None => layout.root.join(config::CONFIG_FILE_NAME),
    };
    let config = config::Config::load(&config_path)?.with_overrides(&cli.opts.overrides());
    if config.debug.verbose && std::env::var_os("RUST_LOG").is_none() {
        filter.reload(EnvFilter::new("debug"))?;
    }
    config.print_summary();

    let source = images::HttpSource::new()?;
    let report =
        run::Pipeline::new(&config, &layout, &source, &run::HostLauncher, cancel).run()?;
    tracing::debug!("{} instance(s) launched", report.instances.len());
    Ok(())
}
