//! `microdoser` binary: run, simulate and operate the dosing hub.

mod assemble;
mod cli;
mod commands;
mod error_fmt;
mod events;

use std::path::Path;

use clap::Parser;
use microdoser_config::Logging;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::cli::{Cli, Commands, FILE_GUARD};
use crate::commands::SimulateArgs;
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::events::Printer;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console logs go to stderr so stdout stays reserved for events.
fn init_tracing(json: bool, cli_level: Option<&str>, logging: Option<&Logging>) -> eyre::Result<()> {
    let level = cli_level
        .or_else(|| logging.and_then(|l| l.level.as_deref()))
        .unwrap_or("info")
        .to_owned();
    let filter = move || {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&level))
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter()?)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter()?)
            .boxed()
    };
    layers.push(console);

    if let Some(path) = logging.and_then(|l| l.file.as_deref()) {
        use tracing_appender::rolling::{RollingFileAppender, Rotation};
        let rotation = match logging.and_then(|l| l.rotation.as_deref()) {
            Some("daily") => Rotation::DAILY,
            Some("hourly") => Rotation::HOURLY,
            _ => Rotation::NEVER,
        };
        let path = Path::new(path);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file must name a file"))?;
        let appender = RollingFileAppender::new(rotation, dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter()?)
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).try_init()?;
    Ok(())
}

fn real_main(cli: Cli) -> eyre::Result<()> {
    let cfg = assemble::load_config(&cli.config);
    init_tracing(
        cli.json,
        cli.log_level.as_deref(),
        cfg.as_ref().ok().map(|c| &c.logging),
    )?;
    let cfg = cfg?;
    tracing::debug!(config = %cli.config.display(), pumps = cfg.pumps.len(), "config loaded");

    let printer = Printer { json: cli.json };
    match &cli.cmd {
        Commands::Run { max_ticks } => commands::run(&cfg, *max_ticks, printer),
        Commands::Simulate {
            start,
            hours,
            tick_ms,
            fail_pumps,
            disabled,
        } => commands::simulate(
            &cfg,
            &SimulateArgs {
                start: *start,
                hours: *hours,
                tick_ms: *tick_ms,
                fail_pumps,
                disabled,
            },
            printer,
        ),
        Commands::Schedule => commands::schedule(&cfg, printer),
        Commands::Prime { pump } => commands::prime(&cfg, pump, printer),
        Commands::Calibrate { pump, measured_ml } => {
            commands::calibrate(&cfg, pump, *measured_ml, printer)
        }
        Commands::SelfCheck => commands::self_check(&cfg, printer),
    }
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error report hook: {e}");
    }

    if let Err(e) = real_main(cli) {
        tracing::error!(error = %e, "command failed");
        if json {
            eprintln!("{}", format_error_json(&e));
        } else {
            eprintln!("{}", humanize(&e));
        }
        std::process::exit(exit_code_for_error(&e));
    }
}
