mod args;

use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use pongo_launcher::{BootConfig, BootConfirmation, IdentityReader, SystemClock, device};
use tracing_subscriber::EnvFilter;

fn init_logging(level: tracing::Level) {
    match EnvFilter::builder()
        .with_env_var("PONGO_TRACE")
        .try_from_env()
    {
        Ok(filter) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    };
}

fn run(config: &BootConfig) -> anyhow::Result<()> {
    tracing::debug!("{config:?}");

    // Fail on bad input files before asking for a device.
    let image = pongo_launcher::payload::build(&config.shellcode, &config.image)
        .context("Failed to prepare PongoOS")?;

    tracing::info!("Waiting for a device in DFU mode");
    let mut session = pongo_launcher::open_device(config).with_context(|| {
        format!(
            "No DFU device found after {} seconds - please connect a device",
            config.find_timeout.as_secs()
        )
    })?;

    let identity = session.identity().unwrap_or_default();
    tracing::debug!("Serial number: {identity}");

    if pongo_launcher::already_booted(session.product_id(), &identity) {
        println!("Device is already running PongoOS");
        return Ok(());
    }

    if !device::is_pwned_dfu(&identity) {
        if !config.force {
            bail!(
                "Device is not in pwned DFU mode, exploit it first or pass --force to send PongoOS anyway"
            );
        }
        tracing::warn!("Device is not in pwned DFU mode, sending PongoOS anyway");
    }

    let clock = SystemClock::new();
    let outcome = pongo_launcher::send_and_confirm(&mut session, image, config, &clock)?;

    match outcome.confirmation {
        Some(BootConfirmation::Confirmed { elapsed }) => {
            println!("PongoOS booted in {:.02}s!", elapsed.as_secs_f64());
        }
        Some(BootConfirmation::TimedOut { .. }) => {
            println!("PongoOS was sent but did not identify itself in time");
        }
        None => println!("PongoOS was sent"),
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = args::CliArgs::parse();
    let verbosity = args.verbosity;

    let config = match args.into_config() {
        Ok(config) => config,
        Err(why) => {
            eprintln!("{why}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.log_level);

    if verbosity > args::MAX_VERBOSITY {
        tracing::debug!(
            "Verbosity set to {verbosity}, max is {} - automatically lowering to {}",
            args::MAX_VERBOSITY,
            args::MAX_VERBOSITY
        );
    }

    if let Err(why) = run(&config) {
        eprintln!("{why:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
