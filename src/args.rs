use std::{path::PathBuf, time::Duration};

use pongo_launcher::{
    config::{self, BootConfig, ConfigError},
    monitor::{DEFAULT_DEADLINE, DEFAULT_POLL_INTERVAL},
};

pub const MAX_VERBOSITY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, clap::Parser)]
#[command(version, about = "Boot PongoOS on a device in pwned DFU mode", long_about = None)]
pub struct CliArgs {
    /// Use a custom Pongo.bin file
    #[arg(short = 'k', long, default_value = config::DEFAULT_IMAGE_PATH)]
    pub override_pongo: PathBuf,

    /// LZ4 decompressor stub placed in front of the compressed PongoOS image
    #[arg(long, default_value = config::DEFAULT_SHELLCODE_PATH)]
    pub shellcode: PathBuf,

    /// Verbosity level, maximum of 2 (e.g. -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Optional log level, can also be set by the "PONGO_TRACE" environment variable. If both are specified, the environment variable is preferred.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Don't wait for PongoOS to report itself after sending it
    #[arg(long)]
    pub no_wait: bool,

    /// Seconds to wait for PongoOS to report itself
    #[arg(long, value_name = "SECS")]
    pub boot_timeout: Option<u64>,

    /// Milliseconds between checks for PongoOS
    #[arg(long, value_name = "MS")]
    pub poll_interval: Option<u64>,

    /// Give up on a chunk after this many attempts instead of retrying forever
    #[arg(long, value_name = "N")]
    pub max_chunk_retries: Option<u32>,

    /// Seconds to wait for the device to come back after the handoff, forever if unset
    #[arg(long, value_name = "SECS")]
    pub ready_timeout: Option<u64>,

    /// Seconds to wait for a DFU device to be connected
    #[arg(long, value_name = "SECS", default_value_t = config::DEFAULT_FIND_TIMEOUT.as_secs())]
    pub find_timeout: u64,

    /// Send PongoOS even if the device does not report itself as pwned
    #[arg(short, long)]
    pub force: bool,

    /// Don't draw a progress bar whilst sending PongoOS
    #[arg(long)]
    pub no_progress: bool,
}

impl CliArgs {
    /// The level implied by `--log-level`, `-d` and `-v`, in that order of precedence.
    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        if self.log_level.is_some() && (self.verbosity > 0 || self.debug) {
            return Err(ConfigError::ConflictingLogLevel);
        }

        if let Some(level) = self.log_level {
            return Ok(level.into());
        }

        Ok(match (self.verbosity.min(MAX_VERBOSITY), self.debug) {
            (0, false) => tracing::Level::INFO,
            (0 | 1, _) => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        })
    }

    pub fn into_config(self) -> Result<BootConfig, ConfigError> {
        if self.no_wait && (self.boot_timeout.is_some() || self.poll_interval.is_some()) {
            return Err(ConfigError::ConfirmationOptionsWithoutConfirmation);
        }

        let mut config = BootConfig::new(self.shellcode.clone(), self.override_pongo.clone());
        config.log_level = self.log_level()?;
        config.confirm_boot = !self.no_wait;
        config.force = self.force;
        config.find_timeout = Duration::from_secs(self.find_timeout);
        config.ready_timeout = self.ready_timeout.map(Duration::from_secs);
        config.transfer.chunk_retry_limit = self.max_chunk_retries;
        config.transfer.show_progress = !self.no_progress;
        config.monitor.deadline = self
            .boot_timeout
            .map_or(DEFAULT_DEADLINE, Duration::from_secs);
        config.monitor.poll_interval = self
            .poll_interval
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis);

        config::validate(&config)?;
        Ok(config)
    }
}
